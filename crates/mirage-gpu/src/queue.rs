//! Bounded hand-off of finished command lists from the producer to the dispatcher thread.
//!
//! This is the only synchronized structure in the pipeline. `push` blocks while the queue is
//! full (backpressure), `pop` blocks while it is empty, and `abort` is the single cancellation
//! primitive: it discards everything still pending and wakes every waiter.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::cmd::CommandList;

/// Default bound on pending lists.
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// The queue was aborted; the rejected list is handed back to the caller.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("submission queue is aborted")]
    Aborted(CommandList),
}

impl PushError {
    pub fn into_list(self) -> CommandList {
        match self {
            PushError::Aborted(list) => list,
        }
    }
}

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<CommandList>,
    aborted: bool,
    discarded: u64,
}

#[derive(Debug)]
pub struct SubmissionQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl Default for SubmissionQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl SubmissionQueue {
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "submission queue capacity must be non-zero");
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::with_capacity(capacity),
                aborted: false,
                discarded: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Nothing in the critical sections can leave the state half-updated, so a panic on the
        // other side of the queue does not invalidate it.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    /// Total number of lists discarded by `abort`.
    pub fn discarded(&self) -> u64 {
        self.lock().discarded
    }

    /// Enqueues `list`, blocking while the queue is at capacity.
    pub fn push(&self, list: CommandList) -> Result<(), PushError> {
        let mut state = self.lock();
        while !state.aborted && state.pending.len() >= self.capacity {
            state = self
                .not_full
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        if state.aborted {
            return Err(PushError::Aborted(list));
        }
        state.pending.push_back(list);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeues the oldest list, blocking until one arrives. `None` once the queue is aborted.
    pub fn pop(&self) -> Option<CommandList> {
        let mut state = self.lock();
        loop {
            if state.aborted {
                return None;
            }
            if let Some(list) = state.pending.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(list);
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<CommandList> {
        let state = self.lock();
        let (mut state, _) = self
            .not_empty
            .wait_timeout_while(state, timeout, |s| !s.aborted && s.pending.is_empty())
            .unwrap_or_else(|e| e.into_inner());
        if state.aborted {
            return None;
        }
        let list = state.pending.pop_front()?;
        drop(state);
        self.not_full.notify_one();
        Some(list)
    }

    pub fn try_pop(&self) -> Option<CommandList> {
        let mut state = self.lock();
        if state.aborted {
            return None;
        }
        let list = state.pending.pop_front()?;
        drop(state);
        self.not_full.notify_one();
        Some(list)
    }

    /// Rejects all further submissions, discards pending lists without executing them and wakes
    /// every blocked producer and consumer. Returns how many lists this call discarded.
    pub fn abort(&self) -> usize {
        let dropped = {
            let mut state = self.lock();
            state.aborted = true;
            let dropped = core::mem::take(&mut state.pending);
            state.discarded += dropped.len() as u64;
            dropped
        };
        let n = dropped.len();
        if n > 0 {
            tracing::debug!(discarded = n, "submission queue aborted with pending lists");
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
        // Records are released outside the lock.
        drop(dropped);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::{ArgBuffer, Opcode};

    fn list_of(n: usize) -> CommandList {
        let mut list = CommandList::new();
        for _ in 0..n {
            list.push(Opcode::Clear, ArgBuffer::new());
        }
        list
    }

    #[test]
    fn fifo_across_lists() {
        let q = SubmissionQueue::new(4);
        for n in 1..=3 {
            q.push(list_of(n)).unwrap();
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop().map(|l| l.len()), Some(1));
        assert_eq!(q.pop().map(|l| l.len()), Some(2));
        assert_eq!(q.try_pop().map(|l| l.len()), Some(3));
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn abort_discards_pending_and_rejects_pushes() {
        let q = SubmissionQueue::new(8);
        for _ in 0..3 {
            q.push(list_of(2)).unwrap();
        }
        assert_eq!(q.abort(), 3);
        assert_eq!(q.abort(), 0, "abort is idempotent");
        assert_eq!(q.discarded(), 3);
        assert!(q.pop().is_none());

        let err = q.push(list_of(5)).unwrap_err();
        assert_eq!(err.into_list().len(), 5);
        assert!(q.is_empty());
    }

    #[test]
    fn pop_timeout_expires_on_empty_queue() {
        let q = SubmissionQueue::new(1);
        assert!(q.pop_timeout(Duration::from_millis(10)).is_none());
        assert!(!q.is_aborted());
    }

    #[test]
    #[should_panic(expected = "capacity must be non-zero")]
    fn zero_capacity_is_rejected() {
        let _ = SubmissionQueue::new(0);
    }
}
