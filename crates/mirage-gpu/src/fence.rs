//! Completion tracking for display commands.
//!
//! Every display command carries a fence value issued at record time. The dispatcher signals
//! it after the surface has been presented; producers that pace frames wait on it. Fence values
//! are issued in record order but lists may be recorded by different builders, so completion is
//! tracked per value rather than as a single watermark.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::backend::BackendError;
use crate::cmd::{CommandList, Opcode};

/// Failed fences whose error is kept for late waiters. Older failures are forgotten and then
/// read as successful.
const FAILURE_HISTORY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PresentError {
    #[error("pipeline aborted before the frame was presented")]
    Aborted,
    #[error("timed out waiting for present")]
    Timeout,
    #[error("present failed: {0}")]
    Backend(#[from] BackendError),
    #[error("fence {0} was never issued")]
    UnknownFence(u64),
    #[error("the list carrying this display was dropped before it was submitted")]
    Discarded,
}

#[derive(Debug, Default)]
struct FenceState {
    next: u64,
    /// Issued but not yet signaled.
    outstanding: BTreeSet<u64>,
    /// Completed with an error. Every waiter observes the same error.
    failed: BTreeMap<u64, PresentError>,
    signals: u64,
    aborted: bool,
}

#[derive(Debug, Default)]
pub struct DisplayFences {
    state: Mutex<FenceState>,
    cond: Condvar,
}

impl DisplayFences {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FenceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Issues the fence value for a newly recorded display command. Values start at 1.
    pub fn issue(&self) -> u64 {
        let mut state = self.lock();
        state.next += 1;
        let fence = state.next;
        state.outstanding.insert(fence);
        fence
    }

    fn complete(state: &mut FenceState, fence: u64, error: Option<PresentError>) -> bool {
        if !state.outstanding.remove(&fence) {
            return false;
        }
        if let Some(err) = error {
            state.failed.insert(fence, err);
            while state.failed.len() > FAILURE_HISTORY {
                state.failed.pop_first();
            }
        }
        true
    }

    /// Marks `fence` complete. Returns `false` if it was not outstanding (unknown or already
    /// signaled), in which case nothing changes.
    pub fn signal(&self, fence: u64, result: Result<(), BackendError>) -> bool {
        let mut state = self.lock();
        if !Self::complete(&mut state, fence, result.err().map(PresentError::Backend)) {
            return false;
        }
        state.signals += 1;
        drop(state);
        self.cond.notify_all();
        true
    }

    /// Completes `fence` with `reason` without presenting anything, for display commands that
    /// will never reach the dispatcher. Not counted as a signal.
    pub fn retire(&self, fence: u64, reason: PresentError) -> bool {
        let retired = Self::complete(&mut self.lock(), fence, Some(reason));
        if retired {
            self.cond.notify_all();
        }
        retired
    }

    /// Retires the fence of every display command in `list`. Returns how many were still
    /// outstanding.
    pub fn retire_list(&self, list: &CommandList, reason: &PresentError) -> usize {
        list.iter()
            .filter(|cmd| cmd.opcode() == Some(Opcode::Display))
            .filter_map(|cmd| cmd.args().reader().pop::<u64>().ok())
            .filter(|&fence| self.retire(fence, reason.clone()))
            .count()
    }

    /// Number of successful `signal` calls so far.
    pub fn signal_count(&self) -> u64 {
        self.lock().signals
    }

    pub fn is_complete(&self, fence: u64) -> bool {
        let state = self.lock();
        fence != 0 && fence <= state.next && !state.outstanding.contains(&fence)
    }

    /// Wakes all waiters; fences that have not completed yet report [`PresentError::Aborted`].
    pub fn abort(&self) {
        self.lock().aborted = true;
        self.cond.notify_all();
    }

    fn settle(state: &mut FenceState, fence: u64) -> Option<Result<(), PresentError>> {
        if fence == 0 || fence > state.next {
            return Some(Err(PresentError::UnknownFence(fence)));
        }
        if !state.outstanding.contains(&fence) {
            return Some(match state.failed.get(&fence) {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            });
        }
        if state.aborted {
            return Some(Err(PresentError::Aborted));
        }
        None
    }

    /// Blocks until `fence` has been presented.
    pub fn wait(&self, fence: u64) -> Result<(), PresentError> {
        let mut state = self.lock();
        loop {
            if let Some(result) = Self::settle(&mut state, fence) {
                return result;
            }
            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn wait_timeout(&self, fence: u64, timeout: Duration) -> Result<(), PresentError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(result) = Self::settle(&mut state, fence) {
                return result;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PresentError::Timeout);
            }
            state = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn signal_is_counted_once_per_fence() {
        let fences = DisplayFences::new();
        let a = fences.issue();
        let b = fences.issue();
        assert_eq!((a, b), (1, 2));

        assert!(fences.signal(b, Ok(())));
        assert!(!fences.signal(b, Ok(())), "second signal is ignored");
        assert!(fences.is_complete(b));
        assert!(!fences.is_complete(a));
        assert_eq!(fences.signal_count(), 1);
        fences.wait(b).unwrap();
    }

    #[test]
    fn wait_blocks_until_signal_from_another_thread() {
        let fences = Arc::new(DisplayFences::new());
        let fence = fences.issue();
        let signaler = {
            let fences = fences.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                fences.signal(fence, Ok(()));
            })
        };
        fences.wait(fence).unwrap();
        signaler.join().unwrap();
    }

    #[test]
    fn backend_failure_is_reported_to_the_waiter() {
        let fences = DisplayFences::new();
        let fence = fences.issue();
        fences.signal(fence, Err(BackendError::Internal("surface lost".into())));
        assert_eq!(
            fences.wait(fence),
            Err(PresentError::Backend(BackendError::Internal(
                "surface lost".into()
            )))
        );
    }

    #[test]
    fn backend_failure_is_stable_across_waits() {
        let fences = DisplayFences::new();
        let fence = fences.issue();
        fences.signal(fence, Err(BackendError::Internal("lost".into())));
        let expected = Err(PresentError::Backend(BackendError::Internal("lost".into())));
        assert_eq!(fences.wait(fence), expected);
        assert_eq!(fences.wait(fence), expected);
        assert_eq!(fences.wait_timeout(fence, Duration::from_millis(5)), expected);
        assert!(fences.is_complete(fence));
    }

    #[test]
    fn failure_history_is_bounded() {
        let fences = DisplayFences::new();
        let all: Vec<u64> = (0..FAILURE_HISTORY + 8).map(|_| fences.issue()).collect();
        for &fence in &all {
            fences.signal(fence, Err(BackendError::OutOfBounds));
        }
        assert_eq!(fences.lock().failed.len(), FAILURE_HISTORY);
        assert!(fences.wait(*all.last().unwrap()).is_err());
        fences.wait(all[0]).unwrap();
    }

    #[test]
    fn retired_fences_wake_waiters_with_the_reason() {
        let fences = Arc::new(DisplayFences::new());
        let fence = fences.issue();
        let waiter = {
            let fences = fences.clone();
            std::thread::spawn(move || fences.wait(fence))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(fences.retire(fence, PresentError::Discarded));
        assert!(!fences.signal(fence, Ok(())), "retired fences cannot be signaled");
        assert_eq!(waiter.join().unwrap(), Err(PresentError::Discarded));
        assert_eq!(fences.signal_count(), 0);
    }

    #[test]
    fn abort_releases_outstanding_waiters() {
        let fences = DisplayFences::new();
        let done = fences.issue();
        let pending = fences.issue();
        fences.signal(done, Ok(()));
        fences.abort();
        assert_eq!(fences.wait(pending), Err(PresentError::Aborted));
        fences.wait(done).unwrap();
    }

    #[test]
    fn timeouts_and_unknown_fences() {
        let fences = DisplayFences::new();
        assert_eq!(fences.wait(7), Err(PresentError::UnknownFence(7)));
        let fence = fences.issue();
        assert_eq!(
            fences.wait_timeout(fence, Duration::from_millis(5)),
            Err(PresentError::Timeout)
        );
    }
}
