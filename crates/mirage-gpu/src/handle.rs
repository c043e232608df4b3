//! Opaque resource handles.
//!
//! Handle values are issued on the producer thread by [`HandleAllocator`] at record time, so
//! later commands can name a resource before the dispatcher has created it. The dispatcher owns
//! the [`HandleTable`] that maps handles to live backend objects; binding and releasing happen
//! only there, as ordinary commands in the stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

/// Opaque resource identifier. `Handle::NULL` never names a resource.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable)]
#[repr(transparent)]
pub struct Handle(pub u32);

impl Handle {
    pub const NULL: Handle = Handle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl core::fmt::Display for Handle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

/// Monotonic handle issuer shared by every builder of one pipeline.
///
/// Values are never reused for the lifetime of the allocator.
#[derive(Debug, Clone)]
pub struct HandleAllocator {
    next: Arc<AtomicU32>,
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicU32::new(1)),
        }
    }

    /// Issues a fresh handle.
    ///
    /// Panics once the 32-bit handle space is exhausted, since wrapping would alias live handles.
    pub fn allocate(&self) -> Handle {
        let raw = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_add(1))
            .expect("resource handle space exhausted");
        Handle(raw)
    }

    /// Number of handles issued so far.
    pub fn issued(&self) -> u32 {
        self.next.load(Ordering::Relaxed) - 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    #[error("null handle cannot be bound")]
    Null,
    #[error("handle {0} is already bound")]
    AlreadyBound(Handle),
    #[error("handle {0} was released and cannot be bound again")]
    Released(Handle),
    #[error("handle {0} is not bound")]
    NotFound(Handle),
}

#[derive(Debug)]
enum Slot<R> {
    Live(R),
    Released,
}

/// Handle → resource mapping owned by the dispatcher thread.
///
/// Released handles keep a tombstone so they resolve to "not found" permanently and can never be
/// rebound, even if a stale command names them again.
#[derive(Debug)]
pub struct HandleTable<R> {
    slots: HashMap<Handle, Slot<R>>,
    live: usize,
}

impl<R> Default for HandleTable<R> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            live: 0,
        }
    }
}

impl<R> HandleTable<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, handle: Handle, resource: R) -> Result<(), HandleError> {
        if handle.is_null() {
            return Err(HandleError::Null);
        }
        match self.slots.get(&handle) {
            Some(Slot::Live(_)) => return Err(HandleError::AlreadyBound(handle)),
            Some(Slot::Released) => return Err(HandleError::Released(handle)),
            None => {}
        }
        self.slots.insert(handle, Slot::Live(resource));
        self.live += 1;
        Ok(())
    }

    pub fn resolve(&self, handle: Handle) -> Option<&R> {
        match self.slots.get(&handle)? {
            Slot::Live(r) => Some(r),
            Slot::Released => None,
        }
    }

    pub fn resolve_mut(&mut self, handle: Handle) -> Option<&mut R> {
        match self.slots.get_mut(&handle)? {
            Slot::Live(r) => Some(r),
            Slot::Released => None,
        }
    }

    /// Invalidates `handle` and hands the resource back for teardown.
    pub fn release(&mut self, handle: Handle) -> Result<R, HandleError> {
        let slot = self
            .slots
            .get_mut(&handle)
            .ok_or(HandleError::NotFound(handle))?;
        match core::mem::replace(slot, Slot::Released) {
            Slot::Live(r) => {
                self.live -= 1;
                Ok(r)
            }
            Slot::Released => Err(HandleError::NotFound(handle)),
        }
    }

    /// Number of live (bound, unreleased) handles.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Releases every live handle, returning the resources for teardown.
    pub fn drain_live(&mut self) -> Vec<(Handle, R)> {
        let mut out = Vec::with_capacity(self.live);
        for (handle, slot) in self.slots.iter_mut() {
            if let Slot::Live(_) = slot {
                if let Slot::Live(r) = core::mem::replace(slot, Slot::Released) {
                    out.push((*handle, r));
                }
            }
        }
        self.live = 0;
        out.sort_by_key(|(h, _)| *h);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_round_trip() {
        let alloc = HandleAllocator::new();
        let mut table = HandleTable::<&'static str>::new();

        let h = alloc.allocate();
        assert!(!h.is_null());
        assert_eq!(table.resolve(h), None, "unbound handle must not resolve");

        table.bind(h, "texture").unwrap();
        assert_eq!(table.resolve(h), Some(&"texture"));
        assert_eq!(table.len(), 1);

        assert_eq!(table.release(h), Ok("texture"));
        assert_eq!(table.resolve(h), None);
        assert_eq!(table.bind(h, "again"), Err(HandleError::Released(h)));
        assert_eq!(table.resolve(h), None, "released handle stays dead");
        assert_eq!(table.release(h), Err(HandleError::NotFound(h)));
        assert!(table.is_empty());
    }

    #[test]
    fn allocator_never_reuses_values_across_clones() {
        let a = HandleAllocator::new();
        let b = a.clone();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(a.allocate()));
            assert!(seen.insert(b.allocate()));
        }
        assert_eq!(a.issued(), 2000);
    }

    #[test]
    fn allocator_is_thread_safe() {
        let alloc = HandleAllocator::new();
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let alloc = alloc.clone();
                std::thread::spawn(move || (0..500).map(|_| alloc.allocate()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<Handle> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 2000);
    }

    #[test]
    fn null_and_double_bind_are_rejected() {
        let mut table = HandleTable::new();
        assert_eq!(table.bind(Handle::NULL, 1), Err(HandleError::Null));
        table.bind(Handle(5), 1).unwrap();
        assert_eq!(
            table.bind(Handle(5), 2),
            Err(HandleError::AlreadyBound(Handle(5)))
        );
        assert_eq!(table.resolve(Handle(5)), Some(&1));
    }

    #[test]
    fn drain_live_skips_tombstones() {
        let mut table = HandleTable::new();
        table.bind(Handle(1), 'a').unwrap();
        table.bind(Handle(2), 'b').unwrap();
        table.bind(Handle(3), 'c').unwrap();
        table.release(Handle(2)).unwrap();
        assert_eq!(table.drain_live(), vec![(Handle(1), 'a'), (Handle(3), 'c')]);
        assert!(table.is_empty());
        assert_eq!(table.resolve(Handle(1)), None);
    }
}
