use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`DispatchStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    pub lists_executed: u64,
    pub commands_executed: u64,
    pub commands_skipped: u64,
    pub draw_calls: u64,
    pub presents: u64,
    pub lists_discarded: u64,
}

/// Dispatcher counters.
///
/// Updated on the dispatcher thread with relaxed atomics; any thread may read them through
/// [`DispatchStats::snapshot`].
#[derive(Debug, Default)]
pub struct DispatchStats {
    lists_executed: AtomicU64,
    commands_executed: AtomicU64,
    commands_skipped: AtomicU64,
    draw_calls: AtomicU64,
    presents: AtomicU64,
    lists_discarded: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_lists_executed(&self) {
        self.lists_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_commands_executed(&self) {
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_commands_skipped(&self) {
        self.commands_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_draw_calls(&self) {
        self.draw_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_presents(&self) {
        self.presents.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_lists_discarded(&self, n: u64) {
        self.lists_discarded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            lists_executed: self.lists_executed.load(Ordering::Relaxed),
            commands_executed: self.commands_executed.load(Ordering::Relaxed),
            commands_skipped: self.commands_skipped.load(Ordering::Relaxed),
            draw_calls: self.draw_calls.load(Ordering::Relaxed),
            presents: self.presents.load(Ordering::Relaxed),
            lists_discarded: self.lists_discarded.load(Ordering::Relaxed),
        }
    }
}
