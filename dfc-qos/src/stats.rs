use std::sync::atomic::{AtomicUsize, Ordering};

/// Statistics for a single interface.
/// Updated on the packet path and by watchdog timers, readable without the table lock.
#[derive(Debug, Default)]
pub struct QosStats {
    /// Packets stamped with a flow id
    marked: AtomicUsize,
    /// Packets that matched no filter rule
    unmarked: AtomicUsize,
    /// Packets that could not be dissected
    dissect_failures: AtomicUsize,
    /// Total number of bearer watchdog expiries
    watchdog_expiries: AtomicUsize,
}

impl QosStats {
    #[inline]
    pub(crate) fn increment_marked(&self) {
        self.marked.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_unmarked(&self) {
        self.unmarked.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_dissect_failures(&self) {
        self.dissect_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_watchdog_expiries(&self) {
        self.watchdog_expiries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn marked(&self) -> usize {
        self.marked.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn unmarked(&self) -> usize {
        self.unmarked.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn dissect_failures(&self) -> usize {
        self.dissect_failures.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn watchdog_expiries(&self) -> usize {
        self.watchdog_expiries.load(Ordering::Relaxed)
    }
}
