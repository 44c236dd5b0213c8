//! Cache counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of cache activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Class lookups answered from the cache
    pub hits: u64,
    /// Class lookups that missed the lock-free read
    pub misses: u64,
    /// Class entries created
    pub populations: u64,
    /// Assignability answers served from the memo
    pub assignability_hits: u64,
    /// Assignability questions forwarded to the reflector
    pub assignability_checks: u64,
    /// Entries removed because their key was dropped
    pub finalized: u64,
    /// Class entries currently held
    pub cached_classes: usize,
}

impl CacheStats {
    /// Fraction of class lookups served without populating (0.0 if none)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) populations: AtomicU64,
    pub(crate) assignability_hits: AtomicU64,
    pub(crate) assignability_checks: AtomicU64,
}

impl StatsCounters {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, finalized: u64, cached_classes: usize) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            populations: self.populations.load(Ordering::Relaxed),
            assignability_hits: self.assignability_hits.load(Ordering::Relaxed),
            assignability_checks: self.assignability_checks.load(Ordering::Relaxed),
            finalized,
            cached_classes,
        }
    }
}
