//! Foreign cache statistics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by [`ForeignStorageCache`](super::ForeignStorageCache).
#[derive(Debug, Default)]
pub struct ForeignCacheStats {
    /// Lookups answered from memory.
    pub hits: AtomicU64,
    /// Lookups answered by neither memory nor spill.
    pub misses: AtomicU64,
    /// Lookups answered by the spill store.
    pub spill_hits: AtomicU64,
    /// Entries pushed out of memory by the byte budget.
    pub evictions: AtomicU64,
    /// Entries written to the spill store.
    pub spills: AtomicU64,
    /// Data wrapper fetches started by `get_or_fetch`.
    pub fetches: AtomicU64,
    pub failed_fetches: AtomicU64,
}

impl ForeignCacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ForeignCacheStatsSnapshot {
        ForeignCacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            spill_hits: self.spill_hits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            spills: self.spills.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            failed_fetches: self.failed_fetches.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`ForeignCacheStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ForeignCacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub spill_hits: u64,
    pub evictions: u64,
    pub spills: u64,
    pub fetches: u64,
    pub failed_fetches: u64,
}

impl fmt::Display for ForeignCacheStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ForeignCache {{ hits: {}, spill_hits: {}, misses: {}, evictions: {}, fetches: {} }}",
            self.hits, self.spill_hits, self.misses, self.evictions, self.fetches
        )
    }
}
