//! Cache counters and diagnostics.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads answered from a lookup table or relationship index.
    pub hits: u64,
    /// Reads that had to go to the remote boundary.
    pub misses: u64,
    pub remote_reads: u64,
    pub remote_writes: u64,
    pub remote_removes: u64,
}

impl CacheStats {
    /// Share of reads answered without a remote get, `None` before any
    /// read has happened. Remote reads made to load children or catalogs
    /// count against it too.
    pub fn local_share(&self) -> Option<f64> {
        let reads = self.hits + self.remote_reads;
        (reads > 0).then(|| self.hits as f64 / reads as f64)
    }

    /// Total calls made to the remote boundary.
    pub fn remote_calls(&self) -> u64 {
        self.remote_reads + self.remote_writes + self.remote_removes
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    remote_reads: AtomicU64,
    remote_writes: AtomicU64,
    remote_removes: AtomicU64,
}

impl StatCounters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn remote_read(&self) {
        self.remote_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn remote_write(&self) {
        self.remote_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn remote_remove(&self) {
        self.remote_removes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            remote_reads: self.remote_reads.load(Ordering::Relaxed),
            remote_writes: self.remote_writes.load(Ordering::Relaxed),
            remote_removes: self.remote_removes.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.remote_reads,
            &self.remote_writes,
            &self.remote_removes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Population of one entity type's cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeDiagnostics {
    /// Whether the descriptor has been built yet.
    pub initialised: bool,
    pub cached: usize,
    pub all_cached: bool,
    pub cache_by_default: bool,
    /// Loaded parents per child relationship name.
    pub parents_with_children: BTreeMap<String, usize>,
    pub memberships: usize,
    pub tagged: usize,
}

/// Snapshot of every type's population plus the counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheDiagnostics {
    pub types: BTreeMap<String, TypeDiagnostics>,
    pub stats: CacheStats,
    pub custom_attributes: Option<usize>,
}

impl CacheDiagnostics {
    /// Total cached handles across all types.
    pub fn total_cached(&self) -> usize {
        self.types.values().map(|t| t.cached).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_share_counts_remote_gets() {
        assert_eq!(CacheStats::default().local_share(), None);

        // Three cached lookups, one miss that cost a get, one child load.
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            remote_reads: 2,
            remote_writes: 4,
            ..Default::default()
        };
        assert_eq!(stats.local_share(), Some(0.6));
    }

    #[test]
    fn test_counters_snapshot_and_reset() {
        let counters = StatCounters::default();
        counters.hit();
        counters.miss();
        counters.remote_read();
        counters.remote_write();
        counters.remote_write();
        let stats = counters.snapshot();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.remote_calls(), 3);

        counters.reset();
        assert_eq!(counters.snapshot(), CacheStats::default());
    }
}
