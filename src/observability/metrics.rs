use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    #[inline]
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// All engine counters, shared by every component through an `Arc`.
#[derive(Debug, Default)]
pub struct Metrics {
    // WAL
    pub wal_flushes: Counter,
    pub wal_syncs: Counter,
    pub wal_bytes_written: Counter,
    pub wal_records_appended: Counter,
    pub wal_rolls: Counter,
    pub wal_files_reused: Counter,

    // Block cache
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub cache_evictions: Counter,

    // Applier
    pub records_applied: Counter,
    pub txns_committed: Counter,
    pub txns_aborted: Counter,

    // Overflow logs and compaction
    pub overflow_records_written: Counter,
    pub overflow_records_deleted: Counter,
    pub overflow_records_moved: Counter,
    pub overflow_logs_created: Counter,
    pub overflow_logs_deleted: Counter,
    pub overflow_logs_recycled: Counter,
    pub compaction_passes: Counter,

    pub checkpoints: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            wal_flushes: self.wal_flushes.get(),
            wal_syncs: self.wal_syncs.get(),
            wal_bytes_written: self.wal_bytes_written.get(),
            wal_records_appended: self.wal_records_appended.get(),
            wal_rolls: self.wal_rolls.get(),
            wal_files_reused: self.wal_files_reused.get(),
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
            cache_evictions: self.cache_evictions.get(),
            records_applied: self.records_applied.get(),
            txns_committed: self.txns_committed.get(),
            txns_aborted: self.txns_aborted.get(),
            overflow_records_written: self.overflow_records_written.get(),
            overflow_records_deleted: self.overflow_records_deleted.get(),
            overflow_records_moved: self.overflow_records_moved.get(),
            overflow_logs_created: self.overflow_logs_created.get(),
            overflow_logs_deleted: self.overflow_logs_deleted.get(),
            overflow_logs_recycled: self.overflow_logs_recycled.get(),
            compaction_passes: self.compaction_passes.get(),
            checkpoints: self.checkpoints.get(),
        }
    }
}

/// Point-in-time copy of [`Metrics`], serializable for stats tooling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub wal_flushes: u64,
    pub wal_syncs: u64,
    pub wal_bytes_written: u64,
    pub wal_records_appended: u64,
    pub wal_rolls: u64,
    pub wal_files_reused: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub records_applied: u64,
    pub txns_committed: u64,
    pub txns_aborted: u64,
    pub overflow_records_written: u64,
    pub overflow_records_deleted: u64,
    pub overflow_records_moved: u64,
    pub overflow_logs_created: u64,
    pub overflow_logs_deleted: u64,
    pub overflow_logs_recycled: u64,
    pub compaction_passes: u64,
    pub checkpoints: u64,
}
