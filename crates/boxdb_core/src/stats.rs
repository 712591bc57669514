//! Store statistics.
//!
//! Counters are atomic and may be read while operations run. All of them
//! only grow for the lifetime of an open store.
//!
//! ```rust,ignore
//! let stats = store.stats();
//! println!("puts: {}, commits: {}", stats.puts, stats.commits);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters of one open store.
#[derive(Debug, Default)]
pub struct StoreStats {
    reads: AtomicU64,
    bytes_read: AtomicU64,
    puts: AtomicU64,
    bytes_written: AtomicU64,
    removes: AtomicU64,
    queries: AtomicU64,
    index_lookups: AtomicU64,
    scans: AtomicU64,
    read_transactions: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
    checkpoints: AtomicU64,
    async_submitted: AtomicU64,
    async_completed: AtomicU64,
    async_failed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl StoreStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_read(&self, bytes: usize) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_put(&self, bytes: usize) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_remove(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_query(&self, used_index: bool) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        if used_index {
            self.index_lookups.fetch_add(1, Ordering::Relaxed);
        } else {
            self.scans.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_read_transaction(&self) {
        self.read_transactions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_async_submitted(&self) {
        self.async_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_async_done(&self, completed: usize, failed: usize) {
        self.async_completed
            .fetch_add(completed as u64, Ordering::Relaxed);
        self.async_failed.fetch_add(failed as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_cache(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Copies the counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            reads: load(&self.reads),
            bytes_read: load(&self.bytes_read),
            puts: load(&self.puts),
            bytes_written: load(&self.bytes_written),
            removes: load(&self.removes),
            queries: load(&self.queries),
            index_lookups: load(&self.index_lookups),
            scans: load(&self.scans),
            read_transactions: load(&self.read_transactions),
            commits: load(&self.commits),
            aborts: load(&self.aborts),
            checkpoints: load(&self.checkpoints),
            async_submitted: load(&self.async_submitted),
            async_completed: load(&self.async_completed),
            async_failed: load(&self.async_failed),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
        }
    }
}

/// A point-in-time copy of [`StoreStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Objects read.
    pub reads: u64,
    /// Bytes of objects read.
    pub bytes_read: u64,
    /// Objects put.
    pub puts: u64,
    /// Bytes of objects put.
    pub bytes_written: u64,
    /// Objects removed.
    pub removes: u64,
    /// Query executions.
    pub queries: u64,
    /// Query executions served by an index.
    pub index_lookups: u64,
    /// Query executions that scanned the entity.
    pub scans: u64,
    /// Top-level read transactions started.
    pub read_transactions: u64,
    /// Write transactions committed.
    pub commits: u64,
    /// Write transactions aborted.
    pub aborts: u64,
    /// Checkpoints written.
    pub checkpoints: u64,
    /// Operations accepted by the async queue.
    pub async_submitted: u64,
    /// Async operations committed.
    pub async_completed: u64,
    /// Async operations dropped because they failed.
    pub async_failed: u64,
    /// Object buffers reused from the async cache.
    pub cache_hits: u64,
    /// Object buffers allocated because the cache had none.
    pub cache_misses: u64,
}
