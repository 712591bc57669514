//! Store configuration.

use std::ops::BitOr;
use std::path::PathBuf;
use std::time::Duration;

use crate::model::Model;

/// Prefix of a directory that opens a purely in-memory store.
pub const MEMORY_PREFIX: &str = "memory:";

/// Per-concern debug logging switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebugFlags(u32);

impl DebugFlags {
    /// No debug output.
    pub const NONE: Self = Self(0);
    /// Log read transactions.
    pub const LOG_TRANSACTIONS_READ: Self = Self(1);
    /// Log write transactions.
    pub const LOG_TRANSACTIONS_WRITE: Self = Self(2);
    /// Log query executions.
    pub const LOG_QUERIES: Self = Self(4);
    /// Log query parameters along with queries.
    pub const LOG_QUERY_PARAMETERS: Self = Self(8);
    /// Log async queue activity.
    pub const LOG_ASYNC_QUEUE: Self = Self(16);
    /// Log object buffer cache hits.
    pub const LOG_CACHE_HITS: Self = Self(32);
    /// Log every object buffer cache access.
    pub const LOG_CACHE_ALL: Self = Self(64);
    /// Accepted for compatibility; there is no tree API.
    pub const LOG_TREE: Self = Self(128);
    /// Run a concurrent read self-test when the store opens.
    pub const RUN_THREADING_SELF_TEST: Self = Self(512);

    /// Builds flags from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl BitOr for DebugFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// How object buffers handed to `put` are brought to a multiple of 4 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingMode {
    /// Copy and pad when needed.
    #[default]
    Automatic,
    /// Pad in place; the buffer must have spare capacity.
    AllowedByBuffer,
    /// The caller pads; unpadded buffers are rejected.
    ByCaller,
}

/// Behaviour of a put with respect to an existing object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PutMode {
    /// Insert or replace.
    #[default]
    Put,
    /// Fail with `IdAlreadyExists` if the ID is taken.
    Insert,
    /// Fail with `IdNotFound` if the ID is free.
    Update,
}

/// Tuning of the background write queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncOptions {
    /// Queue length at which enqueueing is rejected.
    pub max_queue_length: usize,
    /// Queue length at which producers are slowed down (0 disables).
    pub throttle_at_queue_length: usize,
    /// How long a throttled producer sleeps.
    pub throttle_micros: u64,
    /// Maximum time a batch transaction stays open.
    pub max_in_tx_duration: Duration,
    /// Maximum operations per batch transaction.
    pub max_in_tx_operations: usize,
    /// Delay before starting a batch, letting bursts coalesce.
    pub pre_txn_delay: Duration,
    /// Delay after committing a batch.
    pub post_txn_delay: Duration,
    /// Total bytes of recycled object buffers kept around.
    pub object_bytes_max_cache_size: usize,
    /// Largest object buffer that is recycled.
    pub object_bytes_max_size_to_cache: usize,
    /// How long an enqueue waits for room before giving up.
    pub enqueue_timeout: Duration,
}

impl Default for AsyncOptions {
    fn default() -> Self {
        Self {
            max_queue_length: 100_000,
            throttle_at_queue_length: 0,
            throttle_micros: 1_000,
            max_in_tx_duration: Duration::from_millis(500),
            max_in_tx_operations: 10_000,
            pre_txn_delay: Duration::ZERO,
            post_txn_delay: Duration::ZERO,
            object_bytes_max_cache_size: 512 * 1024,
            object_bytes_max_size_to_cache: 64 * 1024,
            enqueue_timeout: Duration::ZERO,
        }
    }
}

impl AsyncOptions {
    /// Creates the default async configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the rejection ceiling.
    #[must_use]
    pub const fn max_queue_length(mut self, len: usize) -> Self {
        self.max_queue_length = len;
        self
    }

    /// Sets the throttling threshold and sleep.
    #[must_use]
    pub const fn throttle(mut self, at_queue_length: usize, micros: u64) -> Self {
        self.throttle_at_queue_length = at_queue_length;
        self.throttle_micros = micros;
        self
    }

    /// Caps how long a batch transaction stays open.
    #[must_use]
    pub const fn max_in_tx_duration(mut self, duration: Duration) -> Self {
        self.max_in_tx_duration = duration;
        self
    }

    /// Caps operations per batch transaction.
    #[must_use]
    pub const fn max_in_tx_operations(mut self, ops: usize) -> Self {
        self.max_in_tx_operations = ops;
        self
    }

    /// Sets the delays around each batch transaction.
    #[must_use]
    pub const fn txn_delays(mut self, pre: Duration, post: Duration) -> Self {
        self.pre_txn_delay = pre;
        self.post_txn_delay = post;
        self
    }

    /// Sets the object buffer cache limits.
    #[must_use]
    pub const fn object_bytes_cache(mut self, max_total: usize, max_single: usize) -> Self {
        self.object_bytes_max_cache_size = max_total;
        self.object_bytes_max_size_to_cache = max_single;
        self
    }

    /// Sets how long a full queue is waited on before rejecting.
    #[must_use]
    pub const fn enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout = timeout;
        self
    }
}

/// Options for [`crate::Store::open`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Store directory, or `memory:<name>`.
    pub directory: PathBuf,
    /// Model to open with; required unless `read_schema` is set.
    pub model: Option<Model>,
    /// Open with the schema persisted in the store.
    pub read_schema: bool,
    /// Size limit of the store files in KiB.
    pub max_db_size_kb: u64,
    /// Size limit of live object data in KiB (0 = unlimited).
    pub max_data_size_kb: u64,
    /// Unix permissions for created files.
    pub file_mode: u32,
    /// Number of reader slots.
    pub max_readers: u32,
    /// Initial debug flags.
    pub debug_flags: DebugFlags,
    /// Padding policy of puts.
    pub put_padding_mode: PaddingMode,
    /// Reject writes.
    pub read_only: bool,
    /// Discard the most recent commit at open.
    pub use_previous_commit: bool,
    /// Sync the WAL on every commit.
    pub sync_on_commit: bool,
    /// WAL size in bytes after which a checkpoint runs (0 = never).
    pub checkpoint_threshold: u64,
    /// Background queue tuning.
    pub async_options: AsyncOptions,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("boxdb"),
            model: None,
            read_schema: false,
            max_db_size_kb: 1024 * 1024,
            max_data_size_kb: 0,
            file_mode: 0o644,
            max_readers: 126,
            debug_flags: DebugFlags::NONE,
            put_padding_mode: PaddingMode::Automatic,
            read_only: false,
            use_previous_commit: false,
            sync_on_commit: true,
            checkpoint_threshold: 16 * 1024 * 1024,
            async_options: AsyncOptions::default(),
        }
    }
}

impl StoreOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the store directory.
    #[must_use]
    pub fn directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.directory = dir.into();
        self
    }

    /// Hands over the model. The options own it from here on.
    #[must_use]
    pub fn model(mut self, model: Model) -> Self {
        self.model = Some(model);
        self
    }

    /// Opens with the persisted schema instead of a model.
    #[must_use]
    pub const fn read_schema(mut self, value: bool) -> Self {
        self.read_schema = value;
        self
    }

    /// Sets the store size limit in KiB.
    #[must_use]
    pub const fn max_db_size_kb(mut self, kb: u64) -> Self {
        self.max_db_size_kb = kb;
        self
    }

    /// Sets the object data limit in KiB.
    #[must_use]
    pub const fn max_data_size_kb(mut self, kb: u64) -> Self {
        self.max_data_size_kb = kb;
        self
    }

    /// Sets unix permissions for created files.
    #[must_use]
    pub const fn file_mode(mut self, mode: u32) -> Self {
        self.file_mode = mode;
        self
    }

    /// Sets the number of reader slots.
    #[must_use]
    pub const fn max_readers(mut self, readers: u32) -> Self {
        self.max_readers = readers;
        self
    }

    /// Sets the initial debug flags.
    #[must_use]
    pub const fn debug_flags(mut self, flags: DebugFlags) -> Self {
        self.debug_flags = flags;
        self
    }

    /// Sets the padding policy.
    #[must_use]
    pub const fn put_padding_mode(mut self, mode: PaddingMode) -> Self {
        self.put_padding_mode = mode;
        self
    }

    /// Opens read-only.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Discards the last commit at open.
    #[must_use]
    pub const fn use_previous_commit(mut self, value: bool) -> Self {
        self.use_previous_commit = value;
        self
    }

    /// Sets whether each commit syncs the WAL.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the automatic checkpoint threshold in WAL bytes.
    #[must_use]
    pub const fn checkpoint_threshold(mut self, bytes: u64) -> Self {
        self.checkpoint_threshold = bytes;
        self
    }

    /// Sets the background queue tuning.
    #[must_use]
    pub fn async_options(mut self, options: AsyncOptions) -> Self {
        self.async_options = options;
        self
    }

    /// Returns the store name if the directory selects an in-memory store.
    #[must_use]
    pub fn memory_name(&self) -> Option<&str> {
        self.directory.to_str()?.strip_prefix(MEMORY_PREFIX)
    }

    pub(crate) fn max_db_size_bytes(&self) -> u64 {
        self.max_db_size_kb.saturating_mul(1024)
    }

    pub(crate) fn max_data_size_bytes(&self) -> Option<u64> {
        (self.max_data_size_kb > 0).then(|| self.max_data_size_kb.saturating_mul(1024))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = StoreOptions::default();
        assert_eq!(options.max_readers, 126);
        assert_eq!(options.max_db_size_bytes(), 1 << 30);
        assert_eq!(options.max_data_size_bytes(), None);
        assert_eq!(options.put_padding_mode, PaddingMode::Automatic);
        assert_eq!(options.async_options.max_queue_length, 100_000);
        assert!(options.sync_on_commit);
    }

    #[test]
    fn builder_pattern() {
        let options = StoreOptions::new()
            .directory("memory:test")
            .max_readers(4)
            .max_data_size_kb(2)
            .debug_flags(DebugFlags::LOG_QUERIES | DebugFlags::LOG_ASYNC_QUEUE);
        assert_eq!(options.memory_name(), Some("test"));
        assert_eq!(options.max_readers, 4);
        assert_eq!(options.max_data_size_bytes(), Some(2048));
        assert!(options.debug_flags.contains(DebugFlags::LOG_ASYNC_QUEUE));
        assert!(!options.debug_flags.contains(DebugFlags::LOG_TREE));
    }

    #[test]
    fn disk_directory_is_not_memory() {
        assert_eq!(StoreOptions::new().directory("/tmp/x").memory_name(), None);
    }
}
