//! Storage engine: WAL, data file and version index behind one API.
//!
//! A commit is logged to the WAL and flushed, then appended to the data
//! file, then published in the version index. Readers resolve a key
//! through the version index and read the bytes from the data file.

mod versions;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;

use boxdb_storage::StorageBackend;

use crate::error::{CoreError, CoreResult};
use crate::segment::{RecordLocation, SegmentManager, SegmentRecord};
use crate::types::{RecordKey, SequenceNumber, TableId, TransactionId};
use crate::wal::{WalManager, WalRecord};

pub use versions::{Version, VersionIndex};

/// One change of a commit: new bytes, or `None` to delete.
pub type Change = (RecordKey, Option<Bytes>);

/// Settings the engine needs at open.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
    /// Sync the WAL on every commit.
    pub sync_on_commit: bool,
    /// Do not modify files.
    pub read_only: bool,
    /// Discard the newest commit.
    pub use_previous_commit: bool,
}

/// What open-time recovery did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Newest commit after recovery.
    pub last_seq: u64,
    /// Transactions copied from the WAL into the data file.
    pub replayed_transactions: usize,
    /// Bytes of an incomplete data file tail that were cut off.
    pub torn_tail_bytes: u64,
    /// Commit dropped because of `use_previous_commit`.
    pub discarded_seq: Option<u64>,
    /// Highest object ID seen per entity, deleted objects included.
    pub max_ids: HashMap<u32, u64>,
}

/// Size of a data file record minus its payload.
const RECORD_OVERHEAD: u64 = (SegmentRecord::HEADER_SIZE + SegmentRecord::CRC_SIZE) as u64;

/// Durable, multi-versioned record storage.
pub struct Engine {
    wal: WalManager,
    segments: SegmentManager,
    versions: RwLock<VersionIndex>,
    next_txid: AtomicU64,
    data_bytes: AtomicU64,
    poisoned: AtomicBool,
}

impl Engine {
    /// Opens the engine, recovering the data file from the WAL.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::FileCorrupt`] for a damaged WAL and
    /// [`CoreError::FilePagesCorrupt`] for a damaged data file.
    pub fn open(
        wal_backend: Box<dyn StorageBackend>,
        data_backend: Box<dyn StorageBackend>,
        options: EngineOptions,
    ) -> CoreResult<(Self, RecoveryReport)> {
        let wal = WalManager::new(wal_backend, options.sync_on_commit);
        let segments = SegmentManager::new(data_backend);
        let mut report = RecoveryReport::default();

        let scan = segments.scan()?;
        if scan.torn_tail > 0 {
            tracing::warn!(bytes = scan.torn_tail, "cutting incomplete data file tail");
            // Read-only stores hold a private in-memory copy; replay still needs the cut.
            segments.truncate(scan.valid_end)?;
            report.torn_tail_bytes = scan.torn_tail;
        }
        let mut entries: Vec<(RecordLocation, SegmentRecord)> = scan.records;
        let segment_seq = entries.last().map_or(0, |(_, r)| r.sequence.as_u64());

        // replay committed WAL transactions the data file does not have yet
        let mut pending: HashMap<TransactionId, Vec<SegmentRecord>> = HashMap::new();
        let mut max_txid = 0;
        let mut replay = Vec::new();
        for item in wal.iter()? {
            let (_, record) = item?;
            if let Some(txid) = record.txid() {
                max_txid = max_txid.max(txid.as_u64());
            }
            match record {
                WalRecord::Begin { txid } => {
                    pending.insert(txid, Vec::new());
                }
                WalRecord::Put { txid, key, payload } => {
                    if let Some(ops) = pending.get_mut(&txid) {
                        ops.push(SegmentRecord::put(key, payload, SequenceNumber::new(0)));
                    }
                }
                WalRecord::Delete { txid, key } => {
                    if let Some(ops) = pending.get_mut(&txid) {
                        ops.push(SegmentRecord::tombstone(key, SequenceNumber::new(0)));
                    }
                }
                WalRecord::Commit { txid, sequence } => {
                    let ops = pending.remove(&txid).unwrap_or_default();
                    if sequence.as_u64() > segment_seq {
                        let ops: Vec<_> = ops
                            .into_iter()
                            .map(|mut r| {
                                r.sequence = sequence;
                                r
                            })
                            .collect();
                        replay.push(ops);
                    }
                }
                WalRecord::Checkpoint { .. } => {}
            }
        }
        for ops in replay {
            let locations = segments.append_batch(&ops)?;
            entries.extend(locations.into_iter().zip(ops));
            report.replayed_transactions += 1;
        }
        if report.replayed_transactions > 0 {
            tracing::info!(
                transactions = report.replayed_transactions,
                "replayed committed transactions from the WAL"
            );
        }

        let mut last_seq = entries.last().map_or(0, |(_, r)| r.sequence.as_u64());
        if options.use_previous_commit && last_seq > 0 {
            let cut = entries
                .iter()
                .position(|(_, r)| r.sequence.as_u64() == last_seq)
                .unwrap_or(entries.len());
            let offset = entries.get(cut).map_or(0, |(loc, _)| loc.offset);
            entries.truncate(cut);
            segments.truncate(offset)?;
            if !options.read_only {
                wal.clear()?;
            }
            tracing::info!(seq = last_seq, "discarded the newest commit");
            report.discarded_seq = Some(last_seq);
            last_seq = entries.last().map_or(0, |(_, r)| r.sequence.as_u64());
        }

        let mut versions = VersionIndex::new();
        let mut live: HashMap<RecordKey, u64> = HashMap::new();
        for (location, record) in entries {
            if let TableId::Objects(entity) = record.key.table {
                let max = report.max_ids.entry(entity).or_insert(0);
                *max = (*max).max(record.key.primary);
            }
            let location = if record.is_tombstone() {
                live.remove(&record.key);
                None
            } else {
                live.insert(record.key, record.payload.len() as u64);
                Some(location)
            };
            versions.push(
                record.key,
                Version {
                    seq: record.sequence.as_u64(),
                    location,
                },
            );
        }
        versions.prune(last_seq);
        report.last_seq = last_seq;

        let data_bytes = live
            .iter()
            .filter(|(key, _)| matches!(key.table, TableId::Objects(_)))
            .map(|(_, len)| len)
            .sum();

        Ok((
            Self {
                wal,
                segments,
                versions: RwLock::new(versions),
                next_txid: AtomicU64::new(max_txid + 1),
                data_bytes: AtomicU64::new(data_bytes),
                poisoned: AtomicBool::new(false),
            },
            report,
        ))
    }

    fn check_poisoned(&self) -> CoreResult<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(CoreError::StoreMustShutdown {
                message: "an earlier commit failed after it was logged".into(),
            });
        }
        Ok(())
    }

    /// Reads the record visible at `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::FilePagesCorrupt`] if the stored bytes are bad.
    pub fn read(&self, key: &RecordKey, snapshot: u64) -> CoreResult<Option<Bytes>> {
        let location = self.versions.read().visible(key, snapshot);
        location.map(|loc| self.read_at(loc)).transpose()
    }

    /// Returns whether a record is visible at `snapshot`, without reading it.
    #[must_use]
    pub fn exists(&self, key: &RecordKey, snapshot: u64) -> bool {
        self.versions.read().visible(key, snapshot).is_some()
    }

    /// Reads the record at `location`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::FilePagesCorrupt`] if the stored bytes are bad.
    pub fn read_at(&self, location: RecordLocation) -> CoreResult<Bytes> {
        Ok(Bytes::from(self.segments.read(location)?.payload))
    }

    /// Keys in `from..=to` visible at `snapshot`, ascending.
    #[must_use]
    pub fn keys(&self, from: RecordKey, to: RecordKey, snapshot: u64) -> Vec<RecordKey> {
        if from > to {
            return Vec::new();
        }
        self.versions
            .read()
            .visible_keys(from, to, snapshot)
            .map(|(key, _)| key)
            .collect()
    }

    /// First key in `from..=to` visible at `snapshot`.
    #[must_use]
    pub fn first_key(&self, from: RecordKey, to: RecordKey, snapshot: u64) -> Option<RecordKey> {
        if from > to {
            return None;
        }
        self.versions
            .read()
            .visible_keys(from, to, snapshot)
            .next()
            .map(|(key, _)| key)
    }

    /// Newest committed records of every live key, for rebuilding indexes.
    #[must_use]
    pub fn latest_locations(&self) -> Vec<(RecordKey, RecordLocation)> {
        self.versions.read().latest_entries().collect()
    }

    /// Payload size of the newest committed version of `key`.
    #[must_use]
    pub fn latest_len(&self, key: &RecordKey) -> Option<u64> {
        self.versions
            .read()
            .latest(key)
            .map(|loc| u64::from(loc.len) - RECORD_OVERHEAD)
    }

    /// Bytes of live object data.
    #[must_use]
    pub fn data_bytes(&self) -> u64 {
        self.data_bytes.load(Ordering::Acquire)
    }

    /// Bytes the store files occupy.
    ///
    /// # Errors
    ///
    /// Returns an error if a backend cannot report its size.
    pub fn file_bytes(&self) -> CoreResult<u64> {
        Ok(self.wal.size()? + self.segments.size()?)
    }

    /// WAL size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn wal_bytes(&self) -> CoreResult<u64> {
        self.wal.size()
    }

    /// Bytes a commit of `changes` adds to the files (WAL and data file).
    #[must_use]
    pub fn commit_footprint(changes: &[Change]) -> u64 {
        let payload: u64 = changes
            .iter()
            .map(|(_, bytes)| bytes.as_ref().map_or(0, |b| b.len() as u64))
            .sum();
        // header, key and checksum in both files
        payload * 2 + changes.len() as u64 * (RECORD_OVERHEAD + 44) + 64
    }

    /// Object data size after applying `changes`.
    #[must_use]
    pub fn data_bytes_after(&self, changes: &[Change]) -> u64 {
        let mut total = i128::from(self.data_bytes());
        for (key, bytes) in changes {
            if !matches!(key.table, TableId::Objects(_)) {
                continue;
            }
            total -= i128::from(self.latest_len(key).unwrap_or(0));
            total += bytes.as_ref().map_or(0, |b| b.len() as i128);
        }
        u64::try_from(total.max(0)).unwrap_or(u64::MAX)
    }

    /// Makes `changes` durable and visible as commit `seq`.
    ///
    /// # Errors
    ///
    /// A failure before the WAL write leaves the store untouched. A
    /// failure after it poisons the engine: every later call returns
    /// [`CoreError::StoreMustShutdown`] and the next open recovers.
    pub fn commit(&self, seq: SequenceNumber, changes: &[Change]) -> CoreResult<()> {
        self.check_poisoned()?;
        let txid = TransactionId::new(self.next_txid.fetch_add(1, Ordering::Relaxed));
        let mut log = Vec::with_capacity(changes.len() + 2);
        log.push(WalRecord::Begin { txid });
        for (key, bytes) in changes {
            log.push(match bytes {
                Some(bytes) => WalRecord::Put {
                    txid,
                    key: *key,
                    payload: bytes.to_vec(),
                },
                None => WalRecord::Delete { txid, key: *key },
            });
        }
        log.push(WalRecord::Commit {
            txid,
            sequence: seq,
        });
        let data_after = self.data_bytes_after(changes);
        let wal_end = self.wal.size()?;
        if let Err(err) = self.wal.append_transaction(&log) {
            // drop a partially written transaction
            let _ = self.wal.truncate(wal_end);
            return Err(err);
        }

        let records: Vec<_> = changes
            .iter()
            .map(|(key, bytes)| match bytes {
                Some(bytes) => SegmentRecord::put(*key, bytes.to_vec(), seq),
                None => SegmentRecord::tombstone(*key, seq),
            })
            .collect();
        let locations = match self.segments.append_batch(&records) {
            Ok(locations) => locations,
            Err(err) => {
                self.poisoned.store(true, Ordering::Release);
                tracing::error!(error = %err, seq = seq.as_u64(), "data file write failed after WAL commit");
                return Err(CoreError::StoreMustShutdown {
                    message: err.to_string(),
                });
            }
        };

        let mut versions = self.versions.write();
        for ((key, bytes), location) in changes.iter().zip(locations) {
            versions.push(
                *key,
                Version {
                    seq: seq.as_u64(),
                    location: bytes.as_ref().map(|_| location),
                },
            );
        }
        self.data_bytes.store(data_after, Ordering::Release);
        Ok(())
    }

    /// Drops versions older than what `watermark` needs.
    pub fn prune(&self, watermark: u64) {
        self.versions.write().prune(watermark);
    }

    /// Syncs the data file; the WAL can be cleared afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync_data(&self) -> CoreResult<()> {
        self.check_poisoned()?;
        self.segments.sync()
    }

    /// Empties the WAL. Only valid after [`Engine::sync_data`].
    ///
    /// # Errors
    ///
    /// Returns an error if the WAL cannot be truncated.
    pub fn clear_wal(&self) -> CoreResult<()> {
        self.wal.clear()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_bytes", &self.data_bytes())
            .field("poisoned", &self.poisoned.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boxdb_storage::InMemoryBackend;

    struct Files {
        wal: InMemoryBackend,
        data: InMemoryBackend,
    }

    impl Files {
        fn new() -> Self {
            Self {
                wal: InMemoryBackend::new(),
                data: InMemoryBackend::new(),
            }
        }

        fn open(&self, options: EngineOptions) -> (Engine, RecoveryReport) {
            Engine::open(Box::new(self.wal.share()), Box::new(self.data.share()), options).unwrap()
        }
    }

    fn put(id: u64, byte: u8) -> Change {
        (RecordKey::object(1, id), Some(Bytes::from(vec![byte; 4])))
    }

    #[test]
    fn commit_then_read() {
        let files = Files::new();
        let (engine, _) = files.open(EngineOptions::default());
        engine.commit(SequenceNumber::new(1), &[put(1, 7), put(2, 8)]).unwrap();
        let key = RecordKey::object(1, 1);
        assert_eq!(engine.read(&key, 1).unwrap().unwrap().as_ref(), &[7; 4]);
        assert_eq!(engine.read(&key, 0).unwrap(), None);
        let table = TableId::Objects(1);
        let (start, end) = (RecordKey::table_start(table), RecordKey::table_end(table));
        assert_eq!(engine.keys(start, end, 1).len(), 2);
        assert_eq!(engine.first_key(RecordKey::object(1, 2), end, 1), Some(RecordKey::object(1, 2)));
        assert_eq!(engine.data_bytes(), 8);
    }

    #[test]
    fn reopen_rebuilds_versions() {
        let files = Files::new();
        {
            let (engine, _) = files.open(EngineOptions::default());
            engine.commit(SequenceNumber::new(1), &[put(1, 1), put(5, 5)]).unwrap();
            engine
                .commit(SequenceNumber::new(2), &[(RecordKey::object(1, 5), None)])
                .unwrap();
        }
        let (engine, report) = files.open(EngineOptions::default());
        assert_eq!(report.last_seq, 2);
        assert_eq!(report.replayed_transactions, 0);
        assert_eq!(report.max_ids.get(&1), Some(&5));
        assert!(engine.exists(&RecordKey::object(1, 1), 2));
        assert!(!engine.exists(&RecordKey::object(1, 5), 2));
        assert_eq!(engine.data_bytes(), 4);
    }

    #[test]
    fn wal_replays_lost_data_file_tail() {
        let files = Files::new();
        {
            let (engine, _) = files.open(EngineOptions::default());
            engine.commit(SequenceNumber::new(1), &[put(1, 1)]).unwrap();
            engine.commit(SequenceNumber::new(2), &[put(2, 2)]).unwrap();
        }
        // keep the first data record, cut the second one short
        let mut data = files.data.share();
        let size = data.size().unwrap();
        data.truncate(size - 20).unwrap();

        let (engine, report) = files.open(EngineOptions::default());
        assert!(report.torn_tail_bytes > 0);
        assert_eq!(report.replayed_transactions, 1);
        assert_eq!(report.last_seq, 2);
        assert!(engine.exists(&RecordKey::object(1, 2), 2));
    }

    #[test]
    fn use_previous_commit_discards_newest() {
        let files = Files::new();
        {
            let (engine, _) = files.open(EngineOptions::default());
            engine.commit(SequenceNumber::new(1), &[put(1, 1)]).unwrap();
            engine.commit(SequenceNumber::new(2), &[put(1, 9), put(2, 2)]).unwrap();
        }
        let (engine, report) = files.open(EngineOptions {
            use_previous_commit: true,
            ..EngineOptions::default()
        });
        assert_eq!(report.discarded_seq, Some(2));
        assert_eq!(report.last_seq, 1);
        let key = RecordKey::object(1, 1);
        assert_eq!(engine.read(&key, 1).unwrap().unwrap().as_ref(), &[1; 4]);
        assert!(!engine.exists(&RecordKey::object(1, 2), 5));
        drop(engine);

        let (_, report) = files.open(EngineOptions::default());
        assert_eq!(report.last_seq, 1);
    }

    #[test]
    fn damaged_wal_refuses_open() {
        let files = Files::new();
        {
            let (engine, _) = files.open(EngineOptions::default());
            engine.commit(SequenceNumber::new(1), &[put(1, 1)]).unwrap();
        }
        files.wal.corrupt_byte(20, 0x5a);
        let result = Engine::open(
            Box::new(files.wal.share()),
            Box::new(files.data.share()),
            EngineOptions::default(),
        );
        assert!(matches!(result, Err(CoreError::FileCorrupt { .. })));
    }

    #[test]
    fn data_size_accounts_replacements() {
        let files = Files::new();
        let (engine, _) = files.open(EngineOptions::default());
        engine.commit(SequenceNumber::new(1), &[put(1, 1)]).unwrap();
        let bigger = (RecordKey::object(1, 1), Some(Bytes::from(vec![0u8; 12])));
        assert_eq!(engine.data_bytes_after(&[bigger]), 12);
        assert_eq!(engine.data_bytes_after(&[(RecordKey::object(1, 1), None)]), 0);
    }
}
