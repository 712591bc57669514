//! WAL writer.

use crate::error::{CoreError, CoreResult};
use crate::wal::record::{compute_crc32, WalRecord, WAL_MAGIC, WAL_VERSION};
use boxdb_storage::StorageBackend;
use parking_lot::Mutex;
use std::sync::Arc;

/// magic (4) + version (2) + type (1) + length (4)
pub(crate) const HEADER_SIZE: usize = 11;

pub(crate) const CRC_SIZE: usize = 4;

/// Append-only access to the write-ahead log.
pub struct WalManager {
    backend: Arc<Mutex<Box<dyn StorageBackend>>>,
    sync_on_commit: bool,
}

impl WalManager {
    /// Creates a WAL manager over `backend`.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_commit: bool) -> Self {
        Self {
            backend: Arc::new(Mutex::new(backend)),
            sync_on_commit,
        }
    }

    fn frame(record: &WalRecord, out: &mut Vec<u8>) -> CoreResult<()> {
        let payload = record.encode_payload()?;
        let start = out.len();
        out.extend_from_slice(&WAL_MAGIC);
        out.extend_from_slice(&WAL_VERSION.to_le_bytes());
        out.push(record.record_type().as_byte());
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::illegal_argument("WAL record payload too large"))?;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&payload);
        let crc = compute_crc32(&out[start..]);
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(())
    }

    /// Appends a single record and returns its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is too large or the write fails.
    pub fn append(&self, record: &WalRecord) -> CoreResult<u64> {
        let mut data = Vec::new();
        Self::frame(record, &mut data)?;
        let mut backend = self.backend.lock();
        Ok(backend.append(&data)?)
    }

    /// Appends the records of one transaction with a single write, then
    /// flushes (and syncs, if configured) before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or any I/O step fails.
    pub fn append_transaction(&self, records: &[WalRecord]) -> CoreResult<u64> {
        let mut data = Vec::new();
        for record in records {
            Self::frame(record, &mut data)?;
        }
        let mut backend = self.backend.lock();
        let offset = backend.append(&data)?;
        backend.flush()?;
        if self.sync_on_commit {
            backend.sync()?;
        }
        Ok(offset)
    }

    /// Flushes pending writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend flush fails.
    pub fn flush(&self) -> CoreResult<()> {
        self.backend.lock().flush()?;
        Ok(())
    }

    /// Current WAL size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }

    /// Returns a streaming iterator over all records.
    ///
    /// The WAL stays locked while the iterator is alive.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be accessed.
    pub fn iter(&self) -> CoreResult<super::WalRecordIterator<'_>> {
        super::WalRecordIterator::new(self.backend.lock(), 0)
    }

    /// Reads all records into memory.
    ///
    /// # Errors
    ///
    /// Returns the first corruption or I/O error met.
    pub fn read_all(&self) -> CoreResult<Vec<(u64, WalRecord)>> {
        self.iter()?.collect()
    }

    /// Discards everything from `offset` on.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot truncate.
    pub fn truncate(&self, offset: u64) -> CoreResult<()> {
        let mut backend = self.backend.lock();
        backend.truncate(offset)?;
        backend.sync()?;
        Ok(())
    }

    /// Empties the WAL after a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot truncate.
    pub fn clear(&self) -> CoreResult<()> {
        self.truncate(0)
    }

    #[cfg(test)]
    pub(crate) fn backend_for_testing(&self) -> Arc<Mutex<Box<dyn StorageBackend>>> {
        Arc::clone(&self.backend)
    }
}

impl std::fmt::Debug for WalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalManager")
            .field("sync_on_commit", &self.sync_on_commit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RecordKey, SequenceNumber, TransactionId};
    use boxdb_storage::InMemoryBackend;

    fn create_wal() -> WalManager {
        WalManager::new(Box::new(InMemoryBackend::new()), false)
    }

    fn txn(id: u64) -> Vec<WalRecord> {
        let txid = TransactionId::new(id);
        vec![
            WalRecord::Begin { txid },
            WalRecord::Put {
                txid,
                key: RecordKey::object(1, id),
                payload: vec![0xa0, 0, 0, 0],
            },
            WalRecord::Commit {
                txid,
                sequence: SequenceNumber::new(id),
            },
        ]
    }

    #[test]
    fn transaction_is_written_in_order() {
        let wal = create_wal();
        wal.append_transaction(&txn(1)).unwrap();
        let records: Vec<_> = wal.read_all().unwrap().into_iter().map(|(_, r)| r).collect();
        assert_eq!(records, txn(1));
    }

    #[test]
    fn read_empty_wal() {
        assert!(create_wal().read_all().unwrap().is_empty());
    }

    #[test]
    fn clear_and_truncate() {
        let wal = create_wal();
        wal.append_transaction(&txn(1)).unwrap();
        let after_first = wal.size().unwrap();
        wal.append_transaction(&txn(2)).unwrap();
        assert_eq!(wal.read_all().unwrap().len(), 6);

        wal.truncate(after_first).unwrap();
        assert_eq!(wal.read_all().unwrap().len(), 3);

        wal.clear().unwrap();
        assert_eq!(wal.size().unwrap(), 0);
    }

    #[test]
    fn single_append_returns_offset() {
        let wal = create_wal();
        let first = wal
            .append(&WalRecord::Checkpoint {
                sequence: SequenceNumber::new(4),
            })
            .unwrap();
        let second = wal
            .append(&WalRecord::Checkpoint {
                sequence: SequenceNumber::new(5),
            })
            .unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, (HEADER_SIZE + 8 + CRC_SIZE) as u64);
    }
}
