//! Data file access.

use crate::error::{CoreError, CoreResult};
use crate::segment::record::SegmentRecord;
use boxdb_storage::StorageBackend;
use parking_lot::RwLock;

/// Position of one record inside the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    /// Offset of the record header.
    pub offset: u64,
    /// Encoded length including header and checksum.
    pub len: u32,
}

/// Result of scanning the data file at open.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Records in file order with their locations.
    pub records: Vec<(RecordLocation, SegmentRecord)>,
    /// End of the last complete record.
    pub valid_end: u64,
    /// Bytes after `valid_end` that form no complete record.
    pub torn_tail: u64,
}

/// Append-only data file holding every committed record version.
pub struct SegmentManager {
    backend: RwLock<Box<dyn StorageBackend>>,
}

impl SegmentManager {
    /// Wraps a backend.
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend: RwLock::new(backend),
        }
    }

    /// Appends the records of one commit with a single write.
    ///
    /// Returns the location of every record, in input order.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the write fails.
    pub fn append_batch(&self, records: &[SegmentRecord]) -> CoreResult<Vec<RecordLocation>> {
        let mut buf = Vec::with_capacity(records.iter().map(SegmentRecord::encoded_size).sum());
        let mut lens = Vec::with_capacity(records.len());
        for record in records {
            let before = buf.len();
            record.encode_into(&mut buf)?;
            lens.push(buf.len() - before);
        }
        let mut backend = self.backend.write();
        let base = backend.append(&buf)?;
        backend.flush()?;

        let mut offset = base;
        let mut locations = Vec::with_capacity(lens.len());
        for len in lens {
            let len32 = u32::try_from(len)
                .map_err(|_| CoreError::illegal_argument("record too large for the data file"))?;
            locations.push(RecordLocation {
                offset,
                len: len32,
            });
            offset += len as u64;
        }
        Ok(locations)
    }

    /// Reads and verifies the record at `location`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::FilePagesCorrupt`] if the bytes do not verify.
    pub fn read(&self, location: RecordLocation) -> CoreResult<SegmentRecord> {
        let data = self
            .backend
            .read()
            .read_at(location.offset, location.len as usize)
            .map_err(|err| {
                CoreError::pages_corrupt(format!(
                    "cannot read data record at offset {}: {err}",
                    location.offset
                ))
            })?;
        SegmentRecord::decode(&data)
    }

    /// Reads every complete record.
    ///
    /// A record cut short by the end of the file is reported as a torn
    /// tail, not an error: the commit it belongs to is still in the WAL.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::FilePagesCorrupt`] for a complete record that
    /// does not verify.
    pub fn scan(&self) -> CoreResult<ScanOutcome> {
        let backend = self.backend.read();
        let size = backend.size()?;
        let mut outcome = ScanOutcome::default();
        let mut offset = 0u64;

        while offset + 4 <= size {
            let len_bytes = backend.read_at(offset, 4)?;
            let record_len =
                u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
            if (record_len as usize) < SegmentRecord::HEADER_SIZE + SegmentRecord::CRC_SIZE {
                return Err(CoreError::pages_corrupt(format!(
                    "invalid data record length {record_len} at offset {offset}"
                )));
            }
            if offset + u64::from(record_len) > size {
                break;
            }
            let data = backend.read_at(offset, record_len as usize)?;
            let record = SegmentRecord::decode(&data).map_err(|err| {
                CoreError::pages_corrupt(format!("at offset {offset}: {err}"))
            })?;
            outcome.records.push((
                RecordLocation {
                    offset,
                    len: record_len,
                },
                record,
            ));
            offset += u64::from(record_len);
        }

        outcome.valid_end = offset;
        outcome.torn_tail = size - offset;
        Ok(outcome)
    }

    /// Discards everything from `offset` on.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot truncate.
    pub fn truncate(&self, offset: u64) -> CoreResult<()> {
        let mut backend = self.backend.write();
        backend.truncate(offset)?;
        backend.sync()?;
        Ok(())
    }

    /// Forces data to stable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> CoreResult<()> {
        self.backend.write().sync()?;
        Ok(())
    }

    /// Data file size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.read().size()?)
    }
}

impl std::fmt::Debug for SegmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RecordKey, SequenceNumber};
    use boxdb_storage::InMemoryBackend;

    fn records() -> Vec<SegmentRecord> {
        vec![
            SegmentRecord::put(RecordKey::object(1, 1), vec![1, 2, 3, 4], SequenceNumber::new(1)),
            SegmentRecord::tombstone(RecordKey::object(1, 2), SequenceNumber::new(1)),
        ]
    }

    #[test]
    fn append_and_read() {
        let manager = SegmentManager::new(Box::new(InMemoryBackend::new()));
        let locations = manager.append_batch(&records()).unwrap();
        assert_eq!(locations.len(), 2);
        assert_eq!(locations[0].offset, 0);
        assert_eq!(locations[1].offset, u64::from(locations[0].len));
        assert_eq!(manager.read(locations[0]).unwrap().payload, vec![1, 2, 3, 4]);
        assert!(manager.read(locations[1]).unwrap().is_tombstone());
    }

    #[test]
    fn scan_reports_torn_tail() {
        let backend = InMemoryBackend::new();
        let manager = SegmentManager::new(Box::new(backend.share()));
        manager.append_batch(&records()).unwrap();
        let full = manager.size().unwrap();
        manager.truncate(full - 2).unwrap();

        let outcome = manager.scan().unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert!(outcome.torn_tail > 0);
        assert_eq!(outcome.valid_end + outcome.torn_tail, full - 2);
    }

    #[test]
    fn scan_rejects_damaged_record() {
        let backend = InMemoryBackend::new();
        let manager = SegmentManager::new(Box::new(backend.share()));
        manager.append_batch(&records()).unwrap();
        backend.corrupt_byte(SegmentRecord::HEADER_SIZE, 0xee);
        assert!(matches!(
            manager.scan(),
            Err(CoreError::FilePagesCorrupt { .. })
        ));
    }
}
