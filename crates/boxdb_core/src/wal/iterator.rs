//! Streaming WAL record iterator.
//!
//! Records are read one at a time straight from the backend, so replaying a
//! large WAL needs memory for one record only.

use crate::error::{CoreError, CoreResult};
use crate::wal::record::{compute_crc32, WalRecord, WalRecordType, WAL_MAGIC, WAL_VERSION};
use crate::wal::writer::{CRC_SIZE, HEADER_SIZE};
use boxdb_storage::StorageBackend;
use parking_lot::MutexGuard;

/// Iterator over `(offset, record)` pairs of a locked WAL.
///
/// A header or body cut short by the end of the log ends iteration cleanly:
/// that is a write interrupted by a crash. Bad magic, an unknown type, a
/// newer version or a CRC mismatch is [`CoreError::FileCorrupt`].
pub struct WalRecordIterator<'a> {
    backend: MutexGuard<'a, Box<dyn StorageBackend>>,
    total_size: u64,
    offset: u64,
    finished: bool,
}

impl<'a> WalRecordIterator<'a> {
    /// Starts iterating at `start_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn new(
        backend: MutexGuard<'a, Box<dyn StorageBackend>>,
        start_offset: u64,
    ) -> CoreResult<Self> {
        let total_size = backend.size()?;
        Ok(Self {
            backend,
            total_size,
            offset: start_offset,
            finished: false,
        })
    }

    /// Offset just past the last record returned so far.
    #[must_use]
    pub fn valid_end(&self) -> u64 {
        self.offset
    }

    fn corrupt(&mut self, message: String) -> CoreError {
        self.finished = true;
        CoreError::file_corrupt(message)
    }

    fn read_next(&mut self) -> CoreResult<Option<(u64, WalRecord)>> {
        let start = self.offset;
        if start + HEADER_SIZE as u64 > self.total_size {
            return Ok(None);
        }
        let header = self.backend.read_at(start, HEADER_SIZE)?;
        if header[0..4] != WAL_MAGIC {
            return Err(self.corrupt(format!("invalid WAL magic at offset {start}")));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > WAL_VERSION {
            return Err(self.corrupt(format!(
                "unsupported WAL version {version} at offset {start}"
            )));
        }
        let Some(record_type) = WalRecordType::from_byte(header[6]) else {
            let byte = header[6];
            return Err(self.corrupt(format!(
                "unknown WAL record type {byte} at offset {start}"
            )));
        };
        let payload_len =
            u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
        if start + total_len as u64 > self.total_size {
            return Ok(None);
        }

        let mut frame = self.backend.read_at(start, total_len)?;
        let crc_bytes = frame.split_off(HEADER_SIZE + payload_len);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let computed = compute_crc32(&frame);
        if stored != computed {
            return Err(self.corrupt(format!(
                "WAL checksum mismatch at offset {start}: stored {stored:#010x}, computed {computed:#010x}"
            )));
        }

        let record = WalRecord::decode_payload(record_type, &frame[HEADER_SIZE..])?;
        self.offset += total_len as u64;
        Ok(Some((start, record)))
    }
}

impl Iterator for WalRecordIterator<'_> {
    type Item = CoreResult<(u64, WalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}
