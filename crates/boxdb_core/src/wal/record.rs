//! WAL record types and serialization.

use crate::error::{CoreError, CoreResult};
use crate::types::{RecordKey, SequenceNumber, TableId, TransactionId};

/// Magic bytes identifying a WAL record.
pub const WAL_MAGIC: [u8; 4] = *b"BWAL";

/// Current WAL format version.
pub const WAL_VERSION: u16 = 1;

/// Type of WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    /// Begin a transaction.
    Begin = 1,
    /// Put a record.
    Put = 2,
    /// Delete a record.
    Delete = 3,
    /// Commit a transaction.
    Commit = 4,
    /// Checkpoint marker.
    Checkpoint = 6,
}

impl WalRecordType {
    /// Converts a byte to a record type.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Begin),
            2 => Some(Self::Put),
            3 => Some(Self::Delete),
            4 => Some(Self::Commit),
            6 => Some(Self::Checkpoint),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One logged operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// Begin a transaction.
    Begin {
        /// Transaction ID.
        txid: TransactionId,
    },

    /// Put (insert or replace) a record.
    Put {
        /// Transaction ID.
        txid: TransactionId,
        /// Record address.
        key: RecordKey,
        /// Stored bytes.
        payload: Vec<u8>,
    },

    /// Delete a record.
    Delete {
        /// Transaction ID.
        txid: TransactionId,
        /// Record address.
        key: RecordKey,
    },

    /// Commit a transaction.
    Commit {
        /// Transaction ID.
        txid: TransactionId,
        /// Sequence number assigned to this commit.
        sequence: SequenceNumber,
    },

    /// Everything up to `sequence` is in the data file.
    Checkpoint {
        /// Sequence number at checkpoint.
        sequence: SequenceNumber,
    },
}

/// Size of an encoded [`RecordKey`]: kind (1) + schema id (4) + primary (8) + secondary (8).
const KEY_SIZE: usize = 21;

pub(crate) fn encode_key(buf: &mut Vec<u8>, key: &RecordKey) {
    let (kind, id) = key.table.to_parts();
    buf.push(kind);
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&key.primary.to_le_bytes());
    buf.extend_from_slice(&key.secondary.to_le_bytes());
}

pub(crate) fn decode_key(bytes: &[u8]) -> Option<RecordKey> {
    if bytes.len() < KEY_SIZE {
        return None;
    }
    let table = TableId::from_parts(bytes[0], u32::from_le_bytes(bytes[1..5].try_into().ok()?))?;
    Some(RecordKey {
        table,
        primary: u64::from_le_bytes(bytes[5..13].try_into().ok()?),
        secondary: u64::from_le_bytes(bytes[13..21].try_into().ok()?),
    })
}

impl WalRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> WalRecordType {
        match self {
            Self::Begin { .. } => WalRecordType::Begin,
            Self::Put { .. } => WalRecordType::Put,
            Self::Delete { .. } => WalRecordType::Delete,
            Self::Commit { .. } => WalRecordType::Commit,
            Self::Checkpoint { .. } => WalRecordType::Checkpoint,
        }
    }

    /// Returns the transaction ID if this record is associated with one.
    #[must_use]
    pub fn txid(&self) -> Option<TransactionId> {
        match self {
            Self::Begin { txid }
            | Self::Put { txid, .. }
            | Self::Delete { txid, .. }
            | Self::Commit { txid, .. } => Some(*txid),
            Self::Checkpoint { .. } => None,
        }
    }

    /// Maximum payload of a put; the envelope carries a 4-byte length.
    pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize - 64;

    /// Serializes the record payload (without envelope).
    ///
    /// # Errors
    ///
    /// Returns an error if a put payload exceeds [`Self::MAX_PAYLOAD_SIZE`].
    pub fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();

        match self {
            Self::Begin { txid } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
            }
            Self::Put { txid, key, payload } => {
                if payload.len() > Self::MAX_PAYLOAD_SIZE {
                    return Err(CoreError::illegal_argument(format!(
                        "object of {} bytes exceeds the maximum of {} bytes",
                        payload.len(),
                        Self::MAX_PAYLOAD_SIZE
                    )));
                }
                buf.reserve(8 + KEY_SIZE + payload.len());
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
                encode_key(&mut buf, key);
                buf.extend_from_slice(payload);
            }
            Self::Delete { txid, key } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
                encode_key(&mut buf, key);
            }
            Self::Commit { txid, sequence } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
                buf.extend_from_slice(&sequence.as_u64().to_le_bytes());
            }
            Self::Checkpoint { sequence } => {
                buf.extend_from_slice(&sequence.as_u64().to_le_bytes());
            }
        }

        Ok(buf)
    }

    /// Deserializes a record from its type and payload.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::FileCorrupt`] if the payload is malformed.
    pub fn decode_payload(record_type: WalRecordType, payload: &[u8]) -> CoreResult<Self> {
        let read_u64 = |at: usize| -> CoreResult<u64> {
            payload
                .get(at..at + 8)
                .and_then(|b| b.try_into().ok())
                .map(u64::from_le_bytes)
                .ok_or_else(|| CoreError::file_corrupt("unexpected end of WAL payload"))
        };
        let read_key = |at: usize| -> CoreResult<RecordKey> {
            payload
                .get(at..)
                .and_then(decode_key)
                .ok_or_else(|| CoreError::file_corrupt("malformed record key in WAL"))
        };
        let exact = |expected: usize, name: &str| -> CoreResult<()> {
            if payload.len() == expected {
                Ok(())
            } else {
                Err(CoreError::file_corrupt(format!(
                    "{name} record has {} bytes, expected {expected}",
                    payload.len()
                )))
            }
        };

        match record_type {
            WalRecordType::Begin => {
                exact(8, "Begin")?;
                Ok(Self::Begin {
                    txid: TransactionId::new(read_u64(0)?),
                })
            }
            WalRecordType::Put => {
                let txid = TransactionId::new(read_u64(0)?);
                let key = read_key(8)?;
                Ok(Self::Put {
                    txid,
                    key,
                    payload: payload[8 + KEY_SIZE..].to_vec(),
                })
            }
            WalRecordType::Delete => {
                exact(8 + KEY_SIZE, "Delete")?;
                Ok(Self::Delete {
                    txid: TransactionId::new(read_u64(0)?),
                    key: read_key(8)?,
                })
            }
            WalRecordType::Commit => {
                exact(16, "Commit")?;
                Ok(Self::Commit {
                    txid: TransactionId::new(read_u64(0)?),
                    sequence: SequenceNumber::new(read_u64(8)?),
                })
            }
            WalRecordType::Checkpoint => {
                exact(8, "Checkpoint")?;
                Ok(Self::Checkpoint {
                    sequence: SequenceNumber::new(read_u64(0)?),
                })
            }
        }
    }
}

/// Computes the IEEE CRC32 checksum of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
