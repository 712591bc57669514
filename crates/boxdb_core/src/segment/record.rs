//! Data file record format.

use crate::error::{CoreError, CoreResult};
use crate::types::{RecordKey, SequenceNumber};
use crate::wal::{compute_crc32, decode_key, encode_key};

/// Flags of a data file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentRecordFlags(u8);

impl SegmentRecordFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// The record was deleted at this sequence.
    pub const TOMBSTONE: Self = Self(0x01);

    /// Creates flags from the raw byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Self {
        Self(b)
    }

    /// Raw byte value.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self.0
    }

    /// Checks the tombstone flag.
    #[must_use]
    pub const fn is_tombstone(self) -> bool {
        self.0 & 0x01 != 0
    }
}

/// One version of one record, as stored in the data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRecord {
    /// Record address.
    pub key: RecordKey,
    /// Record flags.
    pub flags: SegmentRecordFlags,
    /// Commit that wrote this version.
    pub sequence: SequenceNumber,
    /// Stored bytes, empty for tombstones.
    pub payload: Vec<u8>,
}

impl SegmentRecord {
    /// record_len (4) + key (21) + flags (1) + sequence (8)
    pub const HEADER_SIZE: usize = 34;
    /// CRC size.
    pub const CRC_SIZE: usize = 4;

    /// Creates a put record.
    #[must_use]
    pub fn put(key: RecordKey, payload: Vec<u8>, sequence: SequenceNumber) -> Self {
        Self {
            key,
            flags: SegmentRecordFlags::NONE,
            sequence,
            payload,
        }
    }

    /// Creates a tombstone.
    #[must_use]
    pub fn tombstone(key: RecordKey, sequence: SequenceNumber) -> Self {
        Self {
            key,
            flags: SegmentRecordFlags::TOMBSTONE,
            sequence,
            payload: Vec::new(),
        }
    }

    /// Returns whether this is a tombstone.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.flags.is_tombstone()
    }

    /// Encoded size of this record.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len() + Self::CRC_SIZE
    }

    /// Appends the encoded record to `buf`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record does not fit a 4-byte length.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> CoreResult<()> {
        let record_len = u32::try_from(self.encoded_size())
            .map_err(|_| CoreError::illegal_argument("record too large for the data file"))?;
        let start = buf.len();
        buf.extend_from_slice(&record_len.to_le_bytes());
        encode_key(buf, &self.key);
        buf.push(self.flags.as_byte());
        buf.extend_from_slice(&self.sequence.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.payload);
        let crc = compute_crc32(&buf[start..]);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(())
    }

    /// Decodes one complete record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::FilePagesCorrupt`] on a length or checksum
    /// mismatch or a malformed key.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < Self::HEADER_SIZE + Self::CRC_SIZE {
            return Err(CoreError::pages_corrupt("data record too short"));
        }
        let record_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if record_len != data.len() {
            return Err(CoreError::pages_corrupt(format!(
                "data record length {record_len} does not match {} bytes read",
                data.len()
            )));
        }
        let body = &data[..record_len - Self::CRC_SIZE];
        let stored = u32::from_le_bytes([
            data[record_len - 4],
            data[record_len - 3],
            data[record_len - 2],
            data[record_len - 1],
        ]);
        let computed = compute_crc32(body);
        if stored != computed {
            return Err(CoreError::pages_corrupt(format!(
                "data record checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
            )));
        }
        let key = decode_key(&data[4..])
            .ok_or_else(|| CoreError::pages_corrupt("malformed key in data record"))?;
        let flags = SegmentRecordFlags::from_byte(data[25]);
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&data[26..34]);
        Ok(Self {
            key,
            flags,
            sequence: SequenceNumber::new(u64::from_le_bytes(seq)),
            payload: body[Self::HEADER_SIZE..].to_vec(),
        })
    }
}
