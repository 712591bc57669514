//! Object records: the byte form of a stored object.
//!
//! A record is a CBOR map from property ID to value, written with keys in
//! ascending order. Up to three zero bytes may follow the map so that the
//! record length is a multiple of four.

use std::collections::BTreeMap;

use crate::decoder::Decoder;
use crate::encoder::Encoder;
use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// Records are padded to this alignment.
pub const RECORD_ALIGNMENT: usize = 4;

/// Number of zero bytes needed to pad a record of `len` bytes.
#[must_use]
pub fn padding_for(len: usize) -> usize {
    (RECORD_ALIGNMENT - len % RECORD_ALIGNMENT) % RECORD_ALIGNMENT
}

/// Appends zero padding so `buf.len()` becomes a multiple of four.
pub fn pad(buf: &mut Vec<u8>) {
    let extra = padding_for(buf.len());
    buf.resize(buf.len() + extra, 0);
}

/// Property values of one object keyed by property ID.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectRecord {
    fields: BTreeMap<u32, Value>,
}

impl ObjectRecord {
    /// Creates an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`ObjectRecord::set`].
    #[must_use]
    pub fn with(mut self, property: u32, value: impl Into<Value>) -> Self {
        self.set(property, value);
        self
    }

    /// Sets a property, replacing any previous value.
    pub fn set(&mut self, property: u32, value: impl Into<Value>) {
        self.fields.insert(property, value.into());
    }

    /// Returns the value of a property, if present.
    #[must_use]
    pub fn get(&self, property: u32) -> Option<&Value> {
        self.fields.get(&property)
    }

    /// Removes a property and returns its value.
    pub fn remove(&mut self, property: u32) -> Option<Value> {
        self.fields.remove(&property)
    }

    /// Iterates `(property, value)` in ascending property order.
    pub fn fields(&self) -> impl Iterator<Item = (u32, &Value)> {
        self.fields.iter().map(|(id, value)| (*id, value))
    }

    /// Number of properties present.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true when no property is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Encodes the record without padding.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(16 + self.fields.len() * 8);
        encoder.map_header(self.fields.len());
        for (id, value) in &self.fields {
            encoder.integer(i64::from(*id));
            encoder.value(value);
        }
        encoder.into_bytes()
    }

    /// Encodes the record and pads it to a multiple of four bytes.
    #[must_use]
    pub fn encode_padded(&self) -> Vec<u8> {
        let mut bytes = self.encode();
        pad(&mut bytes);
        bytes
    }

    /// Decodes a record, accepting up to three trailing zero bytes.
    ///
    /// # Errors
    ///
    /// Fails if the bytes are not a map keyed by property IDs, if a key
    /// repeats, or if anything other than padding follows the map.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let mut decoder = Decoder::new(bytes);
        let pairs = decoder
            .map_header()
            .map_err(|_| CodecError::invalid_record("top-level item is not a map"))?;
        let mut fields = BTreeMap::new();
        for _ in 0..pairs {
            let key = decoder.value()?;
            let id = key
                .as_integer()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| {
                    CodecError::invalid_record(format!(
                        "property key must be a u32, found {}",
                        key.type_name()
                    ))
                })?;
            let value = decoder.value()?;
            if fields.insert(id, value).is_some() {
                return Err(CodecError::invalid_record(format!(
                    "property {id} appears twice"
                )));
            }
        }
        let tail = decoder.remaining();
        if tail.len() >= RECORD_ALIGNMENT || tail.iter().any(|&b| b != 0) {
            return Err(CodecError::invalid_record(format!(
                "{} unexpected bytes after record",
                tail.len()
            )));
        }
        Ok(Self { fields })
    }
}

impl FromIterator<(u32, Value)> for ObjectRecord {
    fn from_iter<I: IntoIterator<Item = (u32, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> ObjectRecord {
        ObjectRecord::new()
            .with(1, 7i64)
            .with(2, "Ada")
            .with(3, 36i32)
            .with(4, 1.5f64)
    }

    #[test]
    fn keys_are_written_in_ascending_order() {
        let record = ObjectRecord::new().with(10, 1i64).with(2, 2i64);
        assert_eq!(record.encode(), vec![0xa2, 0x02, 0x02, 0x0a, 0x01]);
    }

    #[test]
    fn decode_accepts_padding() {
        let record = person();
        let padded = record.encode_padded();
        assert_eq!(padded.len() % RECORD_ALIGNMENT, 0);
        assert_eq!(ObjectRecord::decode(&padded).unwrap(), record);
        assert_eq!(ObjectRecord::decode(&record.encode()).unwrap(), record);
    }

    #[test]
    fn decode_rejects_garbage_tail() {
        let mut bytes = person().encode();
        bytes.push(1);
        assert!(matches!(
            ObjectRecord::decode(&bytes),
            Err(CodecError::InvalidRecord { .. })
        ));

        let mut bytes = person().encode();
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        assert!(ObjectRecord::decode(&bytes).is_err());
    }

    #[test]
    fn decode_rejects_non_map_and_bad_keys() {
        assert!(ObjectRecord::decode(&[0x80]).is_err());
        // {"a": 1}
        assert!(ObjectRecord::decode(&[0xa1, 0x61, b'a', 0x01]).is_err());
        // {-1: 1}
        assert!(ObjectRecord::decode(&[0xa1, 0x20, 0x01]).is_err());
        // {1: 1, 1: 2}
        assert!(ObjectRecord::decode(&[0xa2, 0x01, 0x01, 0x01, 0x02]).is_err());
    }

    #[test]
    fn padding_math() {
        assert_eq!(padding_for(0), 0);
        assert_eq!(padding_for(1), 3);
        assert_eq!(padding_for(4), 0);
        assert_eq!(padding_for(7), 1);
        let mut buf = vec![1, 2, 3, 4, 5];
        pad(&mut buf);
        assert_eq!(buf, vec![1, 2, 3, 4, 5, 0, 0, 0]);
    }

    #[test]
    fn field_access() {
        let mut record = person();
        assert_eq!(record.len(), 4);
        assert_eq!(record.get(2).and_then(Value::as_text), Some("Ada"));
        assert_eq!(record.remove(2), Some(Value::Text("Ada".into())));
        assert!(record.get(2).is_none());
        let ids: Vec<u32> = record.fields().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![1, 3, 4]);
    }
}
