//! Store manifest: format version, schema and ID sequences.
//!
//! ```text
//! | magic "BMFN" (4) | version (2) | CBOR body (N) | crc32 (4) |
//! ```

use std::collections::BTreeMap;

use boxdb_codec::{from_cbor, to_cbor, Value};

use crate::error::{CoreError, CoreResult};
use crate::model::{model_from_value, model_to_value, Model, SchemaId};
use crate::types::SequenceNumber;
use crate::wal::compute_crc32;

/// Magic bytes of the manifest file.
pub const MANIFEST_MAGIC: [u8; 4] = *b"BMFN";

/// Current manifest version.
pub const MANIFEST_VERSION: u16 = 1;

/// Persistent store metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    /// Data format version (major, minor).
    pub format_version: (u16, u16),
    /// Schema the store was last opened with.
    pub model: Option<Model>,
    /// Highest object ID ever handed out, per entity.
    pub id_sequences: BTreeMap<SchemaId, u64>,
    /// Everything up to this sequence is in the data file.
    pub last_checkpoint: Option<SequenceNumber>,
}

impl Manifest {
    /// Creates a manifest for a new store.
    #[must_use]
    pub fn new(model: Model) -> Self {
        Self {
            format_version: (1, 0),
            model: Some(model),
            id_sequences: BTreeMap::new(),
            last_checkpoint: None,
        }
    }

    /// Encodes the manifest.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let sequences = self
            .id_sequences
            .iter()
            .map(|(&entity, &id)| (Value::from(entity), Value::from(id)))
            .collect();
        let body = Value::map(vec![
            (
                Value::from("format"),
                Value::Array(vec![
                    Value::from(u32::from(self.format_version.0)),
                    Value::from(u32::from(self.format_version.1)),
                ]),
            ),
            (
                Value::from("model"),
                self.model.as_ref().map_or(Value::Null, model_to_value),
            ),
            (Value::from("ids"), Value::Map(sequences)),
            (
                Value::from("checkpoint"),
                Value::from(self.last_checkpoint.map(SequenceNumber::as_u64)),
            ),
        ]);

        let mut buf = Vec::new();
        buf.extend_from_slice(&MANIFEST_MAGIC);
        buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        buf.extend_from_slice(&to_cbor(&body));
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a manifest.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::FileCorrupt`] if the magic, version, checksum
    /// or body does not check out.
    #[allow(clippy::cast_sign_loss)]
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < 10 || data[0..4] != MANIFEST_MAGIC {
            return Err(CoreError::file_corrupt("invalid manifest magic"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version > MANIFEST_VERSION {
            return Err(CoreError::file_corrupt(format!(
                "unsupported manifest version {version}"
            )));
        }
        let (content, crc_bytes) = data.split_at(data.len() - 4);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if compute_crc32(content) != stored {
            return Err(CoreError::file_corrupt("manifest checksum mismatch"));
        }

        let body = from_cbor(&content[6..])?;
        let pairs = body
            .as_map()
            .ok_or_else(|| CoreError::file_corrupt("manifest body is not a map"))?;
        let field = |name: &str| {
            pairs
                .iter()
                .find(|(k, _)| k.as_text() == Some(name))
                .map(|(_, v)| v)
        };

        let format_version = match field("format").and_then(Value::as_array) {
            Some([major, minor]) => {
                let part = |v: &Value| {
                    v.as_integer()
                        .and_then(|n| u16::try_from(n).ok())
                        .ok_or_else(|| CoreError::file_corrupt("bad manifest format version"))
                };
                (part(major)?, part(minor)?)
            }
            _ => return Err(CoreError::file_corrupt("manifest lacks a format version")),
        };

        let model = match field("model") {
            None | Some(Value::Null) => None,
            Some(value) => Some(model_from_value(value)?),
        };

        let mut id_sequences = BTreeMap::new();
        if let Some(map) = field("ids").and_then(Value::as_map) {
            for (entity, id) in map {
                let entity = entity
                    .as_integer()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| CoreError::file_corrupt("bad entity in ID sequences"))?;
                let id = id
                    .as_integer()
                    .ok_or_else(|| CoreError::file_corrupt("bad ID in ID sequences"))?;
                id_sequences.insert(entity, id as u64);
            }
        }

        let last_checkpoint = field("checkpoint")
            .and_then(Value::as_integer)
            .map(|n| SequenceNumber::new(n as u64));

        Ok(Self {
            format_version,
            model,
            id_sequences,
            last_checkpoint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelBuilder, PropertyFlags, PropertyType};

    fn model() -> Model {
        ModelBuilder::new()
            .entity("Person", 1, 10)
            .property("id", PropertyType::Long, 1, 11)
            .property_flags(PropertyFlags::ID)
            .build()
            .unwrap()
    }

    #[test]
    fn encode_decode() {
        let mut manifest = Manifest::new(model());
        manifest.id_sequences.insert(1, 42);
        manifest.last_checkpoint = Some(SequenceNumber::new(7));
        let decoded = Manifest::decode(&manifest.encode()).unwrap();
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn empty_manifest() {
        let manifest = Manifest::default();
        let decoded = Manifest::decode(&manifest.encode()).unwrap();
        assert!(decoded.model.is_none());
        assert!(decoded.last_checkpoint.is_none());
    }

    #[test]
    fn checksum_detects_damage() {
        let mut data = Manifest::new(model()).encode();
        let mid = data.len() / 2;
        data[mid] ^= 0x55;
        assert!(matches!(
            Manifest::decode(&data),
            Err(CoreError::FileCorrupt { .. })
        ));
    }

    #[test]
    fn invalid_magic() {
        assert!(Manifest::decode(b"XXXX\x01\x00\xa0\0\0\0\0").is_err());
    }
}
