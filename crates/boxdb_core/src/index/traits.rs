//! Index traits and key types.

use std::cmp::Ordering;
use std::ops::Bound;

use boxdb_codec::Value;

use crate::model::{Property, PropertyFlags, PropertyType};

/// A normalized property value as stored in an index.
#[derive(Debug, Clone)]
pub enum IndexKey {
    /// Integer-like properties, including relations and dates.
    Int(i64),
    /// Float and Double properties, ordered by `f64::total_cmp`.
    Float(f64),
    /// String properties.
    Text(String),
    /// Byte vectors.
    Bytes(Vec<u8>),
    /// Hash of a string or byte value (hash indexes only).
    Hash(u64),
}

impl IndexKey {
    fn rank(&self) -> u8 {
        match self {
            Self::Int(_) => 0,
            Self::Float(_) => 1,
            Self::Text(_) => 2,
            Self::Bytes(_) => 3,
            Self::Hash(_) => 4,
        }
    }

    /// Builds the key for a stored field, or `None` if the value is not
    /// indexed (null, a mismatching type, or skipped by a partial index).
    #[must_use]
    pub fn for_field(property: &Property, value: &Value) -> Option<Self> {
        let key = Self::plain(property.ptype, value)?;
        if property.flags.contains(PropertyFlags::INDEX_PARTIAL_SKIP_ZERO) {
            if let Self::Int(0) = key {
                return None;
            }
        }
        if property.flags.is_hash_indexed() {
            return Some(key.hashed());
        }
        Some(key)
    }

    /// Builds the unhashed key for a value of `ptype`.
    #[must_use]
    pub fn plain(ptype: PropertyType, value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(b) if ptype == PropertyType::Bool => Some(Self::Int(i64::from(*b))),
            Value::Integer(n) if ptype.is_integer() => Some(Self::Int(*n)),
            #[allow(clippy::cast_precision_loss)]
            Value::Integer(n) if ptype.is_float() => Some(Self::Float(*n as f64)),
            Value::Float(f) if ptype.is_float() => Some(Self::Float(*f)),
            Value::Text(s) if ptype == PropertyType::String => Some(Self::Text(s.clone())),
            Value::Bytes(b) if ptype == PropertyType::ByteVector => Some(Self::Bytes(b.clone())),
            _ => None,
        }
    }

    /// Replaces text and byte keys by their 64-bit FNV-1a hash.
    #[must_use]
    pub fn hashed(self) -> Self {
        match self {
            Self::Text(s) => Self::Hash(fnv1a(s.as_bytes())),
            Self::Bytes(b) => Self::Hash(fnv1a(&b)),
            other => other,
        }
    }
}

fn fnv1a(data: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325_u64;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            (Self::Hash(a), Self::Hash(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl std::hash::Hash for IndexKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Self::Int(n) => n.hash(state),
            Self::Float(f) => f.to_bits().hash(state),
            Self::Text(s) => s.hash(state),
            Self::Bytes(b) => b.hash(state),
            Self::Hash(h) => h.hash(state),
        }
    }
}

/// Versioned key to object mapping.
///
/// Entries are a superset of what any live snapshot sees: an entry removed
/// by a commit is only retired, and dropped by [`Index::prune`] once no
/// reader can still observe it. Callers verify candidates against the
/// object version of their snapshot.
pub trait Index: Send + Sync {
    /// Records that `id` has `key` from now on.
    fn insert(&mut self, key: IndexKey, id: u64);

    /// Records that `id` stopped having `key` at commit `end_seq`.
    fn retire(&mut self, key: &IndexKey, id: u64, end_seq: u64);

    /// Candidate objects with `key`.
    fn lookup(&self, key: &IndexKey) -> Vec<u64>;

    /// Candidate objects with a key in the range; `None` if the index keeps
    /// no order.
    fn range(&self, lower: Bound<&IndexKey>, upper: Bound<&IndexKey>) -> Option<Vec<u64>>;

    /// Drops retired entries no snapshot at or above `watermark` can see.
    fn prune(&mut self, watermark: u64);

    /// Number of entries, retired ones included.
    fn len(&self) -> usize;

    /// Returns true if the index has no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IdUid;

    fn property(ptype: PropertyType, flags: PropertyFlags) -> Property {
        Property {
            id: 2,
            uid: 20,
            name: "p".into(),
            ptype,
            flags,
            index: Some(IdUid::new(1, 30)),
            target_entity: None,
        }
    }

    #[test]
    fn keys_follow_property_type() {
        let long = property(PropertyType::Long, PropertyFlags::INDEXED);
        assert_eq!(IndexKey::for_field(&long, &Value::Integer(5)), Some(IndexKey::Int(5)));
        assert_eq!(IndexKey::for_field(&long, &Value::Null), None);
        assert_eq!(IndexKey::for_field(&long, &Value::Text("x".into())), None);

        let double = property(PropertyType::Double, PropertyFlags::INDEXED);
        assert_eq!(
            IndexKey::for_field(&double, &Value::Integer(2)),
            Some(IndexKey::Float(2.0))
        );
    }

    #[test]
    fn hash_index_hashes_strings() {
        let hashed = property(PropertyType::String, PropertyFlags::INDEX_HASH);
        let a = IndexKey::for_field(&hashed, &Value::Text("abc".into()));
        let b = IndexKey::for_field(&hashed, &Value::Text("abc".into()));
        assert!(matches!(a, Some(IndexKey::Hash(_))));
        assert_eq!(a, b);
    }

    #[test]
    fn partial_index_skips_zero() {
        let p = property(
            PropertyType::Int,
            PropertyFlags::INDEXED | PropertyFlags::INDEX_PARTIAL_SKIP_ZERO,
        );
        assert_eq!(IndexKey::for_field(&p, &Value::Integer(0)), None);
        assert_eq!(IndexKey::for_field(&p, &Value::Integer(1)), Some(IndexKey::Int(1)));
    }

    #[test]
    fn float_order_is_total() {
        assert!(IndexKey::Float(-1.0) < IndexKey::Float(0.5));
        assert_eq!(IndexKey::Float(f64::NAN), IndexKey::Float(f64::NAN));
    }
}
