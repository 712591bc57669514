//! Result ordering.

use std::cmp::Ordering;
use std::ops::BitOr;

use boxdb_codec::{ObjectRecord, Value};

use crate::model::{Property, SchemaId};

/// Flags of an order clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OrderFlags(u32);

impl OrderFlags {
    /// Ascending, case-insensitive, nulls first.
    pub const NONE: Self = Self(0);
    /// Reverses the value order. Null placement is not affected.
    pub const DESCENDING: Self = Self(1);
    /// Compares strings case-sensitively.
    pub const CASE_SENSITIVE: Self = Self(2);
    /// Compares integers as unsigned.
    pub const UNSIGNED: Self = Self(4);
    /// Puts nulls after all values.
    pub const NULLS_LAST: Self = Self(8);
    /// Treats null numbers as zero.
    pub const NULLS_ZERO: Self = Self(16);

    /// Creates flags from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if all bits of `other` are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OrderFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One order clause, resolved against the model.
#[derive(Debug, Clone)]
pub(crate) struct OrderBy {
    pub(crate) property: SchemaId,
    pub(crate) name: String,
    pub(crate) numeric: bool,
    pub(crate) unsigned: bool,
    pub(crate) flags: OrderFlags,
}

impl OrderBy {
    pub(crate) fn new(property: &Property, flags: OrderFlags) -> Self {
        Self {
            property: property.id,
            name: property.name.clone(),
            numeric: property.ptype.is_numeric(),
            unsigned: property.is_unsigned(),
            flags,
        }
    }

    fn key(&self, record: &ObjectRecord) -> SortKey {
        let value = record.get(self.property).filter(|v| !v.is_null());
        let case_sensitive = self.flags.contains(OrderFlags::CASE_SENSITIVE);
        let unsigned = self.unsigned || self.flags.contains(OrderFlags::UNSIGNED);
        match value {
            None if self.numeric && self.flags.contains(OrderFlags::NULLS_ZERO) => SortKey::Int(0),
            None => SortKey::Null,
            Some(Value::Bool(b)) => SortKey::Int(i64::from(*b)),
            #[allow(clippy::cast_sign_loss)]
            Some(Value::Integer(n)) if unsigned => SortKey::Unsigned(*n as u64),
            Some(Value::Integer(n)) => SortKey::Int(*n),
            Some(Value::Float(f)) => SortKey::Float(*f),
            Some(Value::Text(s)) if case_sensitive => SortKey::Text(s.clone()),
            Some(Value::Text(s)) => SortKey::Text(s.to_lowercase()),
            Some(Value::Bytes(b)) => SortKey::Bytes(b.clone()),
            Some(_) => SortKey::Null,
        }
    }

    fn compare(&self, a: &ObjectRecord, b: &ObjectRecord) -> Ordering {
        let (a, b) = (self.key(a), self.key(b));
        let nulls_last = self.flags.contains(OrderFlags::NULLS_LAST);
        match (&a, &b) {
            (SortKey::Null, SortKey::Null) => Ordering::Equal,
            (SortKey::Null, _) if nulls_last => Ordering::Greater,
            (SortKey::Null, _) => Ordering::Less,
            (_, SortKey::Null) if nulls_last => Ordering::Less,
            (_, SortKey::Null) => Ordering::Greater,
            _ if self.flags.contains(OrderFlags::DESCENDING) => b.compare(&a),
            _ => a.compare(&b),
        }
    }
}

#[derive(Debug)]
enum SortKey {
    Null,
    Int(i64),
    Unsigned(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl SortKey {
    #[allow(clippy::cast_precision_loss)]
    fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Unsigned(a), Self::Unsigned(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Int(a), Self::Float(b)) => (*a as f64).total_cmp(b),
            (Self::Float(a), Self::Int(b)) => a.total_cmp(&(*b as f64)),
            (Self::Int(a), Self::Unsigned(b)) => i128::from(*a).cmp(&i128::from(*b)),
            (Self::Unsigned(a), Self::Int(b)) => i128::from(*a).cmp(&i128::from(*b)),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

/// Sorts `(id, record)` rows by the clauses, then by ID.
///
/// Without clauses the rows end up in ascending ID order.
pub(crate) fn sort_rows<T>(rows: &mut [(u64, ObjectRecord, T)], orders: &[OrderBy]) {
    rows.sort_by(|(a_id, a, _), (b_id, b, _)| {
        orders
            .iter()
            .map(|order| order.compare(a, b))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| a_id.cmp(b_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PropertyFlags, PropertyType};

    fn order(ptype: PropertyType, flags: OrderFlags) -> OrderBy {
        let property = Property {
            id: 2,
            uid: 9,
            name: "v".into(),
            ptype,
            flags: PropertyFlags::NONE,
            index: None,
            target_entity: None,
        };
        OrderBy::new(&property, flags)
    }

    fn rows(values: Vec<Value>) -> Vec<(u64, ObjectRecord, ())> {
        values
            .into_iter()
            .enumerate()
            .map(|(i, v)| (i as u64 + 1, ObjectRecord::new().with(2, v), ()))
            .collect()
    }

    fn ids(rows: &[(u64, ObjectRecord, ())]) -> Vec<u64> {
        rows.iter().map(|(id, _, _)| *id).collect()
    }

    #[test]
    fn nulls_first_by_default() {
        let mut data = rows(vec![Value::Integer(5), Value::Null, Value::Integer(-1)]);
        sort_rows(&mut data, &[order(PropertyType::Long, OrderFlags::NONE)]);
        assert_eq!(ids(&data), vec![2, 3, 1]);

        sort_rows(
            &mut data,
            &[order(PropertyType::Long, OrderFlags::DESCENDING | OrderFlags::NULLS_LAST)],
        );
        assert_eq!(ids(&data), vec![1, 3, 2]);
    }

    #[test]
    fn nulls_as_zero() {
        let mut data = rows(vec![Value::Integer(5), Value::Null, Value::Integer(-1)]);
        sort_rows(&mut data, &[order(PropertyType::Long, OrderFlags::NULLS_ZERO)]);
        assert_eq!(ids(&data), vec![3, 2, 1]);
    }

    #[test]
    fn case_and_ties() {
        let mut data = rows(vec![Value::from("b"), Value::from("A"), Value::from("a")]);
        sort_rows(&mut data, &[order(PropertyType::String, OrderFlags::NONE)]);
        // "A" and "a" tie and fall back to ID order
        assert_eq!(ids(&data), vec![2, 3, 1]);
        sort_rows(&mut data, &[order(PropertyType::String, OrderFlags::CASE_SENSITIVE)]);
        assert_eq!(ids(&data), vec![2, 3, 1]);
        sort_rows(
            &mut data,
            &[order(
                PropertyType::String,
                OrderFlags::CASE_SENSITIVE | OrderFlags::DESCENDING,
            )],
        );
        assert_eq!(ids(&data), vec![1, 3, 2]);
    }

    #[test]
    fn unsigned_flag() {
        let mut data = rows(vec![Value::Integer(-1), Value::Integer(1)]);
        sort_rows(&mut data, &[order(PropertyType::Long, OrderFlags::UNSIGNED)]);
        assert_eq!(ids(&data), vec![2, 1]);
    }
}
