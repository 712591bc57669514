//! Property-based test generators using proptest.
//!
//! Provides strategies for generating objects of the fixture model and
//! write workloads against it.

use crate::fixtures::PersonRecord;
use proptest::prelude::*;

/// Strategy for person names, mixed case so case-insensitive matching
/// has something to do.
pub fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Za-z][a-z]{0,11}").expect("valid regex")
}

/// Strategy for ages inside the Int range.
pub fn age_strategy() -> impl Strategy<Value = i64> {
    0i64..120
}

/// Strategy for finite scores.
pub fn score_strategy() -> impl Strategy<Value = f64> {
    (-1_000_000i32..1_000_000).prop_map(|n| f64::from(n) / 100.0)
}

/// A generated person before encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonSpec {
    /// Name.
    pub name: String,
    /// Age, absent for some objects.
    pub age: Option<i64>,
    /// Score.
    pub score: f64,
}

impl PersonSpec {
    /// Encodes the person.
    pub fn encode(&self) -> Vec<u8> {
        let mut record = PersonRecord::new(&self.name).score(self.score);
        if let Some(age) = self.age {
            record = record.age(age);
        }
        record.encode()
    }
}

/// Strategy for whole persons.
pub fn person_strategy() -> impl Strategy<Value = PersonSpec> {
    (name_strategy(), prop::option::weighted(0.8, age_strategy()), score_strategy())
        .prop_map(|(name, age, score)| PersonSpec { name, age, score })
}

/// One step of a write workload.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Put a new person.
    Insert(PersonSpec),
    /// Overwrite the n-th live object (modulo the live count).
    Update(usize, PersonSpec),
    /// Remove the n-th live object (modulo the live count).
    Remove(usize),
}

/// Strategy for a single write step.
pub fn write_op_strategy() -> impl Strategy<Value = WriteOp> {
    prop_oneof![
        3 => person_strategy().prop_map(WriteOp::Insert),
        2 => (any::<usize>(), person_strategy()).prop_map(|(n, p)| WriteOp::Update(n, p)),
        1 => any::<usize>().prop_map(WriteOp::Remove),
    ]
}

/// Strategy for a workload of up to `max_len` steps.
pub fn workload_strategy(max_len: usize) -> impl Strategy<Value = Vec<WriteOp>> {
    prop::collection::vec(write_op_strategy(), 1..=max_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{name_of, person};
    use boxdb_codec::ObjectRecord;

    proptest! {
        #[test]
        fn names_are_not_empty(name in name_strategy()) {
            prop_assert!(!name.is_empty());
        }

        #[test]
        fn encoded_persons_decode(spec in person_strategy()) {
            let data = spec.encode();
            prop_assert_eq!(name_of(&data), spec.name.clone());
            let record = ObjectRecord::decode(&data).unwrap();
            prop_assert_eq!(
                record.get(person::AGE).and_then(|v| v.as_integer()),
                spec.age
            );
        }

        #[test]
        fn workloads_respect_length(ops in workload_strategy(8)) {
            prop_assert!(!ops.is_empty() && ops.len() <= 8);
        }
    }
}
