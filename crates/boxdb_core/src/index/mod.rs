//! Secondary indexes.
//!
//! Every property flagged INDEXED, UNIQUE or INDEX_HASH(64), and every
//! to-one relation property, gets an index. Indexes are rebuilt from the
//! data file at open and maintained by each commit; they are never
//! persisted.
//!
//! - [`BTreeIndex`]: ordered, serves equality and range lookups
//! - [`HashIndex`]: hashed keys, equality only

mod btree;
mod hash;
mod traits;

use std::collections::HashMap;
use std::ops::Bound;

use boxdb_codec::ObjectRecord;

use crate::model::{Entity, Model, SchemaId};

pub use btree::BTreeIndex;
pub use hash::HashIndex;
pub use traits::{Index, IndexKey};

/// All indexes of a store, addressed by `(entity, property)`.
#[derive(Default)]
pub struct IndexSet {
    indexes: HashMap<(SchemaId, SchemaId), Box<dyn Index>>,
}

impl IndexSet {
    /// Creates empty indexes for every indexed property of `model`.
    #[must_use]
    pub fn for_model(model: &Model) -> Self {
        let mut indexes: HashMap<_, Box<dyn Index>> = HashMap::new();
        for entity in &model.entities {
            for property in &entity.properties {
                if !property.flags.is_indexed() {
                    continue;
                }
                let index: Box<dyn Index> = if property.flags.is_hash_indexed() {
                    Box::new(HashIndex::new())
                } else {
                    Box::new(BTreeIndex::new())
                };
                indexes.insert((entity.id, property.id), index);
            }
        }
        Self { indexes }
    }

    /// Returns the index of a property.
    #[must_use]
    pub fn get(&self, entity: SchemaId, property: SchemaId) -> Option<&dyn Index> {
        self.indexes.get(&(entity, property)).map(AsRef::as_ref)
    }

    /// Candidate objects of `entity` whose `property` equals `key`.
    #[must_use]
    pub fn lookup(&self, entity: SchemaId, property: SchemaId, key: &IndexKey) -> Option<Vec<u64>> {
        self.get(entity, property).map(|index| index.lookup(key))
    }

    /// Candidate objects of `entity` whose `property` lies in the range.
    #[must_use]
    pub fn range(
        &self,
        entity: SchemaId,
        property: SchemaId,
        lower: Bound<&IndexKey>,
        upper: Bound<&IndexKey>,
    ) -> Option<Vec<u64>> {
        self.get(entity, property)?.range(lower, upper)
    }

    /// Updates the indexes of `entity` for one object changed at `seq`.
    pub fn apply(
        &mut self,
        entity: &Entity,
        id: u64,
        old: Option<&ObjectRecord>,
        new: Option<&ObjectRecord>,
        seq: u64,
    ) {
        for property in &entity.properties {
            let Some(index) = self.indexes.get_mut(&(entity.id, property.id)) else {
                continue;
            };
            let key_of = |record: Option<&ObjectRecord>| {
                record
                    .and_then(|r| r.get(property.id))
                    .and_then(|value| IndexKey::for_field(property, value))
            };
            let old_key = key_of(old);
            let new_key = key_of(new);
            if old_key == new_key {
                continue;
            }
            if let Some(key) = &old_key {
                index.retire(key, id, seq);
            }
            if let Some(key) = new_key {
                index.insert(key, id);
            }
        }
    }

    /// Drops retired entries below `watermark` in every index.
    pub fn prune(&mut self, watermark: u64) {
        for index in self.indexes.values_mut() {
            index.prune(watermark);
        }
    }

    /// Returns true if there are no indexes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }
}

impl std::fmt::Debug for IndexSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSet")
            .field("indexes", &self.indexes.len())
            .field("entries", &self.indexes.values().map(|index| index.len()).sum::<usize>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelBuilder, PropertyFlags, PropertyType};
    use boxdb_codec::Value;

    fn model() -> Model {
        ModelBuilder::new()
            .entity("Person", 1, 10)
            .property("id", PropertyType::Long, 1, 11)
            .property_flags(PropertyFlags::ID)
            .property("name", PropertyType::String, 2, 12)
            .property_flags(PropertyFlags::INDEXED)
            .property_index_id(1, 13)
            .property("email", PropertyType::String, 3, 14)
            .property_flags(PropertyFlags::UNIQUE | PropertyFlags::INDEX_HASH)
            .property_index_id(2, 15)
            .property("age", PropertyType::Int, 4, 16)
            .build()
            .unwrap()
    }

    fn person(name: &str, email: &str) -> ObjectRecord {
        ObjectRecord::new()
            .with(2, Value::from(name))
            .with(3, Value::from(email))
            .with(4, Value::Integer(3))
    }

    #[test]
    fn builds_one_index_per_indexed_property() {
        let set = IndexSet::for_model(&model());
        assert_eq!(set.indexes.len(), 2);
        assert!(set.get(1, 2).is_some());
        assert!(set.get(1, 4).is_none());
    }

    #[test]
    fn apply_moves_entries() {
        let model = model();
        let entity = model.entity(1).unwrap();
        let mut set = IndexSet::for_model(&model);
        let ann = person("Ann", "a@x");
        let anna = person("Anna", "a@x");
        set.apply(entity, 1, None, Some(&ann), 1);
        set.apply(entity, 1, Some(&ann), Some(&anna), 2);

        let name = IndexKey::Text("Ann".into());
        // retired but still visible to older snapshots
        assert_eq!(set.lookup(1, 2, &name), Some(vec![1]));
        set.prune(2);
        assert_eq!(set.lookup(1, 2, &name), Some(vec![]));
        assert_eq!(set.lookup(1, 2, &IndexKey::Text("Anna".into())), Some(vec![1]));

        let email = IndexKey::Text("a@x".into()).hashed();
        assert_eq!(set.lookup(1, 3, &email), Some(vec![1]));
        assert_eq!(set.range(1, 3, Bound::Unbounded, Bound::Unbounded), None);
    }
}
