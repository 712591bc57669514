//! Persisted schema and open-time migration checks.
//!
//! The model a store was last opened with is kept in the MANIFEST as a CBOR
//! value. On the next open the new model is compared against it by UID:
//! matching UIDs keep their data, new UIDs are additions and UIDs that
//! disappeared have their data dropped.

use std::collections::HashMap;

use boxdb_codec::Value;

use crate::error::{CoreError, CoreResult};
use crate::model::types::{
    Entity, EntityFlags, IdUid, Model, Property, PropertyFlags, PropertyType, Relation, SchemaId,
};

/// Data that has to be removed because the new model no longer declares it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    /// Entities whose objects are deleted.
    pub removed_entities: Vec<SchemaId>,
    /// `(entity, property)` pairs stripped from stored objects.
    pub removed_properties: Vec<(SchemaId, SchemaId)>,
    /// Standalone relations whose rows are deleted.
    pub removed_relations: Vec<SchemaId>,
    /// Number of entities that did not exist before.
    pub added_entities: usize,
    /// Number of properties that did not exist before.
    pub added_properties: usize,
}

impl MigrationPlan {
    /// Returns true when no stored data has to change.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.removed_entities.is_empty()
            && self.removed_properties.is_empty()
            && self.removed_relations.is_empty()
    }
}

/// Checks that `new` can replace `stored` and lists the data to drop.
///
/// # Errors
///
/// Returns [`CoreError::Schema`] when a watermark decreases, when a UID
/// changes its ID or type, or when a new element reuses an old ID.
pub fn plan_migration(stored: &Model, new: &Model) -> CoreResult<MigrationPlan> {
    check_watermark("entity", stored.last_entity, new.last_entity)?;
    check_watermark("index", stored.last_index, new.last_index)?;
    check_watermark("relation", stored.last_relation, new.last_relation)?;

    let mut plan = MigrationPlan::default();
    let stored_by_uid: HashMap<_, _> = stored.entities.iter().map(|e| (e.uid, e)).collect();

    for entity in &new.entities {
        match stored_by_uid.get(&entity.uid) {
            Some(old) => {
                if old.id != entity.id {
                    return Err(CoreError::schema(format!(
                        "entity {} (UID {}) changed its ID from {} to {}",
                        entity.name, entity.uid, old.id, entity.id
                    )));
                }
                migrate_entity(old, entity, &mut plan)?;
            }
            None => {
                if entity.id <= stored.last_entity.id
                    && stored.entities.iter().any(|e| e.id == entity.id)
                {
                    return Err(CoreError::schema(format!(
                        "new entity {} reuses ID {} of a different entity",
                        entity.name, entity.id
                    )));
                }
                if entity.id <= stored.last_entity.id {
                    return Err(CoreError::schema(format!(
                        "new entity {} must use an ID above {}",
                        entity.name, stored.last_entity.id
                    )));
                }
                plan.added_entities += 1;
            }
        }
    }

    for old in &stored.entities {
        if !new.entities.iter().any(|e| e.uid == old.uid) {
            plan.removed_entities.push(old.id);
        }
    }

    let new_relations: HashMap<_, _> = new
        .entities
        .iter()
        .flat_map(|e| e.relations.iter())
        .map(|r| (r.uid, r))
        .collect();
    for old in stored.entities.iter().flat_map(|e| e.relations.iter()) {
        match new_relations.get(&old.uid) {
            Some(relation) if relation.id != old.id => {
                return Err(CoreError::schema(format!(
                    "relation UID {} changed its ID from {} to {}",
                    old.uid, old.id, relation.id
                )));
            }
            Some(_) => {}
            None => plan.removed_relations.push(old.id),
        }
    }

    Ok(plan)
}

fn check_watermark(what: &str, stored: IdUid, new: IdUid) -> CoreResult<()> {
    if new.id < stored.id {
        return Err(CoreError::schema(format!(
            "last {what} ID decreased from {stored} to {new}"
        )));
    }
    if new.id == stored.id && new.uid != stored.uid && !stored.is_unset() {
        return Err(CoreError::schema(format!(
            "last {what} ID {} changed its UID from {} to {}",
            new.id, stored.uid, new.uid
        )));
    }
    Ok(())
}

fn migrate_entity(old: &Entity, new: &Entity, plan: &mut MigrationPlan) -> CoreResult<()> {
    check_watermark(
        &format!("property of {}", new.name),
        old.last_property,
        new.last_property,
    )?;
    let old_by_uid: HashMap<_, _> = old.properties.iter().map(|p| (p.uid, p)).collect();
    for property in &new.properties {
        match old_by_uid.get(&property.uid) {
            Some(previous) => {
                if previous.id != property.id {
                    return Err(CoreError::schema(format!(
                        "property {}.{} changed its ID from {} to {}",
                        new.name, property.name, previous.id, property.id
                    )));
                }
                if previous.ptype != property.ptype {
                    return Err(CoreError::schema(format!(
                        "property {}.{} changed its type from {} to {}",
                        new.name, property.name, previous.ptype, property.ptype
                    )));
                }
            }
            None => {
                if property.id <= old.last_property.id {
                    return Err(CoreError::schema(format!(
                        "new property {}.{} must use an ID above {}",
                        new.name, property.name, old.last_property.id
                    )));
                }
                plan.added_properties += 1;
            }
        }
    }
    for previous in &old.properties {
        if !new.properties.iter().any(|p| p.uid == previous.uid) {
            plan.removed_properties.push((new.id, previous.id));
        }
    }
    Ok(())
}

fn id_uid_value(pair: IdUid) -> Value {
    Value::Array(vec![Value::from(pair.id), Value::from(pair.uid)])
}

/// Encodes a model for the MANIFEST.
#[must_use]
pub fn model_to_value(model: &Model) -> Value {
    let entities = model
        .entities
        .iter()
        .map(|entity| {
            let properties = entity
                .properties
                .iter()
                .map(|p| {
                    Value::map(vec![
                        (Value::from("id"), Value::from(p.id)),
                        (Value::from("uid"), Value::from(p.uid)),
                        (Value::from("name"), Value::from(p.name.as_str())),
                        (Value::from("type"), Value::from(u32::from(p.ptype.code()))),
                        (Value::from("flags"), Value::from(p.flags.bits())),
                        (Value::from("index"), p.index.map_or(Value::Null, id_uid_value)),
                        (Value::from("target"), Value::from(p.target_entity)),
                    ])
                })
                .collect();
            let relations = entity
                .relations
                .iter()
                .map(|r| {
                    Value::map(vec![
                        (Value::from("id"), Value::from(r.id)),
                        (Value::from("uid"), Value::from(r.uid)),
                        (Value::from("target"), id_uid_value(r.target)),
                    ])
                })
                .collect();
            Value::map(vec![
                (Value::from("id"), Value::from(entity.id)),
                (Value::from("uid"), Value::from(entity.uid)),
                (Value::from("name"), Value::from(entity.name.as_str())),
                (Value::from("flags"), Value::from(entity.flags.bits())),
                (Value::from("last_property"), id_uid_value(entity.last_property)),
                (Value::from("properties"), Value::Array(properties)),
                (Value::from("relations"), Value::Array(relations)),
            ])
        })
        .collect();
    Value::map(vec![
        (Value::from("entities"), Value::Array(entities)),
        (Value::from("last_entity"), id_uid_value(model.last_entity)),
        (Value::from("last_index"), id_uid_value(model.last_index)),
        (Value::from("last_relation"), id_uid_value(model.last_relation)),
    ])
}

/// Decodes a model written by [`model_to_value`].
///
/// # Errors
///
/// Returns [`CoreError::FileCorrupt`] when the value has the wrong shape.
pub fn model_from_value(value: &Value) -> CoreResult<Model> {
    let fields = Fields::of(value)?;
    let entities = fields
        .array("entities")?
        .iter()
        .map(entity_from_value)
        .collect::<CoreResult<Vec<_>>>()?;
    Ok(Model {
        entities,
        last_entity: fields.id_uid("last_entity")?,
        last_index: fields.id_uid("last_index")?,
        last_relation: fields.id_uid("last_relation")?,
    })
}

fn entity_from_value(value: &Value) -> CoreResult<Entity> {
    let fields = Fields::of(value)?;
    let properties = fields
        .array("properties")?
        .iter()
        .map(|v| {
            let f = Fields::of(v)?;
            let code = u8::try_from(f.int("type")?)
                .ok()
                .and_then(PropertyType::from_code)
                .ok_or_else(|| CoreError::file_corrupt("unknown property type in schema"))?;
            let index = match f.get("index")? {
                Value::Null => None,
                other => Some(id_uid_from(other)?),
            };
            let target_entity = match f.get("target")? {
                Value::Null => None,
                other => Some(as_u32(other)?),
            };
            Ok(Property {
                id: f.u32("id")?,
                uid: f.uid("uid")?,
                name: f.text("name")?,
                ptype: code,
                flags: PropertyFlags::from_bits(f.u32("flags")?),
                index,
                target_entity,
            })
        })
        .collect::<CoreResult<Vec<_>>>()?;
    let relations = fields
        .array("relations")?
        .iter()
        .map(|v| {
            let f = Fields::of(v)?;
            Ok(Relation {
                id: f.u32("id")?,
                uid: f.uid("uid")?,
                target: f.id_uid("target")?,
            })
        })
        .collect::<CoreResult<Vec<_>>>()?;
    Ok(Entity {
        id: fields.u32("id")?,
        uid: fields.uid("uid")?,
        name: fields.text("name")?,
        flags: EntityFlags::from_bits(fields.u32("flags")?),
        properties,
        relations,
        last_property: fields.id_uid("last_property")?,
    })
}

struct Fields<'a>(&'a [(Value, Value)]);

impl<'a> Fields<'a> {
    fn of(value: &'a Value) -> CoreResult<Self> {
        value
            .as_map()
            .map(Fields)
            .ok_or_else(|| CoreError::file_corrupt("schema entry is not a map"))
    }

    fn get(&self, key: &str) -> CoreResult<&'a Value> {
        self.0
            .iter()
            .find(|(k, _)| k.as_text() == Some(key))
            .map(|(_, v)| v)
            .ok_or_else(|| CoreError::file_corrupt(format!("schema entry lacks {key}")))
    }

    fn int(&self, key: &str) -> CoreResult<i64> {
        self.get(key)?
            .as_integer()
            .ok_or_else(|| CoreError::file_corrupt(format!("schema field {key} is not an integer")))
    }

    fn u32(&self, key: &str) -> CoreResult<u32> {
        as_u32(self.get(key)?)
    }

    #[allow(clippy::cast_sign_loss)]
    fn uid(&self, key: &str) -> CoreResult<u64> {
        Ok(self.int(key)? as u64)
    }

    fn text(&self, key: &str) -> CoreResult<String> {
        self.get(key)?
            .as_text()
            .map(str::to_owned)
            .ok_or_else(|| CoreError::file_corrupt(format!("schema field {key} is not text")))
    }

    fn array(&self, key: &str) -> CoreResult<&'a [Value]> {
        self.get(key)?
            .as_array()
            .ok_or_else(|| CoreError::file_corrupt(format!("schema field {key} is not an array")))
    }

    fn id_uid(&self, key: &str) -> CoreResult<IdUid> {
        id_uid_from(self.get(key)?)
    }
}

fn as_u32(value: &Value) -> CoreResult<u32> {
    value
        .as_integer()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| CoreError::file_corrupt("schema ID out of range"))
}

#[allow(clippy::cast_sign_loss)]
fn id_uid_from(value: &Value) -> CoreResult<IdUid> {
    match value.as_array() {
        Some([id, uid]) => {
            let uid = uid
                .as_integer()
                .ok_or_else(|| CoreError::file_corrupt("schema UID is not an integer"))?;
            Ok(IdUid::new(as_u32(id)?, uid as u64))
        }
        _ => Err(CoreError::file_corrupt("schema ID pair is malformed")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelBuilder;

    fn v1() -> ModelBuilder {
        ModelBuilder::new()
            .entity("Person", 1, 100)
            .property("id", PropertyType::Long, 1, 101)
            .property_flags(PropertyFlags::ID)
            .property("name", PropertyType::String, 2, 102)
            .property("age", PropertyType::Int, 3, 103)
            .entity_last_property_id(3, 103)
            .last_entity_id(1, 100)
    }

    #[test]
    fn value_roundtrip() {
        let model = v1()
            .entity("Tag", 2, 200)
            .property("id", PropertyType::Long, 1, 201)
            .property_flags(PropertyFlags::ID)
            .property("label", PropertyType::String, 2, 202)
            .property_flags(PropertyFlags::UNIQUE)
            .property_index_id(1, 203)
            .relation(1, 204, 1, 100)
            .last_entity_id(2, 200)
            .build()
            .unwrap();
        let decoded = model_from_value(&model_to_value(&model)).unwrap();
        assert_eq!(decoded, model);
    }

    #[test]
    fn same_model_is_noop() {
        let model = v1().build().unwrap();
        let plan = plan_migration(&model, &model).unwrap();
        assert!(plan.is_noop());
        assert_eq!(plan.added_entities, 0);
    }

    #[test]
    fn removed_property_is_stripped() {
        let stored = v1().build().unwrap();
        let new = ModelBuilder::new()
            .entity("Person", 1, 100)
            .property("id", PropertyType::Long, 1, 101)
            .property_flags(PropertyFlags::ID)
            .property("fullName", PropertyType::String, 2, 102)
            .property("email", PropertyType::String, 4, 104)
            .entity_last_property_id(4, 104)
            .last_entity_id(1, 100)
            .build()
            .unwrap();
        let plan = plan_migration(&stored, &new).unwrap();
        assert_eq!(plan.removed_properties, vec![(1, 3)]);
        assert_eq!(plan.added_properties, 1);
    }

    #[test]
    fn type_change_is_rejected() {
        let stored = v1().build().unwrap();
        let new = ModelBuilder::new()
            .entity("Person", 1, 100)
            .property("id", PropertyType::Long, 1, 101)
            .property_flags(PropertyFlags::ID)
            .property("name", PropertyType::Int, 2, 102)
            .entity_last_property_id(3, 103)
            .last_entity_id(1, 100)
            .build()
            .unwrap();
        assert!(matches!(
            plan_migration(&stored, &new),
            Err(CoreError::Schema { .. })
        ));
    }

    #[test]
    fn decreasing_watermark_is_rejected() {
        let stored = v1().last_entity_id(5, 500).build().unwrap();
        let new = v1().build().unwrap();
        assert!(matches!(
            plan_migration(&stored, &new),
            Err(CoreError::Schema { .. })
        ));
    }

    #[test]
    fn new_property_must_not_reuse_old_id() {
        let stored = v1().build().unwrap();
        let new = ModelBuilder::new()
            .entity("Person", 1, 100)
            .property("id", PropertyType::Long, 1, 101)
            .property_flags(PropertyFlags::ID)
            .property("nick", PropertyType::String, 3, 999)
            .entity_last_property_id(3, 103)
            .last_entity_id(1, 100)
            .build()
            .unwrap();
        assert!(matches!(
            plan_migration(&stored, &new),
            Err(CoreError::Schema { .. })
        ));
    }

    #[test]
    fn removed_entity_is_dropped() {
        let stored = v1()
            .entity("Tag", 2, 200)
            .property("id", PropertyType::Long, 1, 201)
            .property_flags(PropertyFlags::ID)
            .last_entity_id(2, 200)
            .build()
            .unwrap();
        let new = v1().last_entity_id(2, 200).build().unwrap();
        let plan = plan_migration(&stored, &new).unwrap();
        assert_eq!(plan.removed_entities, vec![2]);
    }
}
