//! Incremental model construction.

use std::collections::HashSet;

use crate::error::{CoreError, CoreResult};
use crate::model::types::{
    Entity, EntityFlags, IdUid, Model, Property, PropertyFlags, PropertyType, Relation, SchemaId,
    Uid,
};

#[derive(Debug, Default)]
struct Draft {
    model: Model,
    relation_targets: Vec<(usize, usize, String)>,
}

/// Builds a [`Model`] one declaration at a time.
///
/// Calls are order sensitive: property calls refine the most recent
/// [`entity`](Self::entity), and flag/index/relation calls refine the most
/// recent [`property`](Self::property). The first failing call is kept and
/// every later call is skipped; [`build`](Self::build) returns that error.
///
/// ```
/// use boxdb_core::{ModelBuilder, PropertyFlags, PropertyType};
///
/// let model = ModelBuilder::new()
///     .entity("Note", 1, 1001)
///     .property("id", PropertyType::Long, 1, 1101)
///     .property_flags(PropertyFlags::ID)
///     .property("text", PropertyType::String, 2, 1102)
///     .entity_last_property_id(2, 1102)
///     .last_entity_id(1, 1001)
///     .build()
///     .unwrap();
/// assert_eq!(model.entity_id("Note"), Some(1));
/// ```
#[derive(Debug)]
#[must_use]
pub struct ModelBuilder {
    state: Result<Draft, CoreError>,
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelBuilder {
    /// Starts an empty model.
    pub fn new() -> Self {
        Self {
            state: Ok(Draft::default()),
        }
    }

    /// The first error recorded, if any.
    #[must_use]
    pub fn error(&self) -> Option<&CoreError> {
        self.state.as_ref().err()
    }

    fn step(mut self, f: impl FnOnce(&mut Draft) -> CoreResult<()>) -> Self {
        if let Ok(draft) = &mut self.state {
            if let Err(err) = f(draft) {
                self.state = Err(err);
            }
        }
        self
    }

    /// Declares an entity.
    pub fn entity(self, name: &str, id: SchemaId, uid: Uid) -> Self {
        self.step(|draft| {
            check_id_uid("entity", id, uid)?;
            check_name("entity", name)?;
            draft.model.entities.push(Entity {
                id,
                uid,
                name: name.to_owned(),
                flags: EntityFlags::NONE,
                properties: Vec::new(),
                relations: Vec::new(),
                last_property: IdUid::default(),
            });
            Ok(())
        })
    }

    /// Sets flags on the current entity.
    pub fn entity_flags(self, flags: EntityFlags) -> Self {
        self.step(|draft| {
            current_entity(draft)?.flags = flags;
            Ok(())
        })
    }

    /// Declares a property on the current entity.
    pub fn property(self, name: &str, ptype: PropertyType, id: SchemaId, uid: Uid) -> Self {
        self.step(|draft| {
            check_id_uid("property", id, uid)?;
            check_name("property", name)?;
            current_entity(draft)?.properties.push(Property {
                id,
                uid,
                name: name.to_owned(),
                ptype,
                flags: PropertyFlags::NONE,
                index: None,
                target_entity: None,
            });
            Ok(())
        })
    }

    /// Sets flags on the current property.
    pub fn property_flags(self, flags: PropertyFlags) -> Self {
        self.step(|draft| {
            current_property(draft)?.flags = flags;
            Ok(())
        })
    }

    /// Assigns the index ID of the current property.
    pub fn property_index_id(self, id: SchemaId, uid: Uid) -> Self {
        self.step(|draft| {
            check_id_uid("index", id, uid)?;
            current_property(draft)?.index = Some(IdUid::new(id, uid));
            Ok(())
        })
    }

    /// Turns the current property into a to-one relation to `target`.
    ///
    /// Relation properties are always indexed.
    pub fn property_relation(self, target: &str, index_id: SchemaId, index_uid: Uid) -> Self {
        self.step(|draft| {
            check_id_uid("index", index_id, index_uid)?;
            check_name("relation target", target)?;
            let entity_idx = draft.model.entities.len().saturating_sub(1);
            let property = current_property(draft)?;
            if property.ptype != PropertyType::Relation {
                return Err(CoreError::illegal_argument(format!(
                    "property {} must have type Relation to link to {target}",
                    property.name
                )));
            }
            property.index = Some(IdUid::new(index_id, index_uid));
            property.flags = property.flags | PropertyFlags::INDEXED;
            let prop_idx = draft.model.entities[entity_idx].properties.len() - 1;
            draft
                .relation_targets
                .push((entity_idx, prop_idx, target.to_owned()));
            Ok(())
        })
    }

    /// Declares a standalone relation with the current entity as source.
    pub fn relation(
        self,
        relation_id: SchemaId,
        relation_uid: Uid,
        target_id: SchemaId,
        target_uid: Uid,
    ) -> Self {
        self.step(|draft| {
            check_id_uid("relation", relation_id, relation_uid)?;
            check_id_uid("relation target", target_id, target_uid)?;
            current_entity(draft)?.relations.push(Relation {
                id: relation_id,
                uid: relation_uid,
                target: IdUid::new(target_id, target_uid),
            });
            Ok(())
        })
    }

    /// Records the highest property ID ever used by the current entity.
    pub fn entity_last_property_id(self, id: SchemaId, uid: Uid) -> Self {
        self.step(|draft| {
            check_id_uid("last property", id, uid)?;
            current_entity(draft)?.last_property = IdUid::new(id, uid);
            Ok(())
        })
    }

    /// Records the highest entity ID ever used.
    pub fn last_entity_id(self, id: SchemaId, uid: Uid) -> Self {
        self.step(|draft| {
            check_id_uid("last entity", id, uid)?;
            draft.model.last_entity = IdUid::new(id, uid);
            Ok(())
        })
    }

    /// Records the highest index ID ever used.
    pub fn last_index_id(self, id: SchemaId, uid: Uid) -> Self {
        self.step(|draft| {
            check_id_uid("last index", id, uid)?;
            draft.model.last_index = IdUid::new(id, uid);
            Ok(())
        })
    }

    /// Records the highest relation ID ever used.
    pub fn last_relation_id(self, id: SchemaId, uid: Uid) -> Self {
        self.step(|draft| {
            check_id_uid("last relation", id, uid)?;
            draft.model.last_relation = IdUid::new(id, uid);
            Ok(())
        })
    }

    /// Validates the declarations and returns the model.
    ///
    /// # Errors
    ///
    /// Returns the first builder error, or a [`CoreError::Schema`] when the
    /// declarations are inconsistent.
    pub fn build(self) -> CoreResult<Model> {
        let Draft {
            mut model,
            relation_targets,
        } = self.state?;

        for (entity_idx, prop_idx, target) in relation_targets {
            let target_id = model
                .entity_id(&target)
                .ok_or_else(|| CoreError::schema(format!("relation target {target} not found")))?;
            model.entities[entity_idx].properties[prop_idx].target_entity = Some(target_id);
        }

        fill_watermarks(&mut model);
        validate(&model)?;
        Ok(model)
    }
}

fn check_id_uid(what: &str, id: SchemaId, uid: Uid) -> CoreResult<()> {
    if id == 0 || uid == 0 {
        return Err(CoreError::illegal_argument(format!(
            "{what} ID and UID must be non-zero (got {id}:{uid})"
        )));
    }
    Ok(())
}

fn check_name(what: &str, name: &str) -> CoreResult<()> {
    if name.is_empty() {
        return Err(CoreError::illegal_argument(format!("{what} name must not be empty")));
    }
    Ok(())
}

fn current_entity(draft: &mut Draft) -> CoreResult<&mut Entity> {
    draft
        .model
        .entities
        .last_mut()
        .ok_or_else(|| CoreError::illegal_state("no entity declared yet"))
}

fn current_property(draft: &mut Draft) -> CoreResult<&mut Property> {
    current_entity(draft)?
        .properties
        .last_mut()
        .ok_or_else(|| CoreError::illegal_state("no property declared on the current entity"))
}

/// Watermarks left unset default to the highest ID in use.
fn fill_watermarks(model: &mut Model) {
    for entity in &mut model.entities {
        if entity.last_property.is_unset() {
            if let Some(p) = entity.properties.iter().max_by_key(|p| p.id) {
                entity.last_property = IdUid::new(p.id, p.uid);
            }
        }
    }
    if model.last_entity.is_unset() {
        if let Some(e) = model.entities.iter().max_by_key(|e| e.id) {
            model.last_entity = IdUid::new(e.id, e.uid);
        }
    }
    if model.last_index.is_unset() {
        if let Some(index) = model
            .entities
            .iter()
            .flat_map(|e| e.properties.iter().filter_map(|p| p.index))
            .max_by_key(|i| i.id)
        {
            model.last_index = index;
        }
    }
    if model.last_relation.is_unset() {
        if let Some(r) = model
            .entities
            .iter()
            .flat_map(|e| e.relations.iter())
            .max_by_key(|r| r.id)
        {
            model.last_relation = IdUid::new(r.id, r.uid);
        }
    }
}

fn validate(model: &Model) -> CoreResult<()> {
    let mut uids = HashSet::new();
    let mut claim_uid = |uid: Uid, what: &str| -> CoreResult<()> {
        if uids.insert(uid) {
            Ok(())
        } else {
            Err(CoreError::schema(format!("UID {uid} of {what} is used twice")))
        }
    };
    let mut entity_ids = HashSet::new();
    let mut entity_names = HashSet::new();
    let mut index_ids = HashSet::new();
    let mut relation_ids = HashSet::new();

    for entity in &model.entities {
        let name = &entity.name;
        if !entity_ids.insert(entity.id) {
            return Err(CoreError::schema(format!("entity ID {} is used twice", entity.id)));
        }
        if !entity_names.insert(name.as_str()) {
            return Err(CoreError::schema(format!("entity name {name} is used twice")));
        }
        claim_uid(entity.uid, name)?;
        if entity.id > model.last_entity.id {
            return Err(CoreError::schema(format!(
                "entity {name} ID {} is above the last entity ID {}",
                entity.id, model.last_entity.id
            )));
        }

        let mut prop_ids = HashSet::new();
        let mut prop_names = HashSet::new();
        let mut id_props = 0;
        for property in &entity.properties {
            let pname = &property.name;
            if !prop_ids.insert(property.id) || !prop_names.insert(pname.as_str()) {
                return Err(CoreError::schema(format!(
                    "property {name}.{pname} duplicates an ID or name"
                )));
            }
            claim_uid(property.uid, pname)?;
            if property.id > entity.last_property.id {
                return Err(CoreError::schema(format!(
                    "property {name}.{pname} ID {} is above the last property ID {}",
                    property.id, entity.last_property.id
                )));
            }
            if property.is_id() {
                id_props += 1;
                if property.ptype != PropertyType::Long {
                    return Err(CoreError::schema(format!(
                        "ID property {name}.{pname} must have type Long"
                    )));
                }
            }
            match property.index {
                Some(index) => {
                    if !index_ids.insert(index.id) {
                        return Err(CoreError::schema(format!("index ID {} is used twice", index.id)));
                    }
                    claim_uid(index.uid, "index")?;
                    if index.id > model.last_index.id {
                        return Err(CoreError::schema(format!(
                            "index ID {} of {name}.{pname} is above the last index ID {}",
                            index.id, model.last_index.id
                        )));
                    }
                }
                None if property.flags.is_indexed() => {
                    return Err(CoreError::schema(format!(
                        "property {name}.{pname} is indexed but has no index ID"
                    )));
                }
                None => {}
            }
        }
        if id_props != 1 {
            return Err(CoreError::schema(format!(
                "entity {name} must have exactly one ID property, found {id_props}"
            )));
        }

        for relation in &entity.relations {
            if !relation_ids.insert(relation.id) {
                return Err(CoreError::schema(format!(
                    "relation ID {} is used twice",
                    relation.id
                )));
            }
            claim_uid(relation.uid, "relation")?;
            if relation.id > model.last_relation.id {
                return Err(CoreError::schema(format!(
                    "relation ID {} is above the last relation ID {}",
                    relation.id, model.last_relation.id
                )));
            }
            match model.entity(relation.target.id) {
                Some(target) if target.uid == relation.target.uid => {}
                _ => {
                    return Err(CoreError::schema(format!(
                        "relation {} targets unknown entity {}",
                        relation.id, relation.target
                    )))
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ModelBuilder {
        ModelBuilder::new()
            .entity("Person", 1, 100)
            .property("id", PropertyType::Long, 1, 101)
            .property_flags(PropertyFlags::ID)
            .property("name", PropertyType::String, 2, 102)
            .property_flags(PropertyFlags::INDEXED)
            .property_index_id(1, 103)
    }

    #[test]
    fn builds_with_default_watermarks() {
        let model = base().build().unwrap();
        let person = model.entity(1).unwrap();
        assert_eq!(person.last_property, IdUid::new(2, 102));
        assert_eq!(model.last_entity, IdUid::new(1, 100));
        assert_eq!(model.last_index, IdUid::new(1, 103));
        assert_eq!(model.property_id(1, "name"), Some(2));
        assert_eq!(person.id_property().map(|p| p.id), Some(1));
    }

    #[test]
    fn first_error_is_sticky() {
        let builder = ModelBuilder::new()
            .property("orphan", PropertyType::Int, 1, 1)
            .entity("Later", 1, 2);
        assert!(matches!(builder.error(), Some(CoreError::IllegalState { .. })));
        assert!(matches!(builder.build(), Err(CoreError::IllegalState { .. })));
    }

    #[test]
    fn zero_ids_are_rejected() {
        let err = ModelBuilder::new().entity("A", 0, 1).build().unwrap_err();
        assert!(matches!(err, CoreError::IllegalArgument { .. }));
    }

    #[test]
    fn missing_id_property() {
        let err = ModelBuilder::new()
            .entity("A", 1, 1)
            .property("x", PropertyType::Int, 1, 2)
            .build()
            .unwrap_err();
        assert!(matches!(err, CoreError::Schema { .. }));
    }

    #[test]
    fn indexed_property_needs_index_id() {
        let err = ModelBuilder::new()
            .entity("A", 1, 1)
            .property("id", PropertyType::Long, 1, 2)
            .property_flags(PropertyFlags::ID)
            .property("x", PropertyType::Int, 2, 3)
            .property_flags(PropertyFlags::UNIQUE)
            .build()
            .unwrap_err();
        assert!(matches!(err, CoreError::Schema { .. }));
    }

    #[test]
    fn duplicate_uid_is_rejected() {
        let err = base()
            .property("age", PropertyType::Int, 3, 101)
            .build()
            .unwrap_err();
        assert!(matches!(err, CoreError::Schema { .. }));
    }

    #[test]
    fn explicit_watermark_must_cover_ids() {
        let err = base().entity_last_property_id(1, 101).build().unwrap_err();
        assert!(matches!(err, CoreError::Schema { .. }));
    }

    #[test]
    fn relations_resolve_targets() {
        let model = base()
            .entity("Order", 2, 200)
            .property("id", PropertyType::Long, 1, 201)
            .property_flags(PropertyFlags::ID)
            .property("customer", PropertyType::Relation, 2, 202)
            .property_relation("Person", 2, 203)
            .relation(1, 204, 1, 100)
            .build()
            .unwrap();
        let order = model.entity(2).unwrap();
        let customer = order.property(2).unwrap();
        assert_eq!(customer.target_entity, Some(1));
        assert!(customer.flags.contains(PropertyFlags::INDEXED));
        let (source, relation) = model.relation(1).unwrap();
        assert_eq!(source.id, 2);
        assert_eq!(relation.target.id, 1);
    }

    #[test]
    fn relation_property_needs_relation_type() {
        let err = base()
            .property("friend", PropertyType::Long, 3, 104)
            .property_relation("Person", 2, 105)
            .build()
            .unwrap_err();
        assert!(matches!(err, CoreError::IllegalArgument { .. }));
    }

    #[test]
    fn unknown_relation_target() {
        let err = base()
            .property("friend", PropertyType::Relation, 3, 104)
            .property_relation("Nobody", 2, 105)
            .build()
            .unwrap_err();
        assert!(matches!(err, CoreError::Schema { .. }));
    }
}
