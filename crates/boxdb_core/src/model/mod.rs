//! Model registry: entities, properties and relations.
//!
//! A [`Model`] is assembled with [`ModelBuilder`], validated once, and then
//! shared read-only by everything that touches data.

mod builder;
mod schema;
mod types;

pub use builder::ModelBuilder;
pub use schema::{model_from_value, model_to_value, plan_migration, MigrationPlan};
pub use types::{
    Entity, EntityFlags, IdUid, Model, Property, PropertyFlags, PropertyType, Relation, SchemaId,
    Uid,
};
