//! Queries over the objects of one entity.
//!
//! A [`QueryBuilder`] collects conditions, links to related entities and
//! order clauses, and builds a [`Query`]. Built queries are reusable; their
//! condition operands can be replaced through parameters, and
//! [`PropertyQuery`] reads or aggregates a single property of the results.
//!
//! Conditions on indexed properties narrow the candidates through the
//! index; everything else is evaluated by scanning the entity.

mod builder;
mod compiled;
mod condition;
mod executor;
mod order;
mod params;
mod property;

pub use builder::{ConditionId, QueryBuilder};
pub use compiled::Query;
pub use order::OrderFlags;
pub use params::ParamValue;
pub use property::{Aggregate, PropertyQuery};
