//! # boxdb core
//!
//! Embedded, transactional object store driven by a schema model.
//!
//! This crate provides:
//! - A model registry of entities, properties, indexes and relations
//! - A storage engine: write-ahead log, append-only data file and an
//!   in-memory multi-version index
//! - Read and write transactions with reader slots and snapshot isolation
//! - Cursor and box access to objects, relations and backlinks
//! - A query builder and executor with index use, ordering, parameters and
//!   property aggregates
//! - A background write queue
//!
//! ```no_run
//! use boxdb_core::{ModelBuilder, PropertyFlags, PropertyType, Store, StoreOptions};
//!
//! # fn main() -> boxdb_core::CoreResult<()> {
//! let model = ModelBuilder::new()
//!     .entity("Person", 1, 100)
//!     .property("id", PropertyType::Long, 1, 101)
//!     .property_flags(PropertyFlags::ID)
//!     .property("name", PropertyType::String, 2, 102)
//!     .build()?;
//! let store = Store::open(StoreOptions::new().directory("people-db").model(model))?;
//! let people = store.box_for("Person")?;
//! let mut qb = people.query()?;
//! qb.equals_string(2, "ann", false)?;
//! let ann = qb.build()?.find_first()?;
//! # let _ = ann;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod async_queue;
mod change_feed;
mod cursor;
mod dir;
mod engine;
mod entity_box;
mod error;
mod index;
pub mod manifest;
mod model;
mod object;
mod options;
mod query;
pub mod segment;
mod stats;
mod store;
mod transaction;
mod types;
pub mod wal;

pub use async_queue::AsyncBox;
pub use change_feed::ChangeEvent;
pub use cursor::Cursor;
pub use dir::{db_file_size, remove_db_files, StoreDir};
pub use engine::RecoveryReport;
pub use entity_box::{BoxIter, EntityBox};
pub use error::{CoreError, CoreResult, ErrorCategory, NOT_FOUND, NO_SUCCESS, TIMEOUT};
pub use model::{
    model_from_value, model_to_value, plan_migration, Entity, EntityFlags, IdUid, MigrationPlan,
    Model, ModelBuilder, Property, PropertyFlags, PropertyType, Relation, SchemaId, Uid,
};
pub use options::{AsyncOptions, DebugFlags, PaddingMode, PutMode, StoreOptions, MEMORY_PREFIX};
pub use query::{
    Aggregate, ConditionId, OrderFlags, ParamValue, PropertyQuery, Query, QueryBuilder,
};
pub use stats::StatsSnapshot;
pub use store::Store;
pub use transaction::{Transaction, TransactionState};
pub use types::{RecordKey, SequenceNumber, TableId, TransactionId};
