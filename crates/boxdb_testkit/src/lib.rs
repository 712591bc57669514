//! # boxdb testkit
//!
//! Shared helpers for testing boxdb.
//!
//! - [`fixtures`]: throwaway stores and a ready-made `Person`/`Team` model
//! - [`generators`]: proptest strategies for objects and write workloads
//! - [`crash`]: crash images of a store directory and file damage helpers
//! - [`stress`]: concurrent load drivers
//!
//! The cross-crate scenario tests live in this crate's `tests/` directory.
//!
//! ```rust,ignore
//! use boxdb_testkit::prelude::*;
//!
//! let store = TestStore::memory();
//! let people = store.entity_box(PERSON).unwrap();
//! let id = people.put(0, PersonRecord::new("Ann").age(31).encode()).unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
