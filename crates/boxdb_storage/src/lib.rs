//! # boxdb storage
//!
//! Byte-level storage backends for boxdb.
//!
//! A backend is an append-only byte store with positional reads. It knows
//! nothing about WAL records, segment records or objects; the core crate
//! owns every file format.
//!
//! ## Backends
//!
//! - [`InMemoryBackend`] keeps bytes in a shared buffer. Used by `memory:`
//!   stores and by tests that simulate a reopen.
//! - [`FileBackend`] writes to a regular file, optionally read-only or with
//!   explicit unix permissions for newly created files.
//!
//! ```rust
//! use boxdb_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"abc").unwrap();
//! assert_eq!(backend.read_at(offset, 3).unwrap(), b"abc");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::{FileBackend, FileOptions};
pub use memory::InMemoryBackend;
