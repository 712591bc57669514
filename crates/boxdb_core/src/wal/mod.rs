//! Write-ahead log.
//!
//! Every committed write transaction is appended to the WAL as
//! `Begin, (Put | Delete)*, Commit` and flushed before the commit is
//! acknowledged. The data file is written afterwards; on open, committed
//! transactions that did not reach the data file are replayed.
//!
//! ## Record format
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! A record cut short at the end of the log is a crash during write and
//! marks the end of the log. Anything else that does not parse is
//! `FileCorrupt` and the store refuses to open.

mod iterator;
mod record;
mod writer;

pub use iterator::WalRecordIterator;
pub use record::{compute_crc32, WalRecord, WalRecordType};
pub use writer::WalManager;

pub(crate) use record::{decode_key, encode_key};
