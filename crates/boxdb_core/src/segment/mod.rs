//! Data file: every committed version of every record, append-only.
//!
//! ```text
//! | record_len (4) | kind (1) | schema id (4) | primary (8) | secondary (8) | flags (1) | sequence (8) | payload (N) | crc32 (4) |
//! ```
//!
//! Flag `0x01` marks a tombstone. Old versions stay in the file; the
//! in-memory version index decides which one a snapshot sees.

mod record;
mod store;

pub use record::{SegmentRecord, SegmentRecordFlags};
pub use store::{RecordLocation, ScanOutcome, SegmentManager};
