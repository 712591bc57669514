//! # boxdb codec
//!
//! CBOR encoding for stored objects and on-disk metadata.
//!
//! The encoder is deterministic: map keys are sorted by their encoded
//! bytes, integers use the shortest head and floats are always written at
//! double precision. The decoder is lenient and accepts any definite-length
//! CBOR within its size and depth limits.
//!
//! Objects are stored as [`ObjectRecord`]s, maps keyed by property ID.
//!
//! ```
//! use boxdb_codec::{from_cbor, to_cbor, ObjectRecord, Value};
//!
//! let bytes = to_cbor(&Value::Integer(42));
//! assert_eq!(from_cbor(&bytes).unwrap(), Value::Integer(42));
//!
//! let record = ObjectRecord::new().with(1, 5i64).with(2, "five");
//! let decoded = ObjectRecord::decode(&record.encode_padded()).unwrap();
//! assert_eq!(decoded, record);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod record;
mod value;

pub use decoder::{from_cbor, Decoder};
pub use encoder::{to_cbor, Encoder};
pub use error::{CodecError, CodecResult};
pub use record::{pad, padding_for, ObjectRecord, RECORD_ALIGNMENT};
pub use value::Value;
