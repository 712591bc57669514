//! Codec error type.

use thiserror::Error;

/// Result alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Reasons a byte sequence could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended in the middle of an item.
    #[error("unexpected end of input at byte {offset}")]
    UnexpectedEof {
        /// Offset at which more input was needed.
        offset: usize,
    },

    /// A text string was not valid UTF-8.
    #[error("invalid UTF-8 in text string")]
    InvalidUtf8,

    /// The bytes are not well-formed CBOR.
    #[error("invalid CBOR: {message}")]
    InvalidStructure {
        /// What was wrong.
        message: String,
    },

    /// Indefinite-length strings, arrays and maps are not accepted.
    #[error("indefinite-length items are not supported")]
    IndefiniteLength,

    /// A length prefix claims more than the decoder allows.
    #[error("declared length {claimed} exceeds limit {max_allowed}")]
    SizeLimitExceeded {
        /// Length declared in the input.
        claimed: u64,
        /// Largest accepted length.
        max_allowed: u64,
    },

    /// Items are nested deeper than the decoder allows.
    #[error("nesting deeper than {max_depth} levels")]
    DepthLimitExceeded {
        /// Maximum accepted depth.
        max_depth: usize,
    },

    /// The bytes decode to CBOR but not to an object record.
    #[error("invalid object record: {message}")]
    InvalidRecord {
        /// What was wrong.
        message: String,
    },
}

impl CodecError {
    /// Creates an [`CodecError::InvalidStructure`].
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            message: message.into(),
        }
    }

    /// Creates an [`CodecError::InvalidRecord`].
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            message: message.into(),
        }
    }
}
