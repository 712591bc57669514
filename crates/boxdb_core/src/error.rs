//! Error types for the boxdb core.
//!
//! Every fallible operation returns [`CoreResult`]. Outcomes that are part of
//! normal control flow (an object that does not exist, a wait that timed out)
//! are expressed as `Option`/`bool` instead and never become errors.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Status code of an expected "not found" outcome.
pub const NOT_FOUND: i32 = 404;

/// Status code of an expected "did not succeed" outcome.
pub const NO_SUCCESS: i32 = 1001;

/// Status code of an expected timeout.
pub const TIMEOUT: i32 = 1002;

/// Coarse classification of a [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The API was used incorrectly; retrying the same call fails again.
    Usage,
    /// A capacity limit was hit; the call may succeed once resources free up.
    Resource,
    /// The data was rejected; the enclosing transaction stays usable.
    Data,
    /// The store is damaged or inconsistent and should be closed.
    Consistency,
    /// The operating system reported an I/O failure.
    Io,
}

/// Errors that can occur in boxdb core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Operation not permitted in the current state.
    #[error("illegal state: {message}")]
    IllegalState {
        /// Why the operation is not allowed.
        message: String,
    },

    /// An argument was invalid.
    #[error("illegal argument: {message}")]
    IllegalArgument {
        /// Which argument and why.
        message: String,
    },

    /// A buffer could not be allocated.
    #[error("allocation failed: {message}")]
    Allocation {
        /// What was being allocated.
        message: String,
    },

    /// An arithmetic result does not fit its type.
    #[error("numeric overflow: {message}")]
    NumericOverflow {
        /// The overflowing computation.
        message: String,
    },

    /// The requested feature is not part of this build.
    #[error("feature not available: {feature}")]
    FeatureNotAvailable {
        /// Name of the feature.
        feature: String,
    },

    /// The store is shutting down and no longer accepts work.
    #[error("store is shutting down")]
    ShuttingDown,

    /// The store has been closed.
    #[error("store is closed")]
    StoreClosed,

    /// Another process holds the store directory lock.
    #[error("store directory is locked by another process")]
    DatabaseLocked,

    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] boxdb_storage::StorageError),

    /// CBOR codec error.
    #[error("codec error: {0}")]
    Codec(#[from] boxdb_codec::CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Any other failure.
    #[error("{message}")]
    General {
        /// Description of the failure.
        message: String,
    },

    /// A commit would grow the store beyond its size limit.
    #[error("database full: {size} bytes would exceed the limit of {limit} bytes")]
    DbFull {
        /// Size the store would have after the commit.
        size: u64,
        /// Configured maximum.
        limit: u64,
    },

    /// All reader slots are in use.
    #[error("maximum number of readers ({max}) exceeded")]
    MaxReadersExceeded {
        /// Configured number of reader slots.
        max: u32,
    },

    /// A fatal error happened earlier; the store must be closed.
    #[error("store must shut down: {message}")]
    StoreMustShutdown {
        /// The original failure.
        message: String,
    },

    /// A commit would grow the object data beyond its limit.
    #[error("max data size exceeded: {size} bytes would exceed the limit of {limit} bytes")]
    MaxDataSizeExceeded {
        /// Object data size after the commit.
        size: u64,
        /// Configured maximum.
        limit: u64,
    },

    /// A unique index already holds the value.
    #[error("unique constraint violated on entity {entity} property {property}")]
    UniqueViolated {
        /// Entity ID.
        entity: u32,
        /// Property ID.
        property: u32,
    },

    /// A query expected to find one object found several.
    #[error("expected a unique result, found {count} objects")]
    NonUniqueResult {
        /// Number of matching objects.
        count: u64,
    },

    /// A value or parameter does not match the property type.
    #[error("property type mismatch: {message}")]
    PropertyTypeMismatch {
        /// What did not match.
        message: String,
    },

    /// An insert found an object with the same ID.
    #[error("object with ID {id} already exists")]
    IdAlreadyExists {
        /// The conflicting ID.
        id: u64,
    },

    /// An update found no object with the ID.
    #[error("object with ID {id} not found")]
    IdNotFound {
        /// The missing ID.
        id: u64,
    },

    /// A constraint other than uniqueness was violated.
    #[error("constraint violated: {message}")]
    ConstraintViolated {
        /// The constraint.
        message: String,
    },

    /// The model is invalid or incompatible with the stored schema.
    #[error("schema error: {message}")]
    Schema {
        /// What is wrong.
        message: String,
    },

    /// A store file (WAL or MANIFEST) is corrupt.
    #[error("file corrupt: {message}")]
    FileCorrupt {
        /// Where the corruption was found.
        message: String,
    },

    /// The object data file is corrupt.
    #[error("file pages corrupt: {message}")]
    FilePagesCorrupt {
        /// Where the corruption was found.
        message: String,
    },

    /// An entity, property or relation ID is not part of the model.
    #[error("schema object not found: {message}")]
    SchemaObjectNotFound {
        /// The missing schema object.
        message: String,
    },
}

impl CoreError {
    /// Creates an illegal state error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Creates an illegal argument error.
    pub fn illegal_argument(message: impl Into<String>) -> Self {
        Self::IllegalArgument {
            message: message.into(),
        }
    }

    /// Creates a numeric overflow error.
    pub fn numeric_overflow(message: impl Into<String>) -> Self {
        Self::NumericOverflow {
            message: message.into(),
        }
    }

    /// Creates a general error.
    pub fn general(message: impl Into<String>) -> Self {
        Self::General {
            message: message.into(),
        }
    }

    /// Creates a property type mismatch error.
    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::PropertyTypeMismatch {
            message: message.into(),
        }
    }

    /// Creates a schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Creates a file corruption error (WAL or MANIFEST).
    pub fn file_corrupt(message: impl Into<String>) -> Self {
        Self::FileCorrupt {
            message: message.into(),
        }
    }

    /// Creates a data file corruption error.
    pub fn pages_corrupt(message: impl Into<String>) -> Self {
        Self::FilePagesCorrupt {
            message: message.into(),
        }
    }

    /// Creates a schema-object-not-found error.
    pub fn not_in_schema(message: impl Into<String>) -> Self {
        Self::SchemaObjectNotFound {
            message: message.into(),
        }
    }

    /// Stable numeric code of this error.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::IllegalState { .. } | Self::StoreClosed => 10001,
            Self::IllegalArgument { .. } => 10002,
            Self::Allocation { .. } => 10003,
            Self::NumericOverflow { .. } => 10004,
            Self::FeatureNotAvailable { .. } => 10005,
            Self::ShuttingDown => 10006,
            Self::Io(_) | Self::Storage(_) | Self::DatabaseLocked => 10007,
            Self::General { .. } => 10098,
            Self::DbFull { .. } => 10101,
            Self::MaxReadersExceeded { .. } => 10102,
            Self::StoreMustShutdown { .. } => 10103,
            Self::MaxDataSizeExceeded { .. } => 10104,
            Self::UniqueViolated { .. } => 10201,
            Self::NonUniqueResult { .. } => 10202,
            Self::PropertyTypeMismatch { .. } => 10203,
            Self::IdAlreadyExists { .. } => 10210,
            Self::IdNotFound { .. } => 10211,
            Self::ConstraintViolated { .. } => 10299,
            Self::Schema { .. } => 10501,
            Self::FileCorrupt { .. } | Self::Codec(_) => 10502,
            Self::FilePagesCorrupt { .. } => 10503,
            Self::SchemaObjectNotFound { .. } => 10504,
        }
    }

    /// OS error number of an underlying I/O failure, if any.
    #[must_use]
    pub fn secondary_code(&self) -> Option<i32> {
        match self {
            Self::Io(err) => err.raw_os_error(),
            Self::Storage(err) => err.raw_os_error(),
            _ => None,
        }
    }

    /// Classifies the error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::IllegalState { .. }
            | Self::IllegalArgument { .. }
            | Self::FeatureNotAvailable { .. }
            | Self::ShuttingDown
            | Self::StoreClosed
            | Self::SchemaObjectNotFound { .. }
            | Self::General { .. } => ErrorCategory::Usage,
            Self::Allocation { .. }
            | Self::DbFull { .. }
            | Self::MaxReadersExceeded { .. }
            | Self::MaxDataSizeExceeded { .. }
            | Self::DatabaseLocked => ErrorCategory::Resource,
            Self::NumericOverflow { .. }
            | Self::UniqueViolated { .. }
            | Self::NonUniqueResult { .. }
            | Self::PropertyTypeMismatch { .. }
            | Self::IdAlreadyExists { .. }
            | Self::IdNotFound { .. }
            | Self::ConstraintViolated { .. } => ErrorCategory::Data,
            Self::StoreMustShutdown { .. }
            | Self::Schema { .. }
            | Self::FileCorrupt { .. }
            | Self::FilePagesCorrupt { .. }
            | Self::Codec(_) => ErrorCategory::Consistency,
            Self::Io(_) | Self::Storage(_) => ErrorCategory::Io,
        }
    }
}
