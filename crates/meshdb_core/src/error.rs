//! Error types for MeshDB core.

use thiserror::Error;

/// Result type for core operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors that can occur in MeshDB core operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DbError {
    /// Malformed caller input.
    #[error("invalid arguments: {message}")]
    InvalidArgs {
        /// What was wrong with the input.
        message: String,
    },

    /// The entry is already configured.
    #[error("already set")]
    AlreadySet,

    /// The store is already opened by another owner.
    #[error("already opened")]
    AlreadyOpened,

    /// Lookup miss.
    #[error("not found")]
    NotFound,

    /// A conflicting operation is in flight; retry later.
    #[error("busy")]
    Busy,

    /// A resource cap was reached.
    #[error("max limit exceeded (limit {limit})")]
    MaxLimitExceeded {
        /// The configured cap.
        limit: usize,
    },

    /// A dependent component was never configured.
    #[error("{component} not initialized")]
    NotInit {
        /// The missing component.
        component: &'static str,
    },

    /// The operation is not supported in this configuration.
    #[error("not supported")]
    NotSupport,

    /// A permission check rejected the operation.
    #[error("not permitted")]
    NotPermit,

    /// No free timer id is left.
    #[error("out of ids")]
    OutOfIds,

    /// No entry with that id.
    #[error("no such entry")]
    NoSuchEntry,

    /// The component was stopped and rejects new work.
    #[error("{component} stopped")]
    Stopped {
        /// The stopped component.
        component: &'static str,
    },

    /// The process system API adapter reported a failure.
    #[error("system api adapter call failed: {message}")]
    SystemApiAdapterCall {
        /// Adapter failure description.
        message: String,
    },

    /// Invariant violation; indicates a bug.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the violated invariant.
        message: String,
    },

    /// Parcel codec error.
    #[error("codec error: {0}")]
    Codec(#[from] meshdb_codec::CodecError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] meshdb_storage::StorageError),
}

impl DbError {
    /// Creates an invalid arguments error.
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::InvalidArgs {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a system API adapter error.
    pub fn system_api(message: impl Into<String>) -> Self {
        Self::SystemApiAdapterCall {
            message: message.into(),
        }
    }

    /// Returns true for [`DbError::Busy`].
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy)
    }

    /// Returns true for [`DbError::NotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}
