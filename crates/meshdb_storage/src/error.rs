//! Error types for storage operations.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Keys must be non-empty.
    #[error("invalid key: keys must be non-empty")]
    InvalidKey,

    /// The key has no live record.
    #[error("key not found")]
    NotFound,

    /// The source cannot serve reads right now.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A stored record failed to decode.
    #[error("codec error: {0}")]
    Codec(#[from] meshdb_codec::CodecError),
}
