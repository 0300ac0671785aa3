//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while writing or reading a parcel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The payload is malformed, truncated or exceeded the writer limit.
    #[error("parse failed: {message}")]
    ParseFail {
        /// Description of the failure.
        message: String,
    },

    /// The payload was written by a newer format version.
    #[error("version {version} not supported (max {supported})")]
    VersionNotSupported {
        /// Version tag found in the payload.
        version: u32,
        /// Highest version this build understands.
        supported: u32,
    },
}

impl CodecError {
    /// Create a parse failure error.
    pub fn parse_fail(message: impl Into<String>) -> Self {
        Self::ParseFail {
            message: message.into(),
        }
    }

    /// Returns true if this is a version mismatch rather than a malformed payload.
    #[must_use]
    pub fn is_version_not_supported(&self) -> bool {
        matches!(self, Self::VersionNotSupported { .. })
    }
}
