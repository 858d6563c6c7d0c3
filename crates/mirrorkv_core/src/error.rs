//! Error types for the engine.

use mirrorkv_codec::CodecError;
use mirrorkv_storage::StorageError;
use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by the store API.
///
/// Parse and checksum failures during open are handled internally by the
/// recovery policy and never reach the caller; what does reach the caller
/// is argument validation, size-limit violations, and I/O failures of
/// operations the store cannot retry on its own.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A caller-supplied argument is invalid (empty key, oversized key,
    /// bad encoder tag).
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the argument issue.
        message: String,
    },

    /// A write would push the data region past the hard size limit.
    #[error("data size out of limit: {size} bytes")]
    DataSizeLimit {
        /// The capacity the write would have required.
        size: usize,
    },

    /// An object put referenced an encoder tag that is not registered.
    #[error("encoder not registered: {tag}")]
    EncoderNotRegistered {
        /// The unregistered tag.
        tag: String,
    },

    /// A blocking-mode commit failed to replace the committed image.
    #[error("commit failed: {message}")]
    CommitFailed {
        /// Description of the failure.
        message: String,
    },

    /// The data region failed validation during parsing.
    #[error("parse failed: {message}")]
    ParseFailed {
        /// Description of the parse issue.
        message: String,
    },

    /// Storage-layer error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Codec-layer error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Plain I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CoreError {
    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a parse failed error.
    pub fn parse_failed(message: impl Into<String>) -> Self {
        Self::ParseFailed {
            message: message.into(),
        }
    }

    /// Creates a commit failed error.
    pub fn commit_failed(message: impl Into<String>) -> Self {
        Self::CommitFailed {
            message: message.into(),
        }
    }
}
