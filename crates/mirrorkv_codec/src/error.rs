//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A string field contained invalid UTF-8.
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// A read ran past the end of the buffer.
    #[error("unexpected end of buffer at offset {offset}")]
    UnexpectedEof {
        /// Offset at which the read was attempted.
        offset: usize,
    },

    /// The type byte of a record is not a known type.
    #[error("invalid type tag: {raw:#04x}")]
    InvalidTypeTag {
        /// The raw type byte (flags stripped).
        raw: u8,
    },

    /// An object encoder failed to encode a value.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// An object encoder failed to decode a payload.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },
}

impl CodecError {
    /// Creates an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Creates a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }
}
