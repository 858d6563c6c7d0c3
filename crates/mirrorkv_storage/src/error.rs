//! Error types for the storage crate.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur at the file layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Plain I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A memory-map or remap operation failed.
    ///
    /// The engine treats this as the signal to degrade out of
    /// memory-mapped writing.
    #[error("memory-map failed for {path}: {source}")]
    MapFailed {
        /// Path of the file that failed to map.
        path: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
}
