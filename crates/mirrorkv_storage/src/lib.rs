//! # MirrorKV Storage
//!
//! File storage for the MirrorKV engine:
//!
//! - [`MappedFile`]: one memory-mapped mirror copy of the data region,
//!   with little-endian absolute accessors and remap/truncate support
//! - blocking-file helpers: whole-file reads, atomic
//!   write-temp-then-rename commits, and sidecar payload files for
//!   oversized values
//!
//! Storage knows nothing about the record format; the engine owns all
//! interpretation of bytes.

#![warn(missing_docs)]

mod error;
mod file;
mod mapped;

pub use error::{StorageError, StorageResult};
pub use file::{
    delete_dir, delete_file, delete_sidecar, load_sidecar, random_name, read_file, save_sidecar,
    write_atomic,
};
pub use mapped::MappedFile;
