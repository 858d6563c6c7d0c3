//! # MirrorKV Codec
//!
//! Wire-format primitives shared by the MirrorKV engine:
//!
//! - [`Buffer`]: little-endian cursor buffer with the rolling XOR
//!   checksum used for incremental integrity updates
//! - [`DataType`] and the type-byte flag masks of the record format
//! - [`ObjectEncoder`] / [`DynEncoder`]: pluggable codecs for custom
//!   object payloads, plus the built-in [`StringSetEncoder`]
//! - [`Value`]: dynamically typed value for snapshots and batch puts
//!
//! The record layout itself (header fields, key/value framing) is owned
//! by the engine; this crate provides the pieces the layout is built
//! from and commits to their exact byte-level behavior.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod buffer;
mod encoder;
mod error;
mod types;
mod value;

pub use buffer::{shift_checksum, Buffer};
pub use encoder::{DynEncoder, ObjectEncoder, StringSetEncoder, STRING_SET_TAG};
pub use error::{CodecError, CodecResult};
pub use types::{
    DataType, DATA_START, DELETE_MASK, EXTERNAL_MASK, MAX_KEY_SIZE, MAX_TAG_SIZE, NAME_SIZE,
    TYPE_MASK,
};
pub use value::Value;
