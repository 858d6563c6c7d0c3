//! # MirrorKV
//!
//! An embedded, single-process, typed key-value store persisted to local
//! files with crash-consistent updates.
//!
//! The engine keeps the whole data region in memory and, by default,
//! mirrors every mutation into two memory-mapped files (`.kva` and
//! `.kvb`) guarded by a rolling checksum and an in-progress marker, so
//! a torn write never costs more than the interrupted mutation. Two
//! blocking modes trade per-mutation mmap patching for whole-image
//! commits via atomic rename.
//!
//! ```no_run
//! use mirrorkv_core::{Context, Store};
//!
//! # fn main() -> mirrorkv_core::CoreResult<()> {
//! let ctx = Context::new();
//! let store = Store::builder(&ctx, "/var/lib/myapp", "prefs").build()?;
//! store.put_int("launch_count", 42)?;
//! store.put_string("device_id", "a1b2c3")?;
//! assert_eq!(store.get_int("launch_count"), Some(42));
//! # Ok(())
//! # }
//! ```
//!
//! Values above the configured internal limit spill to sidecar files
//! under `<path>/<name>/`, referenced by name from the record body.
//! Custom types round-trip through [`ObjectEncoder`] implementations
//! registered on the builder.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod builder;
mod cache;
mod config;
mod container;
mod error;
mod executor;
mod gc;
mod logger;
mod store;

pub use builder::Builder;
pub use config::{
    Context, ContextBuilder, DEFAULT_INTERNAL_LIMIT, MAX_INTERNAL_LIMIT, MIN_INTERNAL_LIMIT,
};
pub use error::{CoreError, CoreResult};
pub use executor::{LimitExecutor, TagExecutor, ThreadPool};
pub use logger::{Logger, TracingLogger};
pub use store::{Store, StoreStats, WritingMode};

pub use mirrorkv_codec::{
    CodecError, CodecResult, ObjectEncoder, StringSetEncoder, Value, STRING_SET_TAG,
};
