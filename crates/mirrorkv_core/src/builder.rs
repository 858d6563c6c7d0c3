//! Store builder and the per-context instance registry.

use crate::config::Context;
use crate::error::{CoreError, CoreResult};
use crate::store::{Store, WritingMode};
use mirrorkv_codec::{DynEncoder, ObjectEncoder, StringSetEncoder, MAX_TAG_SIZE, STRING_SET_TAG};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// Builds (or retrieves) a [`Store`].
///
/// Stores are deduplicated per context: two builds with the same
/// canonicalized `path + name` return handles to the same engine, and
/// the second build's mode and encoders are ignored. Concurrent external
/// processes touching the same files are undefined behavior; the
/// registry is what enforces single ownership within a process.
pub struct Builder {
    ctx: Context,
    path: PathBuf,
    name: String,
    encoders: Vec<Arc<dyn DynEncoder>>,
    mode: WritingMode,
}

impl Builder {
    pub(crate) fn new(ctx: Context, path: PathBuf, name: String) -> Self {
        Self {
            ctx,
            path,
            name,
            encoders: Vec::new(),
            mode: WritingMode::NonBlocking,
        }
    }

    /// Registers an object encoder for decoding stored payloads on load.
    ///
    /// A duplicate tag is logged and ignored, keeping the first
    /// registration.
    #[must_use]
    pub fn encoder<E: ObjectEncoder>(mut self, encoder: E) -> Self {
        self.encoders.push(Arc::new(encoder));
        self
    }

    /// Selects synchronous blocking mode: every mutation rewrites the
    /// whole committed image before returning.
    #[must_use]
    pub fn blocking(mut self) -> Self {
        self.mode = WritingMode::SyncBlocking;
        self
    }

    /// Selects asynchronous blocking mode: commits run on a background
    /// task with coalescing.
    #[must_use]
    pub fn async_blocking(mut self) -> Self {
        self.mode = WritingMode::AsyncBlocking;
        self
    }

    /// Opens the store, or returns the existing instance for this
    /// `path + name`.
    pub fn build(self) -> CoreResult<Store> {
        let Self {
            ctx,
            path,
            name,
            encoders,
            mode,
        } = self;
        if name.is_empty() {
            return Err(CoreError::invalid_argument("name is empty"));
        }
        if path.as_os_str().is_empty() {
            return Err(CoreError::invalid_argument("path is empty"));
        }
        fs::create_dir_all(&path)?;
        let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
        let registry_key = format!("{}/{name}", canonical.display());

        let mut instances = ctx.inner.instances.lock();
        if let Some(existing) = instances.get(&registry_key) {
            return Ok(existing.clone());
        }

        let mut registry: HashMap<String, Arc<dyn DynEncoder>> = HashMap::new();
        registry.insert(STRING_SET_TAG.to_owned(), Arc::new(StringSetEncoder));
        for encoder in encoders {
            let tag = encoder.tag();
            if tag.is_empty() || tag.len() > MAX_TAG_SIZE {
                return Err(CoreError::invalid_argument(format!(
                    "invalid encoder tag: {tag:?}"
                )));
            }
            if registry.contains_key(tag) {
                ctx.inner
                    .logger
                    .error(&name, &format!("duplicate encoder tag: {tag}"));
                continue;
            }
            registry.insert(tag.to_owned(), encoder);
        }

        let store = Store::open_internal(&ctx, path, name, registry, mode);
        instances.insert(registry_key, store.clone());
        Ok(store)
    }
}
