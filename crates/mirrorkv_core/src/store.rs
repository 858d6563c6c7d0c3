//! The store engine: open/recovery, the container index, the mutation
//! protocol, and the blocking-mode writer.
//!
//! A store keeps its whole data region in one in-memory buffer and, in
//! non-blocking mode, mirrors every patch into two memory-mapped files A
//! and B. Mutations are in-place for same-size primitive updates and
//! append-plus-tombstone for everything else, so offsets of live records
//! never move outside garbage collection. The rolling checksum in the
//! header is maintained incrementally on every change.
//!
//! Crash consistency of the mirror pair rests on one invariant: between
//! any two steps of a write, at least one of A and B is intact. A is
//! always patched first under a negative `dataSize` marker; B is only
//! touched after A has been restored to a consistent state.

use crate::builder::Builder;
use crate::cache::LruCache;
use crate::config::{Context, ContextInner};
use crate::container::{Container, VarContainer, VarValue};
use crate::error::{CoreError, CoreResult};
use crate::executor::{LimitExecutor, TagExecutor};
use crate::gc::InvalidSegment;
use crate::logger::Logger;
use mirrorkv_codec::{
    shift_checksum, Buffer, DataType, DynEncoder, ObjectEncoder, StringSetEncoder, Value,
    DATA_START, DELETE_MASK, EXTERNAL_MASK, MAX_KEY_SIZE, MAX_TAG_SIZE, NAME_SIZE, TYPE_MASK,
};
use mirrorkv_storage::{
    delete_dir, delete_file, delete_sidecar, load_sidecar, random_name, read_file, save_sidecar,
    write_atomic, MappedFile, StorageResult,
};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

pub(crate) const A_SUFFIX: &str = ".kva";
pub(crate) const B_SUFFIX: &str = ".kvb";
pub(crate) const C_SUFFIX: &str = ".kvc";
pub(crate) const TEMP_SUFFIX: &str = ".tmp";

pub(crate) const PAGE_SIZE: usize = 4096;
pub(crate) const DOUBLE_LIMIT: usize = 1 << 14;
pub(crate) const TRUNCATE_THRESHOLD: usize = DOUBLE_LIMIT * 4;
pub(crate) const DATA_SIZE_LIMIT: usize = 1 << 29;

const CACHE_CAPACITY: usize = 16;

/// How mutations reach disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritingMode {
    /// Patch both memory-mapped mirror files on every mutation.
    NonBlocking,
    /// Keep the buffer in memory; commit the whole image on a background
    /// task.
    AsyncBlocking,
    /// Keep the buffer in memory; commit the whole image synchronously.
    SyncBlocking,
}

/// Point-in-time counters for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// End of the data region, including the 12-byte header.
    pub data_end: usize,
    /// Bytes held by tombstoned records awaiting garbage collection.
    pub invalid_bytes: usize,
    /// Number of tracked tombstoned segments.
    pub invalid_segments: usize,
    /// Capacity of the in-memory buffer (and of the mirror files in
    /// non-blocking mode).
    pub capacity: usize,
    /// Number of live keys.
    pub key_count: usize,
    /// Current writing mode.
    pub mode: WritingMode,
}

/// Value cached for a key whose payload lives in a sidecar file.
#[derive(Clone)]
pub(crate) enum CachedValue {
    Text(String),
    Bytes(Arc<Vec<u8>>),
    Object(Arc<dyn Any + Send + Sync>),
}

/// In-memory value being written by a variable-size put.
pub(crate) enum PutPayload {
    Text(String),
    Bytes(Arc<Vec<u8>>),
    Object(Arc<dyn Any + Send + Sync>),
}

impl PutPayload {
    fn into_var_value(self) -> VarValue {
        match self {
            Self::Text(s) => VarValue::Text(s),
            Self::Bytes(b) => VarValue::Bytes(b),
            Self::Object(o) => VarValue::Object(o),
        }
    }

    fn into_cached(self) -> CachedValue {
        match self {
            Self::Text(s) => CachedValue::Text(s),
            Self::Bytes(b) => CachedValue::Bytes(b),
            Self::Object(o) => CachedValue::Object(o),
        }
    }
}

pub(crate) struct Mirror {
    pub(crate) a: MappedFile,
    pub(crate) b: MappedFile,
}

/// An embedded, typed, persistent key-value store.
///
/// Handles are cheap clones sharing one engine; the builder registry
/// guarantees one engine per `path + name` within a [`Context`]. All
/// operations serialize on a single store-level lock and run to
/// completion under it.
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

impl Clone for Store {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.inner.name)
            .field("path", &self.inner.dir)
            .finish_non_exhaustive()
    }
}

pub(crate) struct StoreInner {
    pub(crate) name: String,
    pub(crate) dir: PathBuf,
    pub(crate) sidecar_dir: PathBuf,
    pub(crate) internal_limit: usize,
    pub(crate) ctx: Arc<ContextInner>,
    pub(crate) encoders: HashMap<String, Arc<dyn DynEncoder>>,
    pub(crate) state: Mutex<StoreState>,
    load_started: Mutex<bool>,
    load_cond: Condvar,
    apply_executor: LimitExecutor,
    pub(crate) external_executor: TagExecutor,
}

impl StoreInner {
    pub(crate) fn file_path(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{}", self.name, suffix))
    }

    pub(crate) fn info(&self, message: &str) {
        self.ctx.logger.info(&self.name, message);
    }

    pub(crate) fn warning(&self, message: &str) {
        self.ctx.logger.warning(&self.name, message);
    }

    pub(crate) fn error(&self, message: &str) {
        self.ctx.logger.error(&self.name, message);
    }

    fn logger_handle(&self) -> (Arc<dyn Logger>, String) {
        (Arc::clone(&self.ctx.logger), self.name.clone())
    }
}

pub(crate) struct StoreState {
    pub(crate) buffer: Buffer,
    pub(crate) data_end: usize,
    pub(crate) checksum: u64,
    pub(crate) index: HashMap<String, Container>,
    pub(crate) mirror: Option<Mirror>,
    pub(crate) mode: WritingMode,
    pub(crate) auto_commit: bool,
    pub(crate) invalid_bytes: usize,
    pub(crate) invalids: Vec<InvalidSegment>,
    deleted_files: Vec<String>,
    external_cache: LruCache<Arc<Vec<u8>>>,
    big_value_cache: LruCache<CachedValue>,
    pub(crate) update_start: usize,
    pub(crate) update_size: usize,
    pub(crate) remove_start: usize,
    pub(crate) size_changed: bool,
    temp_external_name: Option<String>,
}

impl Store {
    /// Starts building a store rooted at `path` with the given name.
    pub fn builder(ctx: &Context, path: impl Into<PathBuf>, name: impl Into<String>) -> Builder {
        Builder::new(ctx.clone(), path.into(), name.into())
    }

    /// The store name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The directory holding the store's files.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.dir
    }

    /// Returns point-in-time diagnostics.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let state = self.inner.state.lock();
        StoreStats {
            data_end: state.data_end,
            invalid_bytes: state.invalid_bytes,
            invalid_segments: state.invalids.len(),
            capacity: state.buffer.capacity(),
            key_count: state.index.len(),
            mode: state.mode,
        }
    }

    /// Whether a live value exists for `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.inner.state.lock().index.contains_key(key)
    }

    /// Reads a boolean.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.inner.state.lock().index.get(key) {
            Some(Container::Bool { value, .. }) => Some(*value),
            _ => None,
        }
    }

    /// Reads a 32-bit integer.
    #[must_use]
    pub fn get_int(&self, key: &str) -> Option<i32> {
        match self.inner.state.lock().index.get(key) {
            Some(Container::Int { value, .. }) => Some(*value),
            _ => None,
        }
    }

    /// Reads a 64-bit integer.
    #[must_use]
    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.inner.state.lock().index.get(key) {
            Some(Container::Long { value, .. }) => Some(*value),
            _ => None,
        }
    }

    /// Reads a 32-bit float.
    #[must_use]
    pub fn get_float(&self, key: &str) -> Option<f32> {
        match self.inner.state.lock().index.get(key) {
            Some(Container::Float { value, .. }) => Some(*value),
            _ => None,
        }
    }

    /// Reads a 64-bit float.
    #[must_use]
    pub fn get_double(&self, key: &str) -> Option<f64> {
        match self.inner.state.lock().index.get(key) {
            Some(Container::Double { value, .. }) => Some(*value),
            _ => None,
        }
    }

    /// Reads a string. External payloads are fetched from their sidecar
    /// file; a failed sidecar read logs and yields an empty string.
    #[must_use]
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.inner.state.lock().get_string(&self.inner, key)
    }

    /// Reads a byte array. A failed sidecar read logs and yields an
    /// empty array.
    #[must_use]
    pub fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.state.lock().get_bytes(&self.inner, key)
    }

    /// Reads an object decoded by its registered encoder.
    ///
    /// Returns `None` when the key is absent, holds a different type, or
    /// the stored value does not downcast to `T`.
    #[must_use]
    pub fn get_object<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let erased = self.inner.state.lock().get_object_any(&self.inner, key)?;
        erased.downcast::<T>().ok()
    }

    /// Reads a string set stored via [`Store::put_string_set`].
    #[must_use]
    pub fn get_string_set(&self, key: &str) -> Option<Arc<HashSet<String>>> {
        self.get_object(key)
    }

    /// Snapshots every live entry as a dynamically typed value.
    #[must_use]
    pub fn get_all(&self) -> HashMap<String, Value> {
        let mut state = self.inner.state.lock();
        let keys: Vec<String> = state.index.keys().cloned().collect();
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = state.snapshot_value(&self.inner, &key) {
                out.insert(key, value);
            }
        }
        out
    }

    /// Writes a boolean.
    pub fn put_bool(&self, key: &str, value: bool) -> CoreResult<()> {
        check_key(key)?;
        let mut state = self.inner.state.lock();
        state.put_bool(&self.inner, key, value)?;
        self.check_if_commit(&mut state);
        Ok(())
    }

    /// Writes a 32-bit integer.
    pub fn put_int(&self, key: &str, value: i32) -> CoreResult<()> {
        check_key(key)?;
        let mut state = self.inner.state.lock();
        state.put_int(&self.inner, key, value)?;
        self.check_if_commit(&mut state);
        Ok(())
    }

    /// Writes a 64-bit integer.
    pub fn put_long(&self, key: &str, value: i64) -> CoreResult<()> {
        check_key(key)?;
        let mut state = self.inner.state.lock();
        state.put_long(&self.inner, key, value)?;
        self.check_if_commit(&mut state);
        Ok(())
    }

    /// Writes a 32-bit float.
    pub fn put_float(&self, key: &str, value: f32) -> CoreResult<()> {
        check_key(key)?;
        let mut state = self.inner.state.lock();
        state.put_float(&self.inner, key, value)?;
        self.check_if_commit(&mut state);
        Ok(())
    }

    /// Writes a 64-bit float.
    pub fn put_double(&self, key: &str, value: f64) -> CoreResult<()> {
        check_key(key)?;
        let mut state = self.inner.state.lock();
        state.put_double(&self.inner, key, value)?;
        self.check_if_commit(&mut state);
        Ok(())
    }

    /// Writes a string. Values at or above the internal limit spill to a
    /// sidecar file.
    pub fn put_string(&self, key: &str, value: &str) -> CoreResult<()> {
        check_key(key)?;
        let mut state = self.inner.state.lock();
        state.resolve_type_conflict(&self.inner, key, DataType::String);
        if value.len() < self.inner.internal_limit {
            state.fast_put_string(&self.inner, key, value)?;
        } else {
            let bytes = Arc::new(value.as_bytes().to_vec());
            state.add_or_update(
                &self.inner,
                key,
                PutPayload::Text(value.to_owned()),
                &bytes,
                DataType::String,
            )?;
        }
        self.check_if_commit(&mut state);
        Ok(())
    }

    /// Writes a byte array. Values at or above the internal limit spill
    /// to a sidecar file.
    pub fn put_bytes(&self, key: &str, value: Vec<u8>) -> CoreResult<()> {
        check_key(key)?;
        let bytes = Arc::new(value);
        let mut state = self.inner.state.lock();
        state.resolve_type_conflict(&self.inner, key, DataType::Array);
        state.add_or_update(
            &self.inner,
            key,
            PutPayload::Bytes(Arc::clone(&bytes)),
            &bytes,
            DataType::Array,
        )?;
        self.check_if_commit(&mut state);
        Ok(())
    }

    /// Writes an object through its encoder.
    ///
    /// The encoder's tag must be registered on the builder. An encode
    /// failure logs and converts the put into a remove.
    pub fn put_object<E: ObjectEncoder>(
        &self,
        key: &str,
        value: E::Value,
        encoder: &E,
    ) -> CoreResult<()> {
        check_key(key)?;
        let tag = ObjectEncoder::tag(encoder);
        if tag.is_empty() || tag.len() > MAX_TAG_SIZE {
            return Err(CoreError::invalid_argument(format!(
                "invalid encoder tag: {tag:?}"
            )));
        }
        if !self.inner.encoders.contains_key(tag) {
            return Err(CoreError::EncoderNotRegistered { tag: tag.into() });
        }
        let encoded = match encoder.encode(&value) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.inner
                    .error(&format!("encode failed for key {key}: {e}"));
                self.remove(key);
                return Ok(());
            }
        };
        let tag_bytes = tag.as_bytes();
        let mut body = Vec::with_capacity(1 + tag_bytes.len() + encoded.len());
        body.push(tag_bytes.len() as u8);
        body.extend_from_slice(tag_bytes);
        body.extend_from_slice(&encoded);
        let bytes = Arc::new(body);

        let mut state = self.inner.state.lock();
        state.resolve_type_conflict(&self.inner, key, DataType::Object);
        state.add_or_update(
            &self.inner,
            key,
            PutPayload::Object(Arc::new(value)),
            &bytes,
            DataType::Object,
        )?;
        self.check_if_commit(&mut state);
        Ok(())
    }

    /// Writes a string set via the built-in encoder.
    pub fn put_string_set(&self, key: &str, value: HashSet<String>) -> CoreResult<()> {
        self.put_object(key, value, &StringSetEncoder)
    }

    /// Writes a batch of dynamically typed values.
    ///
    /// Entries with empty keys are skipped. [`Value::Object`] entries are
    /// skipped with a warning: the batch path has no way to recover their
    /// typed encoder.
    pub fn put_all(&self, values: impl IntoIterator<Item = (String, Value)>) -> CoreResult<()> {
        for (key, value) in values {
            if key.is_empty() {
                continue;
            }
            match value {
                Value::Bool(v) => self.put_bool(&key, v)?,
                Value::Int(v) => self.put_int(&key, v)?,
                Value::Long(v) => self.put_long(&key, v)?,
                Value::Float(v) => self.put_float(&key, v)?,
                Value::Double(v) => self.put_double(&key, v)?,
                Value::Text(v) => self.put_string(&key, &v)?,
                Value::Bytes(v) => self.put_bytes(&key, v)?,
                Value::Object(_) => self
                    .inner
                    .warning(&format!("skipping object value for key {key} in batch put")),
            }
        }
        Ok(())
    }

    /// Removes a key, tombstoning its record in place.
    pub fn remove(&self, key: &str) {
        let mut state = self.inner.state.lock();
        if state.do_remove(&self.inner, key) {
            self.check_if_commit(&mut state);
        }
    }

    /// Removes every key and resets the persisted files to empty.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.reset_data(&self.inner);
        if state.mode != WritingMode::NonBlocking {
            state.delete_c_files(&self.inner);
        }
    }

    /// Forces dirty mapped pages to the storage device.
    ///
    /// Only meaningful in non-blocking mode; a no-op otherwise.
    pub fn force(&self) -> CoreResult<()> {
        let state = self.inner.state.lock();
        if let Some(m) = state.mirror.as_ref() {
            m.a.flush()?;
            m.b.flush()?;
        }
        Ok(())
    }

    /// Suspends per-mutation commits in blocking modes until the next
    /// [`Store::commit`].
    pub fn disable_auto_commit(&self) {
        self.inner.state.lock().auto_commit = false;
    }

    /// Commits the buffer to the single-file image and re-enables auto
    /// commit. A no-op in non-blocking mode.
    pub fn commit(&self) -> CoreResult<()> {
        let mut state = self.inner.state.lock();
        state.auto_commit = true;
        match state.mode {
            WritingMode::NonBlocking => Ok(()),
            WritingMode::AsyncBlocking => {
                self.schedule_async_commit();
                Ok(())
            }
            WritingMode::SyncBlocking => {
                if write_to_c_file(&self.inner, &mut state) {
                    Ok(())
                } else {
                    Err(CoreError::commit_failed("failed to replace committed image"))
                }
            }
        }
    }

    fn check_if_commit(&self, state: &mut StoreState) {
        if state.mode != WritingMode::NonBlocking && state.auto_commit {
            match state.mode {
                WritingMode::AsyncBlocking => self.schedule_async_commit(),
                WritingMode::SyncBlocking => {
                    write_to_c_file(&self.inner, state);
                }
                WritingMode::NonBlocking => {}
            }
        }
    }

    fn schedule_async_commit(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.apply_executor.execute(move || {
            let mut state = inner.state.lock();
            write_to_c_file(&inner, &mut state);
        });
    }

    pub(crate) fn open_internal(
        ctx: &Context,
        dir: PathBuf,
        name: String,
        encoders: HashMap<String, Arc<dyn DynEncoder>>,
        mode: WritingMode,
    ) -> Store {
        let pool = ctx.inner.pool.clone();
        let sidecar_dir = dir.join(&name);
        let inner = Arc::new(StoreInner {
            name,
            dir,
            sidecar_dir,
            internal_limit: ctx.inner.internal_limit,
            ctx: Arc::clone(&ctx.inner),
            encoders,
            state: Mutex::new(StoreState::new(mode)),
            load_started: Mutex::new(false),
            load_cond: Condvar::new(),
            apply_executor: LimitExecutor::new(pool.clone()),
            external_executor: TagExecutor::new(pool.clone()),
        });
        let loader = Arc::clone(&inner);
        pool.execute(move || load_task(&loader));
        // Callers must not observe the store before the loader holds the
        // store lock; wait for its signal.
        let mut started = inner.load_started.lock();
        while !*started {
            inner.load_cond.wait(&mut started);
        }
        drop(started);
        Store { inner }
    }
}

fn load_task(inner: &Arc<StoreInner>) {
    let mut state = inner.state.lock();
    {
        let mut started = inner.load_started.lock();
        *started = true;
        inner.load_cond.notify_all();
    }
    let start = Instant::now();
    state.load(inner);
    inner.info(&format!(
        "loading finished, data len: {}, keys: {}, took {:?}",
        state.data_end - DATA_START,
        state.index.len(),
        start.elapsed()
    ));
}

fn check_key(key: &str) -> CoreResult<()> {
    if key.is_empty() {
        return Err(CoreError::invalid_argument("key is empty"));
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(CoreError::invalid_argument(
            "key length must be at most 255 bytes",
        ));
    }
    Ok(())
}

pub(crate) fn get_new_capacity(mut capacity: usize, expected: usize) -> CoreResult<usize> {
    if expected > DATA_SIZE_LIMIT {
        return Err(CoreError::DataSizeLimit { size: expected });
    }
    if expected <= PAGE_SIZE {
        return Ok(PAGE_SIZE);
    }
    while capacity < expected {
        if capacity <= DOUBLE_LIMIT {
            capacity <<= 1;
        } else {
            capacity += DOUBLE_LIMIT;
        }
    }
    Ok(capacity)
}

fn write_to_c_file(inner: &StoreInner, state: &mut StoreState) -> bool {
    let tmp = inner.file_path(TEMP_SUFFIX);
    let target = inner.file_path(C_SUFFIX);
    match write_atomic(&tmp, &target, &state.buffer.as_slice()[..state.data_end]) {
        Ok(()) => {
            state.clear_deleted_files(inner);
            true
        }
        Err(e) => {
            inner.warning(&format!("commit failed: {e}"));
            false
        }
    }
}

/// Writes one mirror side: optional size, checksum, optional tombstone
/// byte, then the changed record bytes.
fn sync_side(
    side: &mut MappedFile,
    buf: &[u8],
    checksum: u64,
    data_size: i32,
    write_size: bool,
    remove_start: usize,
    update_start: usize,
    update_size: usize,
) {
    if write_size {
        side.write_i32(0, data_size);
    }
    side.write_u64(4, checksum);
    if remove_start != 0 {
        side.write_u8(remove_start, buf[remove_start]);
    }
    if update_size != 0 {
        side.write_bytes(update_start, &buf[update_start..update_start + update_size]);
    }
}

fn copy_mirror(src: &MappedFile, dst: &mut MappedFile, end: usize) -> StorageResult<()> {
    if dst.capacity() != src.capacity() {
        dst.remap(src.capacity())?;
    }
    let mut tmp = vec![0u8; end];
    src.read_into(&mut tmp, end);
    dst.write_bytes(0, &tmp);
    Ok(())
}

fn mirror_matches_buffer(side: &MappedFile, buffer: &Buffer, end: usize) -> bool {
    let mut tmp = vec![0u8; end];
    side.read_into(&mut tmp, end);
    buffer.as_slice()[..end] == tmp[..]
}

fn reset_mirror_side(side: &mut MappedFile) -> StorageResult<()> {
    if side.capacity() != PAGE_SIZE {
        side.remap(PAGE_SIZE)?;
    }
    side.write_i32(0, 0);
    side.write_u64(4, 0);
    Ok(())
}

impl StoreState {
    fn new(mode: WritingMode) -> Self {
        Self {
            buffer: Buffer::with_capacity(PAGE_SIZE),
            data_end: DATA_START,
            checksum: 0,
            index: HashMap::new(),
            mirror: None,
            mode,
            auto_commit: true,
            invalid_bytes: 0,
            invalids: Vec::new(),
            deleted_files: Vec::new(),
            external_cache: LruCache::new(CACHE_CAPACITY),
            big_value_cache: LruCache::new(CACHE_CAPACITY),
            update_start: 0,
            update_size: 0,
            remove_start: 0,
            size_changed: false,
            temp_external_name: None,
        }
    }

    // ----- loading and recovery -----

    fn load(&mut self, inner: &StoreInner) {
        if !self.load_from_c_file(inner) && self.mode == WritingMode::NonBlocking {
            self.load_from_ab_file(inner);
        }
    }

    /// Loads from a committed single-file image if one exists.
    ///
    /// Returns true when the image was materialized into fresh mirror
    /// files (non-blocking recovery), in which case the A/B load is
    /// skipped entirely.
    fn load_from_c_file(&mut self, inner: &StoreInner) -> bool {
        let c_path = inner.file_path(C_SUFFIX);
        let tmp_path = inner.file_path(TEMP_SUFFIX);
        let src = if c_path.exists() {
            Some(c_path)
        } else if tmp_path.exists() {
            Some(tmp_path)
        } else {
            None
        };
        match src {
            Some(src) => {
                let loaded = match self.load_with_blocking_io(inner, &src) {
                    Ok(ok) => ok,
                    Err(e) => {
                        inner.error(&format!("failed to read committed image: {e}"));
                        false
                    }
                };
                if loaded {
                    if self.mode == WritingMode::NonBlocking {
                        if self.write_to_ab_file(inner) {
                            inner.info("recovered mirrors from committed image");
                            self.delete_c_files(inner);
                            return true;
                        }
                        self.mode = WritingMode::AsyncBlocking;
                    }
                } else {
                    self.clear_mem();
                    self.delete_c_files(inner);
                }
            }
            None => {
                // A store previously opened non-blocking may be reopened
                // in a blocking mode; its state then lives in A/B only.
                if self.mode != WritingMode::NonBlocking {
                    let a_path = inner.file_path(A_SUFFIX);
                    let b_path = inner.file_path(B_SUFFIX);
                    if a_path.exists() && b_path.exists() {
                        self.try_blocking_io(inner);
                    }
                }
            }
        }
        false
    }

    fn load_with_blocking_io(&mut self, inner: &StoreInner, src: &Path) -> CoreResult<bool> {
        let bytes = read_file(src)?;
        let file_size = bytes.len();
        if file_size == 0 || file_size > DATA_SIZE_LIMIT {
            return Ok(false);
        }
        let capacity = get_new_capacity(PAGE_SIZE, file_size)?;
        if self.buffer.capacity() != capacity {
            self.buffer = Buffer::with_capacity(capacity);
        }
        self.buffer.as_mut_slice()[..file_size].copy_from_slice(&bytes);
        self.buffer.as_mut_slice()[file_size..].fill(0);
        self.buffer.position = 0;
        let data_size = self.buffer.get_i32()?;
        let sum = self.buffer.get_u64()?;
        if data_size >= 0
            && file_size >= DATA_START
            && data_size as usize <= file_size - DATA_START
        {
            self.data_end = DATA_START + data_size as usize;
            if sum == self.buffer.checksum(DATA_START, data_size as usize) {
                match self.parse_data(inner) {
                    Ok(()) => {
                        self.checksum = sum;
                        return Ok(true);
                    }
                    Err(e) => inner.warning(&format!("parse failed: {e}")),
                }
            }
        }
        Ok(false)
    }

    fn try_blocking_io(&mut self, inner: &StoreInner) {
        let a_path = inner.file_path(A_SUFFIX);
        match self.load_with_blocking_io(inner, &a_path) {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => inner.warning(&format!("blocking read of mirror A failed: {e}")),
        }
        self.clear_mem();
        let b_path = inner.file_path(B_SUFFIX);
        match self.load_with_blocking_io(inner, &b_path) {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => inner.warning(&format!("blocking read of mirror B failed: {e}")),
        }
        self.clear_mem();
    }

    fn load_from_ab_file(&mut self, inner: &StoreInner) {
        let a_path = inner.file_path(A_SUFFIX);
        let b_path = inner.file_path(B_SUFFIX);
        // File lengths before mapping: a fresh pair maps a full page but
        // is still logically empty.
        let a_file_len = fs::metadata(&a_path).map(|m| m.len() as usize).unwrap_or(0);
        let b_file_len = fs::metadata(&b_path).map(|m| m.len() as usize).unwrap_or(0);
        if let Err(e) = fs::create_dir_all(&inner.dir) {
            inner.error(&format!("failed to create store directory: {e}"));
            self.to_blocking_mode();
            return;
        }
        let opened = MappedFile::open(&a_path, PAGE_SIZE)
            .and_then(|a| MappedFile::open(&b_path, PAGE_SIZE).map(|b| (a, b)));
        let (mut a, mut b) = match opened {
            Ok(pair) => pair,
            Err(e) => {
                inner.error(&format!("failed to open mirror files: {e}"));
                self.to_blocking_mode();
                self.try_blocking_io(inner);
                return;
            }
        };
        self.buffer = Buffer::with_capacity(a.capacity());
        if a_file_len == 0 && b_file_len == 0 {
            self.data_end = DATA_START;
        } else {
            let a_data_size = a.read_i32(0);
            let a_checksum = a.read_u64(4);
            let b_data_size = b.read_i32(0);
            let b_checksum = b.read_u64(4);

            let mut a_valid = false;
            if a_data_size >= 0
                && a_file_len >= DATA_START
                && a_data_size as usize <= a_file_len - DATA_START
            {
                self.data_end = DATA_START + a_data_size as usize;
                a.read_into(self.buffer.as_mut_slice(), self.data_end);
                if a_checksum == self.buffer.checksum(DATA_START, a_data_size as usize)
                    && self.parse_data(inner).is_ok()
                {
                    self.checksum = a_checksum;
                    a_valid = true;
                }
            }
            if a_valid {
                if a_file_len != b_file_len
                    || !mirror_matches_buffer(&b, &self.buffer, self.data_end)
                {
                    inner.warning("mirror B differs from A, repairing");
                    if let Err(e) = copy_mirror(&a, &mut b, self.data_end) {
                        inner.error(&format!("failed to repair mirror B: {e}"));
                        self.to_blocking_mode();
                        return;
                    }
                }
            } else {
                let mut b_valid = false;
                if b_data_size >= 0
                    && b_file_len >= DATA_START
                    && b_data_size as usize <= b_file_len - DATA_START
                {
                    self.index.clear();
                    self.clear_invalid();
                    self.data_end = DATA_START + b_data_size as usize;
                    if self.buffer.capacity() != b.capacity() {
                        self.buffer = Buffer::with_capacity(b.capacity());
                    }
                    b.read_into(self.buffer.as_mut_slice(), self.data_end);
                    if b_checksum == self.buffer.checksum(DATA_START, b_data_size as usize)
                        && self.parse_data(inner).is_ok()
                    {
                        inner.warning("mirror A invalid, loading from B");
                        if let Err(e) = copy_mirror(&b, &mut a, self.data_end) {
                            inner.error(&format!("failed to repair mirror A: {e}"));
                            self.to_blocking_mode();
                            return;
                        }
                        self.checksum = b_checksum;
                        b_valid = true;
                    }
                }
                if !b_valid {
                    inner.error("both mirror files invalid, resetting store");
                    self.mirror = Some(Mirror { a, b });
                    self.reset_data(inner);
                    return;
                }
            }
        }
        self.mirror = Some(Mirror { a, b });
    }

    fn write_to_ab_file(&mut self, inner: &StoreInner) -> bool {
        let file_len = self.buffer.capacity();
        let opened = MappedFile::open_sized(&inner.file_path(A_SUFFIX), file_len)
            .and_then(|a| MappedFile::open_sized(&inner.file_path(B_SUFFIX), file_len).map(|b| (a, b)));
        match opened {
            Ok((mut a, mut b)) => {
                let image = &self.buffer.as_slice()[..self.data_end];
                a.write_bytes(0, image);
                b.write_bytes(0, image);
                self.mirror = Some(Mirror { a, b });
                true
            }
            Err(e) => {
                inner.error(&format!("failed to materialize mirror files: {e}"));
                false
            }
        }
    }

    /// Walks the data region and rebuilds the container index.
    ///
    /// Tombstones are skipped into the invalid-segment list. The cursor
    /// must land exactly on `data_end` or the region is rejected.
    fn parse_data(&mut self, inner: &StoreInner) -> CoreResult<()> {
        self.buffer.position = DATA_START;
        while self.buffer.position < self.data_end {
            let start = self.buffer.position;
            let info = self.buffer.get_u8()?;
            let data_type = DataType::from_raw(info & TYPE_MASK)?;
            let key_size = self.buffer.get_u8()? as usize;
            if info & DELETE_MASK != 0 {
                self.buffer.position += key_size;
                let value_size = if data_type.is_fixed() {
                    data_type.fixed_size()
                } else {
                    self.buffer.get_u16()? as usize
                };
                self.buffer.position += value_size;
                let end = self.buffer.position;
                self.count_invalid(start, end);
                continue;
            }
            let key = self.buffer.get_str(key_size)?;
            let pos = self.buffer.position;
            match data_type {
                DataType::Bool => {
                    let value = self.buffer.get_u8()? == 1;
                    self.index
                        .insert(key, Container::Bool { offset: pos, value });
                }
                DataType::Int => {
                    let value = self.buffer.get_i32()?;
                    self.index
                        .insert(key, Container::Int { offset: pos, value });
                }
                DataType::Float => {
                    let value = self.buffer.get_f32()?;
                    self.index
                        .insert(key, Container::Float { offset: pos, value });
                }
                DataType::Long => {
                    let value = self.buffer.get_i64()?;
                    self.index
                        .insert(key, Container::Long { offset: pos, value });
                }
                DataType::Double => {
                    let value = self.buffer.get_f64()?;
                    self.index
                        .insert(key, Container::Double { offset: pos, value });
                }
                DataType::String | DataType::Array | DataType::Object => {
                    let size = self.buffer.get_u16()? as usize;
                    let external = info & EXTERNAL_MASK != 0;
                    if external && size != NAME_SIZE {
                        return Err(CoreError::parse_failed("external name size mismatch"));
                    }
                    let container = VarContainer {
                        start,
                        offset: pos + 2,
                        value_size: size,
                        value: VarValue::Text(String::new()),
                    };
                    match data_type {
                        DataType::String => {
                            let text = self.buffer.get_str(size)?;
                            let value = if external {
                                VarValue::FileName(text)
                            } else {
                                VarValue::Text(text)
                            };
                            self.index
                                .insert(key, Container::Str(VarContainer { value, ..container }));
                        }
                        DataType::Array => {
                            let value = if external {
                                VarValue::FileName(self.buffer.get_str(size)?)
                            } else {
                                VarValue::Bytes(Arc::new(self.buffer.get_bytes(size)?))
                            };
                            self.index
                                .insert(key, Container::Bytes(VarContainer { value, ..container }));
                        }
                        _ => {
                            if external {
                                let value = VarValue::FileName(self.buffer.get_str(size)?);
                                self.index.insert(
                                    key,
                                    Container::Object(VarContainer { value, ..container }),
                                );
                            } else {
                                let tag_size = self.buffer.get_u8()? as usize;
                                let tag = self.buffer.get_str(tag_size)?;
                                let object_size = size.checked_sub(tag_size + 1).ok_or_else(
                                    || CoreError::parse_failed("object size underflow"),
                                )?;
                                if let Some(encoder) = inner.encoders.get(&tag) {
                                    let decoded = {
                                        let body =
                                            self.buffer.slice(self.buffer.position, object_size)?;
                                        encoder.decode_any(body)
                                    };
                                    match decoded {
                                        Ok(object) => {
                                            self.index.insert(
                                                key,
                                                Container::Object(VarContainer {
                                                    value: VarValue::Object(object),
                                                    ..container
                                                }),
                                            );
                                        }
                                        Err(e) => inner
                                            .error(&format!("decode failed for tag {tag}: {e}")),
                                    }
                                } else {
                                    inner.error(&format!("object with tag {tag} has no encoder"));
                                }
                                self.buffer.position += object_size;
                            }
                        }
                    }
                }
            }
        }
        if self.buffer.position != self.data_end {
            return Err(CoreError::parse_failed("size mismatch at end of data"));
        }
        Ok(())
    }

    // ----- reads that may touch sidecar files -----

    fn get_string(&mut self, inner: &StoreInner, key: &str) -> Option<String> {
        let value = match self.index.get(key) {
            Some(Container::Str(c)) => c.value.clone(),
            _ => return None,
        };
        match value {
            VarValue::Text(text) => Some(text),
            VarValue::FileName(name) => {
                if let Some(CachedValue::Text(text)) = self.big_value_cache.get(key) {
                    return Some(text.clone());
                }
                let text = self.string_from_file(inner, &name);
                if !text.is_empty() {
                    self.big_value_cache
                        .insert(key.to_owned(), CachedValue::Text(text.clone()));
                }
                Some(text)
            }
            _ => None,
        }
    }

    fn get_bytes(&mut self, inner: &StoreInner, key: &str) -> Option<Vec<u8>> {
        let value = match self.index.get(key) {
            Some(Container::Bytes(c)) => c.value.clone(),
            _ => return None,
        };
        match value {
            VarValue::Bytes(bytes) => Some((*bytes).clone()),
            VarValue::FileName(name) => {
                if let Some(CachedValue::Bytes(bytes)) = self.big_value_cache.get(key) {
                    return Some((**bytes).clone());
                }
                let bytes = self
                    .bytes_from_file(inner, &name)
                    .unwrap_or_else(|| Arc::new(Vec::new()));
                if !bytes.is_empty() {
                    self.big_value_cache
                        .insert(key.to_owned(), CachedValue::Bytes(Arc::clone(&bytes)));
                }
                Some((*bytes).clone())
            }
            _ => None,
        }
    }

    fn get_object_any(
        &mut self,
        inner: &StoreInner,
        key: &str,
    ) -> Option<Arc<dyn Any + Send + Sync>> {
        let value = match self.index.get(key) {
            Some(Container::Object(c)) => c.value.clone(),
            _ => return None,
        };
        match value {
            VarValue::Object(object) => Some(object),
            VarValue::FileName(name) => {
                if let Some(CachedValue::Object(object)) = self.big_value_cache.get(key) {
                    return Some(Arc::clone(object));
                }
                let object = self.object_from_file(inner, &name)?;
                self.big_value_cache
                    .insert(key.to_owned(), CachedValue::Object(Arc::clone(&object)));
                Some(object)
            }
            _ => None,
        }
    }

    fn snapshot_value(&mut self, inner: &StoreInner, key: &str) -> Option<Value> {
        let container = self.index.get(key)?.clone();
        Some(match container {
            Container::Bool { value, .. } => Value::Bool(value),
            Container::Int { value, .. } => Value::Int(value),
            Container::Float { value, .. } => Value::Float(value),
            Container::Long { value, .. } => Value::Long(value),
            Container::Double { value, .. } => Value::Double(value),
            Container::Str(_) => Value::Text(self.get_string(inner, key)?),
            Container::Bytes(_) => Value::Bytes(self.get_bytes(inner, key)?),
            Container::Object(_) => Value::Object(self.get_object_any(inner, key)?),
        })
    }

    fn bytes_from_file(&mut self, inner: &StoreInner, file_name: &str) -> Option<Arc<Vec<u8>>> {
        if let Some(bytes) = self.external_cache.get(file_name) {
            return Some(Arc::clone(bytes));
        }
        match load_sidecar(&inner.sidecar_dir, file_name) {
            Ok(bytes) => Some(Arc::new(bytes)),
            Err(e) => {
                inner.error(&format!("sidecar read failed for {file_name}: {e}"));
                None
            }
        }
    }

    fn string_from_file(&mut self, inner: &StoreInner, file_name: &str) -> String {
        match self.bytes_from_file(inner, file_name) {
            Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            None => String::new(),
        }
    }

    fn object_from_file(
        &mut self,
        inner: &StoreInner,
        file_name: &str,
    ) -> Option<Arc<dyn Any + Send + Sync>> {
        let bytes = self.bytes_from_file(inner, file_name)?;
        if bytes.is_empty() {
            inner.warning(&format!("empty object payload in {file_name}"));
            return None;
        }
        let tag_size = bytes[0] as usize;
        if 1 + tag_size > bytes.len() {
            inner.warning(&format!("truncated object payload in {file_name}"));
            return None;
        }
        let tag = match std::str::from_utf8(&bytes[1..1 + tag_size]) {
            Ok(tag) => tag,
            Err(_) => {
                inner.warning(&format!("bad object tag in {file_name}"));
                return None;
            }
        };
        match inner.encoders.get(tag) {
            Some(encoder) => match encoder.decode_any(&bytes[1 + tag_size..]) {
                Ok(object) => Some(object),
                Err(e) => {
                    inner.error(&format!("decode failed for tag {tag}: {e}"));
                    None
                }
            },
            None => {
                inner.warning(&format!("object with tag {tag} has no encoder"));
                None
            }
        }
    }

    // ----- fixed-size puts -----

    fn resolve_type_conflict(&mut self, inner: &StoreInner, key: &str, expected: DataType) {
        if let Some(container) = self.index.get(key) {
            if container.data_type() != expected {
                self.do_remove(inner, key);
            }
        }
    }

    fn put_bool(&mut self, inner: &StoreInner, key: &str, value: bool) -> CoreResult<()> {
        self.resolve_type_conflict(inner, key, DataType::Bool);
        match self.index.get(key) {
            Some(Container::Bool { offset, value: old }) => {
                let (offset, old) = (*offset, *old);
                if old != value {
                    if let Some(Container::Bool { value: stored, .. }) = self.index.get_mut(key) {
                        *stored = value;
                    }
                    self.update_bool_value(u8::from(value), offset);
                }
            }
            _ => {
                self.wrap_header(inner, key, DataType::Bool.as_u8(), 1)?;
                let offset = self.buffer.position;
                self.buffer.put_u8(u8::from(value));
                self.update_change();
                self.index
                    .insert(key.to_owned(), Container::Bool { offset, value });
            }
        }
        Ok(())
    }

    fn put_int(&mut self, inner: &StoreInner, key: &str, value: i32) -> CoreResult<()> {
        self.resolve_type_conflict(inner, key, DataType::Int);
        match self.index.get(key) {
            Some(Container::Int { offset, value: old }) => {
                let (offset, old) = (*offset, *old);
                if old != value {
                    let sum = u64::from((old ^ value) as u32);
                    if let Some(Container::Int { value: stored, .. }) = self.index.get_mut(key) {
                        *stored = value;
                    }
                    self.update_i32_value(value, sum, offset);
                }
            }
            _ => {
                self.wrap_header(inner, key, DataType::Int.as_u8(), 4)?;
                let offset = self.buffer.position;
                self.buffer.put_i32(value);
                self.update_change();
                self.index
                    .insert(key.to_owned(), Container::Int { offset, value });
            }
        }
        Ok(())
    }

    fn put_long(&mut self, inner: &StoreInner, key: &str, value: i64) -> CoreResult<()> {
        self.resolve_type_conflict(inner, key, DataType::Long);
        match self.index.get(key) {
            Some(Container::Long { offset, value: old }) => {
                let (offset, old) = (*offset, *old);
                if old != value {
                    let sum = (old ^ value) as u64;
                    if let Some(Container::Long { value: stored, .. }) = self.index.get_mut(key) {
                        *stored = value;
                    }
                    self.update_i64_value(value, sum, offset);
                }
            }
            _ => {
                self.wrap_header(inner, key, DataType::Long.as_u8(), 8)?;
                let offset = self.buffer.position;
                self.buffer.put_i64(value);
                self.update_change();
                self.index
                    .insert(key.to_owned(), Container::Long { offset, value });
            }
        }
        Ok(())
    }

    fn put_float(&mut self, inner: &StoreInner, key: &str, value: f32) -> CoreResult<()> {
        self.resolve_type_conflict(inner, key, DataType::Float);
        match self.index.get(key) {
            Some(Container::Float { offset, value: old }) => {
                let (offset, old) = (*offset, *old);
                if old != value {
                    let sum = u64::from(old.to_bits() ^ value.to_bits());
                    if let Some(Container::Float { value: stored, .. }) = self.index.get_mut(key) {
                        *stored = value;
                    }
                    self.update_i32_value(value.to_bits() as i32, sum, offset);
                }
            }
            _ => {
                self.wrap_header(inner, key, DataType::Float.as_u8(), 4)?;
                let offset = self.buffer.position;
                self.buffer.put_f32(value);
                self.update_change();
                self.index
                    .insert(key.to_owned(), Container::Float { offset, value });
            }
        }
        Ok(())
    }

    fn put_double(&mut self, inner: &StoreInner, key: &str, value: f64) -> CoreResult<()> {
        self.resolve_type_conflict(inner, key, DataType::Double);
        match self.index.get(key) {
            Some(Container::Double { offset, value: old }) => {
                let (offset, old) = (*offset, *old);
                if old != value {
                    let sum = old.to_bits() ^ value.to_bits();
                    if let Some(Container::Double { value: stored, .. }) = self.index.get_mut(key) {
                        *stored = value;
                    }
                    self.update_i64_value(value.to_bits() as i64, sum, offset);
                }
            }
            _ => {
                self.wrap_header(inner, key, DataType::Double.as_u8(), 8)?;
                let offset = self.buffer.position;
                self.buffer.put_f64(value);
                self.update_change();
                self.index
                    .insert(key.to_owned(), Container::Double { offset, value });
            }
        }
        Ok(())
    }

    // ----- variable-size puts -----

    /// Fast path for strings under the internal limit.
    fn fast_put_string(&mut self, inner: &StoreInner, key: &str, value: &str) -> CoreResult<()> {
        let string_len = value.len();
        if !matches!(self.index.get(key), Some(Container::Str(_))) {
            // type:1 + keyLen:1 + key + valueLen:2
            let pre_size = 4 + key.len();
            self.update_size = pre_size + string_len;
            self.prepare_put_bytes(inner)?;
            self.buffer.put_u8(DataType::String.as_u8());
            self.put_key(key);
            self.buffer.put_u16(string_len as u16);
            self.buffer.put_str(value);
            self.index.insert(
                key.to_owned(),
                Container::Str(VarContainer {
                    start: self.update_start,
                    offset: self.update_start + pre_size,
                    value_size: string_len,
                    value: VarValue::Text(value.to_owned()),
                }),
            );
            self.update_change();
            return Ok(());
        }

        let (c_offset, c_size, external) = match self.index.get(key) {
            Some(Container::Str(c)) => (c.offset, c.value_size, c.is_external()),
            _ => return Ok(()),
        };
        if c_size == string_len && !external {
            // Same length: overwrite the value body in place, XOR-diffing
            // the checksum over the old and new bytes.
            self.checksum ^= self.buffer.checksum(c_offset, c_size);
            self.buffer.position = c_offset;
            self.buffer.put_str(value);
            self.update_start = c_offset;
            self.update_size = string_len;
            if let Some(Container::Str(c)) = self.index.get_mut(key) {
                c.value = VarValue::Text(value.to_owned());
            }
            self.update_change();
        } else {
            let pre_size = match self.index.get(key) {
                Some(Container::Str(c)) => c.offset - c.start,
                _ => return Ok(()),
            };
            self.update_size = pre_size + string_len;
            self.prepare_put_bytes(inner)?;
            self.buffer.put_u8(DataType::String.as_u8());
            // Container offsets may have been repaired by a GC inside
            // prepare_put_bytes; read them fresh.
            let (c_start, c_offset, c_size, old_file) = match self.index.get(key) {
                Some(Container::Str(c)) => (
                    c.start,
                    c.offset,
                    c.value_size,
                    c.file_name().map(str::to_owned),
                ),
                _ => return Ok(()),
            };
            let key_bytes = pre_size - 3;
            let dst = self.buffer.position;
            self.buffer.copy_within(c_start + 1, dst, key_bytes);
            self.buffer.position += key_bytes;
            self.buffer.put_u16(string_len as u16);
            self.buffer.put_str(value);
            self.tombstone(c_start, c_offset + c_size);
            if let Some(Container::Str(c)) = self.index.get_mut(key) {
                c.start = self.update_start;
                c.offset = self.update_start + pre_size;
                c.value_size = string_len;
                c.value = VarValue::Text(value.to_owned());
            }
            self.update_change();
            self.check_gc(inner);
            if let Some(name) = old_file {
                self.external_cache.remove(&name);
                self.schedule_external_delete(inner, key, name);
            }
        }
        Ok(())
    }

    fn add_or_update(
        &mut self,
        inner: &StoreInner,
        key: &str,
        payload: PutPayload,
        bytes: &Arc<Vec<u8>>,
        data_type: DataType,
    ) -> CoreResult<()> {
        let existing = self
            .index
            .get(key)
            .and_then(Container::var)
            .map(|c| (c.offset, c.value_size, c.is_external()));
        match existing {
            None => self.add_object(inner, key, payload, bytes, data_type),
            Some((offset, value_size, false)) if value_size == bytes.len() => {
                self.update_bytes(offset, bytes);
                if let Some(c) = self.index.get_mut(key).and_then(Container::var_mut) {
                    c.value = payload.into_var_value();
                }
                Ok(())
            }
            Some(_) => self.update_object(inner, key, payload, bytes, data_type),
        }
    }

    fn add_object(
        &mut self,
        inner: &StoreInner,
        key: &str,
        payload: PutPayload,
        bytes: &Arc<Vec<u8>>,
        data_type: DataType,
    ) -> CoreResult<()> {
        let offset = self.save_array(inner, key, bytes, data_type)?;
        let (value_size, value) = match self.temp_external_name.take() {
            Some(name) => {
                self.big_value_cache
                    .insert(key.to_owned(), payload.into_cached());
                (NAME_SIZE, VarValue::FileName(name))
            }
            None => (bytes.len(), payload.into_var_value()),
        };
        let var = VarContainer {
            start: self.update_start,
            offset,
            value_size,
            value,
        };
        let container = match data_type {
            DataType::String => Container::Str(var),
            DataType::Array => Container::Bytes(var),
            _ => Container::Object(var),
        };
        self.index.insert(key.to_owned(), container);
        self.update_change();
        Ok(())
    }

    fn update_object(
        &mut self,
        inner: &StoreInner,
        key: &str,
        payload: PutPayload,
        bytes: &Arc<Vec<u8>>,
        data_type: DataType,
    ) -> CoreResult<()> {
        let offset = self.save_array(inner, key, bytes, data_type)?;
        // Read the container after save_array: a GC inside it repairs
        // offsets.
        let (c_start, c_offset, c_size, old_file) = match self.index.get(key).and_then(Container::var)
        {
            Some(c) => (c.start, c.offset, c.value_size, c.file_name().map(str::to_owned)),
            None => return Ok(()),
        };
        self.tombstone(c_start, c_offset + c_size);
        let (value_size, value) = match self.temp_external_name.take() {
            Some(name) => {
                self.big_value_cache
                    .insert(key.to_owned(), payload.into_cached());
                (NAME_SIZE, VarValue::FileName(name))
            }
            None => (bytes.len(), payload.into_var_value()),
        };
        if let Some(c) = self.index.get_mut(key).and_then(Container::var_mut) {
            c.start = self.update_start;
            c.offset = offset;
            c.value_size = value_size;
            c.value = value;
        }
        self.update_change();
        self.check_gc(inner);
        if let Some(name) = old_file {
            self.external_cache.remove(&name);
            self.schedule_external_delete(inner, key, name);
        }
        Ok(())
    }

    /// Writes the record for `bytes`, spilling to a sidecar file at the
    /// internal limit. Returns the offset of the value body.
    fn save_array(
        &mut self,
        inner: &StoreInner,
        key: &str,
        bytes: &Arc<Vec<u8>>,
        data_type: DataType,
    ) -> CoreResult<usize> {
        self.temp_external_name = None;
        if bytes.len() < inner.internal_limit {
            self.wrap_array(inner, key, bytes, data_type.as_u8())
        } else {
            let file_name = random_name(NAME_SIZE);
            inner.info(&format!(
                "saving large value, key: {key}, size: {}, file: {file_name}",
                bytes.len()
            ));
            self.external_cache
                .insert(file_name.clone(), Arc::clone(bytes));
            let dir = inner.sidecar_dir.clone();
            let task_name = file_name.clone();
            let payload = Arc::clone(bytes);
            let (logger, store_name) = inner.logger_handle();
            inner.external_executor.execute(key, move || {
                if let Err(e) = save_sidecar(&dir, &task_name, &payload) {
                    logger.error(
                        &store_name,
                        &format!("sidecar write failed for {task_name}: {e}"),
                    );
                }
            });
            self.temp_external_name = Some(file_name.clone());
            self.wrap_array(
                inner,
                key,
                file_name.as_bytes(),
                data_type.as_u8() | EXTERNAL_MASK,
            )
        }
    }

    fn wrap_array(
        &mut self,
        inner: &StoreInner,
        key: &str,
        value: &[u8],
        type_byte: u8,
    ) -> CoreResult<usize> {
        self.wrap_header(inner, key, type_byte, 2 + value.len())?;
        self.buffer.put_u16(value.len() as u16);
        let offset = self.buffer.position;
        self.buffer.put_bytes(value);
        Ok(offset)
    }

    fn wrap_header(
        &mut self,
        inner: &StoreInner,
        key: &str,
        type_byte: u8,
        value_size: usize,
    ) -> CoreResult<()> {
        self.update_size = 2 + key.len() + value_size;
        self.prepare_put_bytes(inner)?;
        self.buffer.put_u8(type_byte);
        self.put_key(key);
        Ok(())
    }

    fn put_key(&mut self, key: &str) {
        self.buffer.put_u8(key.len() as u8);
        self.buffer.put_str(key);
    }

    fn prepare_put_bytes(&mut self, inner: &StoreInner) -> CoreResult<()> {
        self.ensure_size(inner, self.update_size)?;
        self.update_start = self.data_end;
        self.data_end += self.update_size;
        self.buffer.position = self.update_start;
        self.size_changed = true;
        Ok(())
    }

    fn ensure_size(&mut self, inner: &StoreInner, allocate: usize) -> CoreResult<()> {
        let capacity = self.buffer.capacity();
        let expected = self.data_end + allocate;
        if expected < capacity {
            return Ok(());
        }
        if self.invalid_bytes > allocate && self.invalid_bytes > self.bytes_threshold() {
            self.gc(inner, allocate);
            return Ok(());
        }
        let new_capacity = get_new_capacity(capacity, expected)?;
        self.buffer.resize(new_capacity);
        let mut remap_error = None;
        if self.mode == WritingMode::NonBlocking {
            if let Some(m) = self.mirror.as_mut() {
                if let Err(e) = m.a.remap(new_capacity).and_then(|_| m.b.remap(new_capacity)) {
                    remap_error = Some(e);
                }
            }
        }
        if let Some(e) = remap_error {
            inner.error(&format!("remap failed during growth: {e}"));
            self.to_blocking_mode();
        }
        Ok(())
    }

    // ----- write protocol -----

    /// Folds the just-written record range into the checksum and pushes
    /// the change through the mirror protocol (or the in-memory header
    /// in blocking modes).
    pub(crate) fn update_change(&mut self) {
        self.checksum ^= self.buffer.checksum(self.update_start, self.update_size);
        let data_size = (self.data_end - DATA_START) as i32;
        if self.mode == WritingMode::NonBlocking {
            if let Some(m) = self.mirror.as_mut() {
                let buf = self.buffer.as_slice();
                // A is patched first under the in-progress marker; a
                // crash mid-patch leaves A marked torn and B whole.
                m.a.write_i32(0, -1);
                sync_side(
                    &mut m.a,
                    buf,
                    self.checksum,
                    data_size,
                    false,
                    self.remove_start,
                    self.update_start,
                    self.update_size,
                );
                m.a.write_i32(0, data_size);
                // B gets its size first, so B's declared region always
                // covers the bytes written after it.
                sync_side(
                    &mut m.b,
                    buf,
                    self.checksum,
                    data_size,
                    self.size_changed,
                    self.remove_start,
                    self.update_start,
                    self.update_size,
                );
            }
        } else {
            if self.size_changed {
                self.buffer.write_i32_at(0, data_size);
            }
            self.buffer.write_u64_at(4, self.checksum);
        }
        self.size_changed = false;
        self.remove_start = 0;
        self.update_size = 0;
    }

    fn update_bool_value(&mut self, value: u8, offset: usize) {
        // Old and new differ by exactly one bit-0 flip, so the delta is 1.
        self.checksum ^= shift_checksum(1, offset);
        if self.mode == WritingMode::NonBlocking {
            if let Some(m) = self.mirror.as_mut() {
                m.a.write_u64(4, self.checksum);
                m.a.write_u8(offset, value);
                m.b.write_u64(4, self.checksum);
                m.b.write_u8(offset, value);
            }
        } else {
            self.buffer.write_u64_at(4, self.checksum);
        }
        self.buffer.write_u8_at(offset, value);
    }

    fn update_i32_value(&mut self, value: i32, sum: u64, offset: usize) {
        self.checksum ^= shift_checksum(sum, offset);
        if self.mode == WritingMode::NonBlocking {
            if let Some(m) = self.mirror.as_mut() {
                m.a.write_u64(4, self.checksum);
                m.a.write_i32(offset, value);
                m.b.write_u64(4, self.checksum);
                m.b.write_i32(offset, value);
            }
        } else {
            self.buffer.write_u64_at(4, self.checksum);
        }
        self.buffer.write_i32_at(offset, value);
    }

    fn update_i64_value(&mut self, value: i64, sum: u64, offset: usize) {
        self.checksum ^= shift_checksum(sum, offset);
        if self.mode == WritingMode::NonBlocking {
            if let Some(m) = self.mirror.as_mut() {
                m.a.write_u64(4, self.checksum);
                m.a.write_i64(offset, value);
                m.b.write_u64(4, self.checksum);
                m.b.write_i64(offset, value);
            }
        } else {
            self.buffer.write_u64_at(4, self.checksum);
        }
        self.buffer.write_i64_at(offset, value);
    }

    /// Same-size in-place overwrite of a variable value body.
    fn update_bytes(&mut self, offset: usize, bytes: &[u8]) {
        let size = bytes.len();
        self.checksum ^= self.buffer.checksum(offset, size);
        self.buffer.position = offset;
        self.buffer.put_bytes(bytes);
        self.checksum ^= self.buffer.checksum(offset, size);
        let data_size = (self.data_end - DATA_START) as i32;
        if self.mode == WritingMode::NonBlocking {
            if let Some(m) = self.mirror.as_mut() {
                m.a.write_i32(0, -1);
                m.a.write_u64(4, self.checksum);
                m.a.write_bytes(offset, bytes);
                m.a.write_i32(0, data_size);
                m.b.write_u64(4, self.checksum);
                m.b.write_bytes(offset, bytes);
            }
        } else {
            self.buffer.write_u64_at(4, self.checksum);
        }
    }

    // ----- remove and tombstones -----

    /// Tombstones the record spanning `[start, end)`.
    ///
    /// Only ORs the delete bit into the type byte: the low bits and the
    /// external flag stay intact because parsers compute the skip length
    /// from them.
    pub(crate) fn tombstone(&mut self, start: usize, end: usize) {
        self.count_invalid(start, end);
        let old = self.buffer.as_slice()[start];
        let new = old | DELETE_MASK;
        self.checksum ^= u64::from(new ^ old) << ((start & 7) << 3);
        self.buffer.write_u8_at(start, new);
        self.remove_start = start;
    }

    fn do_remove(&mut self, inner: &StoreInner, key: &str) -> bool {
        let Some(container) = self.index.remove(key) else {
            return false;
        };
        self.big_value_cache.remove(key);
        let old_file = match &container {
            Container::Str(c) | Container::Bytes(c) | Container::Object(c) => {
                self.tombstone(c.start, c.offset + c.value_size);
                c.file_name().map(str::to_owned)
            }
            _ => {
                let offset = container.offset();
                let start = offset - (2 + key.len());
                self.tombstone(start, offset + container.data_type().fixed_size());
                None
            }
        };
        if self.mode == WritingMode::NonBlocking {
            if let Some(m) = self.mirror.as_mut() {
                let tombstone_byte = self.buffer.as_slice()[self.remove_start];
                m.a.write_u64(4, self.checksum);
                m.a.write_u8(self.remove_start, tombstone_byte);
                m.b.write_u64(4, self.checksum);
                m.b.write_u8(self.remove_start, tombstone_byte);
            }
        } else {
            self.buffer.write_u64_at(4, self.checksum);
        }
        self.remove_start = 0;
        if let Some(name) = old_file {
            self.external_cache.remove(&name);
            self.schedule_external_delete(inner, key, name);
        }
        self.check_gc(inner);
        true
    }

    fn schedule_external_delete(&mut self, inner: &StoreInner, key: &str, file_name: String) {
        if self.mode == WritingMode::NonBlocking {
            // Routed through the per-key executor so a delete can never
            // overtake a pending write for the same key.
            let dir = inner.sidecar_dir.clone();
            inner.external_executor.execute(key, move || {
                let _ = delete_sidecar(&dir, &file_name);
            });
        } else {
            self.deleted_files.push(file_name);
        }
    }

    fn clear_deleted_files(&mut self, inner: &StoreInner) {
        for file_name in self.deleted_files.drain(..) {
            let dir = inner.sidecar_dir.clone();
            inner.ctx.pool.execute(move || {
                let _ = delete_sidecar(&dir, &file_name);
            });
        }
    }

    // ----- reset and bookkeeping -----

    fn reset_data(&mut self, inner: &StoreInner) {
        if self.mode == WritingMode::NonBlocking {
            let mut reset_error = None;
            if let Some(m) = self.mirror.as_mut() {
                if let Err(e) = reset_mirror_side(&mut m.a).and_then(|()| reset_mirror_side(&mut m.b))
                {
                    reset_error = Some(e);
                }
            }
            if let Some(e) = reset_error {
                inner.error(&format!("failed to reset mirrors: {e}"));
                self.to_blocking_mode();
            }
        }
        self.clear_mem();
        let _ = delete_dir(&inner.sidecar_dir);
    }

    fn clear_mem(&mut self) {
        self.data_end = DATA_START;
        self.checksum = 0;
        self.clear_invalid();
        self.index.clear();
        self.big_value_cache.clear();
        self.external_cache.clear();
        if self.buffer.capacity() != PAGE_SIZE {
            self.buffer = Buffer::with_capacity(PAGE_SIZE);
        } else {
            self.buffer.write_i32_at(0, 0);
            self.buffer.write_u64_at(4, 0);
        }
    }

    fn delete_c_files(&mut self, inner: &StoreInner) {
        let _ = delete_file(&inner.file_path(C_SUFFIX));
        let _ = delete_file(&inner.file_path(TEMP_SUFFIX));
    }

    pub(crate) fn to_blocking_mode(&mut self) {
        self.mode = WritingMode::AsyncBlocking;
        self.mirror = None;
        let data_size = (self.data_end - DATA_START) as i32;
        self.buffer.write_i32_at(0, data_size);
        self.buffer.write_u64_at(4, self.checksum);
    }

    pub(crate) fn count_invalid(&mut self, start: usize, end: usize) {
        self.invalid_bytes += end - start;
        self.invalids.push(InvalidSegment { start, end });
    }

    pub(crate) fn clear_invalid(&mut self) {
        self.invalid_bytes = 0;
        self.invalids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    fn open(ctx: &Context, dir: &Path) -> Store {
        Store::builder(ctx, dir, "unit").build().unwrap()
    }

    #[test]
    fn invalid_segments_stay_disjoint_and_accounted() {
        let dir = tempdir().unwrap();
        let ctx = Context::new();
        let store = open(&ctx, dir.path());
        let mut rng = StdRng::seed_from_u64(7);

        for step in 0..400 {
            let key = format!("k{}", rng.gen_range(0..24));
            match step % 4 {
                0 => store.put_int(&key, rng.gen()).unwrap(),
                1 => store
                    .put_string(&key, &"v".repeat(rng.gen_range(1..40)))
                    .unwrap(),
                2 => store.put_long(&key, rng.gen()).unwrap(),
                _ => store.remove(&key),
            }

            let state = store.inner.state.lock();
            let total: usize = state.invalids.iter().map(|s| s.end - s.start).sum();
            assert_eq!(total, state.invalid_bytes);
            let mut sorted = state.invalids.clone();
            sorted.sort_by_key(|s| s.start);
            for pair in sorted.windows(2) {
                assert!(pair[0].end <= pair[1].start, "segments overlap");
                assert!(pair[0].start < pair[0].end, "empty segment");
            }
        }
    }

    #[test]
    fn checksum_header_tracks_buffer_after_every_operation() {
        let dir = tempdir().unwrap();
        let ctx = Context::new();
        let store = open(&ctx, dir.path());
        let mut rng = StdRng::seed_from_u64(11);

        for step in 0..300 {
            let key = format!("k{}", rng.gen_range(0..16));
            match step % 5 {
                0 => store.put_bool(&key, rng.gen()).unwrap(),
                1 => store.put_int(&key, rng.gen()).unwrap(),
                2 => store.put_double(&key, rng.gen()).unwrap(),
                3 => store
                    .put_string(&key, &"x".repeat(rng.gen_range(0..64)))
                    .unwrap(),
                _ => store.remove(&key),
            }

            let state = store.inner.state.lock();
            let expected = state
                .buffer
                .checksum(DATA_START, state.data_end - DATA_START);
            assert_eq!(state.checksum, expected, "checksum drifted at step {step}");
        }
    }

    #[test]
    fn type_conflict_tombstones_old_record() {
        let dir = tempdir().unwrap();
        let ctx = Context::new();
        let store = open(&ctx, dir.path());

        store.put_int("k", 5).unwrap();
        let before = store.stats();
        store.put_string("k", "text").unwrap();

        assert_eq!(store.get_int("k"), None);
        assert_eq!(store.get_string("k").as_deref(), Some("text"));
        // The int record (type + keyLen + key + value) became garbage.
        let after = store.stats();
        assert_eq!(after.invalid_bytes, before.invalid_bytes + 2 + 1 + 4);
    }

    #[test]
    fn same_size_primitive_update_keeps_data_end() {
        let dir = tempdir().unwrap();
        let ctx = Context::new();
        let store = open(&ctx, dir.path());

        store.put_long("counter", 1).unwrap();
        let before = store.stats();
        store.put_long("counter", 2).unwrap();
        store.put_long("counter", -9).unwrap();
        let after = store.stats();

        assert_eq!(before.data_end, after.data_end);
        assert_eq!(after.invalid_bytes, 0);
        assert_eq!(store.get_long("counter"), Some(-9));
    }

    #[test]
    fn equal_value_put_is_a_no_op() {
        let dir = tempdir().unwrap();
        let ctx = Context::new();
        let store = open(&ctx, dir.path());

        store.put_int("k", 42).unwrap();
        let (end, sum) = {
            let state = store.inner.state.lock();
            (state.data_end, state.checksum)
        };
        store.put_int("k", 42).unwrap();
        let state = store.inner.state.lock();
        assert_eq!(state.data_end, end);
        assert_eq!(state.checksum, sum);
    }
}
