//! Memory-mapped mirror region.
//!
//! A [`MappedFile`] is one copy of a store's data region, mapped
//! read-write so the engine can patch bytes in place. The engine owns a
//! pair of these (files A and B) and keeps them byte-identical through
//! its write protocol; this module only knows about one file at a time.
//!
//! Remapping invalidates the previous mapping, so every operation that
//! changes the mapping takes `&mut self`; the borrow checker guarantees
//! no stale view can outlive a `remap`.

use crate::error::{StorageError, StorageResult};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// One memory-mapped copy of the data region.
#[derive(Debug)]
pub struct MappedFile {
    file: File,
    map: MmapMut,
    path: PathBuf,
    capacity: usize,
}

impl MappedFile {
    /// Opens (creating if missing) and maps the file at `path`.
    ///
    /// An existing file keeps its length when it is at least
    /// `min_capacity` bytes; shorter or empty files are extended to
    /// `min_capacity` before mapping.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::MapFailed`] if the mapping itself fails,
    /// or an I/O error if the file cannot be opened or sized.
    pub fn open(path: &Path, min_capacity: usize) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len() as usize;
        let capacity = len.max(min_capacity);
        if capacity != len {
            file.set_len(capacity as u64)?;
        }
        let map = Self::map(&file, path)?;
        Ok(Self {
            file,
            map,
            path: path.to_path_buf(),
            capacity,
        })
    }

    /// Opens the file at `path` and forces its length to exactly
    /// `capacity` bytes before mapping.
    ///
    /// Used when materializing a fresh pair of mirror files from a
    /// recovered in-memory image.
    pub fn open_sized(path: &Path, capacity: usize) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(capacity as u64)?;
        let map = Self::map(&file, path)?;
        Ok(Self {
            file,
            map,
            path: path.to_path_buf(),
            capacity,
        })
    }

    fn map(file: &File, path: &Path) -> StorageResult<MmapMut> {
        // SAFETY: mapping a file mutably is unsound if another process
        // concurrently modifies it. Safe here because:
        // 1. A store's files are owned by a single process; concurrent
        //    external access is documented as undefined behavior.
        // 2. The mapping's lifetime is tied to this struct, and remaps
        //    require exclusive access, so no view outlives its mapping.
        // 3. All access goes through offset-checked accessors below.
        unsafe {
            MmapMut::map_mut(file).map_err(|source| StorageError::MapFailed {
                path: path.display().to_string(),
                source,
            })
        }
    }

    /// Returns the mapped capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads a little-endian `i32` at `offset`.
    #[must_use]
    pub fn read_i32(&self, offset: usize) -> i32 {
        let b = &self.map[offset..offset + 4];
        i32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    /// Reads a little-endian `u64` at `offset`.
    #[must_use]
    pub fn read_u64(&self, offset: usize) -> u64 {
        let b = &self.map[offset..offset + 8];
        u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    }

    /// Copies the first `len` mapped bytes into `dst`.
    pub fn read_into(&self, dst: &mut [u8], len: usize) {
        dst[..len].copy_from_slice(&self.map[..len]);
    }

    /// Writes one byte at `offset`.
    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.map[offset] = value;
    }

    /// Writes a little-endian `i32` at `offset`.
    pub fn write_i32(&mut self, offset: usize, value: i32) {
        self.map[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Writes a little-endian `i64` at `offset`.
    pub fn write_i64(&mut self, offset: usize, value: i64) {
        self.map[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Writes a little-endian `u64` at `offset`.
    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.map[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Writes a byte range at `offset`.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.map[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Resizes the file to `new_capacity` bytes and remaps it.
    ///
    /// Works for both growth and truncation. Dirty pages are flushed
    /// before the file length changes.
    pub fn remap(&mut self, new_capacity: usize) -> StorageResult<()> {
        self.map.flush()?;
        self.file.set_len(new_capacity as u64)?;
        // SAFETY: same ownership argument as in `map`; additionally the
        // old mapping is replaced in this assignment and `&mut self`
        // guarantees no outstanding view of it exists.
        self.map = Self::map(&self.file, &self.path)?;
        self.capacity = new_capacity;
        Ok(())
    }

    /// Flushes dirty pages to the storage device.
    pub fn flush(&self) -> StorageResult<()> {
        self.map.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_extends_to_min_capacity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("region");
        let mapped = MappedFile::open(&path, 4096).unwrap();
        assert_eq!(mapped.capacity(), 4096);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
    }

    #[test]
    fn open_keeps_longer_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("region");
        std::fs::write(&path, vec![7u8; 8192]).unwrap();
        let mapped = MappedFile::open(&path, 4096).unwrap();
        assert_eq!(mapped.capacity(), 8192);
    }

    #[test]
    fn open_sized_forces_exact_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("region");
        std::fs::write(&path, vec![7u8; 8192]).unwrap();
        let mapped = MappedFile::open_sized(&path, 4096).unwrap();
        assert_eq!(mapped.capacity(), 4096);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
    }

    #[test]
    fn writes_round_trip_and_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("region");
        {
            let mut mapped = MappedFile::open(&path, 4096).unwrap();
            mapped.write_i32(0, -1);
            mapped.write_u64(4, 0xDEAD_BEEF_CAFE_F00D);
            mapped.write_bytes(12, b"record");
            mapped.write_u8(12, b'R');
            assert_eq!(mapped.read_i32(0), -1);
            assert_eq!(mapped.read_u64(4), 0xDEAD_BEEF_CAFE_F00D);
            mapped.flush().unwrap();
        }
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[12..18], b"Record");
    }

    #[test]
    fn remap_grows_and_shrinks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("region");
        let mut mapped = MappedFile::open(&path, 4096).unwrap();
        mapped.write_bytes(100, b"stay");

        mapped.remap(16384).unwrap();
        assert_eq!(mapped.capacity(), 16384);
        let mut out = vec![0u8; 104];
        mapped.read_into(&mut out, 104);
        assert_eq!(&out[100..104], b"stay");

        mapped.remap(4096).unwrap();
        assert_eq!(mapped.capacity(), 4096);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
    }
}
