//! Blocking-file helpers: whole-file reads, atomic commits, and sidecar
//! payload files.

use crate::error::StorageResult;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::Path;

/// Reads a whole file into memory.
pub fn read_file(path: &Path) -> StorageResult<Vec<u8>> {
    Ok(fs::read(path)?)
}

/// Writes `bytes` to `tmp_path`, syncs, then renames over `final_path`.
///
/// The rename is the commit point: a crash before it leaves the previous
/// committed image untouched, a crash after it leaves the new one.
pub fn write_atomic(tmp_path: &Path, final_path: &Path, bytes: &[u8]) -> StorageResult<()> {
    if let Some(parent) = tmp_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(tmp_path, final_path)?;
    Ok(())
}

/// Writes a sidecar payload file, creating the sidecar directory if
/// needed.
pub fn save_sidecar(dir: &Path, name: &str, bytes: &[u8]) -> StorageResult<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(name), bytes)?;
    Ok(())
}

/// Reads a sidecar payload file.
pub fn load_sidecar(dir: &Path, name: &str) -> StorageResult<Vec<u8>> {
    Ok(fs::read(dir.join(name))?)
}

/// Deletes a sidecar payload file; a missing file is not an error.
pub fn delete_sidecar(dir: &Path, name: &str) -> StorageResult<()> {
    delete_file(&dir.join(name))
}

/// Deletes a file; a missing file is not an error.
pub fn delete_file(path: &Path) -> StorageResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Deletes a directory recursively; a missing directory is not an error.
pub fn delete_dir(path: &Path) -> StorageResult<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Generates a random alphanumeric ASCII file name of length `len`.
#[must_use]
pub fn random_name(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_replaces_target() {
        let dir = tempdir().unwrap();
        let tmp = dir.path().join("store.tmp");
        let dst = dir.path().join("store.kvc");

        write_atomic(&tmp, &dst, b"first").unwrap();
        assert_eq!(read_file(&dst).unwrap(), b"first");
        assert!(!tmp.exists());

        write_atomic(&tmp, &dst, b"second").unwrap();
        assert_eq!(read_file(&dst).unwrap(), b"second");
    }

    #[test]
    fn sidecar_roundtrip_and_delete() {
        let dir = tempdir().unwrap();
        let sidecar_dir = dir.path().join("store");

        save_sidecar(&sidecar_dir, "abc123", b"payload").unwrap();
        assert_eq!(load_sidecar(&sidecar_dir, "abc123").unwrap(), b"payload");

        delete_sidecar(&sidecar_dir, "abc123").unwrap();
        assert!(load_sidecar(&sidecar_dir, "abc123").is_err());
        // Deleting again is fine.
        delete_sidecar(&sidecar_dir, "abc123").unwrap();
    }

    #[test]
    fn delete_missing_is_ok() {
        let dir = tempdir().unwrap();
        delete_file(&dir.path().join("nope")).unwrap();
        delete_dir(&dir.path().join("nope")).unwrap();
    }

    #[test]
    fn random_names_are_ascii_and_distinct() {
        let a = random_name(32);
        let b = random_name(32);
        assert_eq!(a.len(), 32);
        assert!(a.bytes().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
