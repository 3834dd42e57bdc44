//! Crash-safe persistence for small state records.
//!
//! Checkpoints and job records are JSON documents written to a temporary file,
//! synced, and renamed over the previous version while holding an exclusive
//! advisory lock on a sibling `.lock` file. A crash mid-write leaves the prior
//! record intact.

use crate::utils::errors::Result;
use nix::fcntl::{Flock, FlockArg};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Suffix of archive append checkpoints.
pub const APPEND_SUFFIX: &str = ".append.ckpt";
/// Suffix of archive extract checkpoints.
pub const EXTRACT_SUFFIX: &str = ".extract.ckpt";
/// Suffix of gzip codec checkpoints.
pub const GZIP_SUFFIX: &str = ".gzip.ckpt";
/// Suffix of resumable step records.
pub const STEP_SUFFIX: &str = ".step";

/// Deterministic checkpoint location for `key` inside `dir`.
pub fn checkpoint_path(dir: &Path, key: &str, suffix: &str) -> PathBuf {
    let digest = format!("{:x}", Sha256::digest(key.as_bytes()));
    dir.join(format!("{}{}", &digest[..32], suffix))
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Take an exclusive advisory lock guarding `path`.
fn lock(path: &Path) -> Result<Flock<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path(path))?;
    Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| errno.into())
}

/// Load a record, `None` when it has never been written (or was removed).
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&data)?))
}

/// Atomically replace the record at `path`.
pub fn store<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let _guard = lock(path)?;
    let tmp = temp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&serde_json::to_vec(value)?)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Remove a record together with its lock file. Missing files are fine.
pub fn remove(path: &Path) -> Result<()> {
    {
        let _guard = lock(path)?;
        remove_if_exists(path)?;
        remove_if_exists(&temp_path(path))?;
    }
    remove_if_exists(&lock_path(path))?;
    Ok(())
}

pub(crate) fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        offset: u64,
        name: String,
    }

    #[test]
    fn test_checkpoint_path_is_deterministic() {
        let dir = Path::new("/tmp/work");
        let a = checkpoint_path(dir, "/data/file.bin", APPEND_SUFFIX);
        let b = checkpoint_path(dir, "/data/file.bin", APPEND_SUFFIX);
        let c = checkpoint_path(dir, "/data/other.bin", APPEND_SUFFIX);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.to_string_lossy().ends_with(APPEND_SUFFIX));
    }

    #[test]
    fn test_store_load_remove() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("record.ckpt");

        assert!(load::<Record>(&path)?.is_none());

        store(&path, &Record { offset: 42, name: "a".into() })?;
        store(&path, &Record { offset: 43, name: "a".into() })?;
        let loaded: Record = load(&path)?.unwrap();
        assert_eq!(loaded.offset, 43);
        assert!(!temp_path(&path).exists());

        remove(&path)?;
        assert!(load::<Record>(&path)?.is_none());
        assert!(!lock_path(&path).exists());
        Ok(())
    }

    #[test]
    fn test_leftover_temp_file_does_not_shadow_record() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("record.ckpt");
        store(&path, &Record { offset: 7, name: "b".into() })?;

        // A torn write only ever reaches the temp file.
        fs::write(temp_path(&path), b"{\"offset\": 9")?;
        let loaded: Record = load(&path)?.unwrap();
        assert_eq!(loaded, Record { offset: 7, name: "b".into() });
        Ok(())
    }
}
