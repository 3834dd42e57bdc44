//! Storage backend contract.
//!
//! Tasks move archives and manifests through a [`Destination`]. Remote paths
//! are `/`-separated and interpreted by the implementation.

pub mod local;

pub use local::LocalDestination;

use crate::utils::errors::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteKind {
    File,
    Dir,
    Link,
    Block,
    Fifo,
    Char,
    Socket,
    Unknown,
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    /// Full remote path
    pub path: String,
    pub size: u64,
    pub modify_time: u64,
    pub kind: RemoteKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub used_space: u64,
    pub total_space: u64,
    pub free_space: u64,
}

/// Ranged download of one remote file into a local file.
pub trait ChunkedDownload {
    /// Remote file size
    fn size(&self) -> u64;

    /// Copy remote bytes `[start, end)` to the same offsets of the local file.
    /// Returns the number of bytes copied.
    fn download(&mut self, start: u64, end: u64) -> Result<u64>;
}

/// Resumable upload of one local file.
pub trait ChunkedUpload {
    /// Bytes the remote side already holds; uploading continues from here
    fn offset(&self) -> Result<u64>;

    fn upload(&mut self, chunk: &[u8]) -> Result<()>;

    /// Make the uploaded file visible under its final name.
    fn finalize(&mut self) -> Result<()>;
}

pub trait Destination {
    fn connect(&mut self) -> Result<()>;
    fn disconnect(&mut self) -> Result<()>;

    fn dir_exists(&self, path: &str) -> Result<bool>;
    fn file_exists(&self, path: &str) -> Result<bool>;

    fn create_dir(&mut self, path: &str, recursive: bool) -> Result<()>;
    fn remove_dir(&mut self, path: &str, recursive: bool) -> Result<()>;
    fn remove_file(&mut self, path: &str) -> Result<()>;

    fn copy_file_to_local(&mut self, remote: &str, local: &Path) -> Result<()>;
    fn copy_file_to_local_chunked<'a>(&'a mut self, remote: &str, local: &Path) -> Result<Box<dyn ChunkedDownload + 'a>>;

    fn copy_file_to_remote(&mut self, local: &Path, remote: &str) -> Result<()>;
    fn copy_file_to_remote_chunked<'a>(&'a mut self, local: &Path, remote: &str) -> Result<Box<dyn ChunkedUpload + 'a>>;

    /// Entries of `path`, sorted by name.
    fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>>;

    /// Space figures, `None` when the backend cannot tell.
    fn disk_info(&self) -> Result<Option<DiskInfo>>;
}

/// Join remote path segments with single slashes.
pub fn join_remote(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if base.is_empty() {
        format!("/{}", name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// Every file below `path`, depth first, with paths relative to `path`.
pub fn list_recursive(destination: &dyn Destination, path: &str) -> Result<Vec<(String, RemoteEntry)>> {
    let mut out = Vec::new();
    collect(destination, path, "", &mut out)?;
    Ok(out)
}

fn collect(destination: &dyn Destination, path: &str, prefix: &str, out: &mut Vec<(String, RemoteEntry)>) -> Result<()> {
    for entry in destination.list_dir(path)? {
        let relative = if prefix.is_empty() {
            entry.name.clone()
        } else {
            format!("{}/{}", prefix, entry.name)
        };
        let is_dir = entry.kind == RemoteKind::Dir;
        let child = entry.path.clone();
        out.push((relative.clone(), entry));
        if is_dir {
            collect(destination, &child, &relative, out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("/backups/", "/a.tar"), "/backups/a.tar");
        assert_eq!(join_remote("", "a.tar"), "/a.tar");
        assert_eq!(join_remote("/", "a.tar"), "/a.tar");
    }
}
