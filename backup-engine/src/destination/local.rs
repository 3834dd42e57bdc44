//! Filesystem-backed destination.

use super::{ChunkedDownload, ChunkedUpload, Destination, DiskInfo, RemoteEntry, RemoteKind};
use crate::archive::safe_join;
use crate::fs::metadata::{EntryMetadata, FileKind};
use crate::fs::state::remove_if_exists;
use crate::utils::errors::{EngineError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Suffix of files still being uploaded.
const PART_SUFFIX: &str = ".part";

/// Destination rooted at a local directory; remote `/` is `root`.
pub struct LocalDestination {
    root: PathBuf,
    connected: bool,
}

impl LocalDestination {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            connected: false,
        }
    }

    fn resolve(&self, remote: &str) -> Result<PathBuf> {
        if remote.trim_matches('/').is_empty() {
            return Ok(self.root.clone());
        }
        safe_join(&self.root, remote)
            .ok_or_else(|| EngineError::Destination(format!("invalid remote path {:?}", remote)))
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(EngineError::Destination("not connected".to_string()))
        }
    }
}

impl Destination for LocalDestination {
    fn connect(&mut self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        self.connected = true;
        debug!("Connected to local destination {}", self.root.display());
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn dir_exists(&self, path: &str) -> Result<bool> {
        self.ensure_connected()?;
        Ok(self.resolve(path)?.is_dir())
    }

    fn file_exists(&self, path: &str) -> Result<bool> {
        self.ensure_connected()?;
        Ok(self.resolve(path)?.is_file())
    }

    fn create_dir(&mut self, path: &str, recursive: bool) -> Result<()> {
        self.ensure_connected()?;
        let dir = self.resolve(path)?;
        if recursive {
            fs::create_dir_all(&dir)?;
        } else if !dir.is_dir() {
            fs::create_dir(&dir)?;
        }
        Ok(())
    }

    fn remove_dir(&mut self, path: &str, recursive: bool) -> Result<()> {
        self.ensure_connected()?;
        let dir = self.resolve(path)?;
        if dir == self.root {
            return Err(EngineError::Destination("refusing to remove the root".to_string()));
        }
        let result = if recursive {
            fs::remove_dir_all(&dir)
        } else {
            fs::remove_dir(&dir)
        };
        match result {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn remove_file(&mut self, path: &str) -> Result<()> {
        self.ensure_connected()?;
        Ok(remove_if_exists(&self.resolve(path)?)?)
    }

    fn copy_file_to_local(&mut self, remote: &str, local: &Path) -> Result<()> {
        self.ensure_connected()?;
        let source = self.resolve(remote)?;
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&source, local)?;
        Ok(())
    }

    fn copy_file_to_local_chunked<'a>(&'a mut self, remote: &str, local: &Path) -> Result<Box<dyn ChunkedDownload + 'a>> {
        self.ensure_connected()?;
        let source = File::open(self.resolve(remote)?)?;
        let size = source.metadata()?.len();
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        let target = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(local)?;
        Ok(Box::new(LocalDownload { source, target, size }))
    }

    fn copy_file_to_remote(&mut self, local: &Path, remote: &str) -> Result<()> {
        self.ensure_connected()?;
        let target = self.resolve(remote)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let part = part_path(&target);
        fs::copy(local, &part)?;
        fs::rename(&part, &target)?;
        Ok(())
    }

    fn copy_file_to_remote_chunked<'a>(&'a mut self, local: &Path, remote: &str) -> Result<Box<dyn ChunkedUpload + 'a>> {
        self.ensure_connected()?;
        let target = self.resolve(remote)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let part = part_path(&target);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&part)?;
        // Local size bounds what can legitimately be there already.
        let local_size = fs::metadata(local)?.len();
        if file.metadata()?.len() > local_size {
            file.set_len(0)?;
        }
        Ok(Box::new(LocalUpload { part, target, file }))
    }

    fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        self.ensure_connected()?;
        let dir = self.resolve(path)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(PART_SUFFIX) {
                continue;
            }
            let meta = match EntryMetadata::from_path(&entry.path()) {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            entries.push(RemoteEntry {
                path: super::join_remote(path, &name),
                name,
                size: meta.size,
                modify_time: meta.mtime,
                kind: remote_kind(meta.kind),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn disk_info(&self) -> Result<Option<DiskInfo>> {
        self.ensure_connected()?;
        let stat = nix::sys::statvfs::statvfs(&self.root)?;
        let fragment = stat.fragment_size() as u64;
        let total_space = stat.blocks() as u64 * fragment;
        let free_space = stat.blocks_available() as u64 * fragment;
        let used_space = total_space.saturating_sub(stat.blocks_free() as u64 * fragment);
        Ok(Some(DiskInfo {
            used_space,
            total_space,
            free_space,
        }))
    }
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

fn remote_kind(kind: FileKind) -> RemoteKind {
    match kind {
        FileKind::File => RemoteKind::File,
        FileKind::Dir => RemoteKind::Dir,
        FileKind::Symlink => RemoteKind::Link,
        FileKind::BlockDevice => RemoteKind::Block,
        FileKind::Fifo => RemoteKind::Fifo,
        FileKind::CharDevice => RemoteKind::Char,
        FileKind::Socket => RemoteKind::Socket,
        FileKind::Unknown => RemoteKind::Unknown,
    }
}

struct LocalDownload {
    source: File,
    target: File,
    size: u64,
}

impl ChunkedDownload for LocalDownload {
    fn size(&self) -> u64 {
        self.size
    }

    fn download(&mut self, start: u64, end: u64) -> Result<u64> {
        let end = end.min(self.size);
        if start >= end {
            return Ok(0);
        }
        let mut buffer = vec![0u8; (end - start) as usize];
        self.source.seek(SeekFrom::Start(start))?;
        self.source.read_exact(&mut buffer)?;
        self.target.write_all_at(&buffer, start)?;
        self.target.sync_data()?;
        Ok(buffer.len() as u64)
    }
}

struct LocalUpload {
    part: PathBuf,
    target: PathBuf,
    file: File,
}

impl ChunkedUpload for LocalUpload {
    fn offset(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn upload(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(chunk)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.file.sync_all()?;
        fs::rename(&self.part, &self.target)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_requires_connect() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let destination = LocalDestination::new(temp_dir.path());
        assert!(destination.dir_exists("/").is_err());
        Ok(())
    }

    #[test]
    fn test_chunked_upload_resumes() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let local = temp_dir.path().join("local.bin");
        fs::write(&local, b"abcdefghij")?;

        let mut destination = LocalDestination::new(&temp_dir.path().join("remote"));
        destination.connect()?;
        {
            let mut upload = destination.copy_file_to_remote_chunked(&local, "/b/x.bin")?;
            upload.upload(b"abcd")?;
        }
        assert!(!destination.file_exists("/b/x.bin")?);
        {
            let mut upload = destination.copy_file_to_remote_chunked(&local, "/b/x.bin")?;
            assert_eq!(upload.offset()?, 4);
            upload.upload(b"efghij")?;
            upload.finalize()?;
        }
        assert_eq!(fs::read(temp_dir.path().join("remote/b/x.bin"))?, b"abcdefghij");

        let listing = destination.list_dir("/b")?;
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].path, "/b/x.bin");
        assert_eq!(listing[0].size, 10);
        Ok(())
    }

    #[test]
    fn test_chunked_download() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let remote_root = temp_dir.path().join("remote");
        fs::create_dir_all(&remote_root)?;
        fs::write(remote_root.join("f"), b"0123456789")?;

        let mut destination = LocalDestination::new(&remote_root);
        destination.connect()?;
        let local = temp_dir.path().join("copy");
        let mut download = destination.copy_file_to_local_chunked("/f", &local)?;
        assert_eq!(download.size(), 10);
        assert_eq!(download.download(4, 8)?, 4);
        assert_eq!(download.download(0, 4)?, 4);
        assert_eq!(download.download(8, 100)?, 2);
        drop(download);
        assert_eq!(fs::read(&local)?, b"0123456789");
        Ok(())
    }

    #[test]
    fn test_disk_info() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut destination = LocalDestination::new(temp_dir.path());
        destination.connect()?;
        let info = destination.disk_info()?.ok_or_else(|| EngineError::Destination("no info".into()))?;
        assert!(info.total_space >= info.free_space);
        Ok(())
    }
}
