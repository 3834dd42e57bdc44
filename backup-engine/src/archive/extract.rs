//! Archive extraction.
//!
//! Entries are restored below a destination directory in archive order.
//! Directory metadata is applied in a final pass, deepest first, so that
//! restoring children does not disturb a directory's mtime or trip over a
//! read-only mode. The chunked variant persists its position after every data
//! chunk and every entry.

use super::header::{EntryType, Header};
use super::reader::{ArchiveReader, Entry};
use super::{safe_join, sparse};
use crate::fs::metadata::{EntryMetadata, FileKind};
use crate::fs::state::{self, remove_if_exists, EXTRACT_SUFFIX};
use crate::utils::errors::{EngineError, Result};
use crate::Outcome;
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::ops::ControlFlow;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const COPY_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractStats {
    /// Entries restored
    pub entries: u64,
    /// Entries already present with matching size and mtime
    pub skipped: u64,
    /// Entries that could not be restored (unsafe names, device nodes
    /// without privileges, dangling hard links, paths blocked by existing
    /// entries)
    pub failed: u64,
    /// Logical bytes of regular files written
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingDir {
    path: PathBuf,
    metadata: EntryMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ExtractCheckpoint {
    /// Header offset of the entry to continue with
    entry_offset: u64,
    /// Stored bytes of that entry already on disk
    written: u64,
    stats: ExtractStats,
    dirs: Vec<PendingDir>,
}

pub struct Extractor {
    archive: PathBuf,
    dest: PathBuf,
    checkpoint_dir: Option<PathBuf>,
    last_stats: Option<ExtractStats>,
}

impl Extractor {
    pub fn new(archive: &Path, dest: &Path) -> Self {
        Self {
            archive: archive.to_path_buf(),
            dest: dest.to_path_buf(),
            checkpoint_dir: None,
            last_stats: None,
        }
    }

    /// Keep the extract checkpoint in `dir` instead of next to the archive.
    pub fn checkpoint_dir(mut self, dir: &Path) -> Self {
        self.checkpoint_dir = Some(dir.to_path_buf());
        self
    }

    /// Extract everything in one go.
    pub fn run(&mut self) -> Result<ExtractStats> {
        let mut never = |_: u64, _: u64| ControlFlow::Continue(());
        self.run_chunked(u64::MAX, &mut never)?;
        Ok(self.last_stats.clone().unwrap_or_default())
    }

    /// Resumable extraction. File data is written in `chunk_size` pieces;
    /// `on_chunk(position, archive_len)` is called after each piece and after
    /// each entry, and returning `Break` suspends with the position saved.
    pub fn run_chunked(
        &mut self,
        chunk_size: u64,
        on_chunk: &mut dyn FnMut(u64, u64) -> ControlFlow<()>,
    ) -> Result<Outcome> {
        let ckpt_path = self.checkpoint_path();
        let archive_len = fs::metadata(&self.archive)?.len();
        let chunk_size = chunk_size.max(1);
        fs::create_dir_all(&self.dest)?;

        let mut ckpt = match state::load::<ExtractCheckpoint>(&ckpt_path)? {
            Some(ckpt) => {
                info!(
                    "Resuming extraction of {} at offset {}",
                    self.archive.display(),
                    ckpt.entry_offset
                );
                ckpt
            }
            None => ExtractCheckpoint::default(),
        };

        let mut reader = ArchiveReader::open(&self.archive)?;
        reader.seek_to(ckpt.entry_offset)?;

        while let Some(entry) = reader.next_entry()? {
            let resume_from = if entry.header_offset == ckpt.entry_offset {
                ckpt.written
            } else {
                0
            };
            ckpt.entry_offset = entry.header_offset;
            ckpt.written = resume_from;

            let flow = self.extract_entry(&mut reader, &entry, &mut ckpt, &ckpt_path, chunk_size, archive_len, on_chunk)?;
            if flow.is_break() {
                return Ok(Outcome::Suspended);
            }

            reader.skip_entry(&entry)?;
            ckpt.entry_offset = entry.end_offset();
            ckpt.written = 0;
            state::store(&ckpt_path, &ckpt)?;
            if on_chunk(reader.position(), archive_len).is_break() {
                debug!("Suspending extraction at offset {}", ckpt.entry_offset);
                return Ok(Outcome::Suspended);
            }
        }

        finalize_dirs(&mut ckpt.dirs);
        state::remove(&ckpt_path)?;
        info!(
            "Extracted {} entries ({} bytes) from {}, {} skipped, {} failed",
            ckpt.stats.entries,
            ckpt.stats.bytes,
            self.archive.display(),
            ckpt.stats.skipped,
            ckpt.stats.failed
        );
        self.last_stats = Some(ckpt.stats);
        Ok(Outcome::Completed)
    }

    /// Statistics of the most recent completed run.
    pub fn stats(&self) -> Option<&ExtractStats> {
        self.last_stats.as_ref()
    }

    fn checkpoint_path(&self) -> PathBuf {
        let dir = self
            .checkpoint_dir
            .clone()
            .or_else(|| self.archive.parent().map(Path::to_path_buf))
            .unwrap_or_default();
        let key = format!("extract\0{}\0{}", self.archive.display(), self.dest.display());
        state::checkpoint_path(&dir, &key, EXTRACT_SUFFIX)
    }

    #[allow(clippy::too_many_arguments)]
    fn extract_entry(
        &self,
        reader: &mut ArchiveReader<File>,
        entry: &Entry,
        ckpt: &mut ExtractCheckpoint,
        ckpt_path: &Path,
        chunk_size: u64,
        archive_len: u64,
        on_chunk: &mut dyn FnMut(u64, u64) -> ControlFlow<()>,
    ) -> Result<ControlFlow<()>> {
        let header = &entry.header;
        let target = match safe_join(&self.dest, &header.path) {
            Some(path) => path,
            None => {
                warn!("Refusing to extract unsafe path {:?}", header.path);
                ckpt.stats.failed += 1;
                return Ok(ControlFlow::Continue(()));
            }
        };
        if let Some(parent) = target.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                return Ok(entry_failed(ckpt, &target, e));
            }
        }
        let metadata = entry_metadata(header);

        let result = match header.entry_type {
            EntryType::Regular | EntryType::GnuSparse => {
                return self.extract_file(reader, entry, &target, &metadata, ckpt, ckpt_path, chunk_size, archive_len, on_chunk);
            }
            EntryType::Directory => {
                if let Err(e) = fs::create_dir_all(&target) {
                    return Ok(entry_failed(ckpt, &target, e));
                }
                ckpt.dirs.push(PendingDir {
                    path: target,
                    metadata,
                });
                ckpt.stats.entries += 1;
                return Ok(ControlFlow::Continue(()));
            }
            EntryType::Symlink => replace_path(&target)
                .and_then(|()| std::os::unix::fs::symlink(&header.link_target, &target)),
            EntryType::HardLink => match safe_join(&self.dest, &header.link_target) {
                Some(source) => replace_path(&target).and_then(|()| fs::hard_link(&source, &target)),
                None => Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unsafe hard link target {:?}", header.link_target),
                )),
            },
            EntryType::CharDevice | EntryType::BlockDevice | EntryType::Fifo => {
                replace_path(&target).and_then(|()| make_node(&target, header))
            }
            other => {
                warn!("Skipping {} with unsupported type {:?}", header.path, other);
                ckpt.stats.failed += 1;
                return Ok(ControlFlow::Continue(()));
            }
        };

        let result = result.and_then(|()| {
            if header.entry_type == EntryType::HardLink {
                Ok(())
            } else {
                metadata.apply_to_path(&target)
            }
        });
        match result {
            Ok(()) => {
                ckpt.stats.entries += 1;
                Ok(ControlFlow::Continue(()))
            }
            Err(e) => Ok(entry_failed(ckpt, &target, e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn extract_file(
        &self,
        reader: &mut ArchiveReader<File>,
        entry: &Entry,
        target: &Path,
        metadata: &EntryMetadata,
        ckpt: &mut ExtractCheckpoint,
        ckpt_path: &Path,
        chunk_size: u64,
        archive_len: u64,
        on_chunk: &mut dyn FnMut(u64, u64) -> ControlFlow<()>,
    ) -> Result<ControlFlow<()>> {
        let header = &entry.header;
        let logical = header.logical_size();

        let opened = if ckpt.written > 0 && target.is_file() {
            OpenOptions::new().write(true).open(target)
        } else {
            ckpt.written = 0;
            if is_current(target, header) {
                debug!("{} already extracted", target.display());
                ckpt.stats.skipped += 1;
                return Ok(ControlFlow::Continue(()));
            }
            replace_path(target).and_then(|()| File::create(target))
        };
        let file = match opened {
            Ok(file) => file,
            Err(e) => return Ok(entry_failed(ckpt, target, e)),
        };

        reader.skip(ckpt.written)?;
        let mut buffer = vec![0u8; COPY_BUFFER];
        while ckpt.written < header.size {
            let end = ckpt.written.saturating_add(chunk_size).min(header.size);
            while ckpt.written < end {
                let (file_offset, available) = match &header.sparse {
                    Some(map) => sparse::locate(&map.regions, ckpt.written).ok_or_else(|| {
                        EngineError::InvalidHeader(format!("{}: data beyond sparse map", header.path))
                    })?,
                    None => (ckpt.written, end - ckpt.written),
                };
                let n = available.min(end - ckpt.written).min(COPY_BUFFER as u64) as usize;
                reader.read_exact(&mut buffer[..n])?;
                if let Err(e) = file.write_all_at(&buffer[..n], file_offset) {
                    return Ok(entry_failed(ckpt, target, e));
                }
                ckpt.written += n as u64;
            }

            if ckpt.written < header.size {
                if let Err(e) = file.sync_data() {
                    return Ok(entry_failed(ckpt, target, e));
                }
                state::store(ckpt_path, ckpt)?;
                if on_chunk(reader.position(), archive_len).is_break() {
                    debug!(
                        "Suspending extraction of {} at {}/{}",
                        header.path, ckpt.written, header.size
                    );
                    return Ok(ControlFlow::Break(()));
                }
            }
        }

        let finished = file.set_len(logical);
        drop(file);
        if let Err(e) = finished.and_then(|()| metadata.apply_to_path(target)) {
            return Ok(entry_failed(ckpt, target, e));
        }
        ckpt.stats.entries += 1;
        ckpt.stats.bytes += logical;
        Ok(ControlFlow::Continue(()))
    }
}

/// Count an entry that could not be restored. The caller skips whatever is
/// left of its data so the next header still lines up.
fn entry_failed(ckpt: &mut ExtractCheckpoint, target: &Path, e: io::Error) -> ControlFlow<()> {
    warn!("Could not restore {}: {}", target.display(), e);
    ckpt.stats.failed += 1;
    ControlFlow::Continue(())
}

/// Extract all of `archive` below `dest`.
pub fn extract(archive: &Path, dest: &Path) -> Result<ExtractStats> {
    Extractor::new(archive, dest).run()
}

fn entry_metadata(header: &Header) -> EntryMetadata {
    let kind = match header.entry_type {
        EntryType::Directory => FileKind::Dir,
        EntryType::Symlink => FileKind::Symlink,
        EntryType::CharDevice => FileKind::CharDevice,
        EntryType::BlockDevice => FileKind::BlockDevice,
        EntryType::Fifo => FileKind::Fifo,
        _ => FileKind::File,
    };
    EntryMetadata {
        kind,
        size: header.logical_size(),
        mtime: header.mtime,
        mode: header.mode & 0o7777,
        uid: header.uid,
        gid: header.gid,
        uname: header.uname.clone(),
        gname: header.gname.clone(),
        dev_major: header.dev_major,
        dev_minor: header.dev_minor,
    }
}

/// A regular file that already matches the entry's size and mtime.
fn is_current(target: &Path, header: &Header) -> bool {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_file() => {
            let existing = EntryMetadata::from_std(&meta);
            existing.size == header.logical_size() && existing.mtime == header.mtime
        }
        _ => false,
    }
}

/// Clear the way for a new non-directory entry. Existing directories are
/// left alone and reported as an error.
fn replace_path(target: &Path) -> io::Result<()> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} is a directory", target.display()),
        )),
        Ok(_) => remove_if_exists(target),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn make_node(target: &Path, header: &Header) -> io::Result<()> {
    let mode = Mode::from_bits_truncate((header.mode & 0o777) as nix::libc::mode_t);
    let result = match header.entry_type {
        EntryType::Fifo => nix::unistd::mkfifo(target, mode),
        EntryType::CharDevice => mknod(target, SFlag::S_IFCHR, mode, makedev(header.dev_major, header.dev_minor)),
        _ => mknod(target, SFlag::S_IFBLK, mode, makedev(header.dev_major, header.dev_minor)),
    };
    result.map_err(io::Error::from)
}

fn finalize_dirs(dirs: &mut [PendingDir]) {
    dirs.sort_by(|a, b| b.path.components().count().cmp(&a.path.components().count()));
    for dir in dirs.iter() {
        if let Err(e) = dir.metadata.apply_to_path(&dir.path) {
            warn!("Could not set metadata on {}: {}", dir.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveOptions, ArchiveWriter};
    use tempfile::TempDir;

    fn archive_with(dir: &Path, entries: &[(&str, &[u8])]) -> Result<PathBuf> {
        let archive = dir.join("a.tar");
        let mut writer = ArchiveWriter::open(&archive, ArchiveOptions::default())?;
        for (name, data) in entries {
            writer.append_data(name, &EntryMetadata::for_data(0, 1_500_000_000), data)?;
        }
        writer.finish()?;
        Ok(archive)
    }

    #[test]
    fn test_unsafe_names_are_refused() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = archive_with(temp_dir.path(), &[("../evil", b"x"), ("/abs/ok", b"y")])?;
        let dest = temp_dir.path().join("dest");

        let stats = extract(&archive, &dest)?;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.entries, 1);
        assert!(!temp_dir.path().join("evil").exists());
        assert_eq!(fs::read(dest.join("abs/ok"))?, b"y");
        Ok(())
    }

    #[test]
    fn test_file_blocking_parent_skips_entry() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = archive_with(temp_dir.path(), &[("x", &b"file"[..]), ("x/y", &b"child"[..]), ("z", &b"last"[..])])?;
        let dest = temp_dir.path().join("dest");

        let stats = extract(&archive, &dest)?;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.entries, 2);
        assert_eq!(fs::read(dest.join("x"))?, b"file");
        assert_eq!(fs::read(dest.join("z"))?, b"last");
        Ok(())
    }

    #[test]
    fn test_existing_directory_blocks_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = archive_with(temp_dir.path(), &[("x", &[7u8; 3000][..]), ("z", &b"last"[..])])?;
        let dest = temp_dir.path().join("dest");
        fs::create_dir_all(dest.join("x"))?;

        let stats = extract(&archive, &dest)?;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.entries, 1);
        assert!(dest.join("x").is_dir());
        assert_eq!(fs::read(dest.join("z"))?, b"last");
        Ok(())
    }

    #[test]
    fn test_blocked_entry_in_chunked_run() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = archive_with(temp_dir.path(), &[("x", &[7u8; 3000][..]), ("z", &[9u8; 2000][..])])?;
        let dest = temp_dir.path().join("dest");
        fs::create_dir_all(dest.join("x"))?;

        let mut extractor = Extractor::new(&archive, &dest);
        let mut stop = |_: u64, _: u64| ControlFlow::Break(());
        while extractor.run_chunked(512, &mut stop)? == Outcome::Suspended {}
        let stats = extractor.stats().cloned().unwrap_or_default();
        assert_eq!(stats.failed, 1);
        assert_eq!(fs::read(dest.join("z"))?, vec![9u8; 2000]);
        Ok(())
    }

    #[test]
    fn test_hard_link_restored() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = temp_dir.path().join("a.tar");
        let mut writer = ArchiveWriter::open(&archive, ArchiveOptions::default())?;
        let meta = EntryMetadata::for_data(0, 1_500_000_000);
        writer.append_data("orig", &meta, b"shared")?;
        writer.append_hard_link("alias", "orig", &meta)?;
        writer.finish()?;

        let dest = temp_dir.path().join("dest");
        extract(&archive, &dest)?;
        assert_eq!(fs::read(dest.join("alias"))?, b"shared");
        Ok(())
    }

    #[test]
    fn test_fifo_restored() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let fifo = temp_dir.path().join("pipe");
        nix::unistd::mkfifo(&fifo, Mode::from_bits_truncate(0o600))?;

        let archive = temp_dir.path().join("a.tar");
        let mut writer = ArchiveWriter::open(&archive, ArchiveOptions::default())?;
        writer.append_file(&fifo, "pipe", None)?;
        writer.finish()?;

        let dest = temp_dir.path().join("dest");
        extract(&archive, &dest)?;
        let meta = EntryMetadata::from_path(&dest.join("pipe"))?;
        assert_eq!(meta.kind, FileKind::Fifo);
        Ok(())
    }

    #[test]
    fn test_directory_mtime_survives_children() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = temp_dir.path().join("a.tar");
        let mut writer = ArchiveWriter::open(&archive, ArchiveOptions::default())?;
        let mut dir_meta = EntryMetadata::for_data(0, 1_000_000_000);
        dir_meta.kind = FileKind::Dir;
        dir_meta.mode = 0o755;
        writer.append_file(temp_dir.path(), "d", Some(&dir_meta))?;
        writer.append_data("d/f", &EntryMetadata::for_data(0, 1_500_000_000), b"f")?;
        writer.finish()?;

        let dest = temp_dir.path().join("dest");
        extract(&archive, &dest)?;
        assert_eq!(EntryMetadata::from_path(&dest.join("d"))?.mtime, 1_000_000_000);
        Ok(())
    }
}
