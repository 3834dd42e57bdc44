//! Archive writer.
//!
//! Entries are always appended at the end of the archive file. The chunked
//! path keeps an append checkpoint next to the archive so a later invocation
//! continues the same entry without re-emitting its header or rewriting data.

use super::header::{padded, EntryType, Header, SparseMap, SparseRegion, BLOCK_SIZE};
use super::{sparse, ArchiveObserver, ArchiveOptions, RenamePolicy};
use crate::fs::metadata::{EntryMetadata, FileKind};
use crate::fs::state::{self, APPEND_SUFFIX};
use crate::fs::walker::{self, WalkOptions};
use crate::utils::errors::{EngineError, Result};
use crate::Outcome;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A file may change this many times under a chunked append before the
/// entry is given up.
pub const MAX_FILE_CHANGES: u32 = 3;

const COPY_BUFFER: usize = 64 * 1024;

/// Progress of one chunked append, persisted after every chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AppendCheckpoint {
    source: PathBuf,
    name: String,
    size: u64,
    mtime: u64,
    /// Archive offset where this entry's header run starts
    entry_start: u64,
    /// Archive offset of the first data byte, once the header run is written
    data_start: Option<u64>,
    /// Stored data bytes already in the archive
    written: u64,
    regions: Option<Vec<SparseRegion>>,
    changed: u32,
}

pub struct ArchiveWriter<'a> {
    path: PathBuf,
    file: File,
    options: ArchiveOptions,
    observer: Option<&'a mut dyn ArchiveObserver>,
}

impl<'a> ArchiveWriter<'a> {
    /// Open (or create) an archive for appending. Existing content is kept.
    pub fn open(path: &Path, options: ArchiveOptions) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            options,
            observer: None,
        })
    }

    /// Receive a callback for every header written.
    pub fn with_observer(mut self, observer: &'a mut dyn ArchiveObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current archive length.
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Append one filesystem object. `metadata` overrides what is read from
    /// disk. Sockets are skipped.
    pub fn append_file(
        &mut self,
        path: &Path,
        as_name: &str,
        metadata: Option<&EntryMetadata>,
    ) -> Result<()> {
        let meta = match metadata {
            Some(meta) => meta.clone(),
            None => EntryMetadata::from_path(path)?,
        };

        match meta.kind {
            FileKind::Socket => {
                info!("Skipping socket {}", path.display());
                Ok(())
            }
            FileKind::Unknown => {
                warn!("Skipping {} of unknown type", path.display());
                Ok(())
            }
            FileKind::File => {
                let mut source = File::open(path)?;
                let regions = self.sparse_regions(&mut source, meta.size)?;
                let header = file_header(as_name, &meta, regions);
                self.seek_end()?;
                self.write_header(&header)?;
                let stored = header.size;
                self.copy_data(&mut source, header.sparse.as_ref(), 0, stored)?;
                self.write_padding(stored)
            }
            _ => {
                let link_target = if meta.kind == FileKind::Symlink {
                    std::fs::read_link(path)?.to_string_lossy().into_owned()
                } else {
                    String::new()
                };
                let header = special_header(as_name, &meta, link_target);
                self.seek_end()?;
                self.write_header(&header)
            }
        }
    }

    /// Append an in-memory blob as a regular file.
    pub fn append_data(&mut self, as_name: &str, metadata: &EntryMetadata, data: &[u8]) -> Result<()> {
        let mut meta = metadata.clone();
        meta.kind = FileKind::File;
        meta.size = data.len() as u64;
        let header = file_header(as_name, &meta, None);
        self.seek_end()?;
        self.write_header(&header)?;
        self.file.write_all(data)?;
        self.write_padding(data.len() as u64)
    }

    /// Append a hard link to an entry already in the archive.
    pub fn append_hard_link(&mut self, as_name: &str, target: &str, metadata: &EntryMetadata) -> Result<()> {
        let mut header = special_header(as_name, metadata, target.to_string());
        header.entry_type = EntryType::HardLink;
        self.seek_end()?;
        self.write_header(&header)
    }

    /// Append every entry below `root` in depth-first name order. Returns the
    /// number of entries written.
    pub fn append_directory(&mut self, root: &Path, policy: &RenamePolicy) -> Result<u64> {
        let options = WalkOptions {
            ignore_vanished: self.options.ignore_vanished,
            ..Default::default()
        };
        let ignore_vanished = self.options.ignore_vanished;
        let mut count = 0u64;

        walker::walk_directory_with_callback(root, &options, |info| {
            let name = policy.archive_name(root, &info.relative_path);
            match self.append_file(&info.path, &name, None) {
                Ok(()) => count += 1,
                Err(EngineError::Io(e)) if ignore_vanished && e.kind() == io::ErrorKind::NotFound => {
                    info!("File vanished while archiving: {}", info.path.display());
                }
                Err(e) => return Err(e),
            }
            Ok::<_, EngineError>(true)
        })?;

        debug!("Appended {} entries from {}", count, root.display());
        Ok(count)
    }

    /// Resumable append of a single file.
    ///
    /// Data goes out in `chunk_size` pieces with the checkpoint saved after
    /// each; `on_chunk(written, total)` returning `Break` suspends the append,
    /// leaving the checkpoint for the next call. If the file's size or mtime
    /// changes, the archive is cut back to the entry start and the entry is
    /// rewritten; after `MAX_FILE_CHANGES` such restarts the entry fails.
    pub fn append_file_chunked(
        &mut self,
        source: &Path,
        as_name: &str,
        chunk_size: u64,
        on_chunk: &mut dyn FnMut(u64, u64) -> ControlFlow<()>,
    ) -> Result<Outcome> {
        let ckpt_path = self.checkpoint_path(source);
        let meta = match EntryMetadata::from_path(source) {
            Ok(meta) => meta,
            Err(e) => {
                self.abandon(&ckpt_path)?;
                return Err(e.into());
            }
        };
        if meta.kind != FileKind::File {
            self.append_file(source, as_name, Some(&meta))?;
            return Ok(Outcome::Completed);
        }
        let mut file = match File::open(source) {
            Ok(file) => file,
            Err(e) => {
                self.abandon(&ckpt_path)?;
                return Err(e.into());
            }
        };

        let chunk_size = chunk_size.max(BLOCK_SIZE as u64);

        let mut ckpt = match state::load::<AppendCheckpoint>(&ckpt_path)? {
            Some(ckpt) => {
                debug!(
                    "Resuming {} at {} of {} bytes",
                    source.display(),
                    ckpt.written,
                    ckpt.size
                );
                ckpt
            }
            None => {
                let ckpt = AppendCheckpoint {
                    source: source.to_path_buf(),
                    name: as_name.to_string(),
                    size: meta.size,
                    mtime: meta.mtime,
                    entry_start: self.len()?,
                    data_start: None,
                    written: 0,
                    regions: None,
                    changed: 0,
                };
                state::store(&ckpt_path, &ckpt)?;
                ckpt
            }
        };

        'restart: loop {
            let (size, mtime) = identity(&file)?;
            if size != ckpt.size || mtime != ckpt.mtime {
                self.restart_changed(&ckpt_path, &mut ckpt, size, mtime)?;
                file = File::open(source)?;
            }

            let data_start = match ckpt.data_start {
                Some(offset) => offset,
                None => {
                    self.file.set_len(ckpt.entry_start)?;
                    let regions = self.sparse_regions(&mut file, ckpt.size)?;
                    let mut entry_meta = meta.clone();
                    entry_meta.size = ckpt.size;
                    entry_meta.mtime = ckpt.mtime;
                    let header = file_header(&ckpt.name, &entry_meta, regions.clone());

                    self.file.seek(SeekFrom::Start(ckpt.entry_start))?;
                    self.write_header(&header)?;
                    let offset = self.file.stream_position()?;

                    ckpt.regions = regions;
                    ckpt.data_start = Some(offset);
                    ckpt.written = 0;
                    state::store(&ckpt_path, &ckpt)?;
                    offset
                }
            };

            let sparse_map = ckpt.regions.clone().map(|regions| SparseMap {
                real_size: ckpt.size,
                regions,
            });
            let stored = sparse_map
                .as_ref()
                .map(|m| m.stored_size())
                .unwrap_or(ckpt.size);

            // Bytes past the committed offset may stem from a chunk whose
            // checkpoint never got written.
            self.file.set_len(data_start + ckpt.written)?;
            self.file.seek(SeekFrom::Start(data_start + ckpt.written))?;

            while ckpt.written < stored {
                let (size, mtime) = identity(&file)?;
                if size != ckpt.size || mtime != ckpt.mtime {
                    continue 'restart;
                }

                let end = (ckpt.written + chunk_size).min(stored);
                match self.copy_data(&mut file, sparse_map.as_ref(), ckpt.written, end) {
                    Ok(()) => {}
                    Err(EngineError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        // Shrunk between the stat and the read.
                        continue 'restart;
                    }
                    Err(e) => return Err(e),
                }
                ckpt.written = end;
                state::store(&ckpt_path, &ckpt)?;

                if ckpt.written < stored && on_chunk(ckpt.written, stored).is_break() {
                    debug!(
                        "Suspending append of {} at {}/{}",
                        source.display(),
                        ckpt.written,
                        stored
                    );
                    return Ok(Outcome::Suspended);
                }
            }

            self.write_padding(stored)?;
            state::remove(&ckpt_path)?;
            return Ok(Outcome::Completed);
        }
    }

    /// Write the end-of-archive marker and flush everything to disk.
    pub fn finish(mut self) -> Result<()> {
        self.seek_end()?;
        self.file.write_all(&[0u8; 2 * BLOCK_SIZE])?;
        self.file.sync_all()?;
        Ok(())
    }

    fn checkpoint_path(&self, source: &Path) -> PathBuf {
        let dir = self
            .options
            .checkpoint_dir
            .clone()
            .or_else(|| self.path.parent().map(Path::to_path_buf))
            .unwrap_or_default();
        let key = format!("{}\0{}", self.path.display(), source.display());
        state::checkpoint_path(&dir, &key, APPEND_SUFFIX)
    }

    /// Drop a half-written entry whose source is gone.
    fn abandon(&mut self, ckpt_path: &Path) -> Result<()> {
        if let Some(ckpt) = state::load::<AppendCheckpoint>(ckpt_path)? {
            warn!(
                "{} disappeared mid-append, removing partial entry",
                ckpt.source.display()
            );
            self.file.set_len(ckpt.entry_start)?;
            state::remove(ckpt_path)?;
        }
        Ok(())
    }

    fn restart_changed(
        &mut self,
        ckpt_path: &Path,
        ckpt: &mut AppendCheckpoint,
        size: u64,
        mtime: u64,
    ) -> Result<()> {
        ckpt.changed += 1;
        self.file.set_len(ckpt.entry_start)?;

        if ckpt.changed > MAX_FILE_CHANGES {
            state::remove(ckpt_path)?;
            return Err(EngineError::FileChanged {
                path: ckpt.source.clone(),
                attempts: ckpt.changed,
            });
        }

        warn!(
            "{} changed while archiving (attempt {}), restarting entry",
            ckpt.source.display(),
            ckpt.changed
        );
        ckpt.size = size;
        ckpt.mtime = mtime;
        ckpt.data_start = None;
        ckpt.written = 0;
        ckpt.regions = None;
        state::store(ckpt_path, ckpt)
    }

    fn sparse_regions(&self, source: &mut File, size: u64) -> Result<Option<Vec<SparseRegion>>> {
        if size < BLOCK_SIZE as u64 {
            return Ok(None);
        }
        source.seek(SeekFrom::Start(0))?;
        let regions = sparse::detect_regions(source, size)?;
        source.seek(SeekFrom::Start(0))?;
        if sparse::worth_encoding(&regions, size, self.options.sparse_threshold) {
            Ok(Some(regions))
        } else {
            Ok(None)
        }
    }

    fn seek_end(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::End(0))?;
        Ok(())
    }

    fn write_header(&mut self, header: &Header) -> Result<()> {
        self.file.write_all(&header.encode())?;
        if let Some(observer) = self.observer.as_mut() {
            observer.on_entry(header);
        }
        Ok(())
    }

    /// Copy stored bytes `[from, to)` of `source` to the current archive position.
    fn copy_data(
        &mut self,
        source: &mut File,
        map: Option<&SparseMap>,
        from: u64,
        to: u64,
    ) -> Result<()> {
        let mut buffer = vec![0u8; COPY_BUFFER];
        let mut offset = from;
        while offset < to {
            let (file_offset, available) = match map {
                Some(map) => sparse::locate(&map.regions, offset).ok_or_else(|| {
                    EngineError::InvalidHeader("stored offset outside sparse map".to_string())
                })?,
                None => (offset, to - offset),
            };
            let n = available.min(to - offset).min(COPY_BUFFER as u64) as usize;
            source.seek(SeekFrom::Start(file_offset))?;
            source.read_exact(&mut buffer[..n])?;
            self.file.write_all(&buffer[..n])?;
            offset += n as u64;
        }
        Ok(())
    }

    fn write_padding(&mut self, size: u64) -> Result<()> {
        let pad = (padded(size) - size) as usize;
        if pad > 0 {
            self.file.write_all(&vec![0u8; pad])?;
        }
        Ok(())
    }
}

fn identity(file: &File) -> Result<(u64, u64)> {
    let meta = EntryMetadata::from_std(&file.metadata()?);
    Ok((meta.size, meta.mtime))
}

fn base_header(name: &str, meta: &EntryMetadata, entry_type: EntryType) -> Header {
    let mut header = Header::new(name, entry_type);
    header.mode = meta.mode;
    header.uid = meta.uid;
    header.gid = meta.gid;
    header.mtime = meta.mtime;
    header.uname = meta.uname.clone();
    header.gname = meta.gname.clone();
    header
}

fn file_header(name: &str, meta: &EntryMetadata, regions: Option<Vec<SparseRegion>>) -> Header {
    let mut header = base_header(name, meta, EntryType::Regular);
    match regions {
        Some(regions) => {
            let map = SparseMap {
                real_size: meta.size,
                regions,
            };
            header.size = map.stored_size();
            header.entry_type = EntryType::GnuSparse;
            header.sparse = Some(map);
        }
        None => header.size = meta.size,
    }
    header
}

fn special_header(name: &str, meta: &EntryMetadata, link_target: String) -> Header {
    let entry_type = match meta.kind {
        FileKind::Dir => EntryType::Directory,
        FileKind::Symlink => EntryType::Symlink,
        FileKind::CharDevice => EntryType::CharDevice,
        FileKind::BlockDevice => EntryType::BlockDevice,
        FileKind::Fifo => EntryType::Fifo,
        _ => EntryType::Regular,
    };
    let name = if entry_type == EntryType::Directory && !name.ends_with('/') {
        format!("{}/", name)
    } else {
        name.to_string()
    };
    let mut header = base_header(&name, meta, entry_type);
    header.link_target = link_target;
    header.dev_major = meta.dev_major;
    header.dev_minor = meta.dev_minor;
    header
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::reader::list;
    use tempfile::TempDir;

    fn options(dir: &Path) -> ArchiveOptions {
        ArchiveOptions {
            checkpoint_dir: Some(dir.join("ckpt")),
            ..Default::default()
        }
    }

    fn never_stop() -> impl FnMut(u64, u64) -> ControlFlow<()> {
        |_, _| ControlFlow::Continue(())
    }

    #[test]
    fn test_append_data_layout() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = temp_dir.path().join("a.tar");

        let mut writer = ArchiveWriter::open(&archive, options(temp_dir.path()))?;
        writer.append_data("hello.txt", &EntryMetadata::for_data(5, 1_600_000_000), b"hello")?;
        writer.finish()?;

        let bytes = std::fs::read(&archive)?;
        assert_eq!(bytes.len(), 4 * BLOCK_SIZE);
        assert_eq!(&bytes[BLOCK_SIZE..BLOCK_SIZE + 5], b"hello");
        assert!(bytes[BLOCK_SIZE + 5..].iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn test_observer_sees_every_header() -> Result<()> {
        struct Names(Vec<String>);
        impl ArchiveObserver for Names {
            fn on_entry(&mut self, header: &Header) {
                self.0.push(header.path.clone());
            }
        }

        let temp_dir = TempDir::new()?;
        let src = temp_dir.path().join("src");
        std::fs::create_dir_all(src.join("sub"))?;
        std::fs::write(src.join("x"), b"x")?;
        std::fs::write(src.join("sub/y"), b"y")?;

        let mut names = Names(Vec::new());
        {
            let mut writer = ArchiveWriter::open(&temp_dir.path().join("a.tar"), options(temp_dir.path()))?
                .with_observer(&mut names);
            assert_eq!(writer.append_directory(&src, &RenamePolicy::Relative)?, 3);
            writer.finish()?;
        }
        assert_eq!(names.0, vec!["sub/", "sub/y", "x"]);
        Ok(())
    }

    #[test]
    fn test_socket_is_skipped() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let socket_path = temp_dir.path().join("sock");
        let _listener = std::os::unix::net::UnixListener::bind(&socket_path)?;

        let archive = temp_dir.path().join("a.tar");
        let mut writer = ArchiveWriter::open(&archive, options(temp_dir.path()))?;
        writer.append_file(&socket_path, "sock", None)?;
        assert!(writer.is_empty()?);
        Ok(())
    }

    #[test]
    fn test_chunked_append_resumes_byte_identical() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("data.bin");
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8 + 1).collect();
        std::fs::write(&source, &content)?;

        let reference = temp_dir.path().join("reference.tar");
        {
            let mut writer = ArchiveWriter::open(&reference, options(temp_dir.path()))?;
            let outcome = writer.append_file_chunked(&source, "data.bin", 1024, &mut never_stop())?;
            assert_eq!(outcome, Outcome::Completed);
            writer.finish()?;
        }

        // Stop after every single chunk; each call is a fresh "invocation".
        for stop_after in 1..10u64 {
            let archive = temp_dir.path().join(format!("resumed-{}.tar", stop_after));
            let mut calls = 0;
            loop {
                let mut writer = ArchiveWriter::open(&archive, options(temp_dir.path()))?;
                let mut seen = 0u64;
                let outcome = writer.append_file_chunked(&source, "data.bin", 1024, &mut |_: u64, _: u64| {
                    seen += 1;
                    if seen >= stop_after {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                })?;
                calls += 1;
                if outcome == Outcome::Completed {
                    writer.finish()?;
                    break;
                }
            }
            assert!(calls > 1);
            assert_eq!(std::fs::read(&archive)?, std::fs::read(&reference)?);
        }

        let leftovers = std::fs::read_dir(temp_dir.path().join("ckpt"))?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(APPEND_SUFFIX))
            .count();
        assert_eq!(leftovers, 0);
        Ok(())
    }

    #[test]
    fn test_changed_file_restarts_then_fails() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("grow.log");
        std::fs::write(&source, vec![b'a'; 4096])?;
        let archive = temp_dir.path().join("a.tar");

        let mut writer = ArchiveWriter::open(&archive, options(temp_dir.path()))?;
        writer.append_data("first", &EntryMetadata::for_data(1, 0), b"1")?;
        let entry_start = writer.len()?;

        let mut stop = |_: u64, _: u64| ControlFlow::<()>::Break(());
        assert_eq!(
            writer.append_file_chunked(&source, "grow.log", 1024, &mut stop)?,
            Outcome::Suspended
        );

        // Three changes are tolerated, each truncating back to the entry start.
        for i in 0..MAX_FILE_CHANGES {
            std::fs::write(&source, vec![b'b'; 4096 + 512 * (i as usize + 1)])?;
            assert_eq!(
                writer.append_file_chunked(&source, "grow.log", 1024, &mut stop)?,
                Outcome::Suspended
            );
        }

        std::fs::write(&source, vec![b'c'; 100])?;
        let err = writer
            .append_file_chunked(&source, "grow.log", 1024, &mut stop)
            .unwrap_err();
        assert!(matches!(err, EngineError::FileChanged { attempts: 4, .. }));
        assert_eq!(writer.len()?, entry_start);

        writer.finish()?;
        let headers = list(&archive)?;
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].path, "first");
        Ok(())
    }
}
