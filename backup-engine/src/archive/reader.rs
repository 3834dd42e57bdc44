//! Sequential header traversal.
//!
//! A block that fails its checksum (or does not decode) is reported once per
//! reader and skipped; scanning continues at the next block boundary.

use super::header::{is_zero_block, EntryType, Header, BLOCK_SIZE};
use crate::utils::errors::{EngineError, Result};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, warn};

/// A byte stream an archive can be read from. Seekable sources skip entry
/// data without reading it.
pub trait ArchiveSource: Read {
    fn skip(&mut self, n: u64) -> io::Result<()>;
}

impl ArchiveSource for File {
    fn skip(&mut self, n: u64) -> io::Result<()> {
        self.seek(SeekFrom::Current(n as i64)).map(|_| ())
    }
}

impl<T: AsRef<[u8]>> ArchiveSource for io::Cursor<T> {
    fn skip(&mut self, n: u64) -> io::Result<()> {
        self.seek(SeekFrom::Current(n as i64)).map(|_| ())
    }
}

impl<R: Read> ArchiveSource for MultiGzDecoder<R> {
    fn skip(&mut self, n: u64) -> io::Result<()> {
        io::copy(&mut self.by_ref().take(n), &mut io::sink()).map(|_| ())
    }
}

/// A header together with where it sits in the archive.
#[derive(Debug, Clone)]
pub struct Entry {
    pub header: Header,
    /// Offset of the first block of the header run
    pub header_offset: u64,
    /// Offset of the first data byte
    pub data_offset: u64,
}

impl Entry {
    /// Offset just past this entry's padded data.
    pub fn end_offset(&self) -> u64 {
        self.data_offset + self.header.padded_size()
    }
}

pub struct ArchiveReader<R> {
    inner: R,
    position: u64,
    corruption_reported: bool,
    corrupted_blocks: u64,
}

impl<R: ArchiveSource> ArchiveReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            position: 0,
            corruption_reported: false,
            corrupted_blocks: 0,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Number of header blocks rejected so far.
    pub fn corrupted_blocks(&self) -> u64 {
        self.corrupted_blocks
    }

    /// Next entry header, `None` at the end of the stream. Zero blocks are
    /// passed over, so trailing end-of-archive markers simply end the scan.
    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        loop {
            let header_offset = self.position;
            let block = match self.read_block()? {
                Some(block) => block,
                None => return Ok(None),
            };
            if is_zero_block(&block) {
                continue;
            }

            match Header::parse(&block, self) {
                Ok(header) => {
                    return Ok(Some(Entry {
                        header,
                        header_offset,
                        data_offset: self.position,
                    }))
                }
                Err(EngineError::CorruptedHeader(reason)) | Err(EngineError::InvalidHeader(reason)) => {
                    self.corrupted_blocks += 1;
                    if !self.corruption_reported {
                        warn!(
                            "Skipping unreadable header at offset {}: {}",
                            header_offset, reason
                        );
                        self.corruption_reported = true;
                    } else {
                        debug!("Skipping unreadable header at offset {}", header_offset);
                    }
                }
                Err(EngineError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    warn!("Archive truncated inside header at offset {}", header_offset);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Skip the rest of `entry`'s data, from wherever the reader is inside it.
    pub fn skip_entry(&mut self, entry: &Entry) -> Result<()> {
        let end = entry.end_offset();
        if end > self.position {
            let n = end - self.position;
            self.inner.skip(n)?;
            self.position += n;
        }
        Ok(())
    }

    pub fn skip(&mut self, n: u64) -> Result<()> {
        self.inner.skip(n)?;
        self.position += n;
        Ok(())
    }

    fn read_block(&mut self) -> Result<Option<[u8; BLOCK_SIZE]>> {
        let mut block = [0u8; BLOCK_SIZE];
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            match self.inner.read(&mut block[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.position += filled as u64;
        match filled {
            0 => Ok(None),
            BLOCK_SIZE => Ok(Some(block)),
            _ => {
                warn!("Ignoring {} trailing bytes at offset {}", filled, self.position);
                Ok(None)
            }
        }
    }
}

impl<R: ArchiveSource> Read for ArchiveReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl ArchiveReader<File> {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(File::open(path)?))
    }

    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        self.position = offset;
        Ok(())
    }
}

fn collect_headers<R: ArchiveSource>(mut reader: ArchiveReader<R>) -> Result<Vec<Header>> {
    let mut headers = Vec::new();
    while let Some(entry) = reader.next_entry()? {
        reader.skip_entry(&entry)?;
        headers.push(entry.header);
    }
    Ok(headers)
}

/// Whether an archive path is gzip-wrapped, judged by its name only.
pub fn is_gzipped(path: &Path) -> bool {
    let name = path.to_string_lossy();
    name.ends_with(".gz") || name.ends_with(".tgz")
}

/// All entry headers of a plain or gzip-wrapped archive.
pub fn list(path: &Path) -> Result<Vec<Header>> {
    let file = File::open(path)?;
    if is_gzipped(path) {
        collect_headers(ArchiveReader::new(MultiGzDecoder::new(BufReader::new(file))))
    } else {
        collect_headers(ArchiveReader::new(file))
    }
}

/// `ls -l`-style listing of an archive.
pub fn dump_headers(path: &Path) -> Result<Vec<String>> {
    Ok(list(path)?.iter().map(format_header).collect())
}

pub fn format_header(header: &Header) -> String {
    let owner = match (header.uname.is_empty(), header.gname.is_empty()) {
        (false, false) => format!("{}/{}", header.uname, header.gname),
        _ => format!("{}/{}", header.uid, header.gid),
    };
    let size = match header.entry_type {
        EntryType::CharDevice | EntryType::BlockDevice => {
            format!("{},{}", header.dev_major, header.dev_minor)
        }
        _ => header.logical_size().to_string(),
    };
    let date = chrono::DateTime::from_timestamp(header.mtime as i64, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "????-??-?? ??:??".to_string());
    let link = match header.entry_type {
        EntryType::Symlink => format!(" -> {}", header.link_target),
        EntryType::HardLink => format!(" link to {}", header.link_target),
        _ => String::new(),
    };
    format!(
        "{} {} {:>10} {} {}{}",
        mode_string(header),
        owner,
        size,
        date,
        header.path,
        link
    )
}

fn mode_string(header: &Header) -> String {
    let kind = match header.entry_type {
        EntryType::Directory => 'd',
        EntryType::Symlink => 'l',
        EntryType::HardLink => 'h',
        EntryType::CharDevice => 'c',
        EntryType::BlockDevice => 'b',
        EntryType::Fifo => 'p',
        EntryType::GnuSparse => 'S',
        _ => '-',
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6u32, 3, 0] {
        let bits = (header.mode >> shift) & 0o7;
        out.push(if bits & 4 != 0 { 'r' } else { '-' });
        out.push(if bits & 2 != 0 { 'w' } else { '-' });
        out.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    out
}
