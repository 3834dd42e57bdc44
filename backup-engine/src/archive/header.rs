//! Header block codec.
//!
//! One archive entry starts with a 512-byte header block in the GNU tar layout:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0      | 100  | name |
//! | 100    | 8    | mode |
//! | 108    | 8    | uid |
//! | 116    | 8    | gid |
//! | 124    | 12   | size (bytes stored after the header run) |
//! | 136    | 12   | mtime |
//! | 148    | 8    | checksum |
//! | 156    | 1    | type flag |
//! | 157    | 100  | link target |
//! | 257    | 8    | magic + version (`"ustar  \0"`) |
//! | 265    | 32   | owner name |
//! | 297    | 32   | group name |
//! | 329    | 8    | device major |
//! | 337    | 8    | device minor |
//! | 386    | 96   | 4 inline sparse slots (offset 12 + length 12) |
//! | 482    | 1    | "more sparse slots follow" flag |
//! | 483    | 12   | real size of a sparse file |
//!
//! Names or link targets over 100 bytes are carried by a preceding
//! `././@LongLink` pseudo-entry. Sparse tables that do not fit the 4 inline
//! slots continue in extension blocks of 21 slots each.

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;

pub const BLOCK_SIZE: usize = 512;

/// Name used for GNU long-name and long-link pseudo-entries.
pub const LONG_LINK_NAME: &str = "././@LongLink";

const NAME_FIELD: usize = 100;
const GNU_MAGIC: &[u8; 8] = b"ustar  \0";
const POSIX_MAGIC: &[u8; 6] = b"ustar\0";
const CHECKSUM_RANGE: std::ops::Range<usize> = 148..156;
const INLINE_SPARSE_SLOTS: usize = 4;
const EXTENSION_SPARSE_SLOTS: usize = 21;
/// Refuse long names beyond this; a bigger size field means a damaged header.
const MAX_LONG_NAME: u64 = 64 * 1024;

/// Entry type flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Regular,
    HardLink,
    Symlink,
    CharDevice,
    BlockDevice,
    Directory,
    Fifo,
    GnuLongName,
    GnuLongLink,
    GnuSparse,
    Other(u8),
}

impl EntryType {
    pub fn from_flag(flag: u8) -> Self {
        match flag {
            b'0' | b'\0' | b'7' => Self::Regular,
            b'1' => Self::HardLink,
            b'2' => Self::Symlink,
            b'3' => Self::CharDevice,
            b'4' => Self::BlockDevice,
            b'5' => Self::Directory,
            b'6' => Self::Fifo,
            b'L' => Self::GnuLongName,
            b'K' => Self::GnuLongLink,
            b'S' => Self::GnuSparse,
            other => Self::Other(other),
        }
    }

    pub fn flag(self) -> u8 {
        match self {
            Self::Regular => b'0',
            Self::HardLink => b'1',
            Self::Symlink => b'2',
            Self::CharDevice => b'3',
            Self::BlockDevice => b'4',
            Self::Directory => b'5',
            Self::Fifo => b'6',
            Self::GnuLongName => b'L',
            Self::GnuLongLink => b'K',
            Self::GnuSparse => b'S',
            Self::Other(flag) => flag,
        }
    }

    /// Whether the entry carries data blocks for a file.
    pub fn is_file(self) -> bool {
        matches!(self, Self::Regular | Self::GnuSparse)
    }
}

/// A contiguous run of non-zero data inside a sparse file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseRegion {
    pub offset: u64,
    pub length: u64,
}

/// Region table of a sparse entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseMap {
    pub real_size: u64,
    pub regions: Vec<SparseRegion>,
}

impl SparseMap {
    /// Bytes actually stored in the archive for this map.
    pub fn stored_size(&self) -> u64 {
        self.regions.iter().map(|r| r.length).sum()
    }

    /// Offsets must strictly increase; only the last region may be empty.
    pub fn validate(&self) -> Result<()> {
        let mut end = 0u64;
        for (i, region) in self.regions.iter().enumerate() {
            let last = i + 1 == self.regions.len();
            if region.length == 0 && !last {
                return Err(EngineError::InvalidHeader(format!(
                    "empty sparse region {} is not the terminator",
                    i
                )));
            }
            if i > 0 && region.offset <= self.regions[i - 1].offset {
                return Err(EngineError::InvalidHeader(
                    "sparse regions out of order".to_string(),
                ));
            }
            if region.offset < end {
                return Err(EngineError::InvalidHeader(
                    "overlapping sparse regions".to_string(),
                ));
            }
            end = region.offset.saturating_add(region.length);
            if end > self.real_size {
                return Err(EngineError::InvalidHeader(
                    "sparse region beyond real size".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Decoded archive entry header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub path: String,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    /// Bytes of entry data following the header run
    pub size: u64,
    pub mtime: u64,
    pub entry_type: EntryType,
    pub link_target: String,
    pub uname: String,
    pub gname: String,
    pub dev_major: u64,
    pub dev_minor: u64,
    pub sparse: Option<SparseMap>,
}

impl Header {
    pub fn new(path: impl Into<String>, entry_type: EntryType) -> Self {
        Self {
            path: path.into(),
            mode: 0o644,
            uid: 0,
            gid: 0,
            size: 0,
            mtime: 0,
            entry_type,
            link_target: String::new(),
            uname: String::new(),
            gname: String::new(),
            dev_major: 0,
            dev_minor: 0,
            sparse: None,
        }
    }

    /// Size of the file once extracted.
    pub fn logical_size(&self) -> u64 {
        match &self.sparse {
            Some(map) => map.real_size,
            None => self.size,
        }
    }

    /// Data size rounded up to whole blocks.
    pub fn padded_size(&self) -> u64 {
        padded(self.size)
    }

    /// Pack the main header block. Path and link target are truncated to their
    /// inline fields; `encode` emits the long-name pseudo-entries in front.
    pub fn pack(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        let flag = match (&self.sparse, self.entry_type) {
            (Some(_), EntryType::Regular) => EntryType::GnuSparse,
            (_, t) => t,
        };

        write_str(&mut block[0..100], &self.path);
        write_numeric(&mut block[100..108], self.mode as u64);
        write_numeric(&mut block[108..116], self.uid);
        write_numeric(&mut block[116..124], self.gid);
        write_numeric(&mut block[124..136], self.size);
        write_numeric(&mut block[136..148], self.mtime);
        block[156] = flag.flag();
        write_str(&mut block[157..257], &self.link_target);
        block[257..265].copy_from_slice(GNU_MAGIC);
        write_str(&mut block[265..297], &self.uname);
        write_str(&mut block[297..329], &self.gname);
        write_numeric(&mut block[329..337], self.dev_major);
        write_numeric(&mut block[337..345], self.dev_minor);

        if let Some(map) = &self.sparse {
            for (i, region) in map.regions.iter().take(INLINE_SPARSE_SLOTS).enumerate() {
                let at = 386 + i * 24;
                write_numeric(&mut block[at..at + 12], region.offset);
                write_numeric(&mut block[at + 12..at + 24], region.length);
            }
            if map.regions.len() > INLINE_SPARSE_SLOTS {
                block[482] = b'1';
            }
            write_numeric(&mut block[483..495], map.real_size);
        }

        write_checksum(&mut block);
        block
    }

    /// Encode the whole header run: long-name/long-link pseudo-entries, the
    /// main block, and sparse extension blocks.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOCK_SIZE);
        if self.link_target.len() > NAME_FIELD {
            encode_long(&mut out, EntryType::GnuLongLink, &self.link_target);
        }
        if self.path.len() > NAME_FIELD {
            encode_long(&mut out, EntryType::GnuLongName, &self.path);
        }
        out.extend_from_slice(&self.pack());

        if let Some(map) = &self.sparse {
            let rest: Vec<&SparseRegion> = map.regions.iter().skip(INLINE_SPARSE_SLOTS).collect();
            let chunks: Vec<&[&SparseRegion]> = rest.chunks(EXTENSION_SPARSE_SLOTS).collect();
            for (i, chunk) in chunks.iter().enumerate() {
                let mut block = [0u8; BLOCK_SIZE];
                for (slot, region) in chunk.iter().enumerate() {
                    let at = slot * 24;
                    write_numeric(&mut block[at..at + 12], region.offset);
                    write_numeric(&mut block[at + 12..at + 24], region.length);
                }
                if i + 1 < chunks.len() {
                    block[504] = b'1';
                }
                out.extend_from_slice(&block);
            }
        }
        out
    }

    /// Parse a header block. Continuation data (long names, sparse extension
    /// blocks, and the real header following a long-name pseudo-entry) is
    /// pulled from `reader`.
    pub fn parse<R: Read>(block: &[u8; BLOCK_SIZE], reader: &mut R) -> Result<Self> {
        verify_checksum(block)?;

        let entry_type = EntryType::from_flag(block[156]);
        if let EntryType::GnuLongName | EntryType::GnuLongLink = entry_type {
            let size = parse_numeric(&block[124..136])?;
            if size > MAX_LONG_NAME {
                return Err(EngineError::InvalidHeader(format!(
                    "long name of {} bytes",
                    size
                )));
            }
            let mut data = vec![0u8; padded(size) as usize];
            reader.read_exact(&mut data)?;
            data.truncate(size as usize);
            let name = read_str(&data);

            let mut next = [0u8; BLOCK_SIZE];
            reader.read_exact(&mut next)?;
            let mut header = Self::parse(&next, reader)?;
            if entry_type == EntryType::GnuLongName {
                header.path = name;
            } else {
                header.link_target = name;
            }
            return Ok(header);
        }

        let mut path = read_str(&block[0..100]);
        if &block[257..263] == POSIX_MAGIC {
            let prefix = read_str(&block[345..500]);
            if !prefix.is_empty() {
                path = format!("{}/{}", prefix, path);
            }
        }

        let mut header = Self {
            path,
            mode: parse_numeric(&block[100..108])? as u32,
            uid: parse_numeric(&block[108..116])?,
            gid: parse_numeric(&block[116..124])?,
            size: parse_numeric(&block[124..136])?,
            mtime: parse_numeric(&block[136..148])?,
            entry_type,
            link_target: read_str(&block[157..257]),
            uname: read_str(&block[265..297]),
            gname: read_str(&block[297..329]),
            dev_major: parse_numeric(&block[329..337])?,
            dev_minor: parse_numeric(&block[337..345])?,
            sparse: None,
        };

        if entry_type == EntryType::GnuSparse {
            let mut regions = Vec::new();
            let mut full = read_sparse_slots(&block[386..482], INLINE_SPARSE_SLOTS, &mut regions)?;
            let mut extended = block[482] == b'1';
            while extended {
                let mut ext = [0u8; BLOCK_SIZE];
                reader.read_exact(&mut ext)?;
                if !full {
                    return Err(EngineError::InvalidHeader(
                        "sparse extension after a partially filled table".to_string(),
                    ));
                }
                full = read_sparse_slots(&ext[..504], EXTENSION_SPARSE_SLOTS, &mut regions)?;
                extended = ext[504] == b'1';
            }
            let map = SparseMap {
                real_size: parse_numeric(&block[483..495])?,
                regions,
            };
            map.validate()?;
            if map.stored_size() != header.size {
                return Err(EngineError::InvalidHeader(format!(
                    "sparse map stores {} bytes but header declares {}",
                    map.stored_size(),
                    header.size
                )));
            }
            header.sparse = Some(map);
        }

        Ok(header)
    }
}

/// End-of-archive marker blocks are all zero.
pub fn is_zero_block(block: &[u8]) -> bool {
    block.iter().all(|&b| b == 0)
}

/// Round `size` up to a multiple of the block size.
pub fn padded(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE as u64) * BLOCK_SIZE as u64
}

fn encode_long(out: &mut Vec<u8>, entry_type: EntryType, value: &str) {
    let mut data = value.as_bytes().to_vec();
    data.push(0);
    let mut long = Header::new(LONG_LINK_NAME, entry_type);
    long.mode = 0;
    long.size = data.len() as u64;
    out.extend_from_slice(&long.pack());
    data.resize(padded(data.len() as u64) as usize, 0);
    out.extend_from_slice(&data);
}

/// Returns whether every slot was used, meaning an extension block may follow.
fn read_sparse_slots(area: &[u8], slots: usize, regions: &mut Vec<SparseRegion>) -> Result<bool> {
    for slot in 0..slots {
        let at = slot * 24;
        if area[at] == 0 {
            return Ok(false);
        }
        regions.push(SparseRegion {
            offset: parse_numeric(&area[at..at + 12])?,
            length: parse_numeric(&area[at + 12..at + 24])?,
        });
    }
    Ok(true)
}

fn write_str(field: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(field.len());
    field[..n].copy_from_slice(&bytes[..n]);
}

fn read_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Zero-padded octal with a trailing NUL, or base-256 (high bit of the first
/// byte set, big-endian value in the remaining bytes) when octal does not fit.
pub fn write_numeric(field: &mut [u8], value: u64) {
    let digits = field.len() - 1;
    let fits_octal = digits * 3 >= 64 || value < (1u64 << (digits * 3));
    if fits_octal {
        let text = format!("{:0width$o}", value, width = digits);
        field[..digits].copy_from_slice(text.as_bytes());
        field[digits] = 0;
    } else {
        let mut v = value;
        for byte in field[1..].iter_mut().rev() {
            *byte = (v & 0xff) as u8;
            v >>= 8;
        }
        field[0] = 0x80;
    }
}

pub fn parse_numeric(field: &[u8]) -> Result<u64> {
    if field[0] & 0x80 != 0 {
        if field[0] != 0x80 {
            return Err(EngineError::InvalidHeader(
                "negative or oversized base-256 value".to_string(),
            ));
        }
        let mut value: u64 = 0;
        for &byte in &field[1..] {
            if value >> 56 != 0 {
                return Err(EngineError::InvalidHeader("base-256 overflow".to_string()));
            }
            value = (value << 8) | byte as u64;
        }
        return Ok(value);
    }

    let text: &[u8] = {
        let start = field.iter().position(|&b| b != b' ').unwrap_or(field.len());
        let rest = &field[start..];
        let end = rest
            .iter()
            .position(|&b| b == 0 || b == b' ')
            .unwrap_or(rest.len());
        &rest[..end]
    };
    if text.is_empty() {
        return Ok(0);
    }

    let mut value: u64 = 0;
    for &c in text {
        if !(b'0'..=b'7').contains(&c) {
            return Err(EngineError::InvalidHeader(format!(
                "bad octal digit {:?}",
                c as char
            )));
        }
        value = value
            .checked_mul(8)
            .and_then(|v| v.checked_add((c - b'0') as u64))
            .ok_or_else(|| EngineError::InvalidHeader("octal overflow".to_string()))?;
    }
    Ok(value)
}

fn checksum_sums(block: &[u8; BLOCK_SIZE]) -> (u64, i64) {
    let mut unsigned = 0u64;
    let mut signed = 0i64;
    for (i, &b) in block.iter().enumerate() {
        let b = if CHECKSUM_RANGE.contains(&i) { b' ' } else { b };
        unsigned += b as u64;
        signed += (b as i8) as i64;
    }
    (unsigned, signed)
}

fn write_checksum(block: &mut [u8; BLOCK_SIZE]) {
    let (sum, _) = checksum_sums(block);
    let text = format!("{:06o}\0 ", sum);
    block[CHECKSUM_RANGE].copy_from_slice(text.as_bytes());
}

fn verify_checksum(block: &[u8; BLOCK_SIZE]) -> Result<()> {
    let stored = parse_numeric(&block[CHECKSUM_RANGE])
        .map_err(|_| EngineError::CorruptedHeader("unreadable checksum field".to_string()))?;
    let (unsigned, signed) = checksum_sums(block);
    if stored == unsigned || stored as i64 == signed {
        Ok(())
    } else {
        Err(EngineError::CorruptedHeader(format!(
            "checksum {:o} does not match computed {:o}",
            stored, unsigned
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> Header {
        let mut header = Header::new("dir/file.txt", EntryType::Regular);
        header.mode = 0o640;
        header.uid = 1000;
        header.gid = 100;
        header.size = 1234;
        header.mtime = 1_700_000_000;
        header.uname = "alice".into();
        header.gname = "users".into();
        header
    }

    fn decode(bytes: &[u8]) -> Result<Header> {
        let mut block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(&bytes[..BLOCK_SIZE]);
        let mut rest = Cursor::new(&bytes[BLOCK_SIZE..]);
        Header::parse(&block, &mut rest)
    }

    #[test]
    fn test_pack_layout() {
        let block = sample().pack();
        assert_eq!(&block[0..12], b"dir/file.txt");
        assert_eq!(&block[100..108], b"0000640\0");
        assert_eq!(&block[124..136], b"00000002322\0");
        assert_eq!(block[156], b'0');
        assert_eq!(&block[257..265], b"ustar  \0");
        assert_eq!(&block[154..156], b"\0 ");
    }

    #[test]
    fn test_parse_packed_header() -> Result<()> {
        let header = sample();
        assert_eq!(decode(&header.encode())?, header);
        Ok(())
    }

    #[test]
    fn test_long_name_and_link() -> Result<()> {
        let long_path = format!("{}/{}", "d".repeat(80), "f".repeat(80));
        let mut header = Header::new(long_path.clone(), EntryType::Symlink);
        header.link_target = "t".repeat(150);

        let bytes = header.encode();
        // long-link header + data, long-name header + data, main block
        assert_eq!(bytes.len(), 5 * BLOCK_SIZE);
        assert_eq!(&bytes[0..13], LONG_LINK_NAME.as_bytes());
        assert_eq!(bytes[156], b'K');

        let parsed = decode(&bytes)?;
        assert_eq!(parsed.path, long_path);
        assert_eq!(parsed.link_target, "t".repeat(150));
        assert_eq!(parsed.entry_type, EntryType::Symlink);
        Ok(())
    }

    #[test]
    fn test_name_of_exactly_100_bytes_stays_inline() -> Result<()> {
        let header = Header::new("n".repeat(100), EntryType::Regular);
        let bytes = header.encode();
        assert_eq!(bytes.len(), BLOCK_SIZE);
        assert_eq!(decode(&bytes)?.path, "n".repeat(100));
        Ok(())
    }

    #[test]
    fn test_base256_for_large_size() -> Result<()> {
        let mut header = sample();
        header.size = 1 << 34; // 16 GiB, beyond 11 octal digits
        let block = header.pack();
        assert_eq!(block[124], 0x80);
        assert_eq!(decode(&header.encode())?.size, 1 << 34);
        Ok(())
    }

    #[test]
    fn test_sparse_table_with_extension_blocks() -> Result<()> {
        let regions: Vec<SparseRegion> = (0..30)
            .map(|i| SparseRegion { offset: i * 4096, length: 512 })
            .chain(std::iter::once(SparseRegion { offset: 200_000, length: 0 }))
            .collect();
        let map = SparseMap { real_size: 200_000, regions };
        let mut header = Header::new("sparse.img", EntryType::Regular);
        header.size = map.stored_size();
        header.sparse = Some(map.clone());

        let bytes = header.encode();
        // main block + two extension blocks (31 - 4 = 27 slots)
        assert_eq!(bytes.len(), 3 * BLOCK_SIZE);
        assert_eq!(bytes[156], b'S');

        let parsed = decode(&bytes)?;
        assert_eq!(parsed.entry_type, EntryType::GnuSparse);
        assert_eq!(parsed.sparse, Some(map));
        assert_eq!(parsed.logical_size(), 200_000);
        Ok(())
    }

    #[test]
    fn test_any_flipped_byte_is_rejected() {
        let packed = sample().pack();
        for i in (0..BLOCK_SIZE).filter(|i| !CHECKSUM_RANGE.contains(i)) {
            let mut block = packed;
            block[i] ^= 0x01;
            let result = Header::parse(&block, &mut Cursor::new(Vec::new()));
            assert!(
                matches!(result, Err(EngineError::CorruptedHeader(_))),
                "byte {} accepted",
                i
            );
        }
    }

    #[test]
    fn test_unordered_sparse_regions_are_invalid() {
        let map = SparseMap {
            real_size: 10_000,
            regions: vec![
                SparseRegion { offset: 4096, length: 512 },
                SparseRegion { offset: 0, length: 512 },
            ],
        };
        assert!(map.validate().is_err());

        let map = SparseMap {
            real_size: 10_000,
            regions: vec![
                SparseRegion { offset: 0, length: 0 },
                SparseRegion { offset: 512, length: 512 },
            ],
        };
        assert!(map.validate().is_err());
    }

    #[test]
    fn test_numeric_fields() -> Result<()> {
        let mut field = [0u8; 8];
        write_numeric(&mut field, 0o7777777);
        assert_eq!(&field, b"7777777\0");
        assert_eq!(parse_numeric(&field)?, 0o7777777);

        write_numeric(&mut field, 0o10000000);
        assert_eq!(field[0], 0x80);
        assert_eq!(parse_numeric(&field)?, 0o10000000);

        assert_eq!(parse_numeric(b"   644 \0")?, 0o644);
        assert_eq!(parse_numeric(b"\0\0\0\0\0\0\0\0")?, 0);
        assert!(parse_numeric(b"0000009\0").is_err());
        Ok(())
    }
}
