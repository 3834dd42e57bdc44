//! Sparse-region detection and stored/logical offset mapping.
//!
//! A file is scanned block by block; runs of non-zero blocks become regions,
//! all-zero blocks are holes. The archive stores only region bytes, back to
//! back, so a "stored offset" has to be mapped to a position in the file.

use super::header::{SparseRegion, BLOCK_SIZE};
use std::io::{self, Read};

const SCAN_BUFFER: usize = 64 * 1024;

/// Scan `reader` (positioned at the start of a file of `size` bytes) and return
/// its data regions in increasing offset order. When the file ends in a hole, or
/// contains no data at all, a zero-length region at `size` terminates the table.
pub fn detect_regions<R: Read>(reader: &mut R, size: u64) -> io::Result<Vec<SparseRegion>> {
    let mut regions: Vec<SparseRegion> = Vec::new();
    let mut buffer = vec![0u8; SCAN_BUFFER];
    let mut position = 0u64;

    while position < size {
        let want = ((size - position) as usize).min(SCAN_BUFFER);
        reader.read_exact(&mut buffer[..want])?;

        for block in buffer[..want].chunks(BLOCK_SIZE) {
            let len = block.len() as u64;
            if block.iter().any(|&b| b != 0) {
                match regions.last_mut() {
                    Some(last) if last.offset + last.length == position => last.length += len,
                    _ => regions.push(SparseRegion { offset: position, length: len }),
                }
            }
            position += len;
        }
    }

    let data_end = regions.last().map(|r| r.offset + r.length).unwrap_or(0);
    if data_end < size || regions.is_empty() {
        regions.push(SparseRegion { offset: size, length: 0 });
    }
    Ok(regions)
}

/// Whether the holes in `regions` justify sparse encoding.
pub fn worth_encoding(regions: &[SparseRegion], size: u64, threshold: f64) -> bool {
    if size < BLOCK_SIZE as u64 {
        return false;
    }
    let stored: u64 = regions.iter().map(|r| r.length).sum();
    let holes = size - stored;
    holes as f64 / size as f64 > threshold
}

/// Map an offset into the stored data stream to `(file offset, bytes left in
/// that region)`. `None` once every region is consumed.
pub fn locate(regions: &[SparseRegion], stored_offset: u64) -> Option<(u64, u64)> {
    let mut base = 0u64;
    for region in regions {
        if stored_offset < base + region.length {
            let within = stored_offset - base;
            return Some((region.offset + within, region.length - within));
        }
        base += region.length;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn file_with_gap() -> Vec<u8> {
        let mut data = vec![0u8; 4 * BLOCK_SIZE + 100];
        data[..BLOCK_SIZE].fill(b'a');
        data[3 * BLOCK_SIZE + 10] = b'b';
        data[4 * BLOCK_SIZE + 99] = b'c';
        data
    }

    #[test]
    fn test_detect_regions() -> io::Result<()> {
        let data = file_with_gap();
        let regions = detect_regions(&mut Cursor::new(&data), data.len() as u64)?;
        assert_eq!(
            regions,
            vec![
                SparseRegion { offset: 0, length: 512 },
                SparseRegion { offset: 1536, length: 512 + 100 },
            ]
        );
        Ok(())
    }

    #[test]
    fn test_trailing_hole_gets_terminator() -> io::Result<()> {
        let mut data = vec![0u8; 8 * BLOCK_SIZE];
        data[0] = 1;
        let regions = detect_regions(&mut Cursor::new(&data), data.len() as u64)?;
        assert_eq!(regions.last(), Some(&SparseRegion { offset: 4096, length: 0 }));

        let empty = vec![0u8; 2 * BLOCK_SIZE];
        let regions = detect_regions(&mut Cursor::new(&empty), empty.len() as u64)?;
        assert_eq!(regions, vec![SparseRegion { offset: 1024, length: 0 }]);
        Ok(())
    }

    #[test]
    fn test_worth_encoding() {
        let dense = vec![SparseRegion { offset: 0, length: 4096 }];
        assert!(!worth_encoding(&dense, 4096, 0.1));

        let holey = vec![
            SparseRegion { offset: 0, length: 512 },
            SparseRegion { offset: 4096, length: 0 },
        ];
        assert!(worth_encoding(&holey, 4096, 0.1));
        assert!(!worth_encoding(&holey, 100, 0.1));
    }

    #[test]
    fn test_locate() {
        let regions = vec![
            SparseRegion { offset: 0, length: 512 },
            SparseRegion { offset: 1536, length: 612 },
            SparseRegion { offset: 2148, length: 0 },
        ];
        assert_eq!(locate(&regions, 0), Some((0, 512)));
        assert_eq!(locate(&regions, 511), Some((511, 1)));
        assert_eq!(locate(&regions, 512), Some((1536, 612)));
        assert_eq!(locate(&regions, 600), Some((1624, 524)));
        assert_eq!(locate(&regions, 1124), None);
    }
}
