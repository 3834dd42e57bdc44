//! Backup manifests and the local backup index.
//!
//! A manifest is uploaded as `<name>.json` next to each backup archive, so a
//! destination can be re-indexed without opening any archive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const MANIFEST_VERSION: u32 = 1;

/// Backup manifest, serialized as `<name>.json` in the destination directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub name: String,
    pub job_id: String,
    /// Engine instance that produced the backup
    pub instance: String,
    /// Remote path of the archive
    pub archive: String,
    pub archive_size: u64,
    pub created_at: DateTime<Utc>,
    pub sources: Vec<PathBuf>,
    pub total_files: u64,
    pub total_bytes: u64,
    /// Entries that could not be archived
    pub errors: u32,
}

/// Running totals while a listing is read back, persisted between lines.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ManifestTotals {
    pub files: u64,
    pub bytes: u64,
}

impl ManifestTotals {
    /// Account one `size<TAB>name` listing line. Malformed lines count as a
    /// file of unknown (zero) size.
    pub fn add_line(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }
        let size = line
            .split('\t')
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        self.files += 1;
        self.bytes += size;
    }
}

/// Backups known on a destination, newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Index {
    pub updated_at: Option<DateTime<Utc>>,
    pub backups: Vec<Manifest>,
}

pub fn manifest_file_name(backup_name: &str) -> String {
    format!("{}.json", backup_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_from_listing() {
        let mut totals = ManifestTotals::default();
        totals.add_line("10\ta.txt");
        totals.add_line("0\tb/");
        totals.add_line("");
        totals.add_line("garbage");
        assert_eq!(totals.files, 3);
        assert_eq!(totals.bytes, 10);
    }
}
