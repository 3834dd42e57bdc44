//! GNU tar archive engine.
//!
//! Writes and reads GNU-format archives (long names, sparse files) in
//! 512-byte blocks, with chunked, checkpointed variants of append and extract
//! that survive being stopped between invocations.

pub mod extract;
pub mod header;
pub mod reader;
pub mod sparse;
pub mod writer;

pub use extract::{extract, ExtractStats, Extractor};
pub use header::{EntryType, Header, SparseMap, SparseRegion, BLOCK_SIZE};
pub use reader::{dump_headers, list, ArchiveReader, ArchiveSource, Entry};
pub use writer::{ArchiveWriter, MAX_FILE_CHANGES};

use std::path::{Component, Path, PathBuf};

/// Receives every header as it is written.
pub trait ArchiveObserver {
    fn on_entry(&mut self, _header: &Header) {}
}

#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    /// Minimum share of a file that must be holes before it is stored sparse
    pub sparse_threshold: f64,
    /// Tolerate files vanishing between directory listing and archiving
    pub ignore_vanished: bool,
    /// Where append checkpoints live; next to the archive when unset
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            sparse_threshold: 0.25,
            ignore_vanished: true,
            checkpoint_dir: None,
        }
    }
}

/// How a directory's entries are named inside the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenamePolicy {
    /// Relative to the directory being added
    Relative,
    /// Relative, under a fixed prefix directory
    Prefixed(String),
    /// Full source path without the leading `/`
    Absolute,
}

impl RenamePolicy {
    pub fn archive_name(&self, root: &Path, relative: &Path) -> String {
        let relative = to_archive_path(relative);
        match self {
            RenamePolicy::Relative => relative,
            RenamePolicy::Prefixed(prefix) => {
                let prefix = prefix.trim_matches('/');
                if prefix.is_empty() {
                    relative
                } else {
                    format!("{}/{}", prefix, relative)
                }
            }
            RenamePolicy::Absolute => to_archive_path(&root.join(relative)),
        }
    }
}

/// `/`-separated archive name for a filesystem path; root and `.` components
/// are dropped.
pub fn to_archive_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Destination path for an archive name below `dest`, `None` when the name
/// would escape it.
pub fn safe_join(dest: &Path, name: &str) -> Option<PathBuf> {
    let mut out = dest.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            Component::ParentDir => return None,
            _ => {}
        }
    }
    if depth == 0 {
        None
    } else {
        Some(out)
    }
}
