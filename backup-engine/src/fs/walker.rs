//! Ordered directory traversal.
//!
//! Walks are depth-first with siblings sorted by name, so the visiting order
//! equals the component-wise ordering of relative paths. The resumable scanner
//! relies on that: everything at or before a saved cursor path was visited.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Exclude patterns. A pattern starting with `/` is anchored at the walk
    /// root and excludes that relative path (and everything below it); any
    /// other pattern excludes entries whose file name equals it.
    pub exclude_patterns: Vec<String>,

    /// Keep going when an entry disappears between listing and stat
    pub ignore_vanished: bool,
}

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the entry
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes (0 for non-regular files)
    pub size: u64,

    pub is_dir: bool,
    pub is_symlink: bool,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let metadata = entry.path().symlink_metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        Ok(Self {
            size: if metadata.is_file() { metadata.len() } else { 0 },
            is_dir: metadata.is_dir(),
            is_symlink: metadata.file_type().is_symlink(),
            path,
            relative_path,
        })
    }
}

/// Walk the tree below `root` (the root itself is not reported), calling
/// `callback` for each entry in depth-first name order. The callback may stop
/// the walk early by returning `Ok(false)`.
pub fn walk_directory_with_callback<F, E>(
    root: &Path,
    options: &WalkOptions,
    mut callback: F,
) -> Result<(), E>
where
    F: FnMut(FileInfo) -> Result<bool, E>,
    E: From<std::io::Error>,
{
    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .min_depth(1)
        .sort_by_file_name();

    let mut iter = walker.into_iter();
    while let Some(entry) = iter.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if options.ignore_vanished && is_vanished(&e) => {
                tracing::info!("Skipping vanished entry: {}", e);
                continue;
            }
            Err(e) => return Err(std::io::Error::from(e).into()),
        };

        if should_exclude(&entry, root, &options.exclude_patterns) {
            if entry.file_type().is_dir() {
                iter.skip_current_dir();
            }
            continue;
        }

        let info = match FileInfo::from_entry(&entry, root) {
            Ok(info) => info,
            Err(e) if options.ignore_vanished && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Skipping vanished entry: {}", entry.path().display());
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if !callback(info)? {
            break;
        }
    }

    Ok(())
}

/// Walk a directory tree and collect all entries
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    walk_directory_with_callback(root, options, |info| {
        files.push(info);
        Ok::<_, std::io::Error>(true)
    })?;
    Ok(files)
}

/// Calculate total size of all regular files in a directory
pub fn calculate_total_size(root: &Path, options: &WalkOptions) -> std::io::Result<u64> {
    let mut total_size = 0u64;
    walk_directory_with_callback(root, options, |file| {
        total_size += file.size;
        Ok::<_, std::io::Error>(true)
    })?;
    Ok(total_size)
}

fn is_vanished(e: &walkdir::Error) -> bool {
    e.io_error()
        .map(|io| io.kind() == std::io::ErrorKind::NotFound)
        .unwrap_or(false)
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, root: &Path, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());

    for pattern in patterns {
        match pattern.strip_prefix('/') {
            Some(anchored) => {
                if relative == Path::new(anchored) {
                    return true;
                }
            }
            None => {
                if file_name == pattern.as_str() {
                    return true;
                }
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn names(files: &[FileInfo]) -> Vec<String> {
        files
            .iter()
            .map(|f| f.relative_path.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_order_is_depth_first_by_name() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("b"))?;
        fs::write(temp_dir.path().join("b/c.txt"), b"content")?;
        fs::write(temp_dir.path().join("a.txt"), b"content1")?;
        fs::write(temp_dir.path().join("c.txt"), b"content2")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(names(&files), vec!["a.txt", "b", "b/c.txt", "c.txt"]);

        // Visiting order matches path ordering, which the scan cursor depends on.
        let mut sorted: Vec<PathBuf> = files.iter().map(|f| f.relative_path.clone()).collect();
        sorted.sort();
        assert_eq!(
            sorted,
            files.iter().map(|f| f.relative_path.clone()).collect::<Vec<_>>()
        );
        Ok(())
    }

    #[test]
    fn test_calculate_total_size() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::write(temp_dir.path().join("file1.txt"), b"12345")?;
        fs::create_dir(temp_dir.path().join("sub"))?;
        fs::write(temp_dir.path().join("sub/file2.txt"), b"1234567")?;

        let total = calculate_total_size(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(total, 12);

        Ok(())
    }

    #[test]
    fn test_exclude_patterns() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::write(temp_dir.path().join("file.txt"), b"keep")?;
        fs::write(temp_dir.path().join(".DS_Store"), b"exclude")?;
        fs::create_dir_all(temp_dir.path().join("cache/deep"))?;
        fs::write(temp_dir.path().join("cache/deep/x"), b"exclude")?;

        let options = WalkOptions {
            exclude_patterns: vec![".DS_Store".into(), "/cache".into()],
            ..Default::default()
        };
        let files = walk_directory(temp_dir.path(), &options)?;
        assert_eq!(names(&files), vec!["file.txt"]);

        Ok(())
    }
}
