//! Job record persistence.

use super::item::QueueItem;
use crate::fs::state;
use crate::utils::errors::Result;
use std::path::{Path, PathBuf};

/// Load/save boundary for job records.
pub trait JobStore {
    fn load(&self, id: &str) -> Result<Option<QueueItem>>;
    fn save(&self, item: &QueueItem) -> Result<()>;
    /// All jobs, oldest first
    fn list(&self) -> Result<Vec<QueueItem>>;
    fn remove(&self, id: &str) -> Result<()>;
}

/// One JSON document per job in a directory.
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

impl JobStore for FileJobStore {
    fn load(&self, id: &str) -> Result<Option<QueueItem>> {
        state::load(&self.path(id))
    }

    fn save(&self, item: &QueueItem) -> Result<()> {
        state::store(&self.path(&item.id), item)
    }

    fn list(&self) -> Result<Vec<QueueItem>> {
        let mut items = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                match state::load::<QueueItem>(&path) {
                    Ok(Some(item)) => items.push(item),
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Skipping unreadable job record {}: {}", path.display(), e),
                }
            }
        }
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }

    fn remove(&self, id: &str) -> Result<()> {
        state::remove(&self.path(id))
    }
}
