//! Job queue and state machine.
//!
//! Jobs are persisted through a [`JobStore`]. Operator actions (abort,
//! start-over, confirm) only touch the record or drop a signal file; the
//! running task observes them at its next checkpoint boundary.

pub mod item;
pub mod progress;
pub mod store;

pub use item::{JobPayload, JobType, QueueItem, Status};
pub use progress::{format_bytes, Progress};
pub use store::{FileJobStore, JobStore};

use crate::fs::state::remove_if_exists;
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

/// Prefix of abort signal files in the signals directory.
pub const ABORT_PREFIX: &str = "abort.";
/// Prefix of restore confirmation files in the signals directory.
pub const CONFIRM_PREFIX: &str = "confirm.";

pub struct Queue {
    store: Box<dyn JobStore>,
    workspaces_dir: PathBuf,
    logs_dir: PathBuf,
    signals_dir: PathBuf,
}

impl Queue {
    pub fn new(store: Box<dyn JobStore>, workspaces_dir: &Path, logs_dir: &Path, signals_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(workspaces_dir)?;
        std::fs::create_dir_all(logs_dir)?;
        std::fs::create_dir_all(signals_dir)?;
        Ok(Self {
            store,
            workspaces_dir: workspaces_dir.to_path_buf(),
            logs_dir: logs_dir.to_path_buf(),
            signals_dir: signals_dir.to_path_buf(),
        })
    }

    /// File-backed queue rooted at `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let store = FileJobStore::new(&data_dir.join("jobs"))?;
        Self::new(
            Box::new(store),
            &data_dir.join("workspaces"),
            &data_dir.join("logs"),
            &data_dir.join("signals"),
        )
    }

    pub fn store(&self) -> &dyn JobStore {
        self.store.as_ref()
    }

    pub fn add(&self, payload: JobPayload) -> Result<QueueItem> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let item = QueueItem {
            unique_id: Uuid::new_v4().simple().to_string(),
            job_type: payload.job_type(),
            status: Status::Pending,
            created_at: now,
            updated_at: now,
            workspace: self.workspaces_dir.join(&id),
            log_file: self.logs_dir.join(format!("{}.log", id)),
            progress: Progress::new(payload.total_steps()),
            payload,
            errors: 0,
            message: None,
            id,
        };
        self.store.save(&item)?;
        info!(job_id = %item.id, job_type = ?item.job_type, "Job queued");
        Ok(item)
    }

    pub fn get(&self, id: &str) -> Result<QueueItem> {
        self.store
            .load(id)?
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))
    }

    pub fn list(&self) -> Result<Vec<QueueItem>> {
        self.store.list()
    }

    /// Oldest job that has not finished.
    pub fn next_pending(&self) -> Result<Option<QueueItem>> {
        Ok(self.store.list()?.into_iter().find(|item| !item.is_terminal()))
    }

    pub fn abort_file(&self, item: &QueueItem) -> PathBuf {
        self.signals_dir.join(format!("{}{}", ABORT_PREFIX, item.unique_id))
    }

    pub fn confirm_file(&self, item: &QueueItem) -> PathBuf {
        self.signals_dir.join(format!("{}{}", CONFIRM_PREFIX, item.unique_id))
    }

    /// Request an abort. A job that never started is aborted on the spot;
    /// a running one sees the signal at its next checkpoint.
    pub fn abort(&self, id: &str) -> Result<QueueItem> {
        let mut item = self.get(id)?;
        if item.is_terminal() {
            return Ok(item);
        }
        if item.status == Status::Pending {
            item.message = Some("Aborted before start".to_string());
            item.update_status(self.store(), Status::Aborted)?;
            return Ok(item);
        }
        std::fs::write(self.abort_file(&item), b"")?;
        info!(job_id = %item.id, "Abort requested");
        Ok(item)
    }

    /// Reset a job to `Pending`, dropping its workspace, progress and errors.
    pub fn start_over(&self, id: &str) -> Result<QueueItem> {
        let mut item = self.get(id)?;
        remove_if_exists(&self.abort_file(&item))?;
        remove_if_exists(&self.confirm_file(&item))?;
        match std::fs::remove_dir_all(&item.workspace) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        item.unique_id = Uuid::new_v4().simple().to_string();
        item.status = Status::Pending;
        item.progress = Progress::new(item.payload.total_steps());
        item.errors = 0;
        item.message = None;
        item.updated_at = Utc::now();
        self.store.save(&item)?;
        info!(job_id = %item.id, "Job reset to pending");
        Ok(item)
    }

    /// Confirm a restore that waits for an operator. The confirmation is a
    /// signal file, so a running invocation saving its own copy of the
    /// record cannot lose it.
    pub fn confirm(&self, id: &str) -> Result<QueueItem> {
        let item = self.get(id)?;
        if !matches!(item.payload, JobPayload::Restore(_)) {
            return Err(EngineError::Unsupported(format!(
                "{:?} jobs take no confirmation",
                item.job_type
            )));
        }
        if item.is_terminal() {
            return Ok(item);
        }
        std::fs::write(self.confirm_file(&item), b"")?;
        info!(job_id = %item.id, "Restore confirmed");
        Ok(item)
    }

    /// Whether the job was confirmed at enqueue time or since.
    pub fn is_confirmed(&self, item: &QueueItem) -> bool {
        match &item.payload {
            JobPayload::Restore(restore) => restore.confirmed || self.confirm_file(item).exists(),
            _ => false,
        }
    }

    /// Drop the signal files of a job that reached a final status.
    pub fn clear_signals(&self, item: &QueueItem) -> Result<()> {
        remove_if_exists(&self.abort_file(item))?;
        remove_if_exists(&self.confirm_file(item))?;
        Ok(())
    }

    /// Delete a finished job with its workspace and log.
    pub fn purge(&self, item: &QueueItem) -> Result<()> {
        if !item.is_terminal() {
            return Err(EngineError::InvalidTransition {
                from: item.status.to_string(),
                to: "purged".to_string(),
            });
        }
        match std::fs::remove_dir_all(&item.workspace) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        remove_if_exists(&item.log_file)?;
        self.clear_signals(item)?;
        self.store.remove(&item.id)
    }
}
