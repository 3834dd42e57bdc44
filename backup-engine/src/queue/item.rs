//! Queue items: job record, status machine and per-type payloads.

use super::progress::Progress;
use super::store::JobStore;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::{info, warn};

/// Job status. Variants are declared in lifecycle order; a job only ever
/// moves forward through them (operators can reset it with start-over).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Preparing,
    Downloading,
    Archiving,
    Compressing,
    Uploading,
    Decompressing,
    Extracting,
    /// Paused until an operator confirms (restore)
    WaitingForExternal,
    Restoring,
    Indexing,
    Cleaning,
    Done,
    /// Finished, with errors recorded
    Partially,
    Failed,
    Aborted,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Done | Status::Partially | Status::Failed | Status::Aborted
        )
    }

    pub fn can_transition_to(self, next: Status) -> bool {
        !self.is_terminal() && next >= self
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Preparing => "preparing",
            Status::Downloading => "downloading",
            Status::Archiving => "archiving",
            Status::Compressing => "compressing",
            Status::Uploading => "uploading",
            Status::Decompressing => "decompressing",
            Status::Extracting => "extracting",
            Status::WaitingForExternal => "waiting_for_external",
            Status::Restoring => "restoring",
            Status::Indexing => "indexing",
            Status::Cleaning => "cleaning",
            Status::Done => "done",
            Status::Partially => "partially",
            Status::Failed => "failed",
            Status::Aborted => "aborted",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Backup,
    Restore,
    Download,
    Export,
    Extract,
    Reindex,
    RetentionCleanup,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupPayload {
    /// Backup name; archive and manifest are named after it
    pub name: String,
    pub sources: Vec<PathBuf>,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Directory on the destination receiving the backup
    pub destination_dir: String,
    /// Run retention on `destination_dir` afterwards, keeping this many backups
    #[serde(default)]
    pub keep: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestorePayload {
    /// Archive path on the destination (`.tar` or `.tar.gz`)
    pub archive: String,
    pub target: PathBuf,
    #[serde(default)]
    pub require_confirmation: bool,
    /// Pre-confirmed at enqueue time; later confirmations are signal files
    #[serde(default)]
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadPayload {
    /// Directory on the destination to fetch
    pub remote_dir: String,
    /// Local archive to produce
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportPayload {
    pub sources: Vec<PathBuf>,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Local `.tar.gz` to produce
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractPayload {
    /// Local archive (`.tar` or `.tar.gz`)
    pub archive: PathBuf,
    pub target: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReindexPayload {
    pub destination_dir: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionPayload {
    pub destination_dir: String,
    pub keep: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemPayload {
    /// Finished jobs older than this are purged
    pub max_age_days: u32,
}

/// What a job does, with the parameters of its type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Backup(BackupPayload),
    Restore(RestorePayload),
    Download(DownloadPayload),
    Export(ExportPayload),
    Extract(ExtractPayload),
    Reindex(ReindexPayload),
    RetentionCleanup(RetentionPayload),
    System(SystemPayload),
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::Backup(_) => JobType::Backup,
            JobPayload::Restore(_) => JobType::Restore,
            JobPayload::Download(_) => JobType::Download,
            JobPayload::Export(_) => JobType::Export,
            JobPayload::Extract(_) => JobType::Extract,
            JobPayload::Reindex(_) => JobType::Reindex,
            JobPayload::RetentionCleanup(_) => JobType::RetentionCleanup,
            JobPayload::System(_) => JobType::System,
        }
    }

    /// Number of progress steps a job of this type reports.
    pub fn total_steps(&self) -> u32 {
        match self {
            JobPayload::Backup(p) => 5 + u32::from(p.keep.is_some()),
            JobPayload::Restore(_) => 5,
            JobPayload::Download(_) => 2,
            JobPayload::Export(_) => 3,
            JobPayload::Extract(_) => 3,
            JobPayload::Reindex(_) => 1,
            JobPayload::RetentionCleanup(_) => 1,
            JobPayload::System(_) => 1,
        }
    }
}

/// One queued job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    /// Regenerated on start-over; names the abort signal file
    pub unique_id: String,
    pub job_type: JobType,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Job-private scratch directory
    pub workspace: PathBuf,
    pub log_file: PathBuf,
    pub payload: JobPayload,
    pub progress: Progress,
    pub errors: u32,
    /// Final outcome message
    #[serde(default)]
    pub message: Option<String>,
}

impl QueueItem {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `status` and persist. Backwards moves and moves out of a
    /// terminal status are rejected.
    pub fn update_status(&mut self, store: &dyn JobStore, status: Status) -> Result<()> {
        if status == self.status {
            return Ok(());
        }
        if !self.status.can_transition_to(status) {
            return Err(EngineError::InvalidTransition {
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }
        info!(job_id = %self.id, from = %self.status, to = %status, "Job status changed");
        self.status = status;
        self.touch();
        store.save(self)
    }

    /// Enter the phase `status` unless the job is already at or past it, as
    /// happens when a resumed job replays its earlier phases.
    pub fn enter(&mut self, store: &dyn JobStore, status: Status, message: &str) -> Result<()> {
        if self.status >= status {
            return Ok(());
        }
        self.progress.advance(message, 1);
        self.update_status(store, status)
    }

    /// Advance the step counter by `increment` and set the progress message.
    pub fn update_progress(&mut self, store: &dyn JobStore, message: &str, increment: Option<u32>) -> Result<()> {
        self.progress.advance(message, increment.unwrap_or(1));
        self.touch();
        store.save(self)
    }

    /// Sub-step position within the current step.
    pub fn update_sub_progress(&mut self, store: &dyn JobStore, current: u64, total: u64, sub_message: &str) -> Result<()> {
        self.progress.set_sub(current, total, sub_message);
        self.touch();
        store.save(self)
    }

    /// Record a non-fatal failure; the job will end as `Partially`.
    pub fn add_error(&mut self, store: &dyn JobStore, reason: &str) -> Result<()> {
        self.errors += 1;
        warn!(job_id = %self.id, errors = self.errors, "{}", reason);
        self.touch();
        store.save(self)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_order() {
        assert!(Status::Pending.can_transition_to(Status::Archiving));
        assert!(Status::Archiving.can_transition_to(Status::Done));
        assert!(!Status::Compressing.can_transition_to(Status::Archiving));
        assert!(!Status::Done.can_transition_to(Status::Failed));
        assert!(Status::Aborted.is_terminal());
        assert!(!Status::WaitingForExternal.is_terminal());
    }

    #[test]
    fn test_payload_tagging() -> Result<()> {
        let json = r#"{"type":"retention_cleanup","destination_dir":"/b","keep":3}"#;
        let payload: JobPayload = serde_json::from_str(json)?;
        assert_eq!(payload.job_type(), JobType::RetentionCleanup);
        assert_eq!(
            payload,
            JobPayload::RetentionCleanup(RetentionPayload {
                destination_dir: "/b".into(),
                keep: 3
            })
        );
        Ok(())
    }
}
