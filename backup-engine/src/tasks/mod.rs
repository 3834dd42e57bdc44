//! Job types and the invocation runner.
//!
//! Every invocation loads one job, replays its task from the top through an
//! [`Execution`] (finished steps are skipped) and maps the way the task
//! stopped onto the job's status.

pub mod backup;
pub mod download;
pub mod export;
pub mod extract;
pub mod manifest;
pub mod reindex;
pub mod restore;
pub mod retention;
pub mod steps;
pub mod system;

use crate::config::Config;
use crate::destination::Destination;
use crate::queue::{JobPayload, JobStore, Queue, QueueItem, Status};
use crate::resumable::{Execution, Interrupt, StepResult};
use crate::utils::errors::Result;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// Everything a task touches while it runs.
pub struct JobContext<'a> {
    pub item: QueueItem,
    pub queue: &'a Queue,
    pub destination: &'a mut dyn Destination,
    pub config: &'a Config,
}

impl<'a> JobContext<'a> {
    pub fn store(&self) -> &dyn JobStore {
        self.queue.store()
    }

    /// Path inside the job's workspace.
    pub fn workspace_path(&self, name: &str) -> PathBuf {
        self.item.workspace.join(name)
    }

    /// Where archive and gzip checkpoints of this job live.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.workspace_path("ckpt")
    }

    /// Enter a phase unless the job is already there or past it.
    pub fn enter(&mut self, status: Status, message: &str) -> Result<()> {
        self.item.enter(self.queue.store(), status, message)
    }

    pub fn add_error(&mut self, reason: &str) -> Result<()> {
        warn!(job_id = %self.item.id, "{}", reason);
        self.item.add_error(self.queue.store(), reason)
    }
}

/// How an invocation left the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Budget used up; run again to continue
    Suspended,
    Finished(Status),
}

/// Run one invocation of job `id`.
pub fn run_job(queue: &Queue, destination: &mut dyn Destination, config: &Config, id: &str) -> Result<RunOutcome> {
    let item = queue.get(id)?;
    if item.is_terminal() {
        info!(job_id = %item.id, status = %item.status, "Job already finished");
        return Ok(RunOutcome::Finished(item.status));
    }

    std::fs::create_dir_all(&item.workspace)?;
    let mut exec = Execution::new(
        &item.workspace.join("steps"),
        config.execution_budget(),
        config.limits.chunk_size,
    )
    .with_abort_file(&queue.abort_file(&item));

    info!(
        job_id = %item.id,
        job_type = ?item.job_type,
        status = %item.status,
        "Running job"
    );

    let mut job = JobContext {
        item,
        queue,
        destination,
        config,
    };
    let result = execute(&mut job, &mut exec);
    if let Err(e) = job.destination.disconnect() {
        warn!(job_id = %job.item.id, "Failed to disconnect: {}", e);
    }
    settle(job, &exec, result)
}

fn execute(job: &mut JobContext, exec: &mut Execution) -> StepResult<()> {
    exec.check_abort()?;
    job.destination.connect()?;

    match job.item.payload.clone() {
        JobPayload::Backup(payload) => backup::run(job, exec, &payload),
        JobPayload::Restore(payload) => restore::run(job, exec, &payload),
        JobPayload::Download(payload) => download::run(job, exec, &payload),
        JobPayload::Export(payload) => export::run(job, exec, &payload),
        JobPayload::Extract(payload) => extract::run(job, exec, &payload),
        JobPayload::Reindex(payload) => reindex::run(job, exec, &payload),
        JobPayload::RetentionCleanup(payload) => retention::run(job, exec, &payload),
        JobPayload::System(payload) => system::run(job, exec, &payload),
    }
}

/// Persist the status that follows from how the task stopped.
fn settle(mut job: JobContext, exec: &Execution, result: StepResult<()>) -> Result<RunOutcome> {
    let store = job.queue.store();
    let status = match result {
        Ok(()) => {
            if job.item.errors > 0 {
                job.item.message = Some("Completed with errors (see logs)".to_string());
                Status::Partially
            } else {
                job.item.message = Some("Completed".to_string());
                Status::Done
            }
        }
        Err(Interrupt::Suspend) => {
            job.item.progress.sub_message = "Waiting for next invocation".to_string();
            job.item.updated_at = chrono::Utc::now();
            store.save(&job.item)?;
            info!(
                job_id = %job.item.id,
                status = %job.item.status,
                elapsed_ms = exec.elapsed().as_millis() as u64,
                "Job suspended"
            );
            return Ok(RunOutcome::Suspended);
        }
        Err(Interrupt::Abort) => {
            job.item.message = Some("Aborted by user".to_string());
            Status::Aborted
        }
        Err(Interrupt::Fail(e)) => {
            error!(job_id = %job.item.id, "Job failed: {}", e);
            job.item.message = Some(e.to_string());
            Status::Failed
        }
    };

    job.item.update_status(store, status)?;
    job.queue.clear_signals(&job.item)?;
    if let Err(Interrupt::Fail(e)) = exec.clear() {
        return Err(e);
    }
    if status == Status::Done {
        match std::fs::remove_dir_all(&job.item.workspace) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    info!(
        job_id = %job.item.id,
        status = %status,
        errors = job.item.errors,
        "Job finished"
    );
    Ok(RunOutcome::Finished(status))
}


#[cfg(test)]
mod tests {
    use super::testing::Harness;
    use super::*;
    use crate::queue::item::{ExtractPayload, SystemPayload};
    use tempfile::TempDir;

    #[test]
    fn test_abort_signal_aborts_running_job() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut harness = Harness::new(temp_dir.path(), 0, 1024)?;
        let item = harness.queue.add(JobPayload::Extract(ExtractPayload {
            archive: temp_dir.path().join("missing.tar"),
            target: temp_dir.path().join("out"),
        }))?;

        let mut running = harness.queue.get(&item.id)?;
        running.update_status(harness.queue.store(), Status::Preparing)?;
        harness.queue.abort(&item.id)?;
        assert!(harness.queue.abort_file(&running).exists());

        let outcome = run_job(&harness.queue, &mut harness.destination, &harness.config, &item.id)?;
        assert_eq!(outcome, RunOutcome::Finished(Status::Aborted));
        assert!(!harness.queue.abort_file(&running).exists());
        Ok(())
    }

    #[test]
    fn test_failure_is_recorded() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut harness = Harness::new(temp_dir.path(), 60, 1024)?;
        let item = harness.queue.add(JobPayload::Extract(ExtractPayload {
            archive: temp_dir.path().join("missing.tar"),
            target: temp_dir.path().join("out"),
        }))?;

        let (status, _) = harness.run_to_end(&item.id)?;
        assert_eq!(status, Status::Failed);
        let item = harness.queue.get(&item.id)?;
        assert!(item.message.is_some());
        assert!(!item.workspace.join("steps").exists());
        Ok(())
    }

    #[test]
    fn test_terminal_job_is_not_rerun() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut harness = Harness::new(temp_dir.path(), 60, 1024)?;
        let item = harness.queue.add(JobPayload::System(SystemPayload { max_age_days: 30 }))?;

        assert_eq!(harness.run_to_end(&item.id)?.0, Status::Done);
        let before = harness.queue.get(&item.id)?.updated_at;
        let outcome = run_job(&harness.queue, &mut harness.destination, &harness.config, &item.id)?;
        assert_eq!(outcome, RunOutcome::Finished(Status::Done));
        assert_eq!(harness.queue.get(&item.id)?.updated_at, before);
        Ok(())
    }
}
