//! System housekeeping: purge finished jobs past their retention.

use super::JobContext;
use crate::queue::item::SystemPayload;
use crate::queue::Status;
use crate::resumable::{Execution, StepResult};
use chrono::{Duration, Utc};
use tracing::info;

pub fn run(job: &mut JobContext, exec: &mut Execution, payload: &SystemPayload) -> StepResult<()> {
    job.enter(Status::Cleaning, "Purging finished jobs")?;
    let cutoff = Utc::now() - Duration::days(i64::from(payload.max_age_days));

    let expired: Vec<String> = exec.func("system:select", |_| {
        Ok(job
            .queue
            .list()?
            .into_iter()
            .filter(|item| item.is_terminal() && item.updated_at < cutoff && item.id != job.item.id)
            .map(|item| item.id)
            .collect())
    })?;

    exec.foreach("system:purge", &expired, |_, _, id| {
        // Purged concurrently or started over since selection.
        if let Some(item) = job.queue.store().load(id)? {
            if item.is_terminal() {
                job.queue.purge(&item)?;
                info!(job_id = %id, "Purged finished job");
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::item::ExtractPayload;
    use crate::queue::JobPayload;
    use crate::tasks::testing::Harness;
    use crate::Result;
    use tempfile::TempDir;

    #[test]
    fn test_purges_only_old_finished_jobs() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut harness = Harness::new(temp_dir.path(), 60, 1024)?;
        let extract = |name: &str| {
            JobPayload::Extract(ExtractPayload {
                archive: temp_dir.path().join(name),
                target: temp_dir.path().join("out"),
            })
        };

        let mut old = harness.queue.add(extract("old.tar"))?;
        old.update_status(harness.queue.store(), Status::Failed)?;
        old.updated_at = Utc::now() - Duration::days(40);
        harness.queue.store().save(&old)?;
        std::fs::create_dir_all(&old.workspace)?;

        let mut recent = harness.queue.add(extract("recent.tar"))?;
        recent.update_status(harness.queue.store(), Status::Failed)?;
        let pending = harness.queue.add(extract("pending.tar"))?;

        let system = harness.queue.add(JobPayload::System(SystemPayload { max_age_days: 30 }))?;
        assert_eq!(harness.run_to_end(&system.id)?.0, Status::Done);

        assert!(harness.queue.store().load(&old.id)?.is_none());
        assert!(!old.workspace.exists());
        assert!(harness.queue.store().load(&recent.id)?.is_some());
        assert!(harness.queue.store().load(&pending.id)?.is_some());
        Ok(())
    }
}
