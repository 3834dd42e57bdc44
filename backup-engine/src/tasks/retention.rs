//! Retention: keep the newest backups of a destination directory.

use super::manifest::Manifest;
use super::JobContext;
use crate::destination::RemoteKind;
use crate::queue::item::RetentionPayload;
use crate::queue::Status;
use crate::resumable::{Execution, StepResult};
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::{info, warn};

/// A backup selected for removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Expired {
    name: String,
    manifest: String,
    archive: String,
}

pub fn run(job: &mut JobContext, exec: &mut Execution, payload: &RetentionPayload) -> StepResult<()> {
    job.enter(Status::Cleaning, "Applying retention")?;
    apply(job, exec, "retention", &payload.destination_dir, payload.keep)?;
    Ok(())
}

/// Remove all but the `keep` newest backups (by manifest creation time) in
/// `dir`. The selection is made once and persisted, so backups written while
/// the removal is suspended are never touched. Returns the number removed.
pub fn apply(job: &mut JobContext, exec: &mut Execution, step: &str, dir: &str, keep: usize) -> StepResult<usize> {
    let scratch = job.workspace_path("retention");
    let expired: Vec<Expired> = exec.func(&format!("{}:select", step), |_| {
        fs::create_dir_all(&scratch)?;
        let mut manifests = Vec::new();
        for entry in job.destination.list_dir(dir)? {
            if entry.kind != RemoteKind::File || !entry.name.ends_with(".json") {
                continue;
            }
            let local = scratch.join(&entry.name);
            job.destination.copy_file_to_local(&entry.path, &local)?;
            match serde_json::from_slice::<Manifest>(&fs::read(&local)?) {
                Ok(manifest) => manifests.push((entry.path, manifest)),
                Err(e) => warn!("Ignoring unreadable manifest {}: {}", entry.path, e),
            }
        }

        manifests.sort_by(|a, b| {
            b.1.created_at
                .cmp(&a.1.created_at)
                .then_with(|| b.1.name.cmp(&a.1.name))
        });
        let expired: Vec<Expired> = manifests
            .into_iter()
            .skip(keep)
            .map(|(path, manifest)| Expired {
                name: manifest.name,
                manifest: path,
                archive: manifest.archive,
            })
            .collect();
        info!(job_id = %job.item.id, dir = %dir, keep, expired = expired.len(), "Retention selected");
        Ok(expired)
    })?;

    exec.foreach(&format!("{}:remove", step), &expired, |_, _, expired| {
        // Archive first: a manifest without archive would be selected again.
        job.destination.remove_file(&expired.archive)?;
        job.destination.remove_file(&expired.manifest)?;
        info!(job_id = %job.item.id, backup = %expired.name, "Removed expired backup");
        Ok(())
    })?;

    if let Err(e) = fs::remove_dir_all(&scratch) {
        if e.kind() != std::io::ErrorKind::NotFound {
            return Err(e.into());
        }
    }
    Ok(expired.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobPayload;
    use crate::tasks::manifest::MANIFEST_VERSION;
    use crate::tasks::testing::Harness;
    use crate::Result;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn seed(remote: &std::path::Path, name: &str, age_days: i64) -> Result<()> {
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            name: name.to_string(),
            job_id: "seed".to_string(),
            instance: "test".to_string(),
            archive: format!("/keep/{}.tar.gz", name),
            archive_size: 3,
            created_at: Utc::now() - Duration::days(age_days),
            sources: vec![],
            total_files: 1,
            total_bytes: 3,
            errors: 0,
        };
        fs::write(remote.join(format!("{}.tar.gz", name)), b"tgz")?;
        fs::write(remote.join(format!("{}.json", name)), serde_json::to_vec(&manifest)?)?;
        Ok(())
    }

    #[test]
    fn test_removes_oldest_one_per_invocation() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let remote = temp_dir.path().join("remote/keep");
        fs::create_dir_all(&remote)?;
        seed(&remote, "mon", 4)?;
        seed(&remote, "tue", 3)?;
        seed(&remote, "wed", 2)?;
        seed(&remote, "thu", 1)?;
        fs::write(remote.join("notes.json"), b"not a manifest")?;

        let mut harness = Harness::new(temp_dir.path(), 0, 1024)?;
        let item = harness.queue.add(JobPayload::RetentionCleanup(RetentionPayload {
            destination_dir: "/keep".to_string(),
            keep: 2,
        }))?;
        let (status, invocations) = harness.run_to_end(&item.id)?;
        assert_eq!(status, Status::Done);
        assert_eq!(invocations, 2);

        for gone in ["mon", "tue"] {
            assert!(!remote.join(format!("{}.tar.gz", gone)).exists());
            assert!(!remote.join(format!("{}.json", gone)).exists());
        }
        for kept in ["wed", "thu"] {
            assert!(remote.join(format!("{}.tar.gz", kept)).exists());
        }
        assert!(remote.join("notes.json").exists());
        Ok(())
    }
}
