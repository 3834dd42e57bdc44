//! Reindex: rebuild the local backup index from destination manifests.

use super::manifest::{Index, Manifest};
use super::JobContext;
use crate::destination::{RemoteEntry, RemoteKind};
use crate::fs::state;
use crate::queue::item::ReindexPayload;
use crate::queue::Status;
use crate::resumable::{Execution, StepResult};
use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

pub fn index_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("index.json")
}

pub fn run(job: &mut JobContext, exec: &mut Execution, payload: &ReindexPayload) -> StepResult<()> {
    let manifests_dir = job.workspace_path("manifests");

    job.enter(Status::Indexing, &format!("Indexing {}", payload.destination_dir))?;
    let entries: Vec<RemoteEntry> = exec.func("reindex:list", |_| {
        Ok(job
            .destination
            .list_dir(&payload.destination_dir)?
            .into_iter()
            .filter(|e| e.kind == RemoteKind::File && e.name.ends_with(".json"))
            .collect())
    })?;

    fs::create_dir_all(&manifests_dir)?;
    exec.foreach("reindex:fetch", &entries, |_, index, entry| {
        job.destination
            .copy_file_to_local(&entry.path, &manifests_dir.join(&entry.name))?;
        job.item
            .progress
            .set_sub(index as u64 + 1, entries.len() as u64, entry.name.as_str());
        Ok(())
    })?;

    exec.func("reindex:write", |_| {
        let mut backups = Vec::new();
        for entry in &entries {
            let path = manifests_dir.join(&entry.name);
            match serde_json::from_slice::<Manifest>(&fs::read(&path)?) {
                Ok(manifest) => backups.push(manifest),
                Err(e) => warn!("Skipping {}: {}", entry.path, e),
            }
        }
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let index = Index {
            updated_at: Some(Utc::now()),
            backups,
        };
        let path = index_path(&job.config.engine.data_dir);
        state::store(&path, &index)?;
        info!(job_id = %job.item.id, backups = index.backups.len(), path = %path.display(), "Index written");
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobPayload;
    use crate::tasks::manifest::MANIFEST_VERSION;
    use crate::tasks::testing::Harness;
    use crate::Result;
    use chrono::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_index_lists_newest_first() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let remote = temp_dir.path().join("remote/b");
        fs::create_dir_all(&remote)?;
        for (name, age) in [("old", 3), ("new", 1), ("mid", 2)] {
            let manifest = Manifest {
                version: MANIFEST_VERSION,
                name: name.to_string(),
                job_id: "seed".to_string(),
                instance: "test".to_string(),
                archive: format!("/b/{}.tar.gz", name),
                archive_size: 0,
                created_at: Utc::now() - Duration::days(age),
                sources: vec![],
                total_files: 0,
                total_bytes: 0,
                errors: 0,
            };
            fs::write(remote.join(format!("{}.json", name)), serde_json::to_vec(&manifest)?)?;
        }
        fs::write(remote.join("broken.json"), b"{")?;

        let mut harness = Harness::new(temp_dir.path(), 0, 1024)?;
        let item = harness.queue.add(JobPayload::Reindex(ReindexPayload {
            destination_dir: "/b".to_string(),
        }))?;
        assert_eq!(harness.run_to_end(&item.id)?.0, Status::Done);

        let index: Index = state::load(&index_path(&harness.config.engine.data_dir))?
            .ok_or_else(|| crate::EngineError::FileNotFound("index".into()))?;
        let names: Vec<&str> = index.backups.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["new", "mid", "old"]);
        Ok(())
    }
}
