//! Download: fetch a remote directory and pack it into a local archive.

use super::steps::{self, ArchiveSpec};
use super::JobContext;
use crate::archive::{safe_join, RenamePolicy};
use crate::destination::{list_recursive, RemoteKind};
use crate::fs::metadata::set_mtime;
use crate::queue::item::DownloadPayload;
use crate::queue::Status;
use crate::resumable::{Execution, StepResult};
use crate::utils::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::{info, warn};

/// One remote entry to fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RemoteItem {
    relative: String,
    path: String,
    kind: RemoteKind,
    modify_time: u64,
}

pub fn run(job: &mut JobContext, exec: &mut Execution, payload: &DownloadPayload) -> StepResult<()> {
    let files = job.workspace_path("files");
    let archive = job.workspace_path("download.tar");

    job.enter(Status::Downloading, &format!("Downloading {}", payload.remote_dir))?;
    let items: Vec<RemoteItem> = exec.func("download:list", |_| {
        let items: Vec<RemoteItem> = list_recursive(&*job.destination, &payload.remote_dir)?
            .into_iter()
            .map(|(relative, entry)| RemoteItem {
                relative,
                path: entry.path,
                kind: entry.kind,
                modify_time: entry.modify_time,
            })
            .collect();
        info!(job_id = %job.item.id, entries = items.len(), "Remote directory listed");
        Ok(items)
    })?;

    fs::create_dir_all(&files)?;
    exec.foreach("download:fetch", &items, |exec, index, item| {
        let local = safe_join(&files, &item.relative)
            .ok_or_else(|| EngineError::Destination(format!("unsafe remote name {:?}", item.relative)))?;
        match item.kind {
            RemoteKind::Dir => fs::create_dir_all(&local)?,
            RemoteKind::File => {
                steps::download_file(job, exec, &item.path, &local)?;
                set_mtime(&local, item.modify_time)?;
            }
            other => warn!("Skipping remote {} of kind {:?}", item.path, other),
        }
        job.item.progress.set_sub(index as u64 + 1, items.len() as u64, item.relative.as_str());
        Ok(())
    })?;

    exec.func("download:dir-times", |_| {
        // Children were written after their directories; deepest first.
        let mut dirs: Vec<&RemoteItem> = items.iter().filter(|i| i.kind == RemoteKind::Dir).collect();
        dirs.sort_by_key(|i| std::cmp::Reverse(i.relative.matches('/').count()));
        for dir in dirs {
            if let Some(local) = safe_join(&files, &dir.relative) {
                set_mtime(&local, dir.modify_time)?;
            }
        }
        Ok(())
    })?;

    job.enter(Status::Archiving, "Packing downloaded files")?;
    let sources = [files.clone()];
    let spec = ArchiveSpec {
        sources: &sources,
        exclude: &[],
        policy: RenamePolicy::Relative,
        archive: &archive,
        listing: None,
    };
    steps::archive_sources(job, exec, "archive", &spec)?;

    exec.func("publish", |_| {
        steps::publish(&archive, &payload.output)?;
        info!(job_id = %job.item.id, output = %payload.output.display(), "Download archive ready");
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{list, EntryType};
    use crate::queue::JobPayload;
    use crate::tasks::testing::Harness;
    use crate::Result;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn seed_remote(root: &std::path::Path) -> Result<()> {
        let dir = root.join("remote/site");
        fs::create_dir_all(dir.join("assets/img"))?;
        fs::write(dir.join("index.html"), vec![b'x'; 10_000])?;
        fs::write(dir.join("assets/app.js"), vec![b'y'; 2_500])?;
        fs::write(dir.join("assets/img/logo.png"), vec![0u8; 7_000])?;
        fs::write(dir.join("assets/empty"), b"")?;
        Ok(())
    }

    fn download(root: &std::path::Path, budget_secs: u64, output: &str) -> Result<(Status, usize, PathBuf)> {
        let mut harness = Harness::new(root, budget_secs, 1024)?;
        let output = root.join(output);
        let item = harness.queue.add(JobPayload::Download(DownloadPayload {
            remote_dir: "/site".to_string(),
            output: output.clone(),
        }))?;
        let (status, invocations) = harness.run_to_end(&item.id)?;
        Ok((status, invocations, output))
    }

    #[test]
    fn test_interrupted_download_matches_uninterrupted() -> Result<()> {
        let temp_dir = TempDir::new()?;
        seed_remote(temp_dir.path())?;

        let (status, invocations, resumed) = download(temp_dir.path(), 0, "resumed.tar")?;
        assert_eq!(status, Status::Done);
        assert!(invocations > 10);

        let (status, invocations, straight) = download(temp_dir.path(), 3600, "straight.tar")?;
        assert_eq!(status, Status::Done);
        assert_eq!(invocations, 1);

        assert_eq!(fs::metadata(&resumed)?.len(), fs::metadata(&straight)?.len());
        let resumed_entries = list(&resumed)?;
        let straight_entries = list(&straight)?;
        let summary = |headers: &[crate::archive::Header]| {
            headers
                .iter()
                .map(|h| (h.path.clone(), h.size, h.mtime, h.entry_type))
                .collect::<Vec<_>>()
        };
        assert_eq!(summary(&resumed_entries), summary(&straight_entries));

        let names: Vec<&str> = resumed_entries.iter().map(|h| h.path.as_str()).collect();
        assert_eq!(
            names,
            vec!["assets/", "assets/app.js", "assets/empty", "assets/img/", "assets/img/logo.png", "index.html"]
        );
        assert_eq!(resumed_entries[0].entry_type, EntryType::Directory);
        assert_eq!(resumed_entries[5].size, 10_000);

        // No checkpoint or step records left behind.
        let leftovers: Vec<_> = walkdir::WalkDir::new(temp_dir.path().join("data"))
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name().to_string_lossy();
                name.ends_with(".ckpt") || name.ends_with(".step")
            })
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }
}
