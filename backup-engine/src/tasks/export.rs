//! Export: pack local sources into a local `.tar.gz`.

use super::steps::{self, ArchiveSpec};
use super::JobContext;
use crate::archive::RenamePolicy;
use crate::queue::item::ExportPayload;
use crate::queue::{format_bytes, Status};
use crate::resumable::{Execution, StepResult};
use tracing::info;

pub fn run(job: &mut JobContext, exec: &mut Execution, payload: &ExportPayload) -> StepResult<()> {
    let archive = job.workspace_path("export.tar");

    job.enter(Status::Preparing, "Preparing export")?;
    let total: u64 = exec.func("prepare", |_| Ok(steps::total_size(&payload.sources, &payload.exclude)?))?;

    job.enter(Status::Archiving, &format!("Archiving {}", format_bytes(total)))?;
    let spec = ArchiveSpec {
        sources: &payload.sources,
        exclude: &payload.exclude,
        policy: RenamePolicy::Absolute,
        archive: &archive,
        listing: None,
    };
    steps::archive_sources(job, exec, "archive", &spec)?;

    job.enter(Status::Compressing, "Compressing export")?;
    let compressed = steps::compress(job, exec, "compress", &archive)?;

    exec.func("publish", |_| {
        steps::publish(&compressed, &payload.output)?;
        info!(job_id = %job.item.id, output = %payload.output.display(), "Export ready");
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::list;
    use crate::queue::JobPayload;
    use crate::tasks::testing::Harness;
    use crate::Result;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_export_single_file_and_tree() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let tree = temp_dir.path().join("tree");
        fs::create_dir_all(&tree)?;
        fs::write(tree.join("one"), b"1")?;
        let single = temp_dir.path().join("single.cfg");
        fs::write(&single, b"key = value")?;

        let mut harness = Harness::new(temp_dir.path(), 0, 1024)?;
        let output = temp_dir.path().join("out/export.tar.gz");
        let item = harness.queue.add(JobPayload::Export(ExportPayload {
            sources: vec![tree.clone(), single.clone()],
            exclude: vec![],
            output: output.clone(),
        }))?;
        assert_eq!(harness.run_to_end(&item.id)?.0, Status::Done);

        let names: Vec<String> = list(&output)?.into_iter().map(|h| h.path).collect();
        assert_eq!(
            names,
            vec![
                crate::archive::to_archive_path(&tree.join("one")),
                crate::archive::to_archive_path(&single),
            ]
        );
        Ok(())
    }
}
