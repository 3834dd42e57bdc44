//! Extract: unpack a local archive into a directory.

use super::steps;
use super::JobContext;
use crate::archive::reader::is_gzipped;
use crate::queue::item::ExtractPayload;
use crate::queue::Status;
use crate::resumable::{Execution, StepResult};
use crate::utils::errors::EngineError;

pub fn run(job: &mut JobContext, exec: &mut Execution, payload: &ExtractPayload) -> StepResult<()> {
    let file_name = payload
        .archive
        .file_name()
        .ok_or_else(|| EngineError::FileNotFound(payload.archive.display().to_string()))?;
    let local = job.item.workspace.join(file_name);

    // Work on a private copy; the original may be replaced while we run.
    job.enter(Status::Preparing, "Copying archive")?;
    exec.file_merge("copy", &payload.archive, &local)?;

    let archive = if is_gzipped(&local) {
        job.enter(Status::Decompressing, "Decompressing archive")?;
        steps::decompress(job, exec, "decompress", &local)?
    } else {
        local
    };

    job.enter(Status::Extracting, &format!("Extracting into {}", payload.target.display()))?;
    steps::extract(job, exec, "extract", &archive, &payload.target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveOptions, ArchiveWriter, RenamePolicy};
    use crate::fs::metadata::EntryMetadata;
    use crate::gzip::{self, GzipOptions};
    use crate::queue::JobPayload;
    use crate::tasks::testing::Harness;
    use crate::Result;
    use std::fs;
    use std::ops::ControlFlow;
    use tempfile::TempDir;

    #[test]
    fn test_extract_gzipped_archive_in_small_steps() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let tree = temp_dir.path().join("tree");
        fs::create_dir_all(tree.join("d"))?;
        fs::write(tree.join("d/big"), vec![3u8; 50_000])?;
        fs::write(tree.join("small"), b"s")?;

        let archive = temp_dir.path().join("tree.tar");
        let mut writer = ArchiveWriter::open(&archive, ArchiveOptions::default())?;
        writer.append_directory(&tree, &RenamePolicy::Relative)?;
        writer.append_data("../evil", &EntryMetadata::for_data(1, 0), b"x")?;
        writer.finish()?;
        let mut never = |_: u64, _: u64| ControlFlow::Continue(());
        gzip::compress(&archive, &GzipOptions::default(), &mut never)?;

        let mut harness = Harness::new(temp_dir.path(), 0, 4096)?;
        let target = temp_dir.path().join("out");
        let item = harness.queue.add(JobPayload::Extract(ExtractPayload {
            archive: temp_dir.path().join("tree.tar.gz"),
            target: target.clone(),
        }))?;
        let (status, invocations) = harness.run_to_end(&item.id)?;

        // The unsafe entry is refused and reported.
        assert_eq!(status, Status::Partially);
        assert!(invocations > 3);
        assert_eq!(fs::read(target.join("d/big"))?, vec![3u8; 50_000]);
        assert_eq!(fs::read(target.join("small"))?, b"s");
        assert!(!temp_dir.path().join("evil").exists());
        assert_eq!(harness.queue.get(&item.id)?.errors, 1);
        // The source archive is left alone.
        assert!(temp_dir.path().join("tree.tar.gz").exists());
        Ok(())
    }

    #[test]
    fn test_blocked_entries_end_partially() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = temp_dir.path().join("blocked.tar");
        let meta = EntryMetadata::for_data(0, 1_500_000_000);
        let mut writer = ArchiveWriter::open(&archive, ArchiveOptions::default())?;
        writer.append_data("x", &meta, b"file")?;
        writer.append_data("x/y", &meta, b"child")?;
        writer.append_data("d", &meta, &[5u8; 9000])?;
        writer.append_data("z", &meta, b"last")?;
        writer.finish()?;

        let target = temp_dir.path().join("out");
        fs::create_dir_all(target.join("d"))?;

        let mut harness = Harness::new(temp_dir.path(), 0, 4096)?;
        let item = harness.queue.add(JobPayload::Extract(ExtractPayload {
            archive,
            target: target.clone(),
        }))?;
        assert_eq!(harness.run_to_end(&item.id)?.0, Status::Partially);

        assert_eq!(fs::read(target.join("x"))?, b"file");
        assert!(target.join("d").is_dir());
        assert_eq!(fs::read(target.join("z"))?, b"last");
        assert_eq!(harness.queue.get(&item.id)?.errors, 1);
        Ok(())
    }
}
