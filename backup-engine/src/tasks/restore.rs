//! Restore: download a backup, unpack it into staging, then move it into
//! place, optionally after an operator confirmed.

use super::steps;
use super::JobContext;
use crate::archive::reader::is_gzipped;
use crate::fs::metadata::{EntryMetadata, FileKind};
use crate::fs::walker::{self, WalkOptions};
use crate::queue::item::RestorePayload;
use crate::queue::Status;
use crate::resumable::{Execution, Interrupt, ScanOptions, StepResult};
use crate::utils::errors::EngineError;
use std::fs;
use std::io;
use std::path::Path;
use tracing::info;

pub fn run(job: &mut JobContext, exec: &mut Execution, payload: &RestorePayload) -> StepResult<()> {
    let file_name = payload
        .archive
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| EngineError::FileNotFound(payload.archive.clone()))?;
    let local = job.workspace_path(file_name);
    let staging = job.workspace_path("staging");

    job.enter(Status::Downloading, &format!("Downloading {}", payload.archive))?;
    exec.func("download", |exec| steps::download_file(job, exec, &payload.archive, &local))?;

    let archive = if is_gzipped(&local) {
        job.enter(Status::Decompressing, "Decompressing archive")?;
        steps::decompress(job, exec, "decompress", &local)?
    } else {
        local
    };

    job.enter(Status::Extracting, "Unpacking into staging")?;
    steps::extract(job, exec, "extract", &archive, &staging)?;

    if payload.require_confirmation && !job.queue.is_confirmed(&job.item) {
        job.enter(Status::WaitingForExternal, "Waiting for confirmation")?;
        info!(job_id = %job.item.id, "Restore staged, waiting for confirmation");
        return Err(Interrupt::Suspend);
    }

    job.enter(Status::Restoring, &format!("Restoring into {}", payload.target.display()))?;
    fs::create_dir_all(&payload.target)?;
    exec.scan("restore", &staging, &ScanOptions::default(), |_, info, progress| {
        let target = payload.target.join(&info.relative_path);
        let result = if info.is_dir {
            ensure_dir(&target)
        } else {
            move_into_place(&info.path, &target)
        };
        if let Err(e) = result {
            job.add_error(&format!("Could not restore {}: {}", target.display(), e))?;
        }
        job.item.progress.set_sub(
            progress.position,
            progress.total_size,
            info.relative_path.to_string_lossy(),
        );
        Ok(())
    })?;

    exec.func("restore:dirs", |_| {
        // Directory times last, deepest first, once nothing is moved into them.
        let mut dirs: Vec<_> = walker::walk_directory(&staging, &WalkOptions::default())?
            .into_iter()
            .filter(|info| info.is_dir)
            .collect();
        dirs.sort_by_key(|info| std::cmp::Reverse(info.relative_path.components().count()));
        for dir in dirs {
            let meta = EntryMetadata::from_path(&dir.path)?;
            meta.apply_to_path(&payload.target.join(&dir.relative_path))?;
        }
        info!(job_id = %job.item.id, target = %payload.target.display(), "Restore finished");
        Ok(())
    })
}

fn ensure_dir(target: &Path) -> io::Result<()> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "a non-directory is in the way",
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(target),
        Err(e) => Err(e),
    }
}

/// Replace `target` with `source`, by rename when both share a filesystem.
fn move_into_place(source: &Path, target: &Path) -> io::Result<()> {
    if let Ok(existing) = fs::symlink_metadata(target) {
        if existing.is_dir() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "a directory is in the way"));
        }
        fs::remove_file(target)?;
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(source, target) {
        Err(e) if e.raw_os_error() == Some(nix::libc::EXDEV) => copy_across(source, target),
        other => other,
    }
}

fn copy_across(source: &Path, target: &Path) -> io::Result<()> {
    let meta = EntryMetadata::from_path(source)?;
    match meta.kind {
        FileKind::Symlink => std::os::unix::fs::symlink(fs::read_link(source)?, target)?,
        FileKind::File => {
            fs::copy(source, target)?;
            meta.apply_to_path(target)?;
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("cannot copy {:?} across filesystems", other),
            ))
        }
    }
    fs::remove_file(source)
}
