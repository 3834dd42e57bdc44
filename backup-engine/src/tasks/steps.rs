//! Resumable building blocks shared by the tasks.
//!
//! Each helper is one named step (or a family of steps sharing a prefix) and
//! can be replayed: a finished step returns at once, an unfinished one picks
//! up from its checkpoint.

use super::JobContext;
use crate::archive::{ArchiveWriter, Extractor, RenamePolicy};
use crate::fs::walker::{self, WalkOptions};
use crate::gzip;
use crate::resumable::{Execution, ScanOptions, StepResult};
use crate::utils::errors::EngineError;
use crate::Outcome;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Chunk callback that stops once the invocation should end.
pub fn budget_check(exec: &Execution) -> impl FnMut(u64, u64) -> ControlFlow<()> + '_ {
    move |_, _| {
        if exec.should_stop() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

/// Map a chunked operation's outcome onto the step protocol.
fn settle(exec: &Execution, outcome: Outcome) -> StepResult<()> {
    match outcome {
        Outcome::Completed => Ok(()),
        Outcome::Suspended => Err(exec.interrupt()),
    }
}

/// What goes into an archive and how entries are named.
pub struct ArchiveSpec<'s> {
    pub sources: &'s [PathBuf],
    pub exclude: &'s [String],
    pub policy: RenamePolicy,
    pub archive: &'s Path,
    /// `size<TAB>name` line per archived entry
    pub listing: Option<&'s Path>,
}

/// Bytes below all sources, for disk checks and progress.
pub fn total_size(sources: &[PathBuf], exclude: &[String]) -> io::Result<u64> {
    let options = WalkOptions {
        follow_links: false,
        exclude_patterns: exclude.to_vec(),
        ignore_vanished: true,
    };
    let mut total = 0;
    for source in sources {
        let meta = fs::symlink_metadata(source)?;
        total += if meta.is_dir() {
            walker::calculate_total_size(source, &options)?
        } else {
            meta.len()
        };
    }
    Ok(total)
}

/// Archive every source into `spec.archive`, one resumable scan per source,
/// then close the archive. Steps are named `<step>:<index>` and
/// `<step>:finish`.
pub fn archive_sources(job: &mut JobContext, exec: &mut Execution, step: &str, spec: &ArchiveSpec) -> StepResult<()> {
    let options = job.config.archive_options(&job.checkpoint_dir());
    if let Some(parent) = spec.archive.parent() {
        fs::create_dir_all(parent)?;
    }

    for (index, source) in spec.sources.iter().enumerate() {
        let name = format!("{}:{}", step, index);
        let mut writer = ArchiveWriter::open(spec.archive, options.clone())?;
        let mut listing = match spec.listing {
            Some(path) => Some(OpenOptions::new().create(true).append(true).open(path)?),
            None => None,
        };

        if fs::symlink_metadata(source)?.is_dir() {
            let scan_options = ScanOptions {
                exclude_patterns: spec.exclude.to_vec(),
                follow_links: false,
            };
            exec.scan(&name, source, &scan_options, |exec, info, progress| {
                let entry_name = spec.policy.archive_name(source, &info.relative_path);
                job.item
                    .progress
                    .set_sub(progress.position, progress.total_size, entry_name.as_str());
                append_entry(job, exec, &mut writer, &info.path, &entry_name, listing.as_mut())
            })?;
        } else {
            exec.func(&name, |exec| {
                let parent = source.parent().unwrap_or_else(|| Path::new("/"));
                let file_name = source.file_name().map(Path::new).unwrap_or(source);
                let entry_name = spec.policy.archive_name(parent, file_name);
                append_entry(job, exec, &mut writer, source, &entry_name, listing.as_mut())
            })?;
        }
    }

    exec.func(&format!("{}:finish", step), |_| {
        ArchiveWriter::open(spec.archive, options.clone())?.finish()?;
        info!(
            job_id = %job.item.id,
            archive = %spec.archive.display(),
            "Archive closed"
        );
        Ok(())
    })
}

/// Append one entry chunk by chunk. Entries that change too often or vanish
/// count as job errors instead of failing the job.
fn append_entry(
    job: &mut JobContext,
    exec: &Execution,
    writer: &mut ArchiveWriter,
    path: &Path,
    name: &str,
    listing: Option<&mut File>,
) -> StepResult<()> {
    let mut on_chunk = budget_check(exec);
    match writer.append_file_chunked(path, name, exec.chunk_size(), &mut on_chunk) {
        Ok(Outcome::Completed) => {
            if let Some(listing) = listing {
                let size = fs::symlink_metadata(path).map(|m| if m.is_file() { m.len() } else { 0 })?;
                writeln!(listing, "{}\t{}", size, name)?;
            }
            Ok(())
        }
        Ok(Outcome::Suspended) => Err(exec.interrupt()),
        Err(e @ EngineError::FileChanged { .. }) => Ok(job.add_error(&e.to_string())?),
        Err(EngineError::Io(e)) if e.kind() == io::ErrorKind::NotFound && job.config.archive.ignore_vanished => {
            info!("{} vanished before it was archived", path.display());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Gzip `source` into `source.gz` in checkpointed members.
pub fn compress(job: &mut JobContext, exec: &mut Execution, step: &str, source: &Path) -> StepResult<PathBuf> {
    let options = job.config.gzip_options(&job.checkpoint_dir());
    exec.func(step, |exec| {
        let mut on_chunk = budget_check(exec);
        settle(exec, gzip::compress(source, &options, &mut on_chunk)?)
    })?;
    Ok(gzip::compressed_path(source))
}

/// Gunzip `source` next to itself in checkpointed members.
pub fn decompress(job: &mut JobContext, exec: &mut Execution, step: &str, source: &Path) -> StepResult<PathBuf> {
    let options = job.config.gzip_options(&job.checkpoint_dir());
    let target = gzip::plain_path(source)?;
    exec.func(step, |exec| {
        let mut on_chunk = budget_check(exec);
        settle(exec, gzip::decompress(source, &options, &mut on_chunk)?)
    })?;
    Ok(target)
}

/// Extract `archive` into `dest`. Entries that fail count as job errors.
pub fn extract(job: &mut JobContext, exec: &mut Execution, step: &str, archive: &Path, dest: &Path) -> StepResult<u64> {
    let checkpoint_dir = job.checkpoint_dir();
    exec.func(step, |exec| {
        let mut extractor = Extractor::new(archive, dest).checkpoint_dir(&checkpoint_dir);
        let mut on_chunk = |position: u64, total: u64| {
            job.item.progress.set_sub(position, total, "Extracting");
            if exec.should_stop() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        };
        let outcome = extractor.run_chunked(exec.chunk_size(), &mut on_chunk)?;
        settle(exec, outcome)?;

        let stats = extractor.stats().cloned().unwrap_or_default();
        if stats.failed > 0 {
            job.add_error(&format!(
                "{} entries could not be extracted ({} restored)",
                stats.failed, stats.entries
            ))?;
        }
        info!(
            job_id = %job.item.id,
            entries = stats.entries,
            skipped = stats.skipped,
            bytes = stats.bytes,
            "Extraction finished"
        );
        Ok(stats.entries)
    })
}

/// Upload `local` to `remote`, continuing from what the remote side holds.
pub fn upload(job: &mut JobContext, exec: &mut Execution, step: &str, local: &Path, remote: &str) -> StepResult<u64> {
    exec.func(step, |exec| {
        let total = fs::metadata(local)?.len();
        let mut upload = job.destination.copy_file_to_remote_chunked(local, remote)?;
        let mut offset = upload.offset()?;
        if offset > 0 {
            debug!("Resuming upload of {} at {}", local.display(), offset);
        }

        let mut file = File::open(local)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; exec.chunk_size().min(total.max(1)) as usize];
        while offset < total {
            let want = buffer.len().min((total - offset) as usize);
            file.read_exact(&mut buffer[..want])?;
            upload.upload(&buffer[..want])?;
            offset += want as u64;
            job.item.progress.set_sub(offset, total, remote);
            if offset < total && exec.should_stop() {
                return Err(exec.interrupt());
            }
        }
        upload.finalize()?;
        info!(job_id = %job.item.id, remote = %remote, bytes = total, "Upload finished");
        Ok(total)
    })
}

/// Download `remote` into `local` in ranged chunks. The local length is the
/// resume point, so this is not a step of its own and can run inside one.
pub fn download_file(job: &mut JobContext, exec: &Execution, remote: &str, local: &Path) -> StepResult<u64> {
    let mut download = job.destination.copy_file_to_local_chunked(remote, local)?;
    let size = download.size();
    let mut offset = fs::metadata(local).map(|m| m.len()).unwrap_or(0).min(size);
    while offset < size {
        let end = (offset + exec.chunk_size()).min(size);
        let copied = download.download(offset, end)?;
        if copied == 0 {
            return Err(EngineError::Destination(format!("{} ended early at {} of {} bytes", remote, offset, size)).into());
        }
        offset += copied;
        job.item.progress.set_sub(offset, size, remote);
        if offset < size && exec.should_stop() {
            return Err(exec.interrupt());
        }
    }
    // A local file longer than the remote one is stale.
    drop(download);
    if fs::metadata(local)?.len() > size {
        OpenOptions::new().write(true).open(local)?.set_len(size)?;
    }
    Ok(size)
}

/// Move `path` to `target`, atomically when both are on one filesystem.
pub fn publish(path: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(path, target) {
        Err(e) if e.raw_os_error() == Some(nix::libc::EXDEV) => {
            fs::copy(path, target)?;
            fs::remove_file(path)
        }
        other => other,
    }
}
