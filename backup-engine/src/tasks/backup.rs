//! Backup: archive local sources, compress, upload with a manifest.

use super::manifest::{manifest_file_name, Manifest, ManifestTotals, MANIFEST_VERSION};
use super::steps::{self, ArchiveSpec};
use super::{retention, JobContext};
use crate::archive::RenamePolicy;
use crate::destination::join_remote;
use crate::fs::state;
use crate::queue::item::BackupPayload;
use crate::queue::{format_bytes, Status};
use crate::resumable::{Execution, StepResult};
use crate::utils::errors::EngineError;
use chrono::Utc;
use std::fs;
use tracing::info;

pub fn run(job: &mut JobContext, exec: &mut Execution, payload: &BackupPayload) -> StepResult<()> {
    let archive = job.workspace_path(&format!("{}.tar", payload.name));
    let listing = job.workspace_path(&format!("{}.list", payload.name));
    let remote_archive = join_remote(&payload.destination_dir, &format!("{}.tar.gz", payload.name));

    job.enter(Status::Preparing, "Preparing backup")?;
    let total: u64 = exec.func("prepare", |_| {
        let total = steps::total_size(&payload.sources, &payload.exclude)?;
        if let Some(disk) = job.destination.disk_info()? {
            if disk.free_space < total {
                return Err(EngineError::InsufficientSpace {
                    needed: total,
                    available: disk.free_space,
                }
                .into());
            }
        }
        job.destination.create_dir(&payload.destination_dir, true)?;
        info!(job_id = %job.item.id, bytes = total, "Backup prepared");
        Ok(total)
    })?;

    job.enter(Status::Archiving, &format!("Archiving {}", format_bytes(total)))?;
    let spec = ArchiveSpec {
        sources: &payload.sources,
        exclude: &payload.exclude,
        policy: RenamePolicy::Absolute,
        archive: &archive,
        listing: Some(&listing),
    };
    steps::archive_sources(job, exec, "archive", &spec)?;

    job.enter(Status::Compressing, "Compressing archive")?;
    let compressed = steps::compress(job, exec, "compress", &archive)?;

    job.enter(Status::Uploading, "Uploading archive")?;
    let archive_size = steps::upload(job, exec, "upload", &compressed, &remote_archive)?;

    job.enter(Status::Indexing, "Writing manifest")?;
    let totals_path = job.workspace_path("manifest-totals.json");
    exec.file_read("manifest:read", &listing, |_, line| {
        let mut totals: ManifestTotals = state::load(&totals_path)?.unwrap_or_default();
        totals.add_line(line);
        state::store(&totals_path, &totals)?;
        Ok(())
    })?;
    exec.func("manifest:upload", |_| {
        let totals: ManifestTotals = state::load(&totals_path)?.unwrap_or_default();
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            name: payload.name.clone(),
            job_id: job.item.id.clone(),
            instance: job.config.engine.id.clone(),
            archive: remote_archive.clone(),
            archive_size,
            created_at: Utc::now(),
            sources: payload.sources.clone(),
            total_files: totals.files,
            total_bytes: totals.bytes,
            errors: job.item.errors,
        };
        let local = job.workspace_path(&manifest_file_name(&payload.name));
        fs::write(&local, serde_json::to_vec_pretty(&manifest).map_err(EngineError::from)?)?;
        let remote = join_remote(&payload.destination_dir, &manifest_file_name(&payload.name));
        job.destination.copy_file_to_remote(&local, &remote)?;
        info!(
            job_id = %job.item.id,
            files = manifest.total_files,
            bytes = manifest.total_bytes,
            archive = %remote_archive,
            "Backup stored"
        );
        Ok(())
    })?;

    if let Some(keep) = payload.keep {
        job.enter(Status::Cleaning, "Applying retention")?;
        retention::apply(job, exec, "retention", &payload.destination_dir, keep)?;
    }
    Ok(())
}
