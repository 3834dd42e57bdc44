//! Streaming gzip codec.
//!
//! `compress` turns `file` into `file.gz` one chunk at a time, each chunk
//! being an independent gzip member, so the output is a valid multi-member
//! stream at every committed offset. `decompress` walks those members back.
//! Both record `(plain offset, compressed offset)` in a checkpoint after every
//! chunk and delete their input once done.

use crate::archive::MAX_FILE_CHANGES;
use crate::fs::metadata::EntryMetadata;
use crate::fs::state::{self, remove_if_exists, GZIP_SUFFIX};
use crate::utils::errors::{EngineError, Result};
use crate::Outcome;
use flate2::bufread::GzDecoder;
use flate2::{Compression, GzBuilder};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct GzipOptions {
    /// Compression level, 0-9
    pub level: u32,
    /// Plain bytes per gzip member
    pub chunk_size: u64,
    /// Where checkpoints live; next to the input when unset
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for GzipOptions {
    fn default() -> Self {
        Self {
            level: 6,
            chunk_size: 4 * 1024 * 1024,
            checkpoint_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GzipCheckpoint {
    input_size: u64,
    input_mtime: u64,
    /// Bytes consumed from the input
    input_offset: u64,
    /// Bytes committed to the output
    output_offset: u64,
    changed: u32,
}

/// `archive.tar` -> `archive.tar.gz`
pub fn compressed_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".gz");
    PathBuf::from(name)
}

/// `archive.tar.gz` -> `archive.tar`
pub fn plain_path(path: &Path) -> Result<PathBuf> {
    let name = path.to_string_lossy();
    match name.strip_suffix(".gz") {
        Some(stem) if !stem.is_empty() => Ok(PathBuf::from(stem)),
        _ => Err(EngineError::Compression(format!(
            "{} has no .gz suffix",
            path.display()
        ))),
    }
}

fn checkpoint_path(options: &GzipOptions, input: &Path) -> PathBuf {
    let dir = options
        .checkpoint_dir
        .clone()
        .or_else(|| input.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    state::checkpoint_path(&dir, &format!("gzip\0{}", input.display()), GZIP_SUFFIX)
}

/// Load the checkpoint for `input`, starting (or restarting) it when absent or
/// when the input no longer matches the recorded identity.
fn prepare(ckpt_path: &Path, input: &Path, size: u64, mtime: u64) -> Result<GzipCheckpoint> {
    let fresh = |changed| GzipCheckpoint {
        input_size: size,
        input_mtime: mtime,
        input_offset: 0,
        output_offset: 0,
        changed,
    };

    let ckpt = match state::load::<GzipCheckpoint>(ckpt_path)? {
        None => fresh(0),
        Some(ckpt) if ckpt.input_size == size && ckpt.input_mtime == mtime => return Ok(ckpt),
        Some(ckpt) => {
            let changed = ckpt.changed + 1;
            if changed > MAX_FILE_CHANGES {
                state::remove(ckpt_path)?;
                return Err(EngineError::FileChanged {
                    path: input.to_path_buf(),
                    attempts: changed,
                });
            }
            warn!("{} changed since last chunk, starting over", input.display());
            fresh(changed)
        }
    };
    state::store(ckpt_path, &ckpt)?;
    Ok(ckpt)
}

/// Output file positioned at the committed offset, with anything past it cut.
fn open_output(path: &Path, offset: u64) -> Result<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    file.set_len(offset)?;
    file.seek(SeekFrom::Start(offset))?;
    Ok(file)
}

fn finish(input: &Path, output: File, ckpt_path: &Path) -> Result<Outcome> {
    output.sync_all()?;
    drop(output);
    remove_if_exists(input)?;
    state::remove(ckpt_path)?;
    Ok(Outcome::Completed)
}

/// Compress `source` into `source.gz`, resuming from a checkpoint if one
/// exists. Calling it again after completion is a no-op.
pub fn compress(
    source: &Path,
    options: &GzipOptions,
    on_chunk: &mut dyn FnMut(u64, u64) -> ControlFlow<()>,
) -> Result<Outcome> {
    let target = compressed_path(source);
    let ckpt_path = checkpoint_path(options, source);

    let meta = match EntryMetadata::from_path(source) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound && target.exists() => {
            debug!("{} already compressed", source.display());
            state::remove(&ckpt_path)?;
            return Ok(Outcome::Completed);
        }
        Err(e) => return Err(e.into()),
    };

    let mut ckpt = prepare(&ckpt_path, source, meta.size, meta.mtime)?;
    if ckpt.input_offset > 0 {
        debug!(
            "Resuming compression of {} at {}/{}",
            source.display(),
            ckpt.input_offset,
            ckpt.input_size
        );
    }

    let mut input = File::open(source)?;
    input.seek(SeekFrom::Start(ckpt.input_offset))?;
    let mut output = open_output(&target, ckpt.output_offset)?;
    let level = Compression::new(options.level.min(9));
    let chunk_size = options.chunk_size.max(1);

    // An empty input still yields one (empty) member.
    let mut wrote_any = ckpt.output_offset > 0;
    loop {
        let mut plain = Vec::with_capacity(chunk_size.min(ckpt.input_size.max(1)) as usize);
        (&mut input).take(chunk_size).read_to_end(&mut plain)?;
        if plain.is_empty() && wrote_any {
            break;
        }

        let mut encoder = GzBuilder::new().mtime(0).write(Vec::new(), level);
        encoder.write_all(&plain)?;
        let member = encoder.finish()?;
        output.write_all(&member)?;
        output.sync_data()?;
        wrote_any = true;

        ckpt.input_offset += plain.len() as u64;
        ckpt.output_offset += member.len() as u64;
        state::store(&ckpt_path, &ckpt)?;

        if ckpt.input_offset >= ckpt.input_size {
            break;
        }
        if on_chunk(ckpt.input_offset, ckpt.input_size).is_break() {
            debug!(
                "Suspending compression of {} at {}/{}",
                source.display(),
                ckpt.input_offset,
                ckpt.input_size
            );
            return Ok(Outcome::Suspended);
        }
    }

    info!(
        "Compressed {} ({} -> {} bytes)",
        source.display(),
        ckpt.input_offset,
        ckpt.output_offset
    );
    finish(source, output, &ckpt_path)
}

/// Decompress `source` (`*.gz`) next to itself, member by member. Calling it
/// again after completion is a no-op.
pub fn decompress(
    source: &Path,
    options: &GzipOptions,
    on_chunk: &mut dyn FnMut(u64, u64) -> ControlFlow<()>,
) -> Result<Outcome> {
    let target = plain_path(source)?;
    let ckpt_path = checkpoint_path(options, source);

    let meta = match EntryMetadata::from_path(source) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound && target.exists() => {
            debug!("{} already decompressed", source.display());
            state::remove(&ckpt_path)?;
            return Ok(Outcome::Completed);
        }
        Err(e) => return Err(e.into()),
    };

    let mut ckpt = prepare(&ckpt_path, source, meta.size, meta.mtime)?;
    let mut input = BufReader::new(File::open(source)?);
    input.seek(SeekFrom::Start(ckpt.input_offset))?;
    let mut output = open_output(&target, ckpt.output_offset)?;
    let chunk_size = options.chunk_size.max(1);

    loop {
        if input.fill_buf()?.is_empty() {
            break;
        }

        // Members are decoded whole; a chunk ends at the first member
        // boundary past `chunk_size` plain bytes.
        let mut produced = 0u64;
        while produced < chunk_size && !input.fill_buf()?.is_empty() {
            let mut decoder = GzDecoder::new(&mut input);
            produced += io::copy(&mut decoder, &mut output).map_err(|e| {
                EngineError::Compression(format!("{}: {}", source.display(), e))
            })?;
        }
        output.sync_data()?;

        ckpt.input_offset = input.stream_position()?;
        ckpt.output_offset += produced;
        state::store(&ckpt_path, &ckpt)?;

        if ckpt.input_offset < ckpt.input_size
            && on_chunk(ckpt.input_offset, ckpt.input_size).is_break()
        {
            debug!(
                "Suspending decompression of {} at {}/{}",
                source.display(),
                ckpt.input_offset,
                ckpt.input_size
            );
            return Ok(Outcome::Suspended);
        }
    }

    info!(
        "Decompressed {} ({} -> {} bytes)",
        source.display(),
        ckpt.input_size,
        ckpt.output_offset
    );
    finish(source, output, &ckpt_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::MultiGzDecoder;
    use tempfile::TempDir;

    fn options(dir: &Path) -> GzipOptions {
        GzipOptions {
            level: 6,
            chunk_size: 1000,
            checkpoint_dir: Some(dir.join("ckpt")),
        }
    }

    fn content() -> Vec<u8> {
        (0..10_500u32).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn run_to_completion(
        op: fn(&Path, &GzipOptions, &mut dyn FnMut(u64, u64) -> ControlFlow<()>) -> Result<Outcome>,
        path: &Path,
        options: &GzipOptions,
        stop_after: u32,
    ) -> Result<u32> {
        let mut invocations = 0;
        loop {
            invocations += 1;
            let mut seen = 0;
            let outcome = op(path, options, &mut |_: u64, _: u64| {
                seen += 1;
                if seen >= stop_after {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })?;
            if outcome == Outcome::Completed {
                return Ok(invocations);
            }
        }
    }

    #[test]
    fn test_compress_resume_is_byte_identical() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let opts = options(temp_dir.path());

        let reference = temp_dir.path().join("reference.bin");
        std::fs::write(&reference, content())?;
        assert_eq!(run_to_completion(compress, &reference, &opts, u32::MAX)?, 1);
        let expected = std::fs::read(compressed_path(&reference))?;

        for stop_after in 1..4 {
            let path = temp_dir.path().join(format!("resumed-{}.bin", stop_after));
            std::fs::write(&path, content())?;
            assert!(run_to_completion(compress, &path, &opts, stop_after)? > 1);
            assert!(!path.exists());
            assert_eq!(std::fs::read(compressed_path(&path))?, expected);
        }

        let mut plain = Vec::new();
        MultiGzDecoder::new(File::open(compressed_path(&reference))?).read_to_end(&mut plain)?;
        assert_eq!(plain, content());
        Ok(())
    }

    #[test]
    fn test_decompress_resume() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let opts = options(temp_dir.path());
        let path = temp_dir.path().join("data.bin");
        std::fs::write(&path, content())?;
        run_to_completion(compress, &path, &opts, u32::MAX)?;

        let gz = compressed_path(&path);
        assert!(run_to_completion(decompress, &gz, &opts, 1)? > 1);
        assert!(!gz.exists());
        assert_eq!(std::fs::read(&path)?, content());
        assert_eq!(std::fs::read_dir(temp_dir.path().join("ckpt"))?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_rerun_after_completion_is_noop() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let opts = options(temp_dir.path());
        let path = temp_dir.path().join("data.bin");
        std::fs::write(&path, content())?;

        run_to_completion(compress, &path, &opts, u32::MAX)?;
        let gz = std::fs::read(compressed_path(&path))?;
        assert_eq!(run_to_completion(compress, &path, &opts, 1)?, 1);
        assert_eq!(std::fs::read(compressed_path(&path))?, gz);
        Ok(())
    }

    #[test]
    fn test_empty_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let opts = options(temp_dir.path());
        let path = temp_dir.path().join("empty");
        std::fs::write(&path, b"")?;

        run_to_completion(compress, &path, &opts, u32::MAX)?;
        assert!(std::fs::metadata(compressed_path(&path))?.len() > 0);
        run_to_completion(decompress, &compressed_path(&path), &opts, u32::MAX)?;
        assert_eq!(std::fs::read(&path)?, b"");
        Ok(())
    }

    #[test]
    fn test_plain_path() {
        assert_eq!(plain_path(Path::new("/a/b.tar.gz")).ok(), Some(PathBuf::from("/a/b.tar")));
        assert!(plain_path(Path::new("/a/b.tar")).is_err());
    }
}
