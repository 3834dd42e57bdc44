//! Resumable execution primitives.
//!
//! A long job is expressed as named steps. Each step keeps a small record in
//! the job's step directory holding its cursor; when the invocation's time
//! budget runs out the step returns [`Interrupt::Suspend`] with the cursor
//! saved, and the next invocation replays the job from the top, skipping
//! finished steps and continuing the unfinished one where it stopped.
//!
//! Work done between the last saved cursor and an external kill is repeated,
//! so every unit of work must be idempotent.

use crate::fs::state::{self, STEP_SUFFIX};
use crate::fs::walker::{self, FileInfo, WalkOptions};
use crate::utils::errors::EngineError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// Why a step stopped before finishing.
#[derive(Debug, Error)]
pub enum Interrupt {
    /// Time budget used up; state is saved and the job continues next invocation
    #[error("execution suspended until next invocation")]
    Suspend,

    /// The abort signal was seen (and consumed)
    #[error("job aborted")]
    Abort,

    #[error(transparent)]
    Fail(#[from] EngineError),
}

impl From<io::Error> for Interrupt {
    fn from(e: io::Error) -> Self {
        Interrupt::Fail(EngineError::Io(e))
    }
}

pub type StepResult<T> = std::result::Result<T, Interrupt>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StepState {
    Done {
        #[serde(default)]
        result: serde_json::Value,
    },
    Foreach {
        index: u64,
    },
    Collection {
        items: Vec<serde_json::Value>,
        index: u64,
    },
    Scan {
        /// Raw bytes of the last handled relative path
        last_path: Option<Vec<u8>>,
        position: u64,
        total_size: u64,
    },
    FileRead {
        offset: u64,
        lines: u64,
    },
    FileMerge {
        offset: u64,
        target_start: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StepRecord {
    name: String,
    state: StepState,
}

/// Position of a directory scan, for progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanProgress {
    /// Bytes of all regular files under the root, measured before the first entry
    pub total_size: u64,
    /// Bytes of the files fully handled so far
    pub position: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub exclude_patterns: Vec<String>,
    pub follow_links: bool,
}

/// Step context of one invocation of one job.
pub struct Execution {
    steps_dir: PathBuf,
    started: Instant,
    budget: Duration,
    chunk_size: u64,
    abort_file: Option<PathBuf>,
}

impl Execution {
    pub fn new(steps_dir: &Path, budget: Duration, chunk_size: u64) -> Self {
        Self {
            steps_dir: steps_dir.to_path_buf(),
            started: Instant::now(),
            budget,
            chunk_size: chunk_size.max(1),
            abort_file: None,
        }
    }

    /// Abort when this file shows up.
    pub fn with_abort_file(mut self, path: &Path) -> Self {
        self.abort_file = Some(path.to_path_buf());
        self
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Whether work should stop at the next boundary. Nothing is consumed;
    /// chunk callbacks use this, then report through [`Execution::interrupt`].
    pub fn should_stop(&self) -> bool {
        self.abort_requested() || self.started.elapsed() >= self.budget
    }

    fn abort_requested(&self) -> bool {
        self.abort_file.as_ref().is_some_and(|p| p.exists())
    }

    /// The interrupt for a stop requested through [`Execution::should_stop`].
    /// An abort signal takes precedence and is removed once seen.
    pub fn interrupt(&self) -> Interrupt {
        if let Some(path) = &self.abort_file {
            if path.exists() {
                if let Err(e) = state::remove_if_exists(path) {
                    return Interrupt::Fail(e.into());
                }
                info!("Abort signal found at {}", path.display());
                return Interrupt::Abort;
            }
        }
        info!(
            "Execution time limit of {}s reached after {:.1}s, waiting for next invocation",
            self.budget.as_secs(),
            self.started.elapsed().as_secs_f64()
        );
        Interrupt::Suspend
    }

    /// Abort check alone, for the start of an invocation where the time
    /// budget must not prevent at least one unit of work.
    pub fn check_abort(&self) -> StepResult<()> {
        if self.abort_requested() {
            Err(self.interrupt())
        } else {
            Ok(())
        }
    }

    /// Boundary check between units of work.
    pub fn check_execution_time(&self) -> StepResult<()> {
        if self.should_stop() {
            Err(self.interrupt())
        } else {
            Ok(())
        }
    }

    /// Run `f` once. A finished step is skipped and its saved result returned.
    pub fn func<T, F>(&mut self, name: &str, f: F) -> StepResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut Self) -> StepResult<T>,
    {
        if let Some(StepState::Done { result }) = self.load(name)? {
            debug!("Step {} already done", name);
            return Ok(serde_json::from_value(result).map_err(EngineError::from)?);
        }
        let value = f(self)?;
        self.done(name, serde_json::to_value(&value).map_err(EngineError::from)?)?;
        Ok(value)
    }

    /// Visit `items` in order with a persisted index; every completed item is
    /// followed by a budget check.
    pub fn foreach<T, F>(&mut self, name: &str, items: &[T], mut f: F) -> StepResult<()>
    where
        F: FnMut(&mut Self, usize, &T) -> StepResult<()>,
    {
        let start = match self.load(name)? {
            Some(StepState::Done { .. }) => return Ok(()),
            Some(StepState::Foreach { index }) => index as usize,
            _ => 0,
        };
        if start > 0 {
            debug!("Step {} resuming at item {}/{}", name, start, items.len());
        }

        for (index, item) in items.iter().enumerate().skip(start) {
            f(self, index, item)?;
            self.save(name, StepState::Foreach { index: index as u64 + 1 })?;
            if index + 1 < items.len() {
                self.check_execution_time()?;
            }
        }
        self.done(name, serde_json::Value::Null)
    }

    /// Like [`Execution::foreach`], over a collection built by `produce` on
    /// the first invocation and persisted with the cursor, so later
    /// invocations see the same items in the same order.
    pub fn foreach_callable<T, P, F>(&mut self, name: &str, produce: P, mut f: F) -> StepResult<()>
    where
        T: Serialize + DeserializeOwned,
        P: FnOnce(&mut Self) -> StepResult<Vec<T>>,
        F: FnMut(&mut Self, usize, T) -> StepResult<()>,
    {
        let (items, start) = match self.load(name)? {
            Some(StepState::Done { .. }) => return Ok(()),
            Some(StepState::Collection { items, index }) => (items, index as usize),
            _ => {
                let produced = produce(self)?;
                let items = produced
                    .iter()
                    .map(serde_json::to_value)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(EngineError::from)?;
                self.save(
                    name,
                    StepState::Collection {
                        items: items.clone(),
                        index: 0,
                    },
                )?;
                (items, 0)
            }
        };

        let total = items.len();
        for index in start..total {
            let item: T = serde_json::from_value(items[index].clone()).map_err(EngineError::from)?;
            f(self, index, item)?;
            self.save(
                name,
                StepState::Collection {
                    items: items.clone(),
                    index: index as u64 + 1,
                },
            )?;
            if index + 1 < total {
                self.check_execution_time()?;
            }
        }
        self.done(name, serde_json::Value::Null)
    }

    /// Depth-first walk of `root` in name order, resuming after the last
    /// fully handled path. Returns the final progress.
    pub fn scan<F>(&mut self, name: &str, root: &Path, options: &ScanOptions, mut f: F) -> StepResult<ScanProgress>
    where
        F: FnMut(&mut Self, &FileInfo, ScanProgress) -> StepResult<()>,
    {
        let walk_options = WalkOptions {
            follow_links: options.follow_links,
            exclude_patterns: options.exclude_patterns.clone(),
            ignore_vanished: true,
        };

        let (mut last_path, mut progress) = match self.load(name)? {
            Some(StepState::Done { result }) => {
                return Ok(serde_json::from_value(result).map_err(EngineError::from)?);
            }
            Some(StepState::Scan {
                last_path,
                position,
                total_size,
            }) => (
                last_path.map(|bytes| PathBuf::from(OsString::from_vec(bytes))),
                ScanProgress { total_size, position },
            ),
            _ => {
                let total_size = walker::calculate_total_size(root, &walk_options)?;
                info!("Scanning {} ({} bytes)", root.display(), total_size);
                (None, ScanProgress { total_size, position: 0 })
            }
        };
        if let Some(path) = &last_path {
            debug!("Step {} resuming after {}", name, path.display());
        }

        walker::walk_directory_with_callback(root, &walk_options, |info| {
            if let Some(last) = &last_path {
                if info.relative_path <= *last {
                    return Ok(true);
                }
            }
            f(&mut *self, &info, progress)?;
            progress.position += info.size;
            last_path = Some(info.relative_path.clone());
            self.save(
                name,
                StepState::Scan {
                    last_path: last_path.as_ref().map(|p| p.as_os_str().as_bytes().to_vec()),
                    position: progress.position,
                    total_size: progress.total_size,
                },
            )?;
            self.check_execution_time()?;
            Ok::<_, Interrupt>(true)
        })?;

        self.done(name, serde_json::to_value(progress).map_err(EngineError::from)?)?;
        Ok(progress)
    }

    /// Feed `path` to `f` line by line (without the line terminator),
    /// checkpointed by byte offset. Invalid UTF-8 is replaced, not rejected.
    /// Returns the number of lines read.
    pub fn file_read<F>(&mut self, name: &str, path: &Path, mut f: F) -> StepResult<u64>
    where
        F: FnMut(&mut Self, &str) -> StepResult<()>,
    {
        let (mut offset, mut lines) = match self.load(name)? {
            Some(StepState::Done { result }) => return Ok(result.as_u64().unwrap_or_default()),
            Some(StepState::FileRead { offset, lines }) => (offset, lines),
            _ => (0, 0),
        };

        let mut reader = BufReader::new(File::open(path)?);
        reader.seek(SeekFrom::Start(offset))?;
        let mut line = Vec::new();
        loop {
            line.clear();
            let n = reader.read_until(b'\n', &mut line)?;
            if n == 0 {
                break;
            }
            let text = String::from_utf8_lossy(&line);
            f(self, text.trim_end_matches(['\n', '\r']))?;
            offset += n as u64;
            lines += 1;
            self.save(name, StepState::FileRead { offset, lines })?;
            self.check_execution_time()?;
        }

        self.done(name, serde_json::Value::from(lines))?;
        Ok(lines)
    }

    /// Append the contents of `source` to `target`, chunk by chunk.
    pub fn file_merge(&mut self, name: &str, source: &Path, target: &Path) -> StepResult<u64> {
        let (offset, target_start) = match self.load(name)? {
            Some(StepState::Done { result }) => return Ok(result.as_u64().unwrap_or_default()),
            Some(StepState::FileMerge { offset, target_start }) => (offset, target_start),
            _ => {
                let target_start = match std::fs::metadata(target) {
                    Ok(meta) => meta.len(),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
                    Err(e) => return Err(e.into()),
                };
                self.save(name, StepState::FileMerge { offset: 0, target_start })?;
                (0, target_start)
            }
        };

        let mut input = File::open(source)?;
        let source_len = input.metadata()?.len();
        input.seek(SeekFrom::Start(offset))?;
        let mut output = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(target)?;
        output.set_len(target_start + offset)?;
        output.seek(SeekFrom::End(0))?;

        let mut offset = offset;
        let mut buffer = vec![0u8; self.chunk_size.min(8 * 1024 * 1024) as usize];
        loop {
            let n = input.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            output.write_all(&buffer[..n])?;
            output.sync_data()?;
            offset += n as u64;
            self.save(name, StepState::FileMerge { offset, target_start })?;
            if offset < source_len {
                self.check_execution_time()?;
            }
        }

        self.done(name, serde_json::Value::from(offset))?;
        Ok(offset)
    }

    /// Forget a step so it runs again.
    pub fn reset(&self, name: &str) -> StepResult<()> {
        Ok(state::remove(&self.record_path(name))?)
    }

    /// Remove every step record of the job.
    pub fn clear(&self) -> StepResult<()> {
        match std::fs::remove_dir_all(&self.steps_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn record_path(&self, name: &str) -> PathBuf {
        state::checkpoint_path(&self.steps_dir, name, STEP_SUFFIX)
    }

    fn load(&self, name: &str) -> StepResult<Option<StepState>> {
        Ok(state::load::<StepRecord>(&self.record_path(name))?.map(|r| r.state))
    }

    fn save(&self, name: &str, state: StepState) -> StepResult<()> {
        let record = StepRecord {
            name: name.to_string(),
            state,
        };
        Ok(state::store(&self.record_path(name), &record)?)
    }

    fn done(&self, name: &str, result: serde_json::Value) -> StepResult<()> {
        debug!("Step {} finished", name);
        self.save(name, StepState::Done { result })
    }
}
