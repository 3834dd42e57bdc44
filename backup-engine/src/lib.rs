//! Backup Engine Library
//!
//! Resumable backup/restore engine: a GNU tar archive codec, a chunked gzip
//! codec and a checkpointed job queue, built to make progress in short,
//! bounded invocations driven by an external scheduler.

pub mod archive;
pub mod config;
pub mod destination;
pub mod fs;
pub mod gzip;
pub mod queue;
pub mod resumable;
pub mod tasks;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{EngineError, Result};

/// Result of a chunked operation that may stop between chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// All work is done and the operation's checkpoint is gone
    Completed,
    /// Stopped at a chunk boundary; calling again continues from the checkpoint
    Suspended,
}

impl Outcome {
    pub fn is_completed(self) -> bool {
        self == Outcome::Completed
    }
}
