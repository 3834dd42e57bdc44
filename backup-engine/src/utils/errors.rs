//! Error types for the backup engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    /// Checksum mismatch on a header block. Readers skip the block and keep scanning.
    #[error("Corrupted archive header: {0}")]
    CorruptedHeader(String),

    #[error("Invalid archive header: {0}")]
    InvalidHeader(String),

    #[error("File {} changed {attempts} times while being archived", path.display())]
    FileChanged { path: PathBuf, attempts: u32 },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Destination error: {0}")]
    Destination(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Insufficient disk space: need {needed} bytes, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
