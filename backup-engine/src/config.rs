//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file. Every section and field has a
//! default, so a partial file (or none at all) is valid.

use crate::archive::ArchiveOptions;
use crate::gzip::GzipOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub limits: LimitsConfig,
    pub archive: ArchiveConfig,
    pub gzip: GzipConfig,
    pub destination: DestinationConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Instance identifier, written into manifests
    pub id: String,

    /// Holds `jobs/`, `workspaces/`, `logs/` and `signals/`
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Wall-clock budget of one invocation (seconds)
    pub max_execution_secs: u64,

    /// Bytes per resumable unit of work (default: 1MB)
    pub chunk_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Share of a file that must be holes for sparse storage
    pub sparse_threshold: f64,

    /// Tolerate files vanishing while a tree is archived
    pub ignore_vanished: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GzipConfig {
    /// Compression level (0-9)
    pub level: u32,

    /// Plain bytes per gzip member
    pub chunk_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    /// Root directory of the local destination
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            id: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "backup-engine".to_string()),
            data_dir: PathBuf::from("/var/lib/backup-engine"),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_execution_secs: 50,
            chunk_size: 1024 * 1024,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            sparse_threshold: 0.25,
            ignore_vanished: true,
        }
    }
}

impl Default for GzipConfig {
    fn default() -> Self {
        Self {
            level: 6,
            chunk_size: 4 * 1024 * 1024,
        }
    }
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/backups/backup-engine"),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if !(0.0..=1.0).contains(&self.archive.sparse_threshold) {
            return Err(crate::EngineError::Config(format!(
                "archive.sparse_threshold must be within 0..=1, got {}",
                self.archive.sparse_threshold
            )));
        }
        if self.gzip.level > 9 {
            return Err(crate::EngineError::Config(format!(
                "gzip.level must be 0-9, got {}",
                self.gzip.level
            )));
        }
        if self.limits.chunk_size == 0 || self.gzip.chunk_size == 0 {
            return Err(crate::EngineError::Config("chunk sizes must be positive".to_string()));
        }
        Ok(())
    }

    pub fn execution_budget(&self) -> Duration {
        Duration::from_secs(self.limits.max_execution_secs)
    }

    /// Archive options with checkpoints kept in `checkpoint_dir`.
    pub fn archive_options(&self, checkpoint_dir: &Path) -> ArchiveOptions {
        ArchiveOptions {
            sparse_threshold: self.archive.sparse_threshold,
            ignore_vanished: self.archive.ignore_vanished,
            checkpoint_dir: Some(checkpoint_dir.to_path_buf()),
        }
    }

    pub fn gzip_options(&self, checkpoint_dir: &Path) -> GzipOptions {
        GzipOptions {
            level: self.gzip.level,
            chunk_size: self.gzip.chunk_size,
            checkpoint_dir: Some(checkpoint_dir.to_path_buf()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_file_uses_defaults() -> crate::Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "[limits]\nmax_execution_secs = 20\n\n[gzip]\nlevel = 9")?;

        let config = Config::from_file(file.path())?;
        assert_eq!(config.limits.max_execution_secs, 20);
        assert_eq!(config.limits.chunk_size, 1024 * 1024);
        assert_eq!(config.gzip.level, 9);
        assert_eq!(config.log.level, "info");
        Ok(())
    }

    #[test]
    fn test_invalid_values_rejected() -> crate::Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "[archive]\nsparse_threshold = 1.5")?;
        assert!(matches!(
            Config::from_file(file.path()),
            Err(crate::EngineError::Config(_))
        ));
        Ok(())
    }
}
