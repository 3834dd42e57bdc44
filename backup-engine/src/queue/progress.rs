//! Step-level progress of a queued job.

use serde::{Deserialize, Serialize};

/// Progress shown for a job while it runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current_step: u32,
    pub total_steps: u32,

    /// Position inside the current step (files, bytes, items; step dependent)
    pub current_sub_step: u64,
    pub total_sub_steps: u64,

    pub message: String,

    /// Detail line, e.g. the file being archived
    #[serde(default)]
    pub sub_message: String,
}

impl Progress {
    pub fn new(total_steps: u32) -> Self {
        Self {
            total_steps,
            ..Default::default()
        }
    }

    /// Move to the next step. Sub-step counters start over.
    pub fn advance(&mut self, message: &str, increment: u32) {
        self.current_step += increment;
        self.message = message.to_string();
        self.sub_message.clear();
        self.current_sub_step = 0;
        self.total_sub_steps = 0;
    }

    pub fn set_sub(&mut self, current: u64, total: u64, sub_message: impl Into<String>) {
        self.current_sub_step = current;
        self.total_sub_steps = total;
        self.sub_message = sub_message.into();
    }

    /// Percentage complete (0-100) across steps, counting the sub-step share
    /// of the current one.
    pub fn percent_complete(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        let sub = if self.total_sub_steps > 0 {
            self.current_sub_step.min(self.total_sub_steps) as f64 / self.total_sub_steps as f64
        } else {
            0.0
        };
        let done = self.current_step.saturating_sub(1) as f64 + sub;
        (done / self.total_steps as f64 * 100.0).clamp(0.0, 100.0)
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}
