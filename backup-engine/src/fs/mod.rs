//! File system helpers: ordered walking, metadata capture and crash-safe state files.

pub mod metadata;
pub mod state;
pub mod walker;
