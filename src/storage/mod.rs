//! Persistent storage
//!
//! Data directory resolution and the append-only interaction log.

use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod interaction_log;

pub use interaction_log::InteractionLog;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Appending to the interaction log failed
#[derive(Debug, Error)]
pub enum LogWriteError {
    #[error("Failed to write interaction log: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode log record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Get the application data directory
///
/// Returns the platform-specific application data directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\MiniVault\MiniVault`
/// - macOS: `/Users/{user}/Library/Application Support/com.MiniVault.MiniVault`
/// - Linux: `/home/{user}/.local/share/minivault`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "MiniVault", "MiniVault")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}

/// Create the parent directory of `path` if it does not exist yet
pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}
