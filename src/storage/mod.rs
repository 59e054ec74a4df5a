//! Local storage
//!
//! Data-directory resolution and the model download cache.

pub mod hub;

use std::path::PathBuf;
use thiserror::Error;

pub use hub::Hub;

/// Errors from storage and download operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not determine data directory")]
    DataDir,

    #[error("download failed: {0}")]
    Download(String),

    #[error("no file matching '{pattern}' in {repo_id}")]
    NoMatch { repo_id: String, pattern: String },
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        StorageError::Download(e.to_string())
    }
}

/// Application data directory, created on first use.
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    let dirs =
        directories::ProjectDirs::from("", "", "voxserve").ok_or(StorageError::DataDir)?;
    let dir = dirs.data_dir().to_path_buf();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Directory holding downloaded model files.
pub fn models_dir() -> Result<PathBuf, StorageError> {
    let dir = get_data_dir()?.join("models");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
