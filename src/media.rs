//! Image ingestion helpers
//!
//! Converts local files and remote URLs into the tagged data-URI form the
//! conversation context accepts.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::path::Path;
use thiserror::Error;

/// Errors raised while fetching or encoding image data
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to fetch {url}: status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
}

/// Encode raw PNG bytes as a data URI.
pub fn data_uri_from_bytes(bytes: &[u8]) -> String {
    format!("data:image/png;base64,{}", STANDARD.encode(bytes))
}

/// Read a local image file into a data URI.
pub fn data_uri_from_path(path: impl AsRef<Path>) -> Result<String, MediaError> {
    let bytes = std::fs::read(path)?;
    Ok(data_uri_from_bytes(&bytes))
}

/// Fetch a remote image into a data URI.
pub async fn data_uri_from_url(url: &str) -> Result<String, MediaError> {
    let response = reqwest::get(url).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(MediaError::Status {
            url: url.to_string(),
            status,
        });
    }

    let bytes = response.bytes().await?;
    Ok(data_uri_from_bytes(&bytes))
}

/// Format a tag and data URI as the `tag|uri` attachment string.
pub fn tagged_image(tag: &str, data_uri: &str) -> String {
    format!("{tag}|{data_uri}")
}
