//! Hugging Face hub resolution
//!
//! Resolves a named repository reference plus filename pattern into a cached
//! local GGUF file, downloading it on first use. Remote references need no
//! validation at handle construction; everything here runs inside the
//! background load worker.

use glob::Pattern;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::storage::{models_dir, StorageError};

/// A named remote repository reference
///
/// `file_name` and `clip_name` are glob patterns matched against the repo's
/// file tree; a plain filename matches itself.
#[derive(Debug, Clone)]
pub struct Hub {
    pub repo_id: String,
    pub file_name: String,
    pub clip_name: String,
}

impl Hub {
    /// Reference a repository with the default quantization and companion
    /// patterns.
    pub fn new(repo_id: impl Into<String>) -> Self {
        Self {
            repo_id: repo_id.into(),
            file_name: "q4_1.gguf".to_string(),
            clip_name: "*mmproj*".to_string(),
        }
    }

    pub fn with_file(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    pub fn with_clip(mut self, clip_name: impl Into<String>) -> Self {
        self.clip_name = clip_name.into();
        self
    }
}

#[derive(Debug, serde::Deserialize)]
struct TreeEntry {
    path: String,
}

fn authorized(
    builder: reqwest::RequestBuilder,
    token: Option<&str>,
) -> reqwest::RequestBuilder {
    let builder = builder.header("User-Agent", concat!("voxserve/", env!("CARGO_PKG_VERSION")));
    match token {
        Some(token) => builder.bearer_auth(token),
        None => builder,
    }
}

/// List all files in a repository via the hub tree API.
async fn list_repo_files(repo_id: &str, token: Option<&str>) -> Result<Vec<String>, StorageError> {
    let api_url = format!("https://huggingface.co/api/models/{repo_id}/tree/main");

    let client = reqwest::Client::new();
    let response = authorized(client.get(&api_url), token).send().await?;

    if !response.status().is_success() {
        return Err(StorageError::Download(format!(
            "hub tree api returned {} for {repo_id}",
            response.status()
        )));
    }

    let entries: Vec<TreeEntry> = response.json().await?;
    Ok(entries.into_iter().map(|e| e.path).collect())
}

/// Pick the first repo file matching `pattern` (glob syntax, case
/// insensitive on the pattern's literal parts is not applied; hub names are
/// matched as-is).
pub fn select_file<'a>(files: &'a [String], pattern: &str) -> Option<&'a str> {
    let glob = Pattern::new(pattern).ok()?;
    files
        .iter()
        .map(String::as_str)
        .find(|path| glob.matches(path) || *path == pattern)
}

/// Resolve a filename pattern against a repository's file tree.
pub async fn resolve_file(
    repo_id: &str,
    pattern: &str,
    token: Option<&str>,
) -> Result<String, StorageError> {
    let files = list_repo_files(repo_id, token).await?;

    select_file(&files, pattern)
        .map(str::to_string)
        .ok_or_else(|| StorageError::NoMatch {
            repo_id: repo_id.to_string(),
            pattern: pattern.to_string(),
        })
}

/// Flatten a repo-relative path into a safe cache filename.
fn cache_file_name(repo_id: &str, filename: &str) -> String {
    let mut name = format!("{repo_id}__{filename}").replace(['/', '\\'], "__");
    name.retain(|ch| !ch.is_control());
    name
}

/// Download one repository file into the local model cache.
///
/// Already-cached files are returned immediately. Downloads stream into a
/// temp file and are moved into place atomically so an interrupted download
/// never poisons the cache.
pub async fn download_file(
    repo_id: &str,
    filename: &str,
    token: Option<&str>,
) -> Result<PathBuf, StorageError> {
    let models = models_dir()?;
    let local_name = cache_file_name(repo_id, filename);
    let output_path = models.join(&local_name);
    let temp_path = models.join(format!("{local_name}.tmp"));

    if output_path.exists() {
        let metadata = std::fs::metadata(&output_path)?;
        if metadata.len() > 0 {
            tracing::info!("model file already cached: {}", output_path.display());
            return Ok(output_path);
        }
    }

    let url = format!("https://huggingface.co/{repo_id}/resolve/main/{filename}");
    tracing::info!("downloading {url}");

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(3600))
        .build()?;

    let mut response = authorized(client.get(&url), token).send().await?;
    if !response.status().is_success() {
        return Err(StorageError::Download(format!(
            "download of {filename} failed with status {}",
            response.status()
        )));
    }

    let total = response.content_length().unwrap_or(0);
    if total > 0 {
        tracing::info!("file size: {}", format_size(total));
    }

    let mut file = File::create(&temp_path).await?;
    let mut downloaded: u64 = 0;
    let mut last_decile = 0;

    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;

        if total > 0 {
            let decile = downloaded * 10 / total;
            if decile > last_decile {
                last_decile = decile;
                tracing::debug!(
                    "downloaded {} / {} ({}%)",
                    format_size(downloaded),
                    format_size(total),
                    decile * 10
                );
            }
        }
    }
    file.flush().await?;
    drop(file);

    if total > 0 && downloaded != total {
        let _ = std::fs::remove_file(&temp_path);
        return Err(StorageError::Download(format!(
            "download incomplete: got {downloaded} bytes, expected {total}"
        )));
    }

    std::fs::rename(&temp_path, &output_path)?;
    tracing::info!("download complete: {}", output_path.display());

    Ok(output_path)
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes < 1024.0 {
        format!("{} B", bytes as u64)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo_files() -> Vec<String> {
        vec![
            "README.md".to_string(),
            "ggml-model-q4_1.gguf".to_string(),
            "mmproj-model-f16.gguf".to_string(),
        ]
    }

    #[test]
    fn test_hub_defaults() {
        let hub = Hub::new("BAAI/Bunny-Llama-3-8B-V-gguf");
        assert_eq!(hub.repo_id, "BAAI/Bunny-Llama-3-8B-V-gguf");
        assert_eq!(hub.file_name, "q4_1.gguf");
        assert_eq!(hub.clip_name, "*mmproj*");
    }

    #[test]
    fn test_hub_builders() {
        let hub = Hub::new("a/b").with_file("*Q4_K_M*").with_clip("proj.gguf");
        assert_eq!(hub.file_name, "*Q4_K_M*");
        assert_eq!(hub.clip_name, "proj.gguf");
    }

    #[test]
    fn test_select_file_glob() {
        let files = repo_files();
        assert_eq!(select_file(&files, "*mmproj*"), Some("mmproj-model-f16.gguf"));
        assert_eq!(select_file(&files, "*q4_1*"), Some("ggml-model-q4_1.gguf"));
        assert_eq!(select_file(&files, "*q8_0*"), None);
    }

    #[test]
    fn test_select_file_literal() {
        let files = repo_files();
        assert_eq!(select_file(&files, "README.md"), Some("README.md"));
    }

    #[test]
    fn test_cache_file_name_flattening() {
        let name = cache_file_name("TheBloke/Llama-2-7B-GGUF", "llama-2-7b.Q4_K_M.gguf");
        assert_eq!(name, "TheBloke__Llama-2-7B-GGUF__llama-2-7b.Q4_K_M.gguf");
        assert!(!name.contains('/'));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
    }
}
