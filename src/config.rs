//! Configuration
//!
//! Loads the server's TOML configuration file and exposes the immutable
//! chat-related snapshot consumed by a model handle at construction time.
//! Each handle captures its own [`ChatConfig`] value, so two handles in one
//! process can run with different settings.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors raised while reading the configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Immutable chat configuration snapshot
///
/// Captured once when a model handle is constructed. Later changes to the
/// on-disk file do not affect an already-loading or loaded handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Maximum number of images accepted across a whole conversation
    pub max_images: usize,
    /// Context window size passed to the engine
    pub max_tokens: u32,
    /// Lock model memory so it is never swapped out
    pub keep_in_mem: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_images: 5,
            max_tokens: 512,
            keep_in_mem: false,
        }
    }
}

/// The `[config]` table of the server TOML file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigSection {
    pub keep_in_mem: bool,
    pub max_images: usize,
    pub max_tokens: u32,
    pub huggingface_key: String,
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            keep_in_mem: false,
            max_images: 5,
            max_tokens: 512,
            huggingface_key: String::new(),
        }
    }
}

/// The `[server]` table of the server TOML file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub ip: String,
    pub password: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_string(),
            password: "password".to_string(),
            port: 8282,
        }
    }
}

/// Full server configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub config: ConfigSection,
    pub server: ServerSection,
}

impl ServerConfig {
    /// Load the configuration from a TOML file.
    ///
    /// Missing keys fall back to their defaults; a missing file is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&raw)?;

        tracing::info!("config loaded from {}", path.display());
        tracing::debug!(
            keep_in_mem = config.config.keep_in_mem,
            max_images = config.config.max_images,
            max_tokens = config.config.max_tokens,
            ip = %config.server.ip,
            port = config.server.port,
            "loaded config"
        );

        Ok(config)
    }

    /// The chat snapshot handed to a model handle.
    pub fn chat_config(&self) -> ChatConfig {
        ChatConfig {
            max_images: self.config.max_images,
            max_tokens: self.config.max_tokens,
            keep_in_mem: self.config.keep_in_mem,
        }
    }

    /// Hugging Face API token, if one is configured.
    pub fn huggingface_key(&self) -> Option<&str> {
        if self.config.huggingface_key.is_empty() {
            None
        } else {
            Some(&self.config.huggingface_key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.config.max_images, 5);
        assert_eq!(config.config.max_tokens, 512);
        assert!(!config.config.keep_in_mem);
        assert_eq!(config.server.ip, "0.0.0.0");
        assert_eq!(config.server.port, 8282);
        assert!(config.huggingface_key().is_none());
    }

    #[test]
    fn test_partial_file() {
        let raw = r#"
            [config]
            max_images = 2
            huggingface_key = "hf_abc"

            [server]
            port = 9000
        "#;
        let config: ServerConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.config.max_images, 2);
        assert_eq!(config.config.max_tokens, 512);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.huggingface_key(), Some("hf_abc"));
    }

    #[test]
    fn test_chat_config_snapshot() {
        let raw = "[config]\nmax_tokens = 4096\nkeep_in_mem = true\n";
        let config: ServerConfig = toml::from_str(raw).unwrap();
        let snapshot = config.chat_config();
        assert_eq!(snapshot.max_tokens, 4096);
        assert!(snapshot.keep_in_mem);
        assert_eq!(snapshot.max_images, 5);
    }

    #[test]
    fn test_load_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[config]\nmax_images = 3").unwrap();

        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.config.max_images, 3);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(ServerConfig::load("/nonexistent/server.toml").is_err());
    }
}
