//! GGUF file validation
//!
//! Cheap header check run before a path is handed to llama-cpp, so an
//! obviously wrong file fails fast with a readable error instead of deep
//! inside the engine.

use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// `"GGUF"` in little-endian byte order
pub const GGUF_MAGIC: u32 = 0x4655_4747;

#[derive(Debug, Error)]
pub enum GgufError {
    #[error("io error reading gguf header: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a gguf file (bad magic: {0:#010x})")]
    BadMagic(u32),

    #[error("gguf file truncated before header end")]
    Truncated,
}

/// Header fields extracted during validation
#[derive(Debug, Clone, Copy)]
pub struct GgufMetadata {
    pub version: u32,
}

/// Validate the GGUF magic and read the format version.
pub fn validate_gguf(path: impl AsRef<Path>) -> Result<GgufMetadata, GgufError> {
    let mut file = std::fs::File::open(path.as_ref())?;

    let mut header = [0u8; 8];
    file.read_exact(&mut header)
        .map_err(|_| GgufError::Truncated)?;

    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != GGUF_MAGIC {
        return Err(GgufError::BadMagic(magic));
    }

    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    Ok(GgufMetadata { version })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_valid_header() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"GGUF").unwrap();
        file.write_all(&3u32.to_le_bytes()).unwrap();

        let metadata = validate_gguf(file.path()).unwrap();
        assert_eq!(metadata.version, 3);
    }

    #[test]
    fn test_bad_magic() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"NOPE\x01\x00\x00\x00").unwrap();

        assert!(matches!(
            validate_gguf(file.path()),
            Err(GgufError::BadMagic(_))
        ));
    }

    #[test]
    fn test_truncated_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"GG").unwrap();

        assert!(matches!(
            validate_gguf(file.path()),
            Err(GgufError::Truncated)
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            validate_gguf("/nonexistent/model.gguf"),
            Err(GgufError::Io(_))
        ));
    }
}
