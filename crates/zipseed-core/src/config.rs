use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ZipseedError, ZipseedResult};
use crate::types::CodecKind;

/// Smallest piece size accepted when creating content.
pub const MIN_PIECE_SIZE: u64 = 16 * 1024;

/// Largest piece size accepted anywhere; a whole piece is buffered in memory.
pub const MAX_PIECE_SIZE: u64 = 64 * 1024 * 1024;

/// Standard protocol block size.
pub const DEFAULT_BLOCK_SIZE: u32 = 16 * 1024;

/// Top-level configuration (loaded from zipseed.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ZipseedConfig {
    pub create: CreateConfig,
    pub transfer: TransferConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateConfig {
    /// Piece size in bytes (0 = pick from content size)
    pub piece_size: u64,
    /// Piece codec: "zlib" or "zstd"
    pub codec: CodecKind,
    /// Codec level (None = codec default)
    pub level: Option<i32>,
    /// Include files and directories whose name starts with '.'
    pub include_hidden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Protocol block size pieces are re-sliced into
    pub block_size: u32,
    /// Target number of in-flight range requests per connection
    pub desired_queue_size: usize,
    /// Decompression worker count (0 = cpu_count)
    pub decompress_workers: usize,
    /// Per-request HTTP timeout in seconds
    pub request_timeout_secs: u64,
    /// Transport-level retry limit (the request scheduler never retries)
    pub max_retries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for CreateConfig {
    fn default() -> Self {
        Self {
            piece_size: 0,
            codec: CodecKind::Zlib,
            level: None,
            include_hidden: false,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            desired_queue_size: 4,
            decompress_workers: 0,
            request_timeout_secs: 60,
            max_retries: 3,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl CreateConfig {
    pub fn effective_level(&self) -> i32 {
        self.level.unwrap_or_else(|| self.codec.default_level())
    }
}

impl TransferConfig {
    /// Worker count with 0 resolved to the available parallelism.
    pub fn effective_workers(&self) -> usize {
        if self.decompress_workers > 0 {
            return self.decompress_workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

impl ZipseedConfig {
    /// Load from a TOML file, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> ZipseedResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: ZipseedConfig = toml::from_str(&content)
            .map_err(|e| ZipseedError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ZipseedResult<()> {
        let block = self.transfer.block_size;
        if block == 0 || !block.is_power_of_two() {
            return Err(ZipseedError::Config(format!(
                "transfer.block_size must be a non-zero power of two, got {block}"
            )));
        }
        if self.transfer.desired_queue_size == 0 {
            return Err(ZipseedError::Config(
                "transfer.desired_queue_size must be at least 1".into(),
            ));
        }
        validate_piece_size(self.create.piece_size)
    }
}

/// Accepts 0 (automatic) or a power of two in
/// [`MIN_PIECE_SIZE`]..=[`MAX_PIECE_SIZE`].
pub fn validate_piece_size(piece_size: u64) -> ZipseedResult<()> {
    if piece_size == 0 {
        return Ok(());
    }
    if !(MIN_PIECE_SIZE..=MAX_PIECE_SIZE).contains(&piece_size) || !piece_size.is_power_of_two()
    {
        return Err(ZipseedError::Config(format!(
            "piece size must be a power of two between {MIN_PIECE_SIZE} and {MAX_PIECE_SIZE} bytes, got {piece_size}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[create]
piece_size = 262144
codec = "zstd"
level = 9
include_hidden = true

[transfer]
block_size = 8192
desired_queue_size = 8
decompress_workers = 2
request_timeout_secs = 10
max_retries = 0

[log]
level = "debug"
format = "json"
"#;
        let config: ZipseedConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.create.piece_size, 262144);
        assert_eq!(config.create.codec, CodecKind::Zstd);
        assert_eq!(config.create.effective_level(), 9);
        assert!(config.create.include_hidden);
        assert_eq!(config.transfer.block_size, 8192);
        assert_eq!(config.transfer.desired_queue_size, 8);
        assert_eq!(config.transfer.effective_workers(), 2);
        assert_eq!(config.log.format, "json");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_defaults() {
        let config: ZipseedConfig = toml::from_str("").unwrap();

        assert_eq!(config.create.piece_size, 0);
        assert_eq!(config.create.codec, CodecKind::Zlib);
        assert_eq!(config.create.effective_level(), 6);
        assert_eq!(config.transfer.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(config.transfer.desired_queue_size, 4);
        assert!(config.transfer.effective_workers() >= 1);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[transfer]
block_size = 4096
"#;
        let config: ZipseedConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.transfer.block_size, 4096);
        // Defaults
        assert_eq!(config.transfer.desired_queue_size, 4);
        assert_eq!(config.create.codec, CodecKind::Zlib);
    }

    #[test]
    fn test_validate_rejects_odd_block_size() {
        let mut config = ZipseedConfig::default();
        config.transfer.block_size = 10_000;
        assert!(config.validate().is_err());
        config.transfer.block_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_piece_size_rules() {
        assert!(validate_piece_size(0).is_ok());
        assert!(validate_piece_size(16 * 1024).is_ok());
        assert!(validate_piece_size(4 * 1024 * 1024).is_ok());
        assert!(validate_piece_size(8 * 1024).is_err());
        assert!(validate_piece_size(100_000).is_err());
        assert!(validate_piece_size(MAX_PIECE_SIZE).is_ok());
        assert!(validate_piece_size(MAX_PIECE_SIZE * 2).is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = ZipseedConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.transfer.block_size, DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn test_load_invalid_file_is_config_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("zipseed.toml");
        std::fs::write(&path, "[transfer]\nblock_size = 3\n").unwrap();
        let err = ZipseedConfig::load(&path).unwrap_err();
        assert!(matches!(err, ZipseedError::Config(_)));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = ZipseedConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: ZipseedConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.transfer.block_size, parsed.transfer.block_size);
        assert_eq!(config.create.codec, parsed.create.codec);
    }
}
