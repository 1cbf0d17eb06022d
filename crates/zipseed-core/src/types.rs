use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CodecError;

/// Zero-based piece number within the content.
pub type PieceIndex = u32;

/// Compression algorithm applied independently to every piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// zlib stream (RFC 1950), the historical web-seed format
    #[default]
    Zlib,
    /// zstd frame
    Zstd,
}

impl CodecKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodecKind::Zlib => "zlib",
            CodecKind::Zstd => "zstd",
        }
    }

    /// Level used when none is configured.
    pub fn default_level(&self) -> i32 {
        match self {
            CodecKind::Zlib => 6,
            CodecKind::Zstd => 3,
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodecKind {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "zlib" | "deflate" => Ok(CodecKind::Zlib),
            "zstd" => Ok(CodecKind::Zstd),
            other => Err(CodecError::UnknownCodec(other.to_string())),
        }
    }
}

/// Lifecycle phase of the transfer that owns a connection.
///
/// Range requests are only issued while `Downloading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferPhase {
    /// Verifying pieces already on disk
    CheckingFiles,
    /// Validating resume data
    CheckingResumeData,
    /// Metadata is still being fetched
    DownloadingMetadata,
    /// Pieces may be requested
    Downloading,
    /// Everything is present
    Seeding,
}

impl TransferPhase {
    pub fn can_download(&self) -> bool {
        matches!(self, TransferPhase::Downloading)
    }
}
