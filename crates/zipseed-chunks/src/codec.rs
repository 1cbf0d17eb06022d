//! Single-shot piece codecs
//!
//! Every piece is compressed as its own self-contained stream, so any piece
//! can be decompressed without the others. Decompression is told the exact
//! plaintext length up front and fails unless the stream yields exactly that
//! many bytes.

use std::io::{Read, Write};
use std::sync::Arc;

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use zipseed_core::{CodecError, CodecKind};

/// A deterministic compress/decompress pair applied per piece.
pub trait PieceCodec: Send + Sync {
    fn kind(&self) -> CodecKind;

    fn level(&self) -> i32;

    fn compress(&self, plain: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Decompress `compressed`, which must expand to exactly `expected_len` bytes.
    fn decompress(&self, compressed: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError>;
}

/// Build the codec named in metadata or configuration.
pub fn codec_for(kind: CodecKind, level: i32) -> Arc<dyn PieceCodec> {
    match kind {
        CodecKind::Zlib => Arc::new(ZlibCodec::new(level)),
        CodecKind::Zstd => Arc::new(ZstdCodec::new(level)),
    }
}

/// zlib via flate2. Levels outside 0..=9 fall back to the default level.
#[derive(Debug, Clone, Copy)]
pub struct ZlibCodec {
    level: i32,
}

impl ZlibCodec {
    pub fn new(level: i32) -> Self {
        let level = if (0..=9).contains(&level) {
            level
        } else {
            CodecKind::Zlib.default_level()
        };
        Self { level }
    }
}

impl PieceCodec for ZlibCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Zlib
    }

    fn level(&self) -> i32 {
        self.level
    }

    fn compress(&self, plain: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut enc = ZlibEncoder::new(
            Vec::with_capacity(plain.len() / 2 + 64),
            Compression::new(self.level as u32),
        );
        enc.write_all(plain).map_err(|e| CodecError::Compress {
            codec: CodecKind::Zlib,
            msg: e.to_string(),
        })?;
        enc.finish().map_err(|e| CodecError::Compress {
            codec: CodecKind::Zlib,
            msg: e.to_string(),
        })
    }

    fn decompress(&self, compressed: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        // Read one byte past the expected length so oversized streams are caught
        // without inflating them completely.
        let mut out = Vec::with_capacity(expected_len);
        ZlibDecoder::new(compressed)
            .take(expected_len as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompress {
                codec: CodecKind::Zlib,
                msg: e.to_string(),
            })?;
        check_len(out, expected_len)
    }
}

/// zstd via the zstd crate's bulk API.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl PieceCodec for ZstdCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Zstd
    }

    fn level(&self) -> i32 {
        self.level
    }

    fn compress(&self, plain: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::bulk::compress(plain, self.level).map_err(|e| CodecError::Compress {
            codec: CodecKind::Zstd,
            msg: e.to_string(),
        })
    }

    fn decompress(&self, compressed: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        // The bulk decoder refuses to grow past its capacity, so an oversized
        // frame surfaces as an error rather than a longer buffer.
        let out = zstd::bulk::decompress(compressed, expected_len).map_err(|e| {
            CodecError::Decompress {
                codec: CodecKind::Zstd,
                msg: e.to_string(),
            }
        })?;
        check_len(out, expected_len)
    }
}

fn check_len(out: Vec<u8>, expected: usize) -> Result<Vec<u8>, CodecError> {
    if out.len() != expected {
        return Err(CodecError::LengthMismatch {
            expected,
            actual: out.len(),
        });
    }
    Ok(out)
}
