use thiserror::Error;

use crate::types::{CodecKind, PieceIndex};

pub type ZipseedResult<T> = Result<T, ZipseedError>;

#[derive(Debug, Error)]
pub enum ZipseedError {
    /// Piece index beyond the advertised piece size table.
    #[error("piece {piece} out of range (index has {pieces} entries)")]
    IndexOutOfRange { piece: PieceIndex, pieces: usize },

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection disconnected: {0}")]
    Disconnected(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ZipseedError {
    /// Errors after which the owning connection must be torn down.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            ZipseedError::IndexOutOfRange { .. }
                | ZipseedError::Codec(_)
                | ZipseedError::Transport(_)
                | ZipseedError::Disconnected(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("{codec} compress failed: {msg}")]
    Compress { codec: CodecKind, msg: String },

    #[error("{codec} decompress failed: {msg}")]
    Decompress { codec: CodecKind, msg: String },

    #[error("decompressed length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("piece {piece} compressed to {size} bytes, which does not fit the u32 size table")]
    PieceTooLarge { piece: PieceIndex, size: u64 },

    #[error("unknown codec: {0}")]
    UnknownCodec(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_is_fatal() {
        let err = ZipseedError::IndexOutOfRange { piece: 7, pieces: 3 };
        assert!(err.is_fatal_for_connection());
        assert!(err.to_string().contains("piece 7"));
    }

    #[test]
    fn io_is_not_connection_scoped() {
        let err = ZipseedError::from(std::io::Error::other("disk gone"));
        assert!(!err.is_fatal_for_connection());
    }

    #[test]
    fn length_mismatch_message() {
        let err = ZipseedError::from(CodecError::LengthMismatch {
            expected: 16384,
            actual: 16000,
        });
        assert!(err.is_fatal_for_connection());
        assert_eq!(
            err.to_string(),
            "codec error: decompressed length mismatch: expected 16384 bytes, got 16000"
        );
    }
}
