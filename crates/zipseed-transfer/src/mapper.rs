//! Range request mapper: piece index -> byte range of the compressed blob

use std::ops::Range;
use std::sync::Arc;

use zipseed_chunks::PieceSizeIndex;
use zipseed_core::{PieceIndex, ZipseedError, ZipseedResult};

/// Where one compressed piece lives in the blob and what it expands to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceRange {
    pub piece: PieceIndex,
    /// Offset of the piece in the remote blob
    pub offset: u64,
    pub compressed_length: u64,
    pub expected_plain_length: u64,
}

impl PieceRange {
    /// Last byte covered, inclusive, as HTTP ranges count. An empty range
    /// reports its own offset.
    pub fn last_byte(&self) -> u64 {
        (self.offset + self.compressed_length).saturating_sub(1).max(self.offset)
    }

    /// Value of the `Range` request header: `bytes=<first>-<last>`.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.offset, self.last_byte())
    }

    pub fn as_range(&self) -> Range<u64> {
        self.offset..self.offset + self.compressed_length
    }
}

/// Pure lookup over an immutable size index and the plaintext piece geometry.
#[derive(Debug, Clone)]
pub struct RangeMapper {
    index: Arc<PieceSizeIndex>,
    piece_length: u64,
    total_plain: u64,
}

impl RangeMapper {
    pub fn new(index: Arc<PieceSizeIndex>, piece_length: u64, total_plain: u64) -> Self {
        Self {
            index,
            piece_length,
            total_plain,
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.index.len()
    }

    pub fn index(&self) -> &PieceSizeIndex {
        &self.index
    }

    /// Plaintext length of `piece`; the last piece may be short.
    pub fn plain_length(&self, piece: PieceIndex) -> u64 {
        let start = piece as u64 * self.piece_length;
        self.total_plain
            .saturating_sub(start)
            .min(self.piece_length)
    }

    pub fn map(&self, piece: PieceIndex) -> ZipseedResult<PieceRange> {
        let span = self.index.span(piece)?;
        if span.length == 0 {
            return Err(ZipseedError::Metadata(format!(
                "piece {piece} has a zero compressed size"
            )));
        }
        let expected_plain_length = self.plain_length(piece);
        if expected_plain_length == 0 {
            return Err(ZipseedError::Metadata(format!(
                "piece {piece} lies past the end of the content"
            )));
        }
        Ok(PieceRange {
            piece,
            offset: span.offset,
            compressed_length: span.length,
            expected_plain_length,
        })
    }
}
