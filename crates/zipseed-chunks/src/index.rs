//! Piece size index: compressed size per piece, offsets by prefix sum
//!
//! Wire form (`pieces-size` in the zipinfo record):
//!   one big-endian u32 per piece, in piece order, no header.

use serde::{Deserialize, Serialize};
use zipseed_core::{CodecError, PieceIndex, ZipseedError, ZipseedResult};

const ENTRY_WIRE_SIZE: usize = 4;

/// Compressed size of one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceSizeEntry {
    pub compressed_size: u64,
}

/// Byte region of one piece inside the compressed blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceSpan {
    pub offset: u64,
    pub length: u64,
}

impl PieceSpan {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Ordered, immutable-once-built table of compressed piece sizes.
///
/// `offsets[i]` is the sum of the sizes of entries `0..i`; one extra trailing
/// offset holds the total blob size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceSizeIndex {
    entries: Vec<PieceSizeEntry>,
    offsets: Vec<u64>,
}

impl PieceSizeIndex {
    pub fn from_sizes<I: IntoIterator<Item = u64>>(sizes: I) -> Self {
        let mut entries = Vec::new();
        let mut offsets = vec![0u64];
        let mut running = 0u64;
        for compressed_size in sizes {
            entries.push(PieceSizeEntry { compressed_size });
            running += compressed_size;
            offsets.push(running);
        }
        Self { entries, offsets }
    }

    /// Parse the big-endian u32 wire form.
    pub fn from_wire(bytes: &[u8]) -> ZipseedResult<Self> {
        if bytes.len() % ENTRY_WIRE_SIZE != 0 {
            return Err(ZipseedError::Metadata(format!(
                "pieces-size length {} is not a multiple of {ENTRY_WIRE_SIZE}",
                bytes.len()
            )));
        }
        Ok(Self::from_sizes(bytes.chunks_exact(ENTRY_WIRE_SIZE).map(|c| {
            u32::from_be_bytes([c[0], c[1], c[2], c[3]]) as u64
        })))
    }

    /// Encode as big-endian u32 sizes. Fails if any entry exceeds u32.
    pub fn to_wire(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(self.entries.len() * ENTRY_WIRE_SIZE);
        for (i, entry) in self.entries.iter().enumerate() {
            let size = u32::try_from(entry.compressed_size).map_err(|_| CodecError::PieceTooLarge {
                piece: i as PieceIndex,
                size: entry.compressed_size,
            })?;
            out.extend_from_slice(&size.to_be_bytes());
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PieceSizeEntry] {
        &self.entries
    }

    /// Total compressed blob size.
    pub fn total_size(&self) -> u64 {
        self.offsets[self.entries.len()]
    }

    /// Offset and length of `piece` in the blob.
    pub fn span(&self, piece: PieceIndex) -> ZipseedResult<PieceSpan> {
        let i = piece as usize;
        match self.entries.get(i) {
            Some(entry) => Ok(PieceSpan {
                offset: self.offsets[i],
                length: entry.compressed_size,
            }),
            None => Err(ZipseedError::IndexOutOfRange {
                piece,
                pieces: self.entries.len(),
            }),
        }
    }

    pub fn spans(&self) -> impl Iterator<Item = PieceSpan> + '_ {
        self.entries.iter().enumerate().map(|(i, e)| PieceSpan {
            offset: self.offsets[i],
            length: e.compressed_size,
        })
    }
}

/// Index under construction, filled in piece order by the encoder.
#[derive(Debug, Default)]
pub struct PieceSizeIndexBuilder {
    sizes: Vec<u64>,
}

impl PieceSizeIndexBuilder {
    pub fn with_capacity(pieces: usize) -> Self {
        Self {
            sizes: Vec::with_capacity(pieces),
        }
    }

    /// Record the next piece. Sizes must fit the u32 wire form.
    pub fn push(&mut self, compressed_size: u64) -> Result<(), CodecError> {
        if compressed_size > u32::MAX as u64 {
            return Err(CodecError::PieceTooLarge {
                piece: self.sizes.len() as PieceIndex,
                size: compressed_size,
            });
        }
        self.sizes.push(compressed_size);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn finish(self) -> PieceSizeIndex {
        PieceSizeIndex::from_sizes(self.sizes)
    }
}
