//! Piece store: downstream block sink that verifies and writes pieces
//!
//! Blocks are buffered per piece until the whole piece is present, the
//! plaintext is checked against the BLAKE3 hash in the metadata, and the
//! verified piece is written into the output files through the file layout.

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use zipseed_chunks::{verify_piece, FileLayout, Metainfo};
use zipseed_core::{PieceIndex, ZipseedError, ZipseedResult};

use crate::reassembly::ReassembledBlock;

/// What one ingested block did to its piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceOutcome {
    /// More blocks are needed
    Partial,
    /// Piece verified and written
    Verified,
    /// Piece was whole but its hash did not match; its blocks were dropped
    HashMismatch,
    /// Block for a piece that is already stored
    Duplicate,
}

struct PieceBuffer {
    data: Vec<u8>,
    /// Block offsets already copied in; a refetched block is not counted twice
    offsets: BTreeSet<u64>,
    received: u64,
}

pub struct PieceStore {
    layout: FileLayout,
    piece_hashes: Vec<String>,
    base: PathBuf,
    partial: HashMap<PieceIndex, PieceBuffer>,
    have: Vec<bool>,
    verified: usize,
    hash_failures: u64,
}

impl PieceStore {
    /// Prepare output files under `base`, sized to their final lengths.
    pub fn create(meta: &Metainfo, base: &Path) -> ZipseedResult<Self> {
        meta.validate()?;
        let layout = meta.layout();
        for i in 0..layout.files.len() {
            let path = layout.file_path(i, base);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| {
                    std::io::Error::new(e.kind(), format!("opening {}: {e}", path.display()))
                })?;
            file.set_len(layout.files[i].length)?;
        }

        let pieces = layout.num_pieces();
        Ok(Self {
            layout,
            piece_hashes: meta.piece_hashes.clone(),
            base: base.to_path_buf(),
            partial: HashMap::new(),
            have: vec![false; pieces],
            verified: 0,
            hash_failures: 0,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.have.len()
    }

    pub fn piece_size(&self, piece: PieceIndex) -> u64 {
        self.layout.piece_size(piece)
    }

    pub fn verified_pieces(&self) -> usize {
        self.verified
    }

    pub fn hash_failures(&self) -> u64 {
        self.hash_failures
    }

    pub fn has_piece(&self, piece: PieceIndex) -> bool {
        self.have.get(piece as usize).copied().unwrap_or(false)
    }

    pub fn is_complete(&self) -> bool {
        self.verified == self.have.len()
    }

    pub fn missing_pieces(&self) -> Vec<PieceIndex> {
        self.have
            .iter()
            .enumerate()
            .filter(|(_, &h)| !h)
            .map(|(i, _)| i as PieceIndex)
            .collect()
    }

    pub fn ingest(&mut self, block: ReassembledBlock) -> ZipseedResult<PieceOutcome> {
        let piece = block.piece;
        if piece as usize >= self.have.len() {
            return Err(ZipseedError::IndexOutOfRange {
                piece,
                pieces: self.have.len(),
            });
        }
        if self.has_piece(piece) {
            return Ok(PieceOutcome::Duplicate);
        }

        let size = self.layout.piece_size(piece);
        let end = block.offset + block.payload.len() as u64;
        if end > size {
            return Err(ZipseedError::Metadata(format!(
                "block {}..{end} overruns piece {piece} of {size} bytes",
                block.offset
            )));
        }

        let buf = self.partial.entry(piece).or_insert_with(|| PieceBuffer {
            data: vec![0u8; size as usize],
            offsets: BTreeSet::new(),
            received: 0,
        });
        buf.data[block.offset as usize..end as usize].copy_from_slice(&block.payload);
        if buf.offsets.insert(block.offset) {
            buf.received += block.payload.len() as u64;
        }
        if buf.received < size {
            return Ok(PieceOutcome::Partial);
        }

        let Some(buf) = self.partial.remove(&piece) else {
            return Ok(PieceOutcome::Partial);
        };
        let expected = self
            .piece_hashes
            .get(piece as usize)
            .map(String::as_str)
            .unwrap_or_default();
        if !verify_piece(&buf.data, expected) {
            self.hash_failures += 1;
            warn!(piece, "piece failed hash verification");
            return Ok(PieceOutcome::HashMismatch);
        }

        self.write_piece(piece, &buf.data)?;
        self.have[piece as usize] = true;
        self.verified += 1;
        debug!(piece, size, "piece verified and written");
        Ok(PieceOutcome::Verified)
    }

    fn write_piece(&self, piece: PieceIndex, data: &[u8]) -> ZipseedResult<()> {
        let mut at = 0usize;
        for slice in self.layout.map_block(piece, 0, data.len() as u64) {
            let path = self.layout.file_path(slice.file_index, &self.base);
            let mut file = OpenOptions::new().write(true).open(&path).map_err(|e| {
                std::io::Error::new(e.kind(), format!("opening {}: {e}", path.display()))
            })?;
            file.seek(SeekFrom::Start(slice.offset))?;
            let end = at + slice.size as usize;
            file.write_all(&data[at..end])?;
            at = end;
        }
        Ok(())
    }

    /// Output files, in layout order.
    pub fn file_paths(&self) -> Vec<PathBuf> {
        (0..self.layout.files.len())
            .map(|i| self.layout.file_path(i, &self.base))
            .collect()
    }

    /// Flush all output files to disk.
    pub fn sync_all(&self) -> ZipseedResult<()> {
        for path in self.file_paths() {
            File::open(&path)?.sync_all()?;
        }
        Ok(())
    }
}
