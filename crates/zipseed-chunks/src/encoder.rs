//! Piece encoder: compress every piece independently into one blob
//!
//! Blob format on disk:
//!   N compressed pieces back to back, in piece order, no headers. The piece
//!   size index (published in the metadata record) is the only way to find
//!   piece boundaries.
//!
//! Pieces are read in order, compressed in parallel batches with rayon, and
//! written strictly in piece order. Any read or codec failure aborts the whole
//! run and no index is returned.

use rayon::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use zipseed_core::{PieceIndex, ZipseedResult};

use crate::codec::PieceCodec;
use crate::index::{PieceSizeIndex, PieceSizeIndexBuilder};
use crate::layout::FileLayout;
use crate::piece_hash::{hash_bytes, hash_to_hex};

/// Progress callback type (pieces_done, pieces_total)
pub type ProgressFn = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Source of plaintext piece bytes.
pub trait PieceReader {
    fn num_pieces(&self) -> usize;

    /// Replace the contents of `buf` with the bytes of `piece`.
    fn read_piece(&mut self, piece: PieceIndex, buf: &mut Vec<u8>) -> std::io::Result<()>;
}

/// Reads pieces from the files of a [`FileLayout`] stored under `base`.
pub struct FilePieceReader<'a> {
    layout: &'a FileLayout,
    base: PathBuf,
    open: Option<(usize, File)>,
}

impl<'a> FilePieceReader<'a> {
    pub fn new(layout: &'a FileLayout, base: impl Into<PathBuf>) -> Self {
        Self {
            layout,
            base: base.into(),
            open: None,
        }
    }

    fn file(&mut self, file_index: usize) -> std::io::Result<&mut File> {
        let cached = matches!(self.open, Some((i, _)) if i == file_index);
        if !cached {
            let path = self.layout.file_path(file_index, &self.base);
            let file = File::open(&path).map_err(|e| {
                std::io::Error::new(e.kind(), format!("opening {}: {e}", path.display()))
            })?;
            self.open = Some((file_index, file));
        }
        match self.open.as_mut() {
            Some((_, f)) => Ok(f),
            None => Err(std::io::Error::other("file handle cache empty")),
        }
    }
}

impl PieceReader for FilePieceReader<'_> {
    fn num_pieces(&self) -> usize {
        self.layout.num_pieces()
    }

    fn read_piece(&mut self, piece: PieceIndex, buf: &mut Vec<u8>) -> std::io::Result<()> {
        buf.clear();
        let size = self.layout.piece_size(piece);
        for slice in self.layout.map_block(piece, 0, size) {
            let start = buf.len();
            buf.resize(start + slice.size as usize, 0);
            let file = self.file(slice.file_index)?;
            file.seek(SeekFrom::Start(slice.offset))?;
            file.read_exact(&mut buf[start..])?;
        }
        Ok(())
    }
}

/// Serves pieces out of an in-memory buffer.
pub struct MemoryPieceReader<'a> {
    data: &'a [u8],
    piece_length: usize,
}

impl<'a> MemoryPieceReader<'a> {
    pub fn new(data: &'a [u8], piece_length: usize) -> Self {
        Self {
            data,
            piece_length: piece_length.max(1),
        }
    }
}

impl PieceReader for MemoryPieceReader<'_> {
    fn num_pieces(&self) -> usize {
        self.data.len().div_ceil(self.piece_length)
    }

    fn read_piece(&mut self, piece: PieceIndex, buf: &mut Vec<u8>) -> std::io::Result<()> {
        let start = piece as usize * self.piece_length;
        if start >= self.data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("piece {piece} past end of content"),
            ));
        }
        let end = (start + self.piece_length).min(self.data.len());
        buf.clear();
        buf.extend_from_slice(&self.data[start..end]);
        Ok(())
    }
}

/// Aggregate numbers for one encode run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeStats {
    pub pieces: u64,
    pub plain_bytes: u64,
    pub compressed_bytes: u64,
}

impl EncodeStats {
    /// compressed / plain; 0.0 for empty content
    pub fn ratio(&self) -> f64 {
        if self.plain_bytes == 0 {
            return 0.0;
        }
        self.compressed_bytes as f64 / self.plain_bytes as f64
    }
}

/// Result of a successful encode
#[derive(Debug, Clone)]
pub struct EncodedContent {
    pub index: PieceSizeIndex,
    /// Hex BLAKE3 of every plaintext piece, in piece order
    pub piece_hashes: Vec<String>,
    pub stats: EncodeStats,
}

/// Compress every piece of `reader` into `out`.
pub fn encode<R: PieceReader, W: Write>(
    reader: &mut R,
    codec: &Arc<dyn PieceCodec>,
    out: &mut W,
    progress: Option<&ProgressFn>,
) -> ZipseedResult<EncodedContent> {
    let total = reader.num_pieces();
    let batch = (rayon::current_num_threads() * 2).max(1);
    let mut builder = PieceSizeIndexBuilder::with_capacity(total);
    let mut piece_hashes = Vec::with_capacity(total);
    let mut stats = EncodeStats::default();

    let mut next = 0usize;
    while next < total {
        let end = (next + batch).min(total);

        let mut plains = Vec::with_capacity(end - next);
        for piece in next..end {
            let mut buf = Vec::new();
            reader.read_piece(piece as PieceIndex, &mut buf)?;
            plains.push(buf);
        }

        let packed: Vec<_> = plains
            .par_iter()
            .map(|plain| codec.compress(plain).map(|c| (c, hash_bytes(plain))))
            .collect();

        for (i, result) in packed.into_iter().enumerate() {
            let piece = next + i;
            let (compressed, hash) = result?;
            builder.push(compressed.len() as u64)?;
            out.write_all(&compressed)?;

            debug!(
                piece,
                plain = plains[i].len(),
                compressed = compressed.len(),
                "piece encoded"
            );
            stats.pieces += 1;
            stats.plain_bytes += plains[i].len() as u64;
            stats.compressed_bytes += compressed.len() as u64;
            piece_hashes.push(hash_to_hex(&hash));
        }

        next = end;
        if let Some(cb) = progress {
            cb(next as u64, total as u64);
        }
    }

    out.flush()?;

    info!(
        pieces = stats.pieces,
        plain_bytes = stats.plain_bytes,
        compressed_bytes = stats.compressed_bytes,
        codec = %codec.kind(),
        level = codec.level(),
        "encode complete"
    );

    Ok(EncodedContent {
        index: builder.finish(),
        piece_hashes,
        stats,
    })
}

/// Encode `layout` (files under `base`) into the blob at `blob_path`.
///
/// The blob is written to `<blob_path>.partial` and renamed into place only
/// after every piece succeeded; on failure the partial file is removed.
pub fn encode_to_file(
    layout: &FileLayout,
    base: &Path,
    codec: &Arc<dyn PieceCodec>,
    blob_path: &Path,
    progress: Option<&ProgressFn>,
) -> ZipseedResult<EncodedContent> {
    let partial = partial_path(blob_path);
    if let Some(parent) = blob_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let result = write_blob(layout, base, codec, &partial, progress)
        .and_then(|encoded| {
            std::fs::rename(&partial, blob_path)?;
            Ok(encoded)
        });

    if result.is_err() {
        let _ = std::fs::remove_file(&partial);
    }
    result
}

fn write_blob(
    layout: &FileLayout,
    base: &Path,
    codec: &Arc<dyn PieceCodec>,
    path: &Path,
    progress: Option<&ProgressFn>,
) -> ZipseedResult<EncodedContent> {
    let mut out = BufWriter::new(File::create(path)?);
    let mut reader = FilePieceReader::new(layout, base);
    let encoded = encode(&mut reader, codec, &mut out, progress)?;
    out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok(encoded)
}

fn partial_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".partial");
    PathBuf::from(os)
}
