//! Fixed-size piece layout over one or more files
//!
//! Content is the concatenation of its files in order; pieces are cut from
//! that stream at fixed `piece_length` boundaries, so a piece may span
//! several files and the last piece may be short.
//!
//! Piece size targets when none is given:
//!   - roughly 1500 pieces per content
//!   - clamped to a power of two in [16KB, 16MB]

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use zipseed_core::config::MIN_PIECE_SIZE;
use zipseed_core::PieceIndex;

/// Largest automatically chosen piece size
pub const MAX_AUTO_PIECE_SIZE: u64 = 16 * 1024 * 1024;

const TARGET_PIECE_COUNT: u64 = 1500;

/// One file of the content, path relative to the content root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
}

/// Part of a piece that lives in a single file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSlice {
    pub file_index: usize,
    /// Byte offset within the file
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLayout {
    /// Content name (single file name or top-level directory name)
    pub name: String,
    pub piece_length: u64,
    pub files: Vec<FileEntry>,
}

impl FileLayout {
    pub fn new(name: impl Into<String>, piece_length: u64, files: Vec<FileEntry>) -> Self {
        Self {
            name: name.into(),
            piece_length,
            files,
        }
    }

    /// Scan `root` (a file or a directory) into a layout.
    ///
    /// Directories are walked recursively in sorted order. Names starting
    /// with '.' are skipped unless `include_hidden` is set. A `piece_length`
    /// of 0 picks one from the total size.
    pub fn scan(root: &Path, piece_length: u64, include_hidden: bool) -> Result<Self> {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .with_context(|| format!("content path has no file name: {}", root.display()))?;

        let meta = std::fs::metadata(root)
            .with_context(|| format!("reading metadata: {}", root.display()))?;

        let files = if meta.is_file() {
            vec![FileEntry {
                path: PathBuf::from(&name),
                length: meta.len(),
            }]
        } else {
            let mut out = Vec::new();
            collect_files(root, root, include_hidden, &mut out)?;
            out
        };

        if files.is_empty() {
            anyhow::bail!("no files found under {}", root.display());
        }

        let total: u64 = files.iter().map(|f| f.length).sum();
        let piece_length = if piece_length == 0 {
            auto_piece_size(total)
        } else {
            piece_length
        };

        Ok(Self::new(name, piece_length, files))
    }

    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    pub fn num_pieces(&self) -> usize {
        if self.piece_length == 0 {
            return 0;
        }
        self.total_length().div_ceil(self.piece_length) as usize
    }

    /// Size of `piece`; only the last piece may be shorter than `piece_length`.
    pub fn piece_size(&self, piece: PieceIndex) -> u64 {
        let start = piece as u64 * self.piece_length;
        let total = self.total_length();
        if start >= total {
            return 0;
        }
        (total - start).min(self.piece_length)
    }

    /// Map `size` bytes starting at `offset` within `piece` onto file slices.
    ///
    /// Zero-length files never produce a slice. A request running past the
    /// end of the content is truncated.
    pub fn map_block(&self, piece: PieceIndex, offset: u64, size: u64) -> Vec<FileSlice> {
        let mut slices = Vec::new();
        let mut pos = piece as u64 * self.piece_length + offset;
        let mut remaining = size;
        let mut file_start = 0u64;

        for (file_index, file) in self.files.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            let file_end = file_start + file.length;
            if pos < file_end && file.length > 0 {
                let in_file = pos - file_start;
                let take = remaining.min(file_end - pos);
                slices.push(FileSlice {
                    file_index,
                    offset: in_file,
                    size: take,
                });
                pos += take;
                remaining -= take;
            }
            file_start = file_end;
        }

        slices
    }

    /// Path of a file on disk given the directory the content lives in.
    ///
    /// Single-file content stores the bare file name, multi-file content is
    /// rooted at a directory named after the content.
    pub fn file_path(&self, file_index: usize, base: &Path) -> PathBuf {
        let rel = &self.files[file_index].path;
        if self.is_single_file() {
            base.join(rel)
        } else {
            base.join(&self.name).join(rel)
        }
    }

    pub fn is_single_file(&self) -> bool {
        self.files.len() == 1 && self.files[0].path == Path::new(&self.name)
    }
}

/// Pick a power-of-two piece size in [16KB, 16MB] for `total` bytes.
pub fn auto_piece_size(total: u64) -> u64 {
    let target = (total / TARGET_PIECE_COUNT).max(1);
    target
        .next_power_of_two()
        .clamp(MIN_PIECE_SIZE, MAX_AUTO_PIECE_SIZE)
}

fn collect_files(
    root: &Path,
    dir: &Path,
    include_hidden: bool,
    out: &mut Vec<FileEntry>,
) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("reading directory: {}", dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("listing directory: {}", dir.display()))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        if !include_hidden && name.to_string_lossy().starts_with('.') {
            tracing::debug!(path = %entry.path().display(), "skipping hidden entry");
            continue;
        }
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("reading file type: {}", path.display()))?;
        if file_type.is_dir() {
            collect_files(root, &path, include_hidden, out)?;
        } else if file_type.is_file() {
            let length = entry
                .metadata()
                .with_context(|| format!("reading metadata: {}", path.display()))?
                .len();
            let rel = path
                .strip_prefix(root)
                .with_context(|| format!("{} is not under {}", path.display(), root.display()))?
                .to_path_buf();
            out.push(FileEntry { path: rel, length });
        }
    }
    Ok(())
}
