//! zipseed-chunks: piece layout, per-piece compression, and the size index
//!
//! # Overview
//! - `layout`: fixed-size pieces over one or more files
//! - `codec`: independent per-piece zlib / zstd compression
//! - `index`: compressed size per piece, blob offsets by prefix sum
//! - `encoder`: content -> compressed blob + size index
//! - `metadata`: the distributable record and its `zipinfo` extension
//! - `piece_hash`: BLAKE3 piece verification

pub mod codec;
pub mod encoder;
pub mod index;
pub mod layout;
pub mod metadata;
pub mod piece_hash;

pub use codec::{codec_for, PieceCodec, ZlibCodec, ZstdCodec};
pub use encoder::{
    encode, encode_to_file, EncodeStats, EncodedContent, FilePieceReader, MemoryPieceReader,
    PieceReader, ProgressFn,
};
pub use index::{PieceSizeEntry, PieceSizeIndex, PieceSizeIndexBuilder, PieceSpan};
pub use layout::{auto_piece_size, FileEntry, FileLayout, FileSlice};
pub use metadata::{Metainfo, UrlList, ZipInfo};
pub use piece_hash::{hash_bytes, hash_from_hex, hash_to_hex, verify_piece, Hash};
