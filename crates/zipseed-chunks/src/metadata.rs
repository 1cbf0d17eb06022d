//! Distributable metadata record and its `zipinfo` extension
//!
//! The record is serialised as JSON. The `zipinfo` dictionary carries the
//! compressed-blob description:
//!
//! ```text
//! "zipinfo": {
//!   "total-size": <sum of compressed piece sizes>,
//!   "level":      <codec level>,
//!   "codec":      "zlib" | "zstd",
//!   "pieces-size": <base64 of big-endian u32 per piece>,
//!   "url-list":   "https://..." | ["https://...", ...]
//! }
//! ```

use anyhow::{Context, Result};
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Component, Path};
use zipseed_core::config::validate_piece_size;
use zipseed_core::{CodecKind, PieceIndex, ZipseedError, ZipseedResult};

use crate::index::PieceSizeIndex;
use crate::layout::{FileEntry, FileLayout};

/// Web-seed URLs for the compressed blob. One URL is stored as a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UrlList {
    Single(String),
    Multiple(Vec<String>),
}

impl UrlList {
    pub fn from_urls(mut urls: Vec<String>) -> Option<Self> {
        match urls.len() {
            0 => None,
            1 => urls.pop().map(UrlList::Single),
            _ => Some(UrlList::Multiple(urls)),
        }
    }

    pub fn urls(&self) -> Vec<&str> {
        match self {
            UrlList::Single(u) => vec![u.as_str()],
            UrlList::Multiple(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

/// Compressed-transport description embedded in the metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZipInfo {
    #[serde(rename = "total-size")]
    pub total_size: u64,
    pub level: i32,
    #[serde(default)]
    pub codec: CodecKind,
    #[serde(
        rename = "pieces-size",
        serialize_with = "serialize_pieces_size",
        deserialize_with = "deserialize_pieces_size"
    )]
    pub pieces_size: PieceSizeIndex,
    #[serde(rename = "url-list")]
    pub url_list: UrlList,
}

impl ZipInfo {
    /// Check the index against the content it claims to describe.
    pub fn validate(&self, num_pieces: usize) -> ZipseedResult<()> {
        if self.pieces_size.len() != num_pieces {
            return Err(ZipseedError::Metadata(format!(
                "pieces-size has {} entries but content has {} pieces",
                self.pieces_size.len(),
                num_pieces
            )));
        }
        if self.pieces_size.total_size() != self.total_size {
            return Err(ZipseedError::Metadata(format!(
                "pieces-size sums to {} but total-size is {}",
                self.pieces_size.total_size(),
                self.total_size
            )));
        }
        if let Some((i, _)) = self
            .pieces_size
            .entries()
            .iter()
            .enumerate()
            .find(|(_, e)| e.compressed_size == 0)
        {
            return Err(ZipseedError::Metadata(format!(
                "piece {i} has an empty compressed size"
            )));
        }
        Ok(())
    }
}

/// Top-level metadata record for one piece of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metainfo {
    pub name: String,
    #[serde(rename = "piece-length")]
    pub piece_length: u64,
    pub files: Vec<FileEntry>,
    /// Hex BLAKE3 per plaintext piece
    #[serde(rename = "piece-hashes")]
    pub piece_hashes: Vec<String>,
    #[serde(rename = "created-by", default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zipinfo: Option<ZipInfo>,
}

impl Metainfo {
    pub fn layout(&self) -> FileLayout {
        FileLayout::new(self.name.clone(), self.piece_length, self.files.clone())
    }

    pub fn num_pieces(&self) -> usize {
        self.layout().num_pieces()
    }

    pub fn piece_hash(&self, piece: PieceIndex) -> Option<&str> {
        self.piece_hashes.get(piece as usize).map(String::as_str)
    }

    /// Structural checks: piece length, file paths, hash count and, when
    /// present, the zipinfo index.
    pub fn validate(&self) -> ZipseedResult<()> {
        if self.piece_length == 0 {
            return Err(ZipseedError::Metadata("piece-length is zero".into()));
        }
        validate_piece_size(self.piece_length)
            .map_err(|e| ZipseedError::Metadata(format!("piece-length: {e}")))?;
        self.validate_paths()?;

        let pieces = self.num_pieces();
        if self.piece_hashes.len() != pieces {
            return Err(ZipseedError::Metadata(format!(
                "{} piece hashes for {} pieces",
                self.piece_hashes.len(),
                pieces
            )));
        }
        if let Some(zip) = &self.zipinfo {
            zip.validate(pieces)?;
        }
        Ok(())
    }

    /// Every path must stay inside the download directory: relative, made of
    /// plain names only. `name` is a single plain name.
    fn validate_paths(&self) -> ZipseedResult<()> {
        let mut name = Path::new(&self.name).components();
        if !matches!((name.next(), name.next()), (Some(Component::Normal(_)), None)) {
            return Err(ZipseedError::Metadata(format!(
                "content name {:?} is not a plain file name",
                self.name
            )));
        }
        if self.files.is_empty() {
            return Err(ZipseedError::Metadata("metadata lists no files".into()));
        }
        for file in &self.files {
            let mut parts = file.path.components().peekable();
            let plain = parts.peek().is_some()
                && parts.all(|c| matches!(c, Component::Normal(_)));
            if !plain {
                return Err(ZipseedError::Metadata(format!(
                    "file path {} escapes the content directory",
                    file.path.display()
                )));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context("serializing metadata")
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        let meta: Metainfo = serde_json::from_slice(data).context("deserializing metadata")?;
        meta.validate().context("validating metadata")?;
        Ok(meta)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("reading metadata: {}", path.display()))?;
        Self::from_json(&data).with_context(|| format!("loading metadata: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)
            .with_context(|| format!("writing metadata: {}", path.display()))
    }
}

fn serialize_pieces_size<S: Serializer>(index: &PieceSizeIndex, s: S) -> Result<S::Ok, S::Error> {
    let wire = index.to_wire().map_err(serde::ser::Error::custom)?;
    s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(wire))
}

fn deserialize_pieces_size<'de, D: Deserializer<'de>>(d: D) -> Result<PieceSizeIndex, D::Error> {
    let encoded = String::deserialize(d)?;
    let wire = base64::engine::general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)?;
    PieceSizeIndex::from_wire(&wire).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample_meta(urls: Vec<String>) -> Metainfo {
        Metainfo {
            name: "content.bin".into(),
            piece_length: 16384,
            files: vec![FileEntry {
                path: PathBuf::from("content.bin"),
                length: 32768,
            }],
            piece_hashes: vec!["00".repeat(32), "11".repeat(32)],
            created_by: Some("zipseed".into()),
            comment: None,
            zipinfo: Some(ZipInfo {
                total_size: 17000,
                level: 6,
                codec: CodecKind::Zlib,
                pieces_size: PieceSizeIndex::from_sizes([9000, 8000]),
                url_list: UrlList::from_urls(urls).unwrap(),
            }),
        }
    }

    #[test]
    fn single_url_is_scalar() {
        let meta = sample_meta(vec!["https://seed.example/content.dat".into()]);
        let json: serde_json::Value = serde_json::from_slice(&meta.to_json().unwrap()).unwrap();
        assert_eq!(
            json["zipinfo"]["url-list"],
            serde_json::json!("https://seed.example/content.dat")
        );
    }

    #[test]
    fn several_urls_are_a_list() {
        let meta = sample_meta(vec!["https://a/x.dat".into(), "https://b/x.dat".into()]);
        let json: serde_json::Value = serde_json::from_slice(&meta.to_json().unwrap()).unwrap();
        assert_eq!(
            json["zipinfo"]["url-list"],
            serde_json::json!(["https://a/x.dat", "https://b/x.dat"])
        );
    }

    #[test]
    fn pieces_size_is_base64_big_endian() {
        let meta = sample_meta(vec!["https://a/x.dat".into()]);
        let json: serde_json::Value = serde_json::from_slice(&meta.to_json().unwrap()).unwrap();
        // 9000 = 0x00002328, 8000 = 0x00001F40
        assert_eq!(json["zipinfo"]["pieces-size"], serde_json::json!("AAAjKAAAH0A="));
        assert_eq!(json["zipinfo"]["total-size"], serde_json::json!(17000));
        assert_eq!(json["zipinfo"]["codec"], serde_json::json!("zlib"));
    }

    #[test]
    fn json_round_trip() {
        let meta = sample_meta(vec!["https://a/x.dat".into(), "https://b/x.dat".into()]);
        let back = Metainfo::from_json(&meta.to_json().unwrap()).unwrap();
        assert_eq!(back, meta);
        assert_eq!(back.zipinfo.unwrap().url_list.urls().len(), 2);
    }

    #[test]
    fn total_size_mismatch_rejected() {
        let mut meta = sample_meta(vec!["https://a/x.dat".into()]);
        if let Some(zip) = meta.zipinfo.as_mut() {
            zip.total_size = 1;
        }
        assert!(meta.validate().is_err());
        assert!(Metainfo::from_json(&meta.to_json().unwrap()).is_err());
    }

    #[test]
    fn piece_count_mismatch_rejected() {
        let mut meta = sample_meta(vec!["https://a/x.dat".into()]);
        meta.files[0].length = 3 * 16384;
        meta.piece_hashes.push("22".repeat(32));
        assert!(matches!(meta.validate(), Err(ZipseedError::Metadata(_))));
    }

    #[test]
    fn paths_outside_content_dir_rejected() {
        for bad in ["../escaped.bin", "/etc/passwd", "nested/../../x", "./content.bin", ""] {
            let mut meta = sample_meta(vec!["https://a/x.dat".into()]);
            meta.name = "bundle".into();
            meta.files[0].path = PathBuf::from(bad);
            assert!(
                matches!(meta.validate(), Err(ZipseedError::Metadata(_))),
                "{bad:?} should be rejected"
            );
        }

        let mut meta = sample_meta(vec!["https://a/x.dat".into()]);
        meta.name = "bundle".into();
        meta.files[0].path = PathBuf::from("nested/content.bin");
        assert!(meta.validate().is_ok());
    }

    #[test]
    fn content_name_must_be_one_plain_component() {
        for bad in ["..", "a/b", "/abs", "", "."] {
            let mut meta = sample_meta(vec!["https://a/x.dat".into()]);
            meta.name = bad.into();
            assert!(meta.validate().is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn hostile_piece_length_rejected() {
        for bad in [0u64, 1000, 16384 + 1, 1 << 40] {
            let mut meta = sample_meta(vec!["https://a/x.dat".into()]);
            meta.piece_length = bad;
            assert!(
                matches!(meta.validate(), Err(ZipseedError::Metadata(_))),
                "piece-length {bad} should be rejected"
            );
        }
    }

    #[test]
    fn empty_url_list_is_none() {
        assert!(UrlList::from_urls(Vec::new()).is_none());
    }

    #[test]
    fn missing_codec_defaults_to_zlib() {
        let json = r#"{"total-size":5,"level":2,"pieces-size":"AAAABQ==","url-list":"http://h/b"}"#;
        let zip: ZipInfo = serde_json::from_str(json).unwrap();
        assert_eq!(zip.codec, CodecKind::Zlib);
        assert_eq!(zip.pieces_size.total_size(), 5);
        assert!(zip.validate(1).is_ok());
    }
}
