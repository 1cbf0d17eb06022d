//! Byte-range reads of the compressed blob

use bytes::Bytes;
use opendal::Operator;
use std::ops::Range;
use zipseed_core::{ZipseedError, ZipseedResult};

/// Read `range` of the object at `path`.
///
/// A response shorter or longer than the range is a transport error; the
/// caller's reassembly depends on receiving exactly the requested bytes.
pub async fn read_range(op: &Operator, path: &str, range: Range<u64>) -> ZipseedResult<Bytes> {
    let want = range.end.saturating_sub(range.start);
    let buf = op
        .read_with(path)
        .range(range.clone())
        .await
        .map_err(|e| {
            ZipseedError::Transport(format!(
                "range {}-{} of {path}: {e}",
                range.start,
                range.end.saturating_sub(1)
            ))
        })?;

    let bytes = buf.to_bytes();
    if bytes.len() as u64 != want {
        return Err(ZipseedError::Transport(format!(
            "range {}-{} of {path}: expected {want} bytes, got {}",
            range.start,
            range.end.saturating_sub(1),
            bytes.len()
        )));
    }
    tracing::trace!(path, start = range.start, len = want, "range read");
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::memory_operator;

    #[tokio::test]
    async fn test_read_range_exact() {
        let op = memory_operator().unwrap();
        let blob: Vec<u8> = (0..=255u8).collect();
        op.write("blob.dat", blob.clone()).await.unwrap();

        let got = read_range(&op, "blob.dat", 16..48).await.unwrap();
        assert_eq!(&got[..], &blob[16..48]);
    }

    #[tokio::test]
    async fn test_read_range_missing_object() {
        let op = memory_operator().unwrap();
        let err = read_range(&op, "nope.dat", 0..10).await.unwrap_err();
        assert!(matches!(err, ZipseedError::Transport(_)));
    }
}
