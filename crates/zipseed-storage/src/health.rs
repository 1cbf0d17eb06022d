//! Web-seed reachability check

use opendal::Operator;
use zipseed_core::{ZipseedError, ZipseedResult};

/// Stat the blob and, when the server reports a length, compare it with the
/// total compressed size from the metadata.
pub async fn check_blob(op: &Operator, path: &str, expected_len: u64) -> ZipseedResult<()> {
    let meta = op
        .stat(path)
        .await
        .map_err(|e| ZipseedError::Transport(format!("web seed check failed for {path}: {e}")))?;

    let len = meta.content_length();
    // Some servers omit Content-Length on HEAD; opendal reports 0 then.
    if len != 0 && len != expected_len {
        return Err(ZipseedError::Metadata(format!(
            "{path} is {len} bytes but metadata expects {expected_len}"
        )));
    }
    Ok(())
}

/// Returns true if the blob is reachable and the right size (non-failing)
pub async fn is_healthy(op: &Operator, path: &str, expected_len: u64) -> bool {
    check_blob(op, path, expected_len).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::memory_operator;

    #[tokio::test]
    async fn test_check_blob_matches() {
        let op = memory_operator().unwrap();
        op.write("c.dat", vec![0u8; 42]).await.unwrap();
        assert!(check_blob(&op, "c.dat", 42).await.is_ok());
        assert!(is_healthy(&op, "c.dat", 42).await);
    }

    #[tokio::test]
    async fn test_check_blob_wrong_size() {
        let op = memory_operator().unwrap();
        op.write("c.dat", vec![0u8; 42]).await.unwrap();
        let err = check_blob(&op, "c.dat", 43).await.unwrap_err();
        assert!(matches!(err, ZipseedError::Metadata(_)));
    }

    #[tokio::test]
    async fn test_check_blob_missing() {
        let op = memory_operator().unwrap();
        assert!(!is_healthy(&op, "missing.dat", 1).await);
    }
}
