//! BLAKE3 piece hashing
//!
//! Each plaintext piece is hashed at creation time and the hex digests are
//! published in the metadata record; the downstream verifier compares a
//! reassembled piece against its digest before writing it out.

use anyhow::Result;

/// Piece digest
pub type Hash = blake3::Hash;

/// Hash a piece held in memory.
pub fn hash_bytes(data: &[u8]) -> Hash {
    blake3::hash(data)
}

/// Lowercase hex form used in `piece-hashes`.
pub fn hash_to_hex(hash: &Hash) -> String {
    hash.to_hex().to_string()
}

pub fn hash_from_hex(hex: &str) -> Result<Hash> {
    blake3::Hash::from_hex(hex)
        .map_err(|e| anyhow::anyhow!("malformed piece digest {hex:?}: {e}"))
}

/// True if `data` hashes to the hex digest `expected`.
pub fn verify_piece(data: &[u8], expected: &str) -> bool {
    match hash_from_hex(expected) {
        Ok(h) => hash_bytes(data) == h,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn digest_survives_hex_form() {
        let digest = hash_bytes(b"hello zipseed");
        let text = hash_to_hex(&digest);
        assert_eq!(text.len(), 64);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(hash_from_hex(&text).unwrap(), digest);
    }

    #[test]
    fn verify_rejects_tampered() {
        let hex = hash_to_hex(&hash_bytes(b"piece zero"));
        assert!(verify_piece(b"piece zero", &hex));
        assert!(!verify_piece(b"piece one", &hex));
    }

    #[test]
    fn verify_rejects_malformed_digest() {
        assert!(!verify_piece(b"anything", "not-hex"));
    }

    proptest! {
        #[test]
        fn flipped_byte_fails_verification(
            data in proptest::collection::vec(any::<u8>(), 1..=4096),
            at in any::<prop::sample::Index>(),
        ) {
            let expected = hash_to_hex(&hash_bytes(&data));
            prop_assert!(verify_piece(&data, &expected));
            let mut tampered = data.clone();
            let i = at.index(tampered.len());
            tampered[i] ^= 0x01;
            prop_assert!(!verify_piece(&tampered, &expected));
        }
    }
}
