//! Credential fingerprints
//!
//! Clients prove knowledge of a secret by sending `SHA256(secret)` as the
//! first 32 bytes after the TLS handshake. The server never sees the secret
//! on the wire and only keeps the digest.

use sha2::{Digest, Sha256};

/// Length of a credential fingerprint on the wire
pub const FINGERPRINT_LEN: usize = 32;

/// SHA256 digest of a user secret
pub type Fingerprint = [u8; FINGERPRINT_LEN];

/// Compute the fingerprint of a secret (password or panel uuid)
pub fn fingerprint(secret: &str) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

/// Interpret raw bytes as a fingerprint.
///
/// Returns `None` for any input that is not exactly [`FINGERPRINT_LEN`] long.
pub fn fingerprint_from_slice(candidate: &[u8]) -> Option<Fingerprint> {
    candidate.try_into().ok()
}

/// Equal-length exact compare against a single pre-hashed value
pub fn matches_fingerprint(candidate: &[u8], expected: &Fingerprint) -> bool {
    candidate.len() == expected.len() && candidate == expected.as_slice()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_sha256() {
        // sha256("hunter2")
        let expected = [
            0xf5, 0x2f, 0xbd, 0x32, 0xb2, 0xb3, 0xb8, 0x6f, 0xf8, 0x8e, 0xf6, 0xc4, 0x90, 0x62,
            0x82, 0x85, 0xf4, 0x82, 0xaf, 0x15, 0xdd, 0xcb, 0x29, 0x54, 0x1f, 0x94, 0xbc, 0xf5,
            0x26, 0xa3, 0xf6, 0xc7,
        ];
        assert_eq!(fingerprint("hunter2"), expected);
    }

    #[test]
    fn test_fingerprint_deterministic() {
        assert_eq!(fingerprint("test"), fingerprint("test"));
        assert_ne!(fingerprint("test"), fingerprint("different"));
    }

    #[test]
    fn test_fingerprint_from_slice_length() {
        let fp = fingerprint("secret");
        assert_eq!(fingerprint_from_slice(&fp), Some(fp));
        assert_eq!(fingerprint_from_slice(&fp[..31]), None);
        assert_eq!(fingerprint_from_slice(&[0u8; 33]), None);
        assert_eq!(fingerprint_from_slice(&[]), None);
    }

    #[test]
    fn test_matches_fingerprint() {
        let expected = fingerprint("hunter2");
        assert!(matches_fingerprint(&expected, &expected));
        assert!(!matches_fingerprint(&fingerprint("hunter3"), &expected));
        assert!(!matches_fingerprint(&expected[..16], &expected));
    }
}
