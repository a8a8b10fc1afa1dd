//! Checksums and on-disk names for artifacts.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of a payload.
pub fn checksum(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Sanitize an artifact name for use in filenames.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect()
}

/// Directory name for an artifact: the sanitized name plus a short hash of the
/// original, so `a/b` and `a_b` do not collide.
pub fn storage_name(name: &str) -> String {
    let hash = Sha256::digest(name.as_bytes());
    format!("{}-{}", sanitize_name(name), hex::encode(&hash[..4]))
}
