//! Digest validation and streaming content-hashing (spec §3 "Digest", §4.J).
//!
//! The registry's wire-level digest type is `oci_spec::image::Digest`
//! (`algorithm:hex`); this module is the single place that decides whether
//! one is *acceptable* to this registry (sha256 only, 64 lowercase hex
//! chars) and the single place bytes are hashed while streaming, so that
//! verification never re-reads anything outside the chunk being appended.

use oci_spec::image::Digest as OciDigest;
use sha2::{Digest as _, Sha256};
use std::str::FromStr;

pub use oci_spec::image::Digest;

/// `sha256` is the only digest algorithm this registry accepts, per spec §3.
pub const ALGORITHM: &str = "sha256";

/// Parses and validates a digest string against the grammar required by
/// spec §3: `sha256:` followed by exactly 64 lowercase hex characters.
pub fn parse(s: &str) -> Result<Digest, crate::core::errors::CoreError> {
    let digest =
        OciDigest::from_str(s).map_err(|_| crate::core::errors::CoreError::DigestInvalid(s.to_string()))?;
    validate(&digest)?;
    Ok(digest)
}

pub fn validate(digest: &Digest) -> Result<(), crate::core::errors::CoreError> {
    if digest.algorithm() != ALGORITHM {
        return Err(crate::core::errors::CoreError::DigestInvalid(format!(
            "unsupported digest algorithm: {}",
            digest.algorithm()
        )));
    }
    let hex = digest.digest();
    if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
        return Err(crate::core::errors::CoreError::DigestInvalid(format!(
            "malformed sha256 hex in digest: {digest}"
        )));
    }
    Ok(())
}

/// Computes the sha256 digest of a complete in-memory buffer. Used for
/// small payloads (manifests, `put-bytes`); large blobs go through
/// [`StreamingHasher`] instead.
pub fn hash_bytes(bytes: &[u8]) -> Digest {
    let hex = hex::encode(Sha256::digest(bytes));
    Digest::from_str(&format!("{ALGORITHM}:{hex}")).expect("sha256 digest is always well formed")
}

/// Accumulates a sha256 hash across a sequence of appended chunks, so the
/// blob store's finalizer never needs to re-read previously accepted
/// bytes to verify the whole (spec §4.C: "Digest verification MUST be
/// streaming").
#[derive(Default)]
pub struct StreamingHasher {
    hasher: Sha256,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self { hasher: Sha256::new() }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    pub fn finalize(self) -> Digest {
        let hex = hex::encode(self.hasher.finalize());
        Digest::from_str(&format!("{ALGORITHM}:{hex}")).expect("sha256 digest is always well formed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_sha256() {
        let hex = "a".repeat(64);
        let s = format!("sha256:{hex}");
        assert!(parse(&s).is_ok());
    }

    #[test]
    fn rejects_wrong_length() {
        let s = "sha256:abcd";
        assert!(parse(s).is_err());
    }

    #[test]
    fn rejects_non_sha256_algorithm() {
        let hex = "a".repeat(128);
        let s = format!("sha512:{hex}");
        assert!(super::parse(&s).is_err());
    }

    #[test]
    fn streaming_hash_matches_whole_buffer_hash() {
        let data = b"hello world, this is a blob";
        let mut hasher = StreamingHasher::new();
        for chunk in data.chunks(5) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.finalize().to_string(), hash_bytes(data).to_string());
    }
}
