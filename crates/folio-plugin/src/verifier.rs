//! Package integrity verification.
//!
//! A downloaded artifact is trusted only if the SHA-256 digest of its full
//! contents equals the signature published by the marketplace.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::PluginError;

const READ_CHUNK: usize = 64 * 1024;

/// Computes artifact digests and checks them against registry signatures.
#[derive(Debug, Clone, Default)]
pub struct PackageVerifier;

impl PackageVerifier {
    pub fn new() -> Self {
        Self
    }

    /// SHA-256 of the whole file, streamed in chunks.
    pub async fn digest(&self, file_path: &Path) -> Result<[u8; 32], PluginError> {
        let mut file = tokio::fs::File::open(file_path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(hasher.finalize().into())
    }

    /// Returns `true` only when the file's digest equals `expected_signature_hex`.
    ///
    /// A malformed signature never matches.
    pub async fn verify(
        &self,
        file_path: &Path,
        expected_signature_hex: &str,
    ) -> Result<bool, PluginError> {
        let expected = match hex::decode(expected_signature_hex.trim()) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(path = %file_path.display(), "signature is not valid hex: {e}");
                return Ok(false);
            }
        };

        let actual = self.digest(file_path).await?;
        let matched = constant_time_eq(&actual, &expected);

        tracing::debug!(
            path = %file_path.display(),
            digest = %hex::encode(actual),
            matched,
            "package digest computed"
        );

        Ok(matched)
    }
}

/// Compare two byte strings without short-circuiting on the first mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// SHA-256 of the ASCII string "abc".
    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"same", b"sane"));
        assert!(!constant_time_eq(b"short", b"longer"));
        assert!(constant_time_eq(b"", b""));
    }

    #[tokio::test]
    async fn test_digest_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.zip");
        tokio::fs::write(&path, b"abc").await.unwrap();

        let digest = PackageVerifier::new().digest(&path).await.unwrap();
        assert_eq!(hex::encode(digest), ABC_SHA256);
    }

    #[tokio::test]
    async fn test_verify_matching_signature() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.zip");
        tokio::fs::write(&path, b"abc").await.unwrap();

        let verifier = PackageVerifier::new();
        assert!(verifier.verify(&path, ABC_SHA256).await.unwrap());
        // Upper-case hex and surrounding whitespace are accepted
        let upper = format!("  {}\n", ABC_SHA256.to_uppercase());
        assert!(verifier.verify(&path, &upper).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.zip");
        tokio::fs::write(&path, b"abd").await.unwrap();

        assert!(!PackageVerifier::new().verify(&path, ABC_SHA256).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_truncated_or_garbage_signature() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.zip");
        tokio::fs::write(&path, b"abc").await.unwrap();

        let verifier = PackageVerifier::new();
        assert!(!verifier.verify(&path, &ABC_SHA256[..32]).await.unwrap());
        assert!(!verifier.verify(&path, "not-hex-at-all").await.unwrap());
        assert!(!verifier.verify(&path, "").await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_missing_file() {
        let err = PackageVerifier::new()
            .verify(Path::new("/nonexistent/plugin.zip"), ABC_SHA256)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Io(_)));
    }

    #[tokio::test]
    async fn test_digest_spans_multiple_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.zip");
        let data = vec![7u8; READ_CHUNK * 3 + 17];
        tokio::fs::write(&path, &data).await.unwrap();

        let streamed = PackageVerifier::new().digest(&path).await.unwrap();
        let whole: [u8; 32] = Sha256::digest(&data).into();
        assert_eq!(streamed, whole);
    }
}
