//! Digest parsing and integrity hashing.
//!
//! A digest is an opaque `<algorithm>:<hex>` string. The hex part is the
//! lower-case encoded output of the named algorithm over the blob's bytes.

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

/// Splits a digest into its algorithm prefix and hex suffix.
pub fn split(digest: &str) -> Option<(&str, &str)> {
    digest.split_once(':')
}

/// Whether the string is a well-formed digest.
///
/// The algorithm must be alphanumeric and the hash must be lower-case hex,
/// both non-empty.
pub fn is_valid(digest: &str) -> bool {
    let Some((algorithm, hash)) = split(digest) else {
        return false;
    };

    !algorithm.is_empty()
        && algorithm.chars().all(|c| c.is_ascii_alphanumeric())
        && !hash.is_empty()
        && hash.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

/// An incremental checksum over a blob body.
pub enum Checksum {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
    Md5(Md5),
}

impl Checksum {
    /// Selects the checksum matching the digest's algorithm prefix.
    ///
    /// Returns `None` for unrecognized algorithms; the download then
    /// proceeds without integrity verification.
    pub fn for_digest(digest: &str) -> Option<Self> {
        let algorithm = split(digest).map(|(algorithm, _)| algorithm).unwrap_or("");

        match algorithm {
            "sha1" => Some(Checksum::Sha1(Sha1::new())),
            "sha256" => Some(Checksum::Sha256(Sha256::new())),
            "sha512" => Some(Checksum::Sha512(Sha512::new())),
            "md5" => Some(Checksum::Md5(Md5::new())),
            _ => {
                tracing::warn!("unknown hash algorithm, will not check download: {algorithm}");
                None
            }
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Checksum::Sha1(hasher) => hasher.update(bytes),
            Checksum::Sha256(hasher) => hasher.update(bytes),
            Checksum::Sha512(hasher) => hasher.update(bytes),
            Checksum::Md5(hasher) => hasher.update(bytes),
        }
    }

    /// The hex-encoded checksum over all bytes fed so far.
    pub fn finalize(self) -> String {
        match self {
            Checksum::Sha1(hasher) => hex::encode(hasher.finalize()),
            Checksum::Sha256(hasher) => hex::encode(hasher.finalize()),
            Checksum::Sha512(hasher) => hex::encode(hasher.finalize()),
            Checksum::Md5(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checksum_of(algorithm: &str, body: &[u8]) -> String {
        let mut checksum = Checksum::for_digest(&format!("{algorithm}:00")).unwrap();
        checksum.update(body);
        checksum.finalize()
    }

    #[test]
    fn test_known_checksums() {
        assert_eq!(
            checksum_of("sha256", b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(
            checksum_of("sha1", b"hello world"),
            "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"
        );
        assert_eq!(
            checksum_of("md5", b"hello world"),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
    }

    #[test]
    fn test_incremental_updates() {
        let mut checksum = Checksum::for_digest("sha256:00").unwrap();
        checksum.update(b"hello");
        checksum.update(b" ");
        checksum.update(b"world");
        assert_eq!(
            checksum.finalize(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_empty_body() {
        let checksum = Checksum::for_digest("sha256:00").unwrap();
        assert_eq!(
            checksum.finalize(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_unknown_algorithm() {
        assert!(Checksum::for_digest("blake3:abcdef").is_none());
        assert!(Checksum::for_digest("not-a-digest").is_none());
    }

    #[test]
    fn test_is_valid() {
        assert!(is_valid("sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe3"));
        assert!(is_valid("md5:5eb63bbbe01eeed093cb22bb8f5acdc3"));

        assert!(!is_valid("sha256"));
        assert!(!is_valid("sha256:"));
        assert!(!is_valid(":abcdef"));
        assert!(!is_valid("sha256:ABCDEF"));
        assert!(!is_valid("sha_256:abcdef"));
        assert!(!is_valid("sha256:abcdefg"));
    }
}
