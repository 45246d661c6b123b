//! Digest parsing and hashing helpers

use crate::error::StoreError;

/// Parse a digest string (e.g., "sha256:abc123...") into algorithm and hex parts
pub fn parse_digest(digest: &str) -> Result<(&str, &str), StoreError> {
    let parts: Vec<&str> = digest.splitn(2, ':').collect();
    if parts.len() != 2 {
        return Err(StoreError::InvalidDigest(format!(
            "Invalid digest format: {}",
            digest
        )));
    }
    Ok((parts[0], parts[1]))
}

/// Validate that a digest is exactly `sha256:` followed by 64 lowercase hex chars.
///
/// Anything else is rejected; this is also the path-traversal guard for
/// digest-derived filenames.
pub fn validate_digest(digest: &str) -> Result<(), StoreError> {
    let (algorithm, hash) = parse_digest(digest)?;

    if algorithm != "sha256" {
        return Err(StoreError::InvalidDigest(format!(
            "Unsupported digest algorithm: {}",
            algorithm
        )));
    }

    if hash.len() != 64
        || !hash
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    {
        return Err(StoreError::InvalidDigest(format!(
            "Expected 64 lowercase hex characters: {}",
            digest
        )));
    }

    Ok(())
}

/// Compute SHA256 digest of data
pub fn compute_sha256(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    format!("sha256:{}", hex::encode(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_digest() {
        let (algorithm, hash) = parse_digest("sha256:abcd").unwrap();
        assert_eq!(algorithm, "sha256");
        assert_eq!(hash, "abcd");

        assert!(parse_digest("no-colon").is_err());
    }

    #[test]
    fn test_validate_digest() {
        let good = compute_sha256(b"hello");
        assert!(validate_digest(&good).is_ok());

        assert!(validate_digest("sha256:abcd").is_err());
        assert!(validate_digest("sha512:0000000000000000000000000000000000000000000000000000000000000000").is_err());
        assert!(validate_digest(&good.to_uppercase()).is_err());
        assert!(validate_digest("sha256:../../../../etc/passwd").is_err());
    }

    #[test]
    fn test_compute_sha256() {
        // sha256 of the empty string, a well-known vector
        assert_eq!(
            compute_sha256(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
