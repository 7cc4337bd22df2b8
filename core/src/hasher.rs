use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of raw bytes.
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Compare a submitted secret against a stored digest without early exit.
pub fn verify_secret(secret: &str, stored_digest: &str) -> bool {
    let computed = digest(secret.as_bytes());
    if computed.len() != stored_digest.len() {
        return false;
    }
    computed
        .bytes()
        .zip(stored_digest.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
