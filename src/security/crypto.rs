// Cryptographic utilities

use sha2::{Digest, Sha256};

/// SHA-256 hex digest (lowercase).
pub fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Short, log-safe fingerprint for a secret (hash prefix only).
pub fn secret_fingerprint(input: &str) -> String {
    sha256_hex(input.as_bytes())[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn fingerprint_does_not_contain_secret() {
        let fp = secret_fingerprint("AABBCCDDEEFF");
        assert_eq!(fp.len(), 12);
        assert!(!fp.contains("AABBCC"));
    }
}
