// Hashing utilities

use crate::core::Hash256;
use sha2::{Digest, Sha256};

/// Single SHA-256.
pub fn sha256(data: &[u8]) -> Hash256 {
    let digest = Sha256::digest(data);
    Hash256::from_slice(&digest).expect("SHA256 always returns 32 bytes")
}

/// Double SHA-256, used for merkle tree levels and checksums.
pub fn hash256(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    Hash256::from_slice(&second).expect("SHA256 always returns 32 bytes")
}

/// RIPEMD160(SHA256(data)) - used for address generation.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    use ripemd::{Digest as RipemdDigest, Ripemd160};
    let sha = Sha256::digest(data);
    let rip = Ripemd160::digest(sha);
    let mut result = [0u8; 20];
    result.copy_from_slice(&rip);
    result
}
