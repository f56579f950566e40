// Pay-to-public-key-hash addresses

use crate::core::hash::hash160;

/// Version byte for mainnet pay-to-pubkey-hash addresses.
const ADDRESS_VERSION: u8 = 0x00;

/// Derive the base58check address for a serialized (compressed) public key:
/// base58check(version || RIPEMD160(SHA256(pubkey))).
pub fn pubkey_to_address(pubkey: &[u8]) -> String {
    let pubkey_hash = hash160(pubkey);
    bs58::encode(pubkey_hash)
        .with_check_version(ADDRESS_VERSION)
        .into_string()
}

/// Decode an address back to its 20-byte public-key hash, verifying the
/// checksum and version byte.
pub fn address_to_pubkey_hash(addr: &str) -> Result<[u8; 20], String> {
    let payload = bs58::decode(addr)
        .with_check(Some(ADDRESS_VERSION))
        .into_vec()
        .map_err(|e| format!("invalid address {}: {}", addr, e))?;
    // with_check keeps the version byte at the front
    if payload.len() != 21 {
        return Err(format!("invalid address payload length: {}", payload.len()));
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&payload[1..]);
    Ok(hash)
}

/// Check that a public key (hex) hashes to the given address.
pub fn pubkey_matches_address(pubkey_hex: &str, addr: &str) -> bool {
    match hex::decode(pubkey_hex) {
        Ok(bytes) => pubkey_to_address(&bytes) == addr,
        Err(_) => false,
    }
}
