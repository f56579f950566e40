// Key management

use crate::core::address::pubkey_to_address;
use rand::rngs::OsRng;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
    pub address: String,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let mut rng = OsRng;
        let secret_key = SecretKey::new(&mut rng);
        Self::from_secret(secret_key)
    }

    pub fn from_secret(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = secret_key.public_key(&secp);
        let address = pubkey_to_address(&public_key.serialize());
        Self {
            secret_key,
            public_key,
            address,
        }
    }

    pub fn from_secret_hex(hex_str: &str) -> Result<Self, String> {
        let bytes = hex::decode(hex_str).map_err(|e| format!("invalid secret hex: {}", e))?;
        let secret_key =
            SecretKey::from_slice(&bytes).map_err(|e| format!("invalid secret key: {}", e))?;
        Ok(Self::from_secret(secret_key))
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Compressed public key bytes.
    pub fn pubkey_bytes(&self) -> Vec<u8> {
        self.public_key.serialize().to_vec()
    }
}

/// Persisted keystore layout: address -> secret key hex.
#[derive(Serialize, Deserialize, Default)]
struct KeystoreFile {
    keys: HashMap<String, String>,
    default_address: Option<String>,
}

/// Manages the node's key pairs.
pub struct Keystore {
    keys: HashMap<String, KeyPair>,
    default_address: Option<String>,
}

impl Keystore {
    pub fn new() -> Self {
        Self {
            keys: HashMap::new(),
            default_address: None,
        }
    }

    /// Generate a fresh address; the first one becomes the default.
    pub fn new_address(&mut self) -> String {
        let keypair = KeyPair::generate();
        let address = keypair.address.clone();
        if self.default_address.is_none() {
            self.default_address = Some(address.clone());
        }
        self.keys.insert(address.clone(), keypair);
        address
    }

    pub fn get(&self, address: &str) -> Option<&KeyPair> {
        self.keys.get(address)
    }

    pub fn list_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.keys.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn default_address(&self) -> Option<&String> {
        self.default_address.as_ref()
    }

    pub fn set_default(&mut self, address: &str) -> Result<(), String> {
        if !self.keys.contains_key(address) {
            return Err("address not found in keystore".to_string());
        }
        self.default_address = Some(address.to_string());
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.keys.len()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), String> {
        let file = KeystoreFile {
            keys: self
                .keys
                .iter()
                .map(|(addr, kp)| (addr.clone(), kp.secret_hex()))
                .collect(),
            default_address: self.default_address.clone(),
        };
        let data = serde_json::to_vec_pretty(&file)
            .map_err(|e| format!("failed to encode keystore: {}", e))?;
        std::fs::write(path, data).map_err(|e| format!("failed to write keystore: {}", e))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let data =
            std::fs::read(path).map_err(|e| format!("failed to read keystore: {}", e))?;
        let file: KeystoreFile = serde_json::from_slice(&data)
            .map_err(|e| format!("failed to decode keystore: {}", e))?;

        let mut keys = HashMap::new();
        for (address, secret_hex) in file.keys {
            let keypair = KeyPair::from_secret_hex(&secret_hex)?;
            if keypair.address != address {
                return Err(format!("keystore entry {} does not match its key", address));
            }
            keys.insert(address, keypair);
        }
        Ok(Self {
            keys,
            default_address: file.default_address,
        })
    }
}

impl Default for Keystore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp = KeyPair::generate();
        assert_eq!(kp.pubkey_bytes().len(), 33); // compressed
        assert!(!kp.address.is_empty());
    }

    #[test]
    fn test_secret_hex_round_trip() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_secret_hex(&kp.secret_hex()).unwrap();
        assert_eq!(restored.address, kp.address);
    }

    #[test]
    fn test_keystore_defaults() {
        let mut ks = Keystore::new();
        assert_eq!(ks.count(), 0);
        assert!(ks.default_address().is_none());

        let addr1 = ks.new_address();
        assert_eq!(ks.default_address(), Some(&addr1));

        let addr2 = ks.new_address();
        assert_eq!(ks.count(), 2);
        assert_eq!(ks.default_address(), Some(&addr1));

        ks.set_default(&addr2).unwrap();
        assert_eq!(ks.default_address(), Some(&addr2));
        assert!(ks.set_default("unknown").is_err());
    }

    #[test]
    fn test_keystore_save_load() {
        let dir = std::env::temp_dir().join(format!("keystore-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("keystore.json");

        let mut ks = Keystore::new();
        let addr = ks.new_address();
        ks.save(&path).unwrap();

        let loaded = Keystore::load(&path).unwrap();
        assert_eq!(loaded.count(), 1);
        assert_eq!(loaded.default_address(), Some(&addr));
        assert!(loaded.get(&addr).is_some());

        std::fs::remove_dir_all(&dir).ok();
    }
}
