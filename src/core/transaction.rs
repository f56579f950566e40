// Transaction model: inputs reference prior outpoints, outputs pay addresses

use crate::core::address::pubkey_to_address;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Marker index for the coinbase input, which spends nothing.
pub const COINBASE_INDEX: u32 = u32::MAX;

/// Transaction input - references a previous transaction output.
/// `sig` is a DER-encoded ECDSA signature in hex; `pubkey` is the
/// compressed public key in hex. For coinbase inputs both slots carry
/// arbitrary tag data instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub txid: String,
    pub index: u32,
    pub sig: String,
    pub pubkey: String,
}

impl TxInput {
    pub fn new(txid: String, index: u32) -> Self {
        Self {
            txid,
            index,
            sig: String::new(),
            pubkey: String::new(),
        }
    }
}

/// Transaction output - an amount payable to an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub to: String,
}

impl TxOutput {
    pub fn new(value: u64, to: String) -> Self {
        Self { value, to }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub is_coinbase: bool,
}

impl Transaction {
    /// Create a new unsigned transaction. The id is fixed at creation and
    /// never changes when signatures are attached later.
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        let mut tx = Self {
            id: String::new(),
            inputs,
            outputs,
            is_coinbase: false,
        };
        tx.id = tx.compute_id();
        tx
    }

    /// Create a coinbase transaction paying the block reward (plus fees).
    /// The tag goes into the input's data slots so that coinbases at
    /// different heights produce distinct ids.
    pub fn coinbase(to: &str, value: u64, tag: &str) -> Self {
        let input = TxInput {
            txid: String::new(),
            index: COINBASE_INDEX,
            sig: tag.to_string(),
            pubkey: "coinbase".to_string(),
        };
        let mut tx = Self {
            id: String::new(),
            inputs: vec![input],
            outputs: vec![TxOutput::new(value, to.to_string())],
            is_coinbase: true,
        };
        tx.id = tx.compute_id();
        tx
    }

    /// Canonical digest stream. Signature and pubkey slots are only folded
    /// in for coinbase transactions, where they hold tag data; regular
    /// transaction ids are independent of signature bytes.
    fn digest(&self, with_tag_slots: bool) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update([self.is_coinbase as u8]);
        h.update((self.inputs.len() as u32).to_be_bytes());
        for input in &self.inputs {
            h.update(input.txid.as_bytes());
            h.update((input.index as u64).to_be_bytes());
            if with_tag_slots {
                h.update(input.sig.as_bytes());
                h.update(input.pubkey.as_bytes());
            }
        }
        h.update((self.outputs.len() as u32).to_be_bytes());
        for output in &self.outputs {
            h.update(output.value.to_be_bytes());
            h.update(output.to.as_bytes());
        }
        h.finalize().into()
    }

    pub fn compute_id(&self) -> String {
        hex::encode(self.digest(self.is_coinbase))
    }

    /// Digest signed by every input. Excludes all signatures and public
    /// keys so the id and the signatures cannot depend on each other.
    pub fn signing_digest(&self) -> [u8; 32] {
        self.digest(false)
    }

    /// Sign every input with the given key, filling in pubkey and sig slots.
    pub fn sign(&mut self, secret_key: &SecretKey) -> Result<(), String> {
        if self.is_coinbase {
            return Ok(());
        }
        let secp = Secp256k1::new();
        let pubkey_hex = hex::encode(secret_key.public_key(&secp).serialize());
        let digest = self.signing_digest();
        let message = Message::from_digest_slice(&digest)
            .map_err(|e| format!("invalid signing digest: {}", e))?;

        for input in &mut self.inputs {
            input.pubkey = pubkey_hex.clone();
            let sig = secp.sign_ecdsa(&message, secret_key);
            input.sig = hex::encode(sig.serialize_der());
        }
        Ok(())
    }

    /// Verify the DER signature of every input against the shared signing
    /// digest. Coinbase transactions carry no signatures.
    pub fn verify_signatures(&self) -> Result<(), String> {
        if self.is_coinbase {
            return Ok(());
        }
        let secp = Secp256k1::verification_only();
        let digest = self.signing_digest();
        let message = Message::from_digest_slice(&digest)
            .map_err(|e| format!("invalid signing digest: {}", e))?;

        for (i, input) in self.inputs.iter().enumerate() {
            let sig_bytes =
                hex::decode(&input.sig).map_err(|_| format!("input {}: invalid sig hex", i))?;
            let sig = Signature::from_der(&sig_bytes)
                .map_err(|_| format!("input {}: invalid DER signature", i))?;
            let pk_bytes = hex::decode(&input.pubkey)
                .map_err(|_| format!("input {}: invalid pubkey hex", i))?;
            let pubkey = PublicKey::from_slice(&pk_bytes)
                .map_err(|_| format!("input {}: invalid public key", i))?;
            secp.verify_ecdsa(&message, &sig, &pubkey)
                .map_err(|_| format!("input {}: signature verification failed", i))?;
        }
        Ok(())
    }

    /// Address the signing key pays from, derived from an input's pubkey.
    pub fn input_address(input: &TxInput) -> Result<String, String> {
        let pk = hex::decode(&input.pubkey).map_err(|_| "invalid pubkey hex".to_string())?;
        Ok(pubkey_to_address(&pk))
    }

    pub fn output_sum(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Fee = inputs - outputs, with input values supplied by a resolver
    /// (confirmed UTXO or in-mempool parent outputs). Unresolvable inputs
    /// make the fee zero rather than an error, matching admission behavior
    /// where such a transaction is rejected elsewhere.
    pub fn fee_with<F>(&self, resolve: F) -> u64
    where
        F: Fn(&str, u32) -> Option<u64>,
    {
        if self.is_coinbase {
            return 0;
        }
        let mut input_sum: u64 = 0;
        for input in &self.inputs {
            match resolve(&input.txid, input.index) {
                Some(value) => input_sum += value,
                None => return 0,
            }
        }
        input_sum.saturating_sub(self.output_sum())
    }

    pub fn serialize(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("transaction serialization cannot fail")
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(data).map_err(|e| format!("invalid transaction: {}", e))
    }
}
