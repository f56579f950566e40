// Block model and merkle root computation

use crate::core::hash::{hash256, sha256};
use crate::core::{Hash256, Transaction};
use serde::{Deserialize, Serialize};

/// Fixed genesis parameters. The coinbase tag must match on every node or
/// the genesis hashes diverge and no two nodes can sync.
pub const GENESIS_TAG: &str =
    "The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";
pub const GENESIS_RECIPIENT: &str = "GENESIS";
pub const GENESIS_SUBSIDY: u64 = 1_000_000;
pub const GENESIS_TIMESTAMP: i64 = 1_700_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub prev_hash: Hash256,
    pub timestamp: i64,
    pub nonce: u64,
    /// Compact-encoded difficulty target.
    pub bits: u32,
    pub merkle_root: Hash256,
    pub transactions: Vec<Transaction>,
    pub hash: Hash256,
}

impl Block {
    pub fn new(
        height: u64,
        prev_hash: Hash256,
        timestamp: i64,
        bits: u32,
        transactions: Vec<Transaction>,
    ) -> Self {
        let merkle_root = compute_merkle_root(&transactions);
        let mut block = Self {
            height,
            prev_hash,
            timestamp,
            nonce: 0,
            bits,
            merkle_root,
            transactions,
            hash: Hash256::zero(),
        };
        block.hash = block.compute_hash();
        block
    }

    /// The fixed genesis block: a single coinbase crediting the genesis
    /// subsidy to the GENESIS recipient.
    pub fn genesis(bits: u32) -> Self {
        let coinbase = Transaction::coinbase(GENESIS_RECIPIENT, GENESIS_SUBSIDY, GENESIS_TAG);
        Self::new(0, Hash256::zero(), GENESIS_TIMESTAMP, bits, vec![coinbase])
    }

    /// Header bytes in hashing order: height || prev || timestamp || bits
    /// || nonce || merkle root, all integers little-endian.
    pub fn header_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(92);
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(self.prev_hash.as_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.bits.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf.extend_from_slice(self.merkle_root.as_bytes());
        buf
    }

    pub fn compute_hash(&self) -> Hash256 {
        sha256(&self.header_bytes())
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0 && self.prev_hash.is_zero()
    }

    pub fn serialize(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("block serialization cannot fail")
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(data).map_err(|e| format!("invalid block: {}", e))
    }
}

/// Hash of header fields alone, for header-only entries received during
/// headers-first sync.
pub fn header_hash(
    height: u64,
    prev_hash: &Hash256,
    timestamp: i64,
    bits: u32,
    nonce: u64,
    merkle_root: &Hash256,
) -> Hash256 {
    let mut buf = Vec::with_capacity(92);
    buf.extend_from_slice(&height.to_le_bytes());
    buf.extend_from_slice(prev_hash.as_bytes());
    buf.extend_from_slice(&timestamp.to_le_bytes());
    buf.extend_from_slice(&bits.to_le_bytes());
    buf.extend_from_slice(&nonce.to_le_bytes());
    buf.extend_from_slice(merkle_root.as_bytes());
    sha256(&buf)
}

/// Merkle root over transaction ids: pairwise double-SHA-256, duplicating
/// the last element on odd layers.
pub fn compute_merkle_root(transactions: &[Transaction]) -> Hash256 {
    if transactions.is_empty() {
        return sha256(&[]);
    }

    let mut layer: Vec<Hash256> = transactions
        .iter()
        .map(|tx| Hash256::from_hex(&tx.id).unwrap_or_else(|_| sha256(tx.id.as_bytes())))
        .collect();

    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len().div_ceil(2));
        for pair in layer.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            let mut combined = Vec::with_capacity(64);
            combined.extend_from_slice(left.as_bytes());
            combined.extend_from_slice(right.as_bytes());
            next.push(hash256(&combined));
        }
        layer = next;
    }

    layer[0]
}
