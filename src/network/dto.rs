// Wire representations of headers, blocks and transactions

use crate::consensus::pow::compact_to_big;
use crate::core::{header_hash, Block, Hash256, Transaction, TxInput, TxOutput};
use crate::node::BlockEntry;
use serde::{Deserialize, Serialize};

/// Header as served during headers-first sync. Carries enough to
/// recompute the header hash and verify proof of work without the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderDto {
    pub hash: String,
    pub prev_hash: String,
    pub height: u64,
    pub bits: u32,
    /// Expanded target, hex, for human consumption.
    pub target: String,
    /// Cumulative work claimed by the sender, hex. Receivers recompute
    /// their own from bits.
    pub cum_work: String,
    pub timestamp: i64,
    pub nonce: u64,
    pub merkle_root: String,
}

impl HeaderDto {
    pub fn from_block(block: &Block, entry: &BlockEntry) -> Self {
        Self {
            hash: block.hash.to_hex(),
            prev_hash: block.prev_hash.to_hex(),
            height: block.height,
            bits: block.bits,
            target: compact_to_big(block.bits).to_str_radix(16),
            cum_work: entry.cum_work.to_str_radix(16),
            timestamp: block.timestamp,
            nonce: block.nonce,
            merkle_root: block.merkle_root.to_hex(),
        }
    }

    /// Recompute the header hash from the transmitted fields.
    pub fn computed_hash(&self) -> Result<Hash256, String> {
        let prev = Hash256::from_hex(&self.prev_hash)?;
        let merkle = Hash256::from_hex(&self.merkle_root)?;
        Ok(header_hash(
            self.height,
            &prev,
            self.timestamp,
            self.bits,
            self.nonce,
            &merkle,
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxInputDto {
    pub txid: String,
    pub index: u32,
    pub sig: String,
    pub pubkey: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxOutputDto {
    /// Decimal string; amounts stay integral end to end.
    pub value: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxDto {
    pub id: String,
    pub inputs: Vec<TxInputDto>,
    pub outputs: Vec<TxOutputDto>,
    pub is_coinbase: bool,
}

impl TxDto {
    pub fn from_tx(tx: &Transaction) -> Self {
        Self {
            id: tx.id.clone(),
            inputs: tx
                .inputs
                .iter()
                .map(|i| TxInputDto {
                    txid: i.txid.clone(),
                    index: i.index,
                    sig: i.sig.clone(),
                    pubkey: i.pubkey.clone(),
                })
                .collect(),
            outputs: tx
                .outputs
                .iter()
                .map(|o| TxOutputDto {
                    value: o.value.to_string(),
                    to: o.to.clone(),
                })
                .collect(),
            is_coinbase: tx.is_coinbase,
        }
    }

    pub fn to_tx(&self) -> Result<Transaction, String> {
        let mut outputs = Vec::with_capacity(self.outputs.len());
        for o in &self.outputs {
            let value: u64 = o
                .value
                .parse()
                .map_err(|_| format!("invalid output value: {}", o.value))?;
            outputs.push(TxOutput::new(value, o.to.clone()));
        }
        Ok(Transaction {
            id: self.id.clone(),
            inputs: self
                .inputs
                .iter()
                .map(|i| TxInput {
                    txid: i.txid.clone(),
                    index: i.index,
                    sig: i.sig.clone(),
                    pubkey: i.pubkey.clone(),
                })
                .collect(),
            outputs,
            is_coinbase: self.is_coinbase,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDto {
    pub hash: String,
    pub prev_hash: String,
    pub height: u64,
    pub bits: u32,
    pub target: String,
    pub timestamp: i64,
    pub nonce: u64,
    pub merkle_root: String,
    pub txs: Vec<TxDto>,
}

impl BlockDto {
    pub fn from_block(block: &Block) -> Self {
        Self {
            hash: block.hash.to_hex(),
            prev_hash: block.prev_hash.to_hex(),
            height: block.height,
            bits: block.bits,
            target: compact_to_big(block.bits).to_str_radix(16),
            timestamp: block.timestamp,
            nonce: block.nonce,
            merkle_root: block.merkle_root.to_hex(),
            txs: block.transactions.iter().map(TxDto::from_tx).collect(),
        }
    }

    /// Rebuild the block exactly as transmitted; validation recomputes the
    /// hash and merkle root before anything is trusted.
    pub fn to_block(&self) -> Result<Block, String> {
        let mut transactions = Vec::with_capacity(self.txs.len());
        for tx in &self.txs {
            transactions.push(tx.to_tx()?);
        }
        Ok(Block {
            height: self.height,
            prev_hash: Hash256::from_hex(&self.prev_hash)?,
            timestamp: self.timestamp,
            nonce: self.nonce,
            bits: self.bits,
            merkle_root: Hash256::from_hex(&self.merkle_root)?,
            transactions,
            hash: Hash256::from_hex(&self.hash)?,
        })
    }
}
