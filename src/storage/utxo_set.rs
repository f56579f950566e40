// Unspent transaction output set with a recipient index

use crate::core::{Block, Transaction};
use crate::storage::{Store, BUCKET_UTXO};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// (txid, output index) naming exactly one output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: String,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: String, index: u32) -> Self {
        Self { txid, index }
    }

    pub fn db_key(&self) -> String {
        format!("{}_{}", self.txid, self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub txid: String,
    pub index: u32,
    pub value: u64,
    pub to: String,
}

/// In-memory UTXO map with a recipient -> outpoints index, optionally
/// mirrored to the "utxo" bucket. Clones used for speculative validation
/// are detached and never write through.
#[derive(Clone)]
pub struct UtxoSet {
    set: HashMap<OutPoint, UtxoEntry>,
    addr_index: HashMap<String, Vec<OutPoint>>,
    db: Option<Store>,
}

impl UtxoSet {
    pub fn new(db: Option<Store>) -> Self {
        Self {
            set: HashMap::new(),
            addr_index: HashMap::new(),
            db,
        }
    }

    /// Independent copy for speculative validation; mutations never reach
    /// the persistent mirror.
    pub fn clone_detached(&self) -> Self {
        Self {
            set: self.set.clone(),
            addr_index: self.addr_index.clone(),
            db: None,
        }
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn get(&self, txid: &str, index: u32) -> Option<&UtxoEntry> {
        self.set.get(&OutPoint::new(txid.to_string(), index))
    }

    pub fn contains(&self, txid: &str, index: u32) -> bool {
        self.get(txid, index).is_some()
    }

    /// Insert every output of a transaction. Re-inserting a live outpoint
    /// would silently destroy coins, so it is an internal invariant
    /// violation; the block validator rejects duplicate ids first.
    pub fn add(&mut self, tx: &Transaction) {
        for (i, output) in tx.outputs.iter().enumerate() {
            let outpoint = OutPoint::new(tx.id.clone(), i as u32);
            let entry = UtxoEntry {
                txid: tx.id.clone(),
                index: i as u32,
                value: output.value,
                to: output.to.clone(),
            };

            assert!(
                self.set.insert(outpoint.clone(), entry.clone()).is_none(),
                "outpoint {} inserted twice",
                outpoint.db_key()
            );

            let keys = self.addr_index.entry(output.to.clone()).or_default();
            if !keys.contains(&outpoint) {
                keys.push(outpoint.clone());
            }

            if let Some(db) = &self.db {
                if let Ok(bytes) = serde_json::to_vec(&entry) {
                    if let Err(e) = db.put(BUCKET_UTXO, &outpoint.db_key(), &bytes) {
                        log::error!("failed to persist utxo {}: {}", outpoint.db_key(), e);
                    }
                }
            }
        }
    }

    /// Remove every outpoint a transaction spends, after checking that the
    /// claimed public key hashes to the stored recipient. A missing
    /// outpoint is a transaction-level rejection, not an internal fault.
    pub fn spend(&mut self, tx: &Transaction) -> Result<(), String> {
        if tx.is_coinbase {
            return Ok(());
        }
        for input in &tx.inputs {
            let outpoint = OutPoint::new(input.txid.clone(), input.index);
            let entry = self
                .set
                .get(&outpoint)
                .ok_or_else(|| format!("missing utxo: {}", outpoint.db_key()))?;

            let addr = Transaction::input_address(input)?;
            if entry.to != addr {
                return Err(format!("utxo owner mismatch: {}", outpoint.db_key()));
            }

            let owner = entry.to.clone();
            self.set.remove(&outpoint);
            if let Some(keys) = self.addr_index.get_mut(&owner) {
                keys.retain(|k| k != &outpoint);
                if keys.is_empty() {
                    self.addr_index.remove(&owner);
                }
            }

            if let Some(db) = &self.db {
                if let Err(e) = db.delete(BUCKET_UTXO, &outpoint.db_key()) {
                    log::error!("failed to delete utxo {}: {}", outpoint.db_key(), e);
                }
            }
        }
        Ok(())
    }

    /// Reset and replay every block of the main chain.
    pub fn rebuild(&mut self, chain: &[Block]) -> Result<(), String> {
        self.set.clear();
        self.addr_index.clear();
        if let Some(db) = &self.db {
            db.clear_bucket(BUCKET_UTXO)?;
        }

        for block in chain {
            for tx in &block.transactions {
                if !tx.is_coinbase {
                    self.spend(tx)?;
                }
                for index in 0..tx.outputs.len() {
                    if self.contains(&tx.id, index as u32) {
                        return Err(format!("duplicate outpoint {}_{} in chain", tx.id, index));
                    }
                }
                self.add(tx);
            }
        }
        Ok(())
    }

    /// Reload the in-memory maps from the persistent mirror.
    pub fn load(&mut self) -> Result<(), String> {
        let db = match &self.db {
            Some(db) => db.clone(),
            None => return Ok(()),
        };
        self.set.clear();
        self.addr_index.clear();

        let mut entries = Vec::new();
        db.iterate(BUCKET_UTXO, |_, v| {
            if let Ok(entry) = serde_json::from_slice::<UtxoEntry>(v) {
                entries.push(entry);
            }
        })?;

        for entry in entries {
            let outpoint = OutPoint::new(entry.txid.clone(), entry.index);
            self.addr_index
                .entry(entry.to.clone())
                .or_default()
                .push(outpoint.clone());
            self.set.insert(outpoint, entry);
        }
        Ok(())
    }

    pub fn balance(&self, addr: &str) -> u64 {
        self.utxos_for(addr).iter().map(|u| u.value).sum()
    }

    pub fn utxos_for(&self, addr: &str) -> Vec<UtxoEntry> {
        match self.addr_index.get(addr) {
            Some(keys) => keys.iter().filter_map(|k| self.set.get(k).cloned()).collect(),
            None => Vec::new(),
        }
    }

    /// Accumulate spendable outputs for an address until `amount` is
    /// covered. Returns the accumulated value and the chosen entries.
    pub fn find_spendable(&self, addr: &str, amount: u64) -> (u64, Vec<UtxoEntry>) {
        let mut accumulated = 0u64;
        let mut chosen = Vec::new();
        for entry in self.utxos_for(addr) {
            accumulated += entry.value;
            chosen.push(entry);
            if accumulated >= amount {
                break;
            }
        }
        (accumulated, chosen)
    }
}
