// Mempool: unconfirmed transactions with replace-by-fee and packages

use crate::core::Transaction;
use crate::storage::{Store, UtxoSet, BUCKET_MEMPOOL};
use std::collections::{HashMap, HashSet};

/// A package for the miner: a transaction together with its in-pool
/// ancestors, valued by the sum of their fees.
#[derive(Debug, Clone)]
pub struct TxPackage {
    pub txs: Vec<Transaction>,
    pub fee: u64,
}

/// Pool of unconfirmed transactions keyed by txid. The spent map tracks
/// which pool transaction claims each outpoint (conflict and RBF
/// detection); parent/child adjacency supports package construction and
/// BIP-125-style descendant eviction. Contents are mirrored to the
/// "mempool" bucket when a store is attached.
pub struct Mempool {
    txs: HashMap<String, Vec<u8>>,
    spent: HashMap<String, String>,
    parents: HashMap<String, Vec<String>>,
    children: HashMap<String, Vec<String>>,
    max_txs: usize,
    db: Option<Store>,
}

fn outpoint_key(txid: &str, index: u32) -> String {
    format!("{}_{}", txid, index)
}

impl Mempool {
    pub fn new(max_txs: usize, db: Option<Store>) -> Self {
        Self {
            txs: HashMap::new(),
            spent: HashMap::new(),
            parents: HashMap::new(),
            children: HashMap::new(),
            max_txs,
            db,
        }
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn has(&self, txid: &str) -> bool {
        self.txs.contains_key(txid)
    }

    pub fn get(&self, txid: &str) -> Option<Vec<u8>> {
        self.txs.get(txid).cloned()
    }

    pub fn get_decoded(&self, txid: &str) -> Option<Transaction> {
        self.txs
            .get(txid)
            .and_then(|bytes| Transaction::deserialize(bytes).ok())
    }

    pub fn get_all(&self) -> HashMap<String, Vec<u8>> {
        self.txs.clone()
    }

    pub fn txids(&self) -> Vec<String> {
        self.txs.keys().cloned().collect()
    }

    /// Value of an in-pool transaction's output, for resolving inputs of
    /// dependent (child) transactions.
    pub fn output_value(&self, txid: &str, index: u32) -> Option<u64> {
        self.get_decoded(txid)
            .and_then(|tx| tx.outputs.get(index as usize).map(|o| o.value))
    }

    pub fn output_entry(&self, txid: &str, index: u32) -> Option<(u64, String)> {
        self.get_decoded(txid).and_then(|tx| {
            tx.outputs
                .get(index as usize)
                .map(|o| (o.value, o.to.clone()))
        })
    }

    /// Fee of a transaction resolved against confirmed UTXO plus in-pool
    /// parent outputs.
    pub fn fee_of(&self, tx: &Transaction, utxo: &UtxoSet) -> u64 {
        tx.fee_with(|txid, index| {
            utxo.get(txid, index)
                .map(|u| u.value)
                .or_else(|| self.output_value(txid, index))
        })
    }

    /// True when some pool transaction already claims one of this
    /// transaction's inputs.
    pub fn has_conflict(&self, tx: &Transaction) -> bool {
        !self.find_conflicts(tx).is_empty()
    }

    fn find_conflicts(&self, tx: &Transaction) -> HashSet<String> {
        let mut conflicts = HashSet::new();
        for input in &tx.inputs {
            if let Some(claimer) = self.spent.get(&outpoint_key(&input.txid, input.index)) {
                conflicts.insert(claimer.clone());
            }
        }
        conflicts
    }

    /// Admission with replace-by-fee. The caller has already validated the
    /// transaction (signatures, input availability); this decides fee
    /// precedence and bookkeeping. Returns false on duplicate, losing fee,
    /// or a full pool that the newcomer does not out-bid.
    pub fn add_with_rbf(&mut self, txid: &str, bytes: &[u8], utxo: &UtxoSet) -> bool {
        let tx = match Transaction::deserialize(bytes) {
            Ok(tx) => tx,
            Err(e) => {
                log::warn!("mempool rejected undecodable tx: {}", e);
                return false;
            }
        };
        if self.has(txid) {
            return false;
        }

        let new_fee = self.fee_of(&tx, utxo);

        // replace-by-fee: the newcomer must strictly out-pay every conflict
        let conflicts = self.find_conflicts(&tx);
        if !conflicts.is_empty() {
            for conflict_id in &conflicts {
                if let Some(old) = self.get_decoded(conflict_id) {
                    if new_fee <= self.fee_of(&old, utxo) {
                        return false;
                    }
                }
            }
            for conflict_id in &conflicts {
                self.remove_with_descendants(conflict_id);
                log::info!("mempool rbf: replaced {} with {}", conflict_id, txid);
            }
        }

        // lowest-fee eviction at capacity
        if self.txs.len() >= self.max_txs {
            match self.lowest_fee_tx(utxo) {
                Some((lowest_id, lowest_fee)) if new_fee > lowest_fee => {
                    log::info!(
                        "mempool eviction: drop {} (fee {}) for {} (fee {})",
                        lowest_id,
                        lowest_fee,
                        txid,
                        new_fee
                    );
                    self.remove_with_descendants(&lowest_id);
                }
                _ => return false,
            }
        }

        self.insert(txid, &tx, bytes);
        true
    }

    fn insert(&mut self, txid: &str, tx: &Transaction, bytes: &[u8]) {
        self.txs.insert(txid.to_string(), bytes.to_vec());

        for input in &tx.inputs {
            self.spent
                .insert(outpoint_key(&input.txid, input.index), txid.to_string());

            if self.txs.contains_key(&input.txid) {
                self.parents
                    .entry(txid.to_string())
                    .or_default()
                    .push(input.txid.clone());
                self.children
                    .entry(input.txid.clone())
                    .or_default()
                    .push(txid.to_string());
            }
        }

        if let Some(db) = &self.db {
            if let Err(e) = db.put(BUCKET_MEMPOOL, txid, bytes) {
                log::error!("failed to persist mempool tx {}: {}", txid, e);
            }
        }
    }

    /// Remove a single transaction (block inclusion). Children stay: their
    /// parent is now confirmed.
    pub fn remove(&mut self, txid: &str) {
        if let Some(bytes) = self.txs.remove(txid) {
            if let Ok(tx) = Transaction::deserialize(&bytes) {
                for input in &tx.inputs {
                    self.spent.remove(&outpoint_key(&input.txid, input.index));
                }
            }
        }
        if let Some(parents) = self.parents.remove(txid) {
            for parent in parents {
                if let Some(siblings) = self.children.get_mut(&parent) {
                    siblings.retain(|c| c != txid);
                }
            }
        }
        if let Some(children) = self.children.remove(txid) {
            for child in children {
                if let Some(ps) = self.parents.get_mut(&child) {
                    ps.retain(|p| p != txid);
                }
            }
        }
        if let Some(db) = &self.db {
            let _ = db.delete(BUCKET_MEMPOOL, txid);
        }
    }

    /// Remove a transaction together with every in-pool descendant
    /// (replacement and eviction semantics).
    pub fn remove_with_descendants(&mut self, txid: &str) {
        let mut queue = vec![txid.to_string()];
        let mut doomed = Vec::new();
        let mut seen = HashSet::new();
        while let Some(id) = queue.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(children) = self.children.get(&id) {
                queue.extend(children.iter().cloned());
            }
            doomed.push(id);
        }
        for id in doomed {
            self.remove(&id);
        }
    }

    pub fn clear(&mut self) {
        self.txs.clear();
        self.spent.clear();
        self.parents.clear();
        self.children.clear();
        if let Some(db) = &self.db {
            let _ = db.clear_bucket(BUCKET_MEMPOOL);
        }
    }

    fn lowest_fee_tx(&self, utxo: &UtxoSet) -> Option<(String, u64)> {
        self.txs
            .keys()
            .filter_map(|txid| {
                self.get_decoded(txid)
                    .map(|tx| (txid.clone(), self.fee_of(&tx, utxo)))
            })
            .min_by_key(|(_, fee)| *fee)
    }

    fn collect_ancestors(&self, txid: &str, visited: &mut HashSet<String>, out: &mut Vec<Transaction>) {
        if !visited.insert(txid.to_string()) {
            return;
        }
        if let Some(parents) = self.parents.get(txid) {
            for parent in parents {
                self.collect_ancestors(parent, visited, out);
            }
        }
        if let Some(tx) = self.get_decoded(txid) {
            out.push(tx);
        }
    }

    /// Packages for the miner: every pool transaction with its ancestors
    /// (ancestors first), valued by summed fees and sorted descending.
    pub fn packages(&self, utxo: &UtxoSet) -> Vec<TxPackage> {
        let mut packages: Vec<TxPackage> = self
            .txs
            .keys()
            .map(|txid| {
                let mut txs = Vec::new();
                let mut visited = HashSet::new();
                self.collect_ancestors(txid, &mut visited, &mut txs);
                let fee = txs.iter().map(|tx| self.fee_of(tx, utxo)).sum();
                TxPackage { txs, fee }
            })
            .collect();
        packages.sort_by(|a, b| b.fee.cmp(&a.fee));
        packages
    }

    /// Reload persisted transactions after a restart, rebuilding the spent
    /// map and dependency links.
    pub fn load(&mut self, utxo: &UtxoSet) -> Result<usize, String> {
        let db = match &self.db {
            Some(db) => db.clone(),
            None => return Ok(0),
        };
        let mut entries = Vec::new();
        db.iterate(BUCKET_MEMPOOL, |k, v| {
            entries.push((String::from_utf8_lossy(k).to_string(), v.to_vec()));
        })?;

        let mut count = 0;
        for (txid, bytes) in entries {
            // anything no longer valid against the current UTXO is dropped
            if self.add_with_rbf(&txid, &bytes, utxo) {
                count += 1;
            } else {
                let _ = db.delete(BUCKET_MEMPOOL, &txid);
            }
        }
        Ok(count)
    }
}
