// Block-index tree: one entry per known header, arena-allocated

use crate::consensus::params::DIFFICULTY_INTERVAL;
use crate::consensus::pow::{big_to_compact, compact_to_big, work_from_bits};
use crate::consensus::validation::retarget;
use crate::core::{Block, Hash256};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One known header. Parent and children are arena indices; the body is
/// attached once downloaded and entries are never deleted.
#[derive(Debug, Clone)]
pub struct BlockEntry {
    pub hash: Hash256,
    pub prev_hash: Hash256,
    pub height: u64,
    pub bits: u32,
    pub timestamp: i64,
    pub cum_work: BigUint,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub block: Option<Block>,
}

impl BlockEntry {
    pub fn has_body(&self) -> bool {
        self.block.is_some()
    }

    pub fn to_record(&self) -> IndexRecord {
        IndexRecord {
            hash: self.hash.to_hex(),
            prevhash: self.prev_hash.to_hex(),
            height: self.height,
            bits: self.bits,
            timestamp: self.timestamp,
            cumwork: self.cum_work.to_str_radix(16),
        }
    }
}

/// Persisted form of an entry ("index" bucket). Cumulative work is stored
/// as lowercase hex; parent wiring is rebuilt from prevhash at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRecord {
    pub hash: String,
    pub prevhash: String,
    pub height: u64,
    pub bits: u32,
    pub timestamp: i64,
    pub cumwork: String,
}

impl IndexRecord {
    pub fn cum_work(&self) -> BigUint {
        BigUint::parse_bytes(self.cumwork.as_bytes(), 16).unwrap_or_default()
    }
}

/// The header tree rooted at genesis. `best` points at the entry with the
/// greatest cumulative work seen so far, which may be header-only during
/// synchronization.
pub struct BlockTree {
    entries: Vec<BlockEntry>,
    by_hash: HashMap<Hash256, usize>,
    best: usize,
}

impl BlockTree {
    /// Build a tree containing only the genesis block.
    pub fn with_genesis(genesis: Block) -> Self {
        let entry = BlockEntry {
            hash: genesis.hash,
            prev_hash: Hash256::zero(),
            height: 0,
            bits: genesis.bits,
            timestamp: genesis.timestamp,
            cum_work: work_from_bits(genesis.bits),
            parent: None,
            children: Vec::new(),
            block: Some(genesis),
        };
        let mut by_hash = HashMap::new();
        by_hash.insert(entry.hash, 0);
        Self {
            entries: vec![entry],
            by_hash,
            best: 0,
        }
    }

    /// Rebuild the tree from persisted records and any available bodies.
    /// Entries must include genesis; orphaned records (parent never seen)
    /// keep a None parent and are unreachable for chain selection.
    pub fn from_records(
        records: Vec<IndexRecord>,
        mut bodies: HashMap<Hash256, Block>,
        best_hash: &Hash256,
    ) -> Result<Self, String> {
        let mut entries = Vec::with_capacity(records.len());
        let mut by_hash = HashMap::new();

        for record in &records {
            let hash = Hash256::from_hex(&record.hash)?;
            let prev_hash = if record.prevhash.is_empty() {
                Hash256::zero()
            } else {
                Hash256::from_hex(&record.prevhash)?
            };
            let index = entries.len();
            entries.push(BlockEntry {
                hash,
                prev_hash,
                height: record.height,
                bits: record.bits,
                timestamp: record.timestamp,
                cum_work: record.cum_work(),
                parent: None,
                children: Vec::new(),
                block: bodies.remove(&hash),
            });
            by_hash.insert(hash, index);
        }

        // reattach parent pointers via prev-hash
        for index in 0..entries.len() {
            if entries[index].height == 0 {
                continue;
            }
            if let Some(&parent) = by_hash.get(&entries[index].prev_hash) {
                entries[index].parent = Some(parent);
                entries[parent].children.push(index);
            }
        }

        let best = *by_hash
            .get(best_hash)
            .ok_or_else(|| format!("best block {} missing from index", best_hash))?;

        Ok(Self {
            entries,
            by_hash,
            best,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> &BlockEntry {
        &self.entries[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut BlockEntry {
        &mut self.entries[index]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<usize> {
        self.by_hash.get(hash).copied()
    }

    pub fn best_index(&self) -> usize {
        self.best
    }

    pub fn best(&self) -> &BlockEntry {
        &self.entries[self.best]
    }

    pub fn set_best(&mut self, index: usize) {
        self.best = index;
    }

    /// Insert a new entry under `parent`, computing cumulative work from
    /// the parent's. Returns the new arena index.
    pub fn insert(
        &mut self,
        hash: Hash256,
        parent: usize,
        bits: u32,
        timestamp: i64,
        block: Option<Block>,
    ) -> usize {
        let parent_entry = &self.entries[parent];
        let entry = BlockEntry {
            hash,
            prev_hash: parent_entry.hash,
            height: parent_entry.height + 1,
            bits,
            timestamp,
            cum_work: &parent_entry.cum_work + work_from_bits(bits),
            parent: Some(parent),
            children: Vec::new(),
            block,
        };
        let index = self.entries.len();
        self.entries.push(entry);
        self.by_hash.insert(hash, index);
        self.entries[parent].children.push(index);
        index
    }

    /// The network's easiest target, taken from the genesis entry's bits.
    pub fn genesis_target(&self) -> BigUint {
        let root = self
            .entries
            .iter()
            .find(|e| e.height == 0)
            .expect("tree always contains genesis");
        compact_to_big(root.bits)
    }

    /// Expected bits for the child of `parent` under the retarget schedule.
    /// Uses only header data so it also works for header-only entries.
    pub fn expected_bits(&self, parent: usize) -> u32 {
        let parent_entry = &self.entries[parent];
        if (parent_entry.height + 1) % DIFFICULTY_INTERVAL != 0 {
            return parent_entry.bits;
        }

        // first block of the closing interval, clamped at genesis
        let first_height = parent_entry.height.saturating_sub(DIFFICULTY_INTERVAL - 1);
        let mut first = parent;
        while self.entries[first].height > first_height {
            match self.entries[first].parent {
                Some(p) => first = p,
                None => break,
            }
        }

        let span = parent_entry.timestamp - self.entries[first].timestamp;
        let old_target = compact_to_big(parent_entry.bits);
        big_to_compact(&retarget(&old_target, span, &self.genesis_target()))
    }

    /// Block locator: dense near the tip (ten single steps), then doubling
    /// strides back to genesis.
    pub fn locator(&self) -> Vec<Hash256> {
        let mut hashes = Vec::new();
        let mut step = 1usize;
        let mut emitted = 0usize;
        let mut cursor = Some(self.best);

        while let Some(index) = cursor {
            hashes.push(self.entries[index].hash);
            emitted += 1;
            if emitted > 10 {
                step *= 2;
            }
            for _ in 0..step {
                match cursor.and_then(|i| self.entries[i].parent) {
                    Some(p) => cursor = Some(p),
                    None => {
                        cursor = None;
                        break;
                    }
                }
            }
        }

        hashes
    }

    /// Walk both entries up to their common ancestor. Returns
    /// (ancestor, path old->ancestor exclusive, path ancestor->new exclusive
    /// in connect order).
    pub fn fork_paths(&self, old_tip: usize, new_tip: usize) -> (usize, Vec<usize>, Vec<usize>) {
        let mut a = old_tip;
        let mut b = new_tip;

        while self.entries[a].height > self.entries[b].height {
            a = self.entries[a].parent.expect("non-genesis entry has parent");
        }
        while self.entries[b].height > self.entries[a].height {
            b = self.entries[b].parent.expect("non-genesis entry has parent");
        }
        while a != b {
            a = self.entries[a].parent.expect("forked entries reach a common ancestor");
            b = self.entries[b].parent.expect("forked entries reach a common ancestor");
        }
        let ancestor = a;

        let mut disconnect = Vec::new();
        let mut cursor = old_tip;
        while cursor != ancestor {
            disconnect.push(cursor);
            cursor = self.entries[cursor].parent.expect("path to ancestor");
        }

        let mut connect = Vec::new();
        cursor = new_tip;
        while cursor != ancestor {
            connect.push(cursor);
            cursor = self.entries[cursor].parent.expect("path to ancestor");
        }
        connect.reverse();

        (ancestor, disconnect, connect)
    }

    /// Bodies along the path genesis -> `tip`, oldest first. Entries
    /// without a body are skipped.
    pub fn chain_to(&self, tip: usize) -> Vec<Block> {
        let mut blocks = Vec::new();
        let mut cursor = Some(tip);
        while let Some(index) = cursor {
            if let Some(block) = &self.entries[index].block {
                blocks.push(block.clone());
            }
            cursor = self.entries[index].parent;
        }
        blocks.reverse();
        blocks
    }

    /// Oldest ancestor of the best entry that still lacks a body.
    pub fn oldest_missing_body(&self) -> Option<Hash256> {
        let mut missing = None;
        let mut cursor = Some(self.best);
        while let Some(index) = cursor {
            if !self.entries[index].has_body() {
                missing = Some(self.entries[index].hash);
            }
            cursor = self.entries[index].parent;
        }
        missing
    }

    /// True while any ancestor of the best entry lacks a body.
    pub fn has_missing_bodies(&self) -> bool {
        self.oldest_missing_body().is_some()
    }

    /// All persisted records, for tests and diagnostics.
    pub fn records(&self) -> Vec<IndexRecord> {
        self.entries.iter().map(|e| e.to_record()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::params::INTERVAL_TIMESPAN_SECS;

    const EASY_BITS: u32 = 0x207fffff;

    fn linear_tree(length: u64) -> BlockTree {
        let genesis = Block::genesis(EASY_BITS);
        let mut tree = BlockTree::with_genesis(genesis.clone());
        let mut parent = 0;
        let mut prev_hash = genesis.hash;
        for h in 1..=length {
            let block = Block::new(h, prev_hash, genesis.timestamp + h as i64 * 30, EASY_BITS, vec![]);
            prev_hash = block.hash;
            parent = tree.insert(block.hash, parent, EASY_BITS, block.timestamp, Some(block));
            tree.set_best(parent);
        }
        tree
    }

    #[test]
    fn test_cumulative_work_monotone() {
        let tree = linear_tree(5);
        let mut cursor = Some(tree.best_index());
        let mut prev_work: Option<BigUint> = None;
        while let Some(index) = cursor {
            let entry = tree.get(index);
            if let Some(w) = &prev_work {
                assert!(entry.cum_work < *w);
            }
            prev_work = Some(entry.cum_work.clone());
            cursor = entry.parent;
        }
    }

    #[test]
    fn test_locator_shape() {
        let tree = linear_tree(40);
        let locator = tree.locator();

        // dense near the tip: first eleven entries descend one by one
        for (i, hash) in locator.iter().take(11).enumerate() {
            let index = tree.lookup(hash).unwrap();
            assert_eq!(tree.get(index).height, 40 - i as u64);
        }
        // sparse after that, and much shorter than the chain
        assert!(locator.len() < 20);
        // genesis region is reachable from the tail
        let tail = tree.lookup(locator.last().unwrap()).unwrap();
        assert!(tree.get(tail).height <= 10);
    }

    #[test]
    fn test_fork_paths() {
        let mut tree = linear_tree(3);
        // branch off height 1 with a competing chain of length 3
        let fork_parent = {
            let mut cursor = tree.best_index();
            while tree.get(cursor).height > 1 {
                cursor = tree.get(cursor).parent.unwrap();
            }
            cursor
        };
        let base_hash = tree.get(fork_parent).hash;
        let b2 = Block::new(2, base_hash, 1_000, EASY_BITS, vec![]);
        let i2 = tree.insert(b2.hash, fork_parent, EASY_BITS, b2.timestamp, Some(b2.clone()));
        let b3 = Block::new(3, b2.hash, 1_030, EASY_BITS, vec![]);
        let i3 = tree.insert(b3.hash, i2, EASY_BITS, b3.timestamp, Some(b3.clone()));
        let b4 = Block::new(4, b3.hash, 1_060, EASY_BITS, vec![]);
        let i4 = tree.insert(b4.hash, i3, EASY_BITS, b4.timestamp, Some(b4));

        let old_tip = tree.best_index();
        let (ancestor, disconnect, connect) = tree.fork_paths(old_tip, i4);

        assert_eq!(ancestor, fork_parent);
        assert_eq!(disconnect.len(), 2); // heights 3, 2 of the old chain
        assert_eq!(connect, vec![i2, i3, i4]); // ancestor -> new tip order
    }

    #[test]
    fn test_expected_bits_off_interval_is_parent_bits() {
        let tree = linear_tree(5);
        assert_eq!(tree.expected_bits(tree.best_index()), EASY_BITS);
    }

    #[test]
    fn test_expected_bits_retargets_on_interval() {
        // blocks arriving much faster than the 30s spacing force a harder
        // target at the boundary
        let genesis = Block::genesis(EASY_BITS);
        let mut tree = BlockTree::with_genesis(genesis.clone());
        let mut parent = 0;
        let mut prev_hash = genesis.hash;
        for h in 1..=(DIFFICULTY_INTERVAL - 1) {
            let block = Block::new(h, prev_hash, genesis.timestamp + h as i64, EASY_BITS, vec![]);
            prev_hash = block.hash;
            parent = tree.insert(block.hash, parent, EASY_BITS, block.timestamp, Some(block));
        }
        tree.set_best(parent);

        let bits = tree.expected_bits(parent);
        assert_ne!(bits, EASY_BITS);
        // actual span of ~9s against 300 expected clamps to /4
        let expected = big_to_compact(&retarget(
            &compact_to_big(EASY_BITS),
            INTERVAL_TIMESPAN_SECS / 4,
            &compact_to_big(EASY_BITS),
        ));
        assert_eq!(bits, expected);
    }

    #[test]
    fn test_records_round_trip() {
        let tree = linear_tree(4);
        let records = tree.records();
        let bodies: HashMap<Hash256, Block> = records
            .iter()
            .filter_map(|r| {
                let h = Hash256::from_hex(&r.hash).unwrap();
                tree.lookup(&h)
                    .and_then(|i| tree.get(i).block.clone())
                    .map(|b| (h, b))
            })
            .collect();

        let best_hash = tree.best().hash;
        let reloaded = BlockTree::from_records(records, bodies, &best_hash).unwrap();

        assert_eq!(reloaded.len(), tree.len());
        assert_eq!(reloaded.best().hash, best_hash);
        assert_eq!(reloaded.best().cum_work, tree.best().cum_work);
        assert_eq!(reloaded.best().height, 4);
        assert!(!reloaded.has_missing_bodies());
    }

    #[test]
    fn test_oldest_missing_body() {
        let mut tree = linear_tree(2);
        let tip = tree.best_index();
        // header-only extension
        let tip_hash = tree.get(tip).hash;
        let b3 = Block::new(3, tip_hash, 2_000, EASY_BITS, vec![]);
        let i3 = tree.insert(b3.hash, tip, EASY_BITS, b3.timestamp, None);
        let b4 = Block::new(4, b3.hash, 2_030, EASY_BITS, vec![]);
        let i4 = tree.insert(b4.hash, i3, EASY_BITS, b4.timestamp, None);
        tree.set_best(i4);

        assert!(tree.has_missing_bodies());
        // the oldest gap comes first
        assert_eq!(tree.oldest_missing_body(), Some(b3.hash));

        tree.get_mut(i3).block = Some(b3);
        assert_eq!(tree.oldest_missing_body(), Some(b4.hash));
        tree.get_mut(i4).block = Some(b4);
        assert!(!tree.has_missing_bodies());
    }
}
