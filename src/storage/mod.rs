// Persistence layer: a bucketed key/value store backed by sled

mod utxo_set;

pub use utxo_set::{OutPoint, UtxoEntry, UtxoSet};

use std::path::Path;

/// Logical buckets, each mapped to a sled tree.
pub const BUCKET_BLOCKS: &str = "blocks";
pub const BUCKET_INDEX: &str = "index";
pub const BUCKET_UTXO: &str = "utxo";
pub const BUCKET_META: &str = "meta";
pub const BUCKET_TXINDEX: &str = "txindex";
pub const BUCKET_MEMPOOL: &str = "mempool";
pub const BUCKET_PEERSTORE: &str = "peerstore";

/// Bucketed store. Cloning is cheap and shares the underlying database.
#[derive(Clone)]
pub struct Store {
    db: sled::Db,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let db = sled::open(path).map_err(|e| format!("failed to open database: {}", e))?;
        Ok(Self { db })
    }

    /// In-memory store for tests.
    pub fn memory() -> Result<Self, String> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| format!("failed to create memory db: {}", e))?;
        Ok(Self { db })
    }

    fn tree(&self, bucket: &str) -> Result<sled::Tree, String> {
        self.db
            .open_tree(bucket)
            .map_err(|e| format!("failed to open bucket {}: {}", bucket, e))
    }

    pub fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), String> {
        self.tree(bucket)?
            .insert(key.as_bytes(), value)
            .map_err(|e| format!("put {}/{} failed: {}", bucket, key, e))?;
        Ok(())
    }

    pub fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, String> {
        let value = self
            .tree(bucket)?
            .get(key.as_bytes())
            .map_err(|e| format!("get {}/{} failed: {}", bucket, key, e))?;
        Ok(value.map(|v| v.to_vec()))
    }

    pub fn delete(&self, bucket: &str, key: &str) -> Result<(), String> {
        self.tree(bucket)?
            .remove(key.as_bytes())
            .map_err(|e| format!("delete {}/{} failed: {}", bucket, key, e))?;
        Ok(())
    }

    /// Visit every key/value pair in a bucket.
    pub fn iterate<F>(&self, bucket: &str, mut visit: F) -> Result<(), String>
    where
        F: FnMut(&[u8], &[u8]),
    {
        for item in self.tree(bucket)?.iter() {
            let (k, v) = item.map_err(|e| format!("iterate {} failed: {}", bucket, e))?;
            visit(&k, &v);
        }
        Ok(())
    }

    pub fn clear_bucket(&self, bucket: &str) -> Result<(), String> {
        self.tree(bucket)?
            .clear()
            .map_err(|e| format!("clear {} failed: {}", bucket, e))
    }

    pub fn flush(&self) -> Result<(), String> {
        self.db
            .flush()
            .map_err(|e| format!("flush failed: {}", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let store = Store::memory().unwrap();
        assert_eq!(store.get(BUCKET_META, "best").unwrap(), None);

        store.put(BUCKET_META, "best", b"abc").unwrap();
        assert_eq!(store.get(BUCKET_META, "best").unwrap(), Some(b"abc".to_vec()));

        store.delete(BUCKET_META, "best").unwrap();
        assert_eq!(store.get(BUCKET_META, "best").unwrap(), None);
    }

    #[test]
    fn test_buckets_are_isolated() {
        let store = Store::memory().unwrap();
        store.put(BUCKET_BLOCKS, "k", b"block").unwrap();
        store.put(BUCKET_INDEX, "k", b"index").unwrap();

        assert_eq!(store.get(BUCKET_BLOCKS, "k").unwrap(), Some(b"block".to_vec()));
        assert_eq!(store.get(BUCKET_INDEX, "k").unwrap(), Some(b"index".to_vec()));
    }

    #[test]
    fn test_iterate_and_clear() {
        let store = Store::memory().unwrap();
        store.put(BUCKET_MEMPOOL, "a", b"1").unwrap();
        store.put(BUCKET_MEMPOOL, "b", b"2").unwrap();

        let mut seen = Vec::new();
        store
            .iterate(BUCKET_MEMPOOL, |k, _| seen.push(String::from_utf8_lossy(k).to_string()))
            .unwrap();
        seen.sort();
        assert_eq!(seen, vec!["a", "b"]);

        store.clear_bucket(BUCKET_MEMPOOL).unwrap();
        let mut count = 0;
        store.iterate(BUCKET_MEMPOOL, |_, _| count += 1).unwrap();
        assert_eq!(count, 0);
    }
}
