//! In-memory reference implementation of the store contract

use std::collections::HashMap;
use std::sync::Mutex;

use super::{StoreBatch, StoreError, StoreResult, TreeStore};

/// Batched mutation queued by a [`MemoryBatch`]
#[derive(Debug, Clone)]
enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// `HashMap`-backed store
///
/// Batches are applied under a single lock acquisition, so every queued
/// mutation becomes visible together.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored
    pub fn len(&self) -> usize {
        self.entries.lock().expect("memory store poisoned").len()
    }

    /// True when the store holds no keys
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TreeStore for MemoryStore {
    fn get(&self, key: &[u8]) -> StoreResult<Vec<u8>> {
        self.entries
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.entries
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.entries
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .remove(key);
        Ok(())
    }

    fn new_batch(&self) -> Box<dyn StoreBatch + '_> {
        Box::new(MemoryBatch {
            store: self,
            ops: Vec::new(),
            bytes: 0,
        })
    }

    fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Batch against a [`MemoryStore`]
struct MemoryBatch<'a> {
    store: &'a MemoryStore,
    ops: Vec<BatchOp>,
    bytes: usize,
}

impl StoreBatch for MemoryBatch<'_> {
    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.bytes += key.len() + value.len();
        self.ops.push(BatchOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    fn delete(&mut self, key: &[u8]) {
        self.bytes += key.len();
        self.ops.push(BatchOp::Delete { key: key.to_vec() });
    }

    fn reset(&mut self) {
        self.ops.clear();
        self.bytes = 0;
    }

    fn size(&self) -> usize {
        self.bytes
    }

    fn write(&mut self) -> StoreResult<()> {
        let mut entries = self
            .store
            .entries
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        for op in self.ops.drain(..) {
            match op {
                BatchOp::Put { key, value } => {
                    entries.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
        self.bytes = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let store = MemoryStore::new();

        store.set(b"key", b"value").unwrap();
        assert_eq!(store.get(b"key").unwrap(), b"value".to_vec());

        store.delete(b"key").unwrap();
        assert!(matches!(store.get(b"key"), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_batch_write() {
        let store = MemoryStore::new();
        store.set(b"stale", b"old").unwrap();

        let mut batch = store.new_batch();
        batch.set(b"k1", b"v1");
        batch.set(b"k2", b"v2");
        batch.delete(b"stale");
        assert!(batch.size() > 0);

        batch.write().unwrap();
        assert_eq!(batch.size(), 0);

        assert_eq!(store.get(b"k1").unwrap(), b"v1".to_vec());
        assert_eq!(store.get(b"k2").unwrap(), b"v2".to_vec());
        assert!(matches!(store.get(b"stale"), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_batch_reset_discards_mutations() {
        let store = MemoryStore::new();

        let mut batch = store.new_batch();
        batch.set(b"k1", b"v1");
        batch.reset();
        batch.write().unwrap();

        assert!(matches!(store.get(b"k1"), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_batch_applies_in_order() {
        let store = MemoryStore::new();

        // A delete followed by a put of the same key must leave the put
        let mut batch = store.new_batch();
        batch.delete(b"k");
        batch.set(b"k", b"restored");
        batch.write().unwrap();

        assert_eq!(store.get(b"k").unwrap(), b"restored".to_vec());
    }
}
