//! Backing store interface for the tree
//!
//! The engine persists nodes, roots and journal records through the narrow
//! [`TreeStore`] trait: batched get/put/delete over opaque byte keys with an
//! atomic batch commit. Two implementations ship with the crate:
//!
//! - `memory`: `HashMap`-backed reference store used by tests and examples
//! - `rocks`: RocksDB-backed persistent store
//!
//! The engine never relies on key ordering, only on batch atomicity.

pub mod memory;
pub mod rocks;

use thiserror::Error;

use crate::node::NodePath;
use crate::tree::Version;

pub use memory::MemoryStore;
pub use rocks::RocksDbStore;

/// Error type for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// Key not present in the store
    #[error("key not found")]
    NotFound,

    /// Failure reported by the underlying backend
    #[error("backend error: {0}")]
    Backend(String),

    /// A persisted record could not be decoded
    #[error("corrupted record: {0}")]
    Corrupted(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// A set of mutations applied atomically by [`StoreBatch::write`]
pub trait StoreBatch {
    /// Queue a put
    fn set(&mut self, key: &[u8], value: &[u8]);

    /// Queue a delete
    fn delete(&mut self, key: &[u8]);

    /// Drop all queued mutations
    fn reset(&mut self);

    /// Bytes queued so far
    fn size(&self) -> usize;

    /// Apply every queued mutation as one atomic unit, leaving the batch
    /// empty
    fn write(&mut self) -> StoreResult<()>;
}

/// Batched key-value store contract required by the engine
pub trait TreeStore {
    /// Fetch a value; `StoreError::NotFound` when absent
    fn get(&self, key: &[u8]) -> StoreResult<Vec<u8>>;

    /// Single-op, non-atomic put
    fn set(&self, key: &[u8], value: &[u8]) -> StoreResult<()>;

    /// Single-op, non-atomic delete
    fn delete(&self, key: &[u8]) -> StoreResult<()>;

    /// Open a fresh batch against this store
    fn new_batch(&self) -> Box<dyn StoreBatch + '_>;

    /// Release underlying resources
    fn close(&self) -> StoreResult<()>;
}

// Persisted key schema. All integers little-endian.
//
//   n:<depth><prefix-le> -> node record
//   v                    -> latest committed version
//   r:<version-le>       -> root hash at that version
//   j:<version-le>       -> journal record at that version
//   p                    -> highest pruned version
//   d                    -> tree depth

pub(crate) const KEY_LATEST: &[u8] = b"v";
pub(crate) const KEY_PRUNED: &[u8] = b"p";
pub(crate) const KEY_DEPTH: &[u8] = b"d";

pub(crate) fn node_key(path: &NodePath) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + 1 + 8);
    key.extend_from_slice(b"n:");
    key.push(path.depth());
    key.extend_from_slice(&path.prefix().to_le_bytes());
    key
}

pub(crate) fn root_key(version: Version) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + 8);
    key.extend_from_slice(b"r:");
    key.extend_from_slice(&version.to_le_bytes());
    key
}

pub(crate) fn journal_key(version: Version) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + 8);
    key.extend_from_slice(b"j:");
    key.extend_from_slice(&version.to_le_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_schema_is_disjoint() {
        let node = node_key(&NodePath::ROOT.child(true));
        let root = root_key(1);
        let journal = journal_key(1);

        assert!(node.starts_with(b"n:"));
        assert!(root.starts_with(b"r:"));
        assert!(journal.starts_with(b"j:"));
        assert_ne!(root, journal);
    }

    #[test]
    fn test_node_key_encodes_depth_and_prefix() {
        let path = NodePath::ROOT.child(true).child(false).child(true);
        let key = node_key(&path);
        assert_eq!(key[2], 3);
        assert_eq!(&key[3..], &5u64.to_le_bytes());
    }
}
