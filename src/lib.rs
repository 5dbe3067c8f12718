//! Versioned, pruning sparse Merkle tree over a pluggable key-value store
//!
//! This crate maintains a cryptographic commitment over a fixed-depth key
//! space. Each commit produces a new version, inclusion proofs can be
//! generated and verified against any retained version, versions can be
//! rolled back, and cold subtrees are paged out to the backing store so
//! the in-memory footprint stays bounded.
//!
//! The crate is split into focused modules:
//!
//! - `hasher`: digest abstraction (SHA-256 by default)
//! - `store`: batched key-value store contract plus the bundled in-memory
//!   and RocksDB implementations
//! - `node`: in-memory node model and the fixed on-disk node record
//! - `journal`: per-version created/obsolete change records
//! - `tree`: the tree engine (set/get/commit/rollback/reset)
//! - `proof`: inclusion/exclusion proofs and the pure verifier

pub mod error;
pub mod hasher;
pub mod journal;
pub mod node;
pub mod proof;
mod pruner;
pub mod store;
pub mod tree;

// Re-export common types
pub use error::{TreeError, TreeResult};
pub use hasher::TreeHasher;
pub use journal::{JournalRecord, NodeId};
pub use node::NodePath;
pub use proof::{verify_proof, Proof};
pub use store::{MemoryStore, RocksDbStore, StoreBatch, StoreError, TreeStore};
pub use tree::{SparseMerkleTree, TreeOptions, Version};

/// Initialize logging
pub fn init_logger() {
    env_logger::init();
}
