use thiserror::Error;

use crate::store::StoreError;
use crate::tree::Version;

/// Error type for tree operations
#[derive(Debug, Error)]
pub enum TreeError {
    /// Key does not fit in the tree's key space
    #[error("key {key} is out of range for a depth-{depth} tree")]
    KeyOutOfRange { key: u64, depth: u8 },

    /// The requested version has an empty root
    #[error("the requested version has an empty root")]
    EmptyRoot,

    /// Requested version is newer than the latest committed version
    #[error("version {requested} is newer than the latest committed version {latest}")]
    VersionTooHigh { requested: Version, latest: Version },

    /// Requested version precedes the retained window
    #[error("version {requested} precedes the retained window (pruned up to {pruned})")]
    VersionTooLow { requested: Version, pruned: Version },

    /// Construction depth disagrees with the persisted metadata
    #[error("tree depth {requested} does not match the persisted depth {persisted}")]
    MismatchedDepth { requested: u8, persisted: u8 },

    /// Proof requested while uncommitted writes exist
    #[error("proofs require a committed tree, but uncommitted writes exist")]
    DirtyTreeProof,

    /// Backing store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for tree operations
pub type TreeResult<T> = Result<T, TreeError>;
