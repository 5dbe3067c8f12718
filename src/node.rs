//! In-memory node model and on-disk node records
//!
//! Every node is addressed by a [`NodePath`]: the bits of the key prefix
//! leading to it from the root. Child slots are tagged handles so a subtree
//! can be absent, owned in memory, or paged out to the backing store while
//! its hash stays available to the parent.

use serde::{Deserialize, Serialize};

use crate::store::{StoreError, StoreResult};
use crate::tree::Version;

/// Status-byte flag: left child present
const LEFT_PRESENT: u8 = 0b01;
/// Status-byte flag: right child present
const RIGHT_PRESENT: u8 = 0b10;

/// Length of the fixed record head (status byte + version)
const RECORD_HEAD: usize = 1 + 8;

/// Position of a node inside the tree
///
/// `depth` counts edges from the root (0 = root); `prefix` holds the first
/// `depth` key bits right-aligned. Depth never exceeds 64, so the prefix
/// always fits a `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodePath {
    depth: u8,
    prefix: u64,
}

impl NodePath {
    /// The root position
    pub const ROOT: NodePath = NodePath { depth: 0, prefix: 0 };

    /// Position of the leaf holding `key` in a tree of the given depth
    pub fn leaf(key: u64, tree_depth: u8) -> Self {
        NodePath {
            depth: tree_depth,
            prefix: key,
        }
    }

    /// Position of the left (`false`) or right (`true`) child
    pub fn child(&self, right: bool) -> Self {
        NodePath {
            depth: self.depth + 1,
            prefix: (self.prefix << 1) | right as u64,
        }
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn prefix(&self) -> u64 {
        self.prefix
    }
}

/// Handle to a child subtree
#[derive(Debug)]
pub enum Child {
    /// No subtree below this slot
    Empty,
    /// Subtree owned in memory
    Loaded(Box<TreeNode>),
    /// Subtree persisted in the backing store; only the hash is retained
    Unloaded { path: NodePath, hash: Vec<u8> },
}

impl Child {
    pub fn is_empty(&self) -> bool {
        matches!(self, Child::Empty)
    }

    /// The child's hash, or `nil` when the slot is empty
    pub fn hash_or<'a>(&'a self, nil: &'a [u8]) -> &'a [u8] {
        match self {
            Child::Empty => nil,
            Child::Loaded(node) => &node.hash,
            Child::Unloaded { hash, .. } => hash,
        }
    }
}

/// A materialized tree node
///
/// `hash` is only trusted while `dirty` is false; a dirty node is rehashed
/// from its children on the next commit. `version` is the version at which
/// the current content was last persisted (0 = never).
#[derive(Debug)]
pub struct TreeNode {
    pub(crate) path: NodePath,
    pub(crate) hash: Vec<u8>,
    pub(crate) version: Version,
    pub(crate) dirty: bool,
    pub(crate) left: Child,
    pub(crate) right: Child,
}

impl TreeNode {
    /// Root of an empty tree
    pub(crate) fn empty_root(nil_root_hash: Vec<u8>) -> Self {
        TreeNode {
            path: NodePath::ROOT,
            hash: nil_root_hash,
            version: 0,
            dirty: false,
            left: Child::Empty,
            right: Child::Empty,
        }
    }

    /// Fresh internal node created along a write path
    pub(crate) fn new_internal(path: NodePath) -> Self {
        TreeNode {
            path,
            hash: Vec::new(),
            version: 0,
            dirty: true,
            left: Child::Empty,
            right: Child::Empty,
        }
    }

    /// Fresh leaf holding a value hash
    pub(crate) fn new_leaf(path: NodePath, value_hash: Vec<u8>) -> Self {
        TreeNode {
            path,
            hash: value_hash,
            version: 0,
            dirty: true,
            left: Child::Empty,
            right: Child::Empty,
        }
    }

    /// Serialize with the node's current version stamp
    pub(crate) fn encode(&self, w: usize) -> Vec<u8> {
        self.encode_at(self.version, w)
    }

    /// Serialize with an explicit version stamp
    ///
    /// Layout: status byte, version (u64 LE), left child hash, right child
    /// hash, own hash. Absent child hashes are zero-padded so the record
    /// length is always `9 + 3 * w`.
    pub(crate) fn encode_at(&self, version: Version, w: usize) -> Vec<u8> {
        let mut record = Vec::with_capacity(RECORD_HEAD + 3 * w);

        let mut status = 0u8;
        if !self.left.is_empty() {
            status |= LEFT_PRESENT;
        }
        if !self.right.is_empty() {
            status |= RIGHT_PRESENT;
        }
        record.push(status);
        record.extend_from_slice(&version.to_le_bytes());

        let zero = vec![0u8; w];
        record.extend_from_slice(self.left.hash_or(&zero));
        record.extend_from_slice(self.right.hash_or(&zero));
        record.extend_from_slice(&self.hash);
        record
    }

    /// Decode a record read from the backing store
    ///
    /// Present children come back as `Unloaded` handles carrying the child
    /// hash; the subtree itself stays in the store until walked into.
    pub(crate) fn decode(path: NodePath, bytes: &[u8], w: usize) -> StoreResult<Self> {
        if bytes.len() != RECORD_HEAD + 3 * w {
            return Err(StoreError::Corrupted(format!(
                "node record has {} bytes, expected {}",
                bytes.len(),
                RECORD_HEAD + 3 * w
            )));
        }

        let status = bytes[0];
        let mut version_bytes = [0u8; 8];
        version_bytes.copy_from_slice(&bytes[1..9]);
        let version = Version::from_le_bytes(version_bytes);

        let left = if status & LEFT_PRESENT != 0 {
            Child::Unloaded {
                path: path.child(false),
                hash: bytes[RECORD_HEAD..RECORD_HEAD + w].to_vec(),
            }
        } else {
            Child::Empty
        };
        let right = if status & RIGHT_PRESENT != 0 {
            Child::Unloaded {
                path: path.child(true),
                hash: bytes[RECORD_HEAD + w..RECORD_HEAD + 2 * w].to_vec(),
            }
        } else {
            Child::Empty
        };

        Ok(TreeNode {
            path,
            hash: bytes[RECORD_HEAD + 2 * w..].to_vec(),
            version,
            dirty: false,
            left,
            right,
        })
    }

    /// Count of materialized nodes in this subtree, itself included
    pub(crate) fn count_loaded(&self) -> u64 {
        let mut count = 1;
        if let Child::Loaded(node) = &self.left {
            count += node.count_loaded();
        }
        if let Child::Loaded(node) = &self.right {
            count += node.count_loaded();
        }
        count
    }
}

/// Extract the own-hash field of a serialized node record
pub(crate) fn record_hash(bytes: &[u8], w: usize) -> StoreResult<&[u8]> {
    if bytes.len() != RECORD_HEAD + 3 * w {
        return Err(StoreError::Corrupted(format!(
            "node record has {} bytes, expected {}",
            bytes.len(),
            RECORD_HEAD + 3 * w
        )));
    }
    Ok(&bytes[RECORD_HEAD + 2 * w..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_children() {
        let root = NodePath::ROOT;
        assert_eq!(root.depth(), 0);

        // Bits 1,0,1 from the root give prefix 0b101
        let path = root.child(true).child(false).child(true);
        assert_eq!(path.depth(), 3);
        assert_eq!(path.prefix(), 0b101);

        assert_eq!(NodePath::leaf(213, 8).prefix(), 213);
        assert_eq!(NodePath::leaf(213, 8).depth(), 8);
    }

    #[test]
    fn test_record_round_trip() {
        let w = 32;
        let path = NodePath::ROOT.child(false);
        let node = TreeNode {
            path,
            hash: vec![7u8; w],
            version: 42,
            dirty: false,
            left: Child::Unloaded {
                path: path.child(false),
                hash: vec![1u8; w],
            },
            right: Child::Empty,
        };

        let record = node.encode(w);
        assert_eq!(record.len(), 9 + 3 * w);

        let decoded = TreeNode::decode(path, &record, w).unwrap();
        assert_eq!(decoded.version, 42);
        assert_eq!(decoded.hash, vec![7u8; w]);
        assert!(!decoded.dirty);
        assert!(matches!(&decoded.left, Child::Unloaded { hash, .. } if hash == &vec![1u8; w]));
        assert!(decoded.right.is_empty());

        assert_eq!(record_hash(&record, w).unwrap(), &vec![7u8; w][..]);
    }

    #[test]
    fn test_decode_rejects_truncated_record() {
        let result = TreeNode::decode(NodePath::ROOT, &[0u8; 10], 32);
        assert!(matches!(result, Err(StoreError::Corrupted(_))));
    }

    #[test]
    fn test_leaf_record_has_no_children() {
        let w = 32;
        let leaf = TreeNode::new_leaf(NodePath::leaf(9, 8), vec![3u8; w]);
        let record = leaf.encode(w);
        assert_eq!(record[0], 0);

        let decoded = TreeNode::decode(NodePath::leaf(9, 8), &record, w).unwrap();
        assert!(decoded.left.is_empty());
        assert!(decoded.right.is_empty());
        assert_eq!(decoded.hash, vec![3u8; w]);
    }
}
