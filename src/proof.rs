//! Merkle inclusion and exclusion proofs
//!
//! A proof carries the leaf hash and one sibling per level. Verification is
//! a pure fold from the leaf to the root and works across independently
//! constructed trees as long as they share a digest.

use serde::{Deserialize, Serialize};

use crate::hasher::TreeHasher;

/// Proof for one key against one root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proof {
    /// Leaf hash the proof anchors on; the nil leaf hash for absent keys
    pub leaf: Vec<u8>,
    /// Sibling hashes top-down: `siblings[d]` is the sibling at depth
    /// `d + 1`, combined when folding up to depth `d`
    pub siblings: Vec<Vec<u8>>,
    /// Bit `d` set when `siblings[d]` covers an empty subtree
    pub nil_mask: u64,
}

impl Proof {
    /// Tree depth this proof was produced for
    pub fn depth(&self) -> usize {
        self.siblings.len()
    }
}

/// Recompute the root from `proof` and compare it against `root`
///
/// The fold follows the key bits MSB-first: at each level the running hash
/// is placed on the side the key selects and the recorded sibling on the
/// other.
pub fn verify_proof(hasher: &mut TreeHasher, key: u64, proof: &Proof, root: &[u8]) -> bool {
    let depth = proof.siblings.len();
    if depth == 0 || depth > 64 {
        return false;
    }
    if depth < 64 && key >> depth != 0 {
        return false;
    }

    let mut acc = proof.leaf.clone();
    for d in (0..depth).rev() {
        let right = (key >> (depth - 1 - d)) & 1 == 1;
        acc = if right {
            hasher.hash_pair(&proof.siblings[d], &acc)
        } else {
            hasher.hash_pair(&acc, &proof.siblings[d])
        };
    }

    acc == root
}
