//! Digest abstraction for the tree
//!
//! The tree only needs a two-to-one digest plus a one-shot leaf digest.
//! `TreeHasher` wraps any [`digest::DynDigest`] so the digest algorithm is a
//! construction-time choice; SHA-256 is provided as the default.

use digest::DynDigest;
use sha2::{Digest, Sha256};

/// Digest wrapper owned by a tree instance
///
/// Not thread-safe; the engine serializes access. The internal state is
/// reset before every digest so interleaved calls cannot bleed into each
/// other.
pub struct TreeHasher {
    digest: Box<dyn DynDigest>,
}

impl TreeHasher {
    /// Wrap an arbitrary digest implementation
    pub fn new(digest: Box<dyn DynDigest>) -> Self {
        Self { digest }
    }

    /// SHA-256 backed hasher
    pub fn sha256() -> Self {
        Self::new(Box::new(Sha256::new()))
    }

    /// Width of the produced digests in bytes
    pub fn output_len(&self) -> usize {
        self.digest.output_size()
    }

    /// One-shot digest of `data`
    pub fn hash(&mut self, data: &[u8]) -> Vec<u8> {
        self.digest.reset();
        self.digest.update(data);
        self.digest.finalize_reset().to_vec()
    }

    /// Two-to-one digest of a left/right child pair
    pub fn hash_pair(&mut self, left: &[u8], right: &[u8]) -> Vec<u8> {
        self.digest.reset();
        self.digest.update(left);
        self.digest.update(right);
        self.digest.finalize_reset().to_vec()
    }
}

impl Clone for TreeHasher {
    fn clone(&self) -> Self {
        Self {
            digest: self.digest.box_clone(),
        }
    }
}

impl std::fmt::Debug for TreeHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeHasher")
            .field("output_len", &self.output_len())
            .finish()
    }
}
