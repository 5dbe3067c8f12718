//! Versioned sparse Merkle tree engine
//!
//! The engine owns an in-memory working set rooted at a single node and
//! drives everything else: lazy materialization of persisted subtrees,
//! path dirtying on writes, the commit pipeline that turns the dirty
//! frontier into one atomic store batch, version rollback, and the
//! post-commit memory eviction pass.

use std::collections::BTreeSet;

use log::{debug, info, trace, warn};

use crate::error::{TreeError, TreeResult};
use crate::hasher::TreeHasher;
use crate::journal::{JournalRecord, NodeId, Rewind, StagedChanges};
use crate::node::{record_hash, Child, NodePath, TreeNode};
use crate::proof::Proof;
use crate::pruner;
use crate::store::{
    journal_key, node_key, root_key, StoreError, TreeStore, KEY_DEPTH, KEY_LATEST, KEY_PRUNED,
};

/// Monotonic version identifier assigned by commits; 0 denotes the empty
/// tree
pub type Version = u64;

/// Construction options for a tree instance
#[derive(Debug, Clone, Default)]
pub struct TreeOptions {
    gc_threshold: u64,
    batch_size_limit: usize,
}

impl TreeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evict clean subtrees once the in-memory node count exceeds `n`;
    /// 0 disables eviction
    pub fn gc_threshold(mut self, n: u64) -> Self {
        self.gc_threshold = n;
        self
    }

    /// Split commit batches above this many bytes
    ///
    /// Atomicity then holds per sub-batch, not across the whole commit;
    /// metadata is always written by the final sub-batch. 0 means
    /// unlimited.
    pub fn batch_size_limit(mut self, bytes: usize) -> Self {
        self.batch_size_limit = bytes;
        self
    }
}

/// A versioned sparse Merkle tree over a backing store
///
/// Single-writer: concurrent mutation is not supported. All operations
/// that may touch the backing store take `&mut self` because they can
/// materialize paged-out subtrees into the working set.
pub struct SparseMerkleTree<'a> {
    store: &'a dyn TreeStore,
    hasher: TreeHasher,
    depth: u8,
    digest_len: usize,
    /// `nil_hashes[d]` commits to a perfectly empty subtree rooted at
    /// depth `d`
    nil_hashes: Vec<Vec<u8>>,
    root: TreeNode,
    /// Root hash as of `latest`; stays valid while the working set is
    /// dirty
    committed_root: Vec<u8>,
    latest: Version,
    /// Highest version dropped by pruning; versions at or below are gone
    pruned: Version,
    /// Materialized node count, root included
    size: u64,
    staged: StagedChanges,
    opts: TreeOptions,
}

impl<'a> SparseMerkleTree<'a> {
    /// Open a tree over `store`, resuming from persisted state when
    /// present
    ///
    /// A store that has never held a tree starts at version 0 with the nil
    /// root. A populated store restores the latest version, its root and
    /// the pruned watermark; a depth disagreement with the persisted
    /// metadata fails with `MismatchedDepth`.
    ///
    /// # Panics
    ///
    /// Panics when `depth` is outside `1..=64` or `nil_leaf_hash` does not
    /// match the hasher's digest width.
    pub fn new(
        mut hasher: TreeHasher,
        store: &'a dyn TreeStore,
        depth: u8,
        nil_leaf_hash: Vec<u8>,
        opts: TreeOptions,
    ) -> TreeResult<Self> {
        assert!(
            (1..=64).contains(&depth),
            "tree depth must be within 1..=64"
        );
        assert_eq!(
            nil_leaf_hash.len(),
            hasher.output_len(),
            "nil leaf hash width must match the digest width"
        );
        let digest_len = hasher.output_len();

        // Precompute the empty-subtree hash at every depth, leaf upward
        let mut nil_hashes = vec![Vec::new(); depth as usize + 1];
        nil_hashes[depth as usize] = nil_leaf_hash;
        for d in (0..depth as usize).rev() {
            let child = nil_hashes[d + 1].clone();
            nil_hashes[d] = hasher.hash_pair(&child, &child);
        }

        match store.get(KEY_DEPTH) {
            Ok(bytes) => {
                let persisted = *bytes
                    .first()
                    .ok_or_else(|| StoreError::Corrupted("empty depth record".into()))?;
                if persisted != depth {
                    return Err(TreeError::MismatchedDepth {
                        requested: depth,
                        persisted,
                    });
                }
            }
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let latest = read_version(store, KEY_LATEST)?;
        let pruned = read_version(store, KEY_PRUNED)?;

        let (root, committed_root) = if latest == 0 {
            let root = TreeNode::empty_root(nil_hashes[0].clone());
            let hash = root.hash.clone();
            (root, hash)
        } else {
            load_committed_root(store, latest, &nil_hashes[0], digest_len)?
        };

        debug!(
            "opened tree at version {} (pruned up to {}), root {}",
            latest,
            pruned,
            hex::encode(&committed_root)
        );

        Ok(Self {
            store,
            hasher,
            depth,
            digest_len,
            nil_hashes,
            root,
            committed_root,
            latest,
            pruned,
            size: 1,
            staged: StagedChanges::default(),
            opts,
        })
    }

    /// Most recent committed version
    pub fn latest_version(&self) -> Version {
        self.latest
    }

    /// Count of materialized in-memory nodes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Root hash as of the latest committed version
    pub fn root(&self) -> &[u8] {
        &self.committed_root
    }

    /// Configured tree depth
    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// True when uncommitted writes exist
    pub fn is_dirty(&self) -> bool {
        self.root.dirty
    }

    fn check_key(&self, key: u64) -> TreeResult<()> {
        if self.depth < 64 && key >> self.depth != 0 {
            return Err(TreeError::KeyOutOfRange {
                key,
                depth: self.depth,
            });
        }
        Ok(())
    }

    /// Stage a value hash for `key` in the working set
    ///
    /// Writing the nil leaf hash records the key as absent. Every node on
    /// the path becomes dirty; nothing is persisted until [`commit`].
    ///
    /// [`commit`]: SparseMerkleTree::commit
    pub fn set(&mut self, key: u64, value_hash: Vec<u8>) -> TreeResult<()> {
        self.check_key(key)?;
        assert_eq!(
            value_hash.len(),
            self.digest_len,
            "value hash width must match the digest width"
        );
        trace!("set key {}", key);

        let nil_leaf = &self.nil_hashes[self.depth as usize];
        set_rec(
            self.store,
            &mut self.root,
            key,
            self.depth,
            &value_hash,
            nil_leaf,
            &mut self.staged,
            &mut self.size,
            self.digest_len,
        )
    }

    /// Read the value hash of `key`
    ///
    /// `version = None` reads the working set, staged writes included.
    /// Pinning a version reads the tree exactly as committed at that
    /// version; versions below the pruned watermark fail with
    /// `VersionTooLow`. Absent keys resolve to the nil leaf hash.
    pub fn get(&mut self, key: u64, version: Option<Version>) -> TreeResult<Vec<u8>> {
        self.check_key(key)?;
        match version {
            None => {
                if !self.root.dirty && self.committed_root == self.nil_hashes[0] {
                    return Err(TreeError::EmptyRoot);
                }
                let leaf = walk_leaf(
                    self.store,
                    &mut self.root,
                    key,
                    self.depth,
                    self.digest_len,
                    &mut self.size,
                )?;
                Ok(leaf
                    .map(|(hash, _)| hash)
                    .unwrap_or_else(|| self.nil_hashes[self.depth as usize].clone()))
            }
            Some(v) => self.get_versioned(key, v),
        }
    }

    fn get_versioned(&mut self, key: u64, version: Version) -> TreeResult<Vec<u8>> {
        if version > self.latest {
            return Err(TreeError::VersionTooHigh {
                requested: version,
                latest: self.latest,
            });
        }
        if version == 0 {
            return Err(TreeError::EmptyRoot);
        }
        if version <= self.pruned {
            return Err(TreeError::VersionTooLow {
                requested: version,
                pruned: self.pruned,
            });
        }

        let root_at = if version == self.latest {
            self.committed_root.clone()
        } else {
            match self.store.get(&root_key(version)) {
                Ok(bytes) => bytes,
                Err(StoreError::NotFound) => {
                    return Err(TreeError::VersionTooLow {
                        requested: version,
                        pruned: self.pruned,
                    })
                }
                Err(e) => return Err(e.into()),
            }
        };
        if root_at == self.nil_hashes[0] {
            return Err(TreeError::EmptyRoot);
        }

        // Leaf hash as committed at `latest`: staged writes are invisible
        // to pinned reads, so a capture of the leaf's prior record wins
        // over the working set.
        let leaf_path = NodePath::leaf(key, self.depth);
        let mut leaf = match self.staged.prior_of(&leaf_path) {
            Some(bytes) => Some(record_hash(bytes, self.digest_len)?.to_vec()),
            None => {
                match walk_leaf(
                    self.store,
                    &mut self.root,
                    key,
                    self.depth,
                    self.digest_len,
                    &mut self.size,
                )? {
                    // A dirty, uncaptured leaf did not exist at `latest`
                    Some((hash, dirty)) => (!dirty).then_some(hash),
                    None => None,
                }
            }
        };

        // Rewind the leaf through the journals down to the pinned version
        for v in ((version + 1)..=self.latest).rev() {
            let bytes = match self.store.get(&journal_key(v)) {
                Ok(b) => b,
                Err(StoreError::NotFound) => {
                    return Err(TreeError::VersionTooLow {
                        requested: version,
                        pruned: self.pruned,
                    })
                }
                Err(e) => return Err(e.into()),
            };
            let record = JournalRecord::decode(&bytes)?;
            match record.rewind(&leaf_path) {
                Rewind::Untouched => {}
                Rewind::Remove => leaf = None,
                Rewind::Restore(prior) => {
                    leaf = Some(record_hash(prior, self.digest_len)?.to_vec())
                }
            }
        }

        Ok(leaf.unwrap_or_else(|| self.nil_hashes[self.depth as usize].clone()))
    }

    /// Produce an inclusion (or exclusion) proof for `key` against the
    /// latest committed root
    ///
    /// Fails with `DirtyTreeProof` while uncommitted writes exist so a
    /// proof always anchors to a committed root.
    pub fn get_proof(&mut self, key: u64) -> TreeResult<Proof> {
        self.check_key(key)?;
        if self.root.dirty {
            return Err(TreeError::DirtyTreeProof);
        }

        let depth = self.depth as usize;
        let mut siblings = vec![Vec::new(); depth];
        let mut nil_mask = 0u64;

        let mut node: &mut TreeNode = &mut self.root;
        for d in 0..depth {
            let go_right = (key >> (depth - 1 - d)) & 1 == 1;

            let sibling = if go_right { &node.left } else { &node.right };
            if sibling.is_empty() {
                nil_mask |= 1 << d;
            }
            siblings[d] = sibling.hash_or(&self.nil_hashes[d + 1]).to_vec();

            let slot = if go_right {
                &mut node.right
            } else {
                &mut node.left
            };
            if slot.is_empty() {
                // The rest of the path is absent: nil siblings all the way
                // down to the nil leaf.
                for (dd, sibling) in siblings.iter_mut().enumerate().skip(d + 1) {
                    nil_mask |= 1 << dd;
                    *sibling = self.nil_hashes[dd + 1].clone();
                }
                return Ok(Proof {
                    leaf: self.nil_hashes[depth].clone(),
                    siblings,
                    nil_mask,
                });
            }
            materialize(self.store, slot, self.digest_len, &mut self.size)?;
            node = match slot {
                Child::Loaded(child) => child.as_mut(),
                _ => {
                    return Err(StoreError::Corrupted(
                        "materialized child is not loaded".into(),
                    )
                    .into())
                }
            };
        }

        Ok(Proof {
            leaf: node.hash.clone(),
            siblings,
            nil_mask,
        })
    }

    /// Verify `proof` for `key` against the latest committed root
    pub fn verify_proof(&mut self, key: u64, proof: &Proof) -> bool {
        crate::proof::verify_proof(&mut self.hasher, key, proof, &self.committed_root)
    }

    /// Commit the working set as a new version
    ///
    /// Rehashes the dirty frontier bottom-up, persists every rewritten
    /// node together with the journal record and version metadata in one
    /// atomic batch, then optionally prunes versions up to
    /// `prune_up_to` and finally evicts cold subtrees when over the GC
    /// threshold. A store failure leaves the in-memory state dirty and
    /// the version unchanged.
    pub fn commit(&mut self, prune_up_to: Option<Version>) -> TreeResult<Version> {
        let next = self.latest + 1;

        let mut created: Vec<(NodePath, Vec<u8>, Vec<u8>)> = Vec::new();
        if self.root.dirty {
            rehash_rec(
                &mut self.hasher,
                &mut self.root,
                &self.nil_hashes,
                self.depth,
                next,
                self.digest_len,
                &mut created,
                &mut self.size,
            );
        }

        let created_ids: Vec<NodeId> = created
            .iter()
            .map(|(path, hash, _)| NodeId {
                path: *path,
                hash: hash.clone(),
            })
            .collect();
        let record = self.staged.to_record(created_ids);

        // Captured nodes that were not rewritten this commit were removed
        // from the tree altogether.
        let created_paths: BTreeSet<NodePath> = created.iter().map(|(p, _, _)| *p).collect();
        let removed: Vec<NodePath> = self
            .staged
            .paths()
            .filter(|p| !created_paths.contains(p))
            .copied()
            .collect();

        let limit = self.opts.batch_size_limit;
        let mut batch = self.store.new_batch();
        for (path, _, bytes) in &created {
            batch.set(&node_key(path), bytes);
            if limit > 0 && batch.size() >= limit {
                batch.write()?;
            }
        }
        for path in &removed {
            batch.delete(&node_key(path));
            if limit > 0 && batch.size() >= limit {
                batch.write()?;
            }
        }
        batch.set(&journal_key(next), &record.encode()?);
        batch.set(&root_key(next), &self.root.hash);
        batch.set(KEY_LATEST, &next.to_le_bytes());
        batch.set(KEY_DEPTH, &[self.depth]);
        batch.write()?;

        // The batch landed; only now flip the in-memory state.
        if self.root.dirty {
            finalize_rec(&mut self.root, next);
        }
        self.committed_root = self.root.hash.clone();
        self.latest = next;
        self.staged.clear();

        debug!(
            "committed version {} ({} created, {} obsolete), root {}",
            next,
            created.len(),
            record.obsolete.len(),
            hex::encode(&self.committed_root)
        );

        if let Some(up_to) = prune_up_to {
            if up_to < next {
                self.prune_versions(up_to)?;
            }
        }

        if self.opts.gc_threshold > 0 && self.size > self.opts.gc_threshold {
            pruner::evict(&mut self.root, &mut self.size, self.opts.gc_threshold);
        }

        Ok(next)
    }

    /// Drop journal records and superseded nodes for versions at or below
    /// `up_to`; idempotent across repeated calls
    fn prune_versions(&mut self, up_to: Version) -> TreeResult<()> {
        if up_to <= self.pruned {
            warn!(
                "prune up to version {} requested, but versions up to {} are already gone",
                up_to, self.pruned
            );
            return Ok(());
        }

        let mut batch = self.store.new_batch();
        for v in (self.pruned + 1)..=up_to {
            batch.delete(&journal_key(v));
            batch.delete(&root_key(v));
        }
        batch.set(KEY_PRUNED, &up_to.to_le_bytes());
        batch.write()?;

        self.pruned = up_to;
        debug!("pruned versions up to {}", up_to);
        Ok(())
    }

    /// Roll the tree back to `target`, replaying journals in reverse
    ///
    /// Every journal between `target` and the latest version must still be
    /// retained; otherwise the call fails with `VersionTooLow` before any
    /// mutation.
    pub fn rollback(&mut self, target: Version) -> TreeResult<()> {
        if target > self.latest {
            return Err(TreeError::VersionTooHigh {
                requested: target,
                latest: self.latest,
            });
        }
        if self.pruned > 0 && target <= self.pruned {
            return Err(TreeError::VersionTooLow {
                requested: target,
                pruned: self.pruned,
            });
        }

        // Fetch every journal first so a missing record fails cleanly.
        let mut records = Vec::new();
        for v in ((target + 1)..=self.latest).rev() {
            let bytes = match self.store.get(&journal_key(v)) {
                Ok(b) => b,
                Err(StoreError::NotFound) => {
                    return Err(TreeError::VersionTooLow {
                        requested: target,
                        pruned: self.pruned,
                    })
                }
                Err(e) => return Err(e.into()),
            };
            records.push((v, JournalRecord::decode(&bytes)?));
        }

        for (v, record) in &records {
            let mut batch = self.store.new_batch();
            for id in &record.created {
                batch.delete(&node_key(&id.path));
            }
            for (path, bytes) in &record.obsolete {
                batch.set(&node_key(path), bytes);
            }
            batch.delete(&journal_key(*v));
            batch.delete(&root_key(*v));
            batch.set(KEY_LATEST, &(v - 1).to_le_bytes());
            batch.write()?;
            trace!("rolled back version {}", v);
        }

        self.latest = target;
        self.staged.clear();
        if target == 0 {
            self.root = TreeNode::empty_root(self.nil_hashes[0].clone());
            self.committed_root = self.nil_hashes[0].clone();
        } else {
            let (root, committed) =
                load_committed_root(self.store, target, &self.nil_hashes[0], self.digest_len)?;
            self.root = root;
            self.committed_root = committed;
        }
        self.size = self.root.count_loaded();

        info!(
            "rolled back to version {} , root {}",
            target,
            hex::encode(&self.committed_root)
        );
        Ok(())
    }

    /// Discard all staged writes, restoring the working set to the latest
    /// committed version without touching the backing store
    pub fn reset(&mut self) {
        if !self.root.dirty {
            return;
        }

        self.root = match self.staged.prior_of(&NodePath::ROOT) {
            // The captured record was produced by this process, so it
            // always decodes.
            Some(bytes) => TreeNode::decode(NodePath::ROOT, bytes, self.digest_len)
                .expect("captured root record must decode"),
            // The root was never committed: back to the empty tree.
            None => TreeNode::empty_root(self.nil_hashes[0].clone()),
        };
        self.staged.clear();
        self.size = self.root.count_loaded();
        debug!("reset working set to version {}", self.latest);
    }
}

fn read_version(store: &dyn TreeStore, key: &[u8]) -> TreeResult<Version> {
    match store.get(key) {
        Ok(bytes) => {
            let arr: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::Corrupted("version record is not 8 bytes".into()))?;
            Ok(Version::from_le_bytes(arr))
        }
        Err(StoreError::NotFound) => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn load_committed_root(
    store: &dyn TreeStore,
    version: Version,
    nil_root: &[u8],
    w: usize,
) -> TreeResult<(TreeNode, Vec<u8>)> {
    let root_hash = store.get(&root_key(version))?;
    let root = match store.get(&node_key(&NodePath::ROOT)) {
        Ok(bytes) => TreeNode::decode(NodePath::ROOT, &bytes, w)?,
        // Only empty commits so far: there is no root record yet.
        Err(StoreError::NotFound) => TreeNode::empty_root(nil_root.to_vec()),
        Err(e) => return Err(e.into()),
    };
    Ok((root, root_hash))
}

/// Swap an `Unloaded` handle for the materialized subtree root
fn materialize(
    store: &dyn TreeStore,
    slot: &mut Child,
    w: usize,
    size: &mut u64,
) -> TreeResult<()> {
    if let Child::Unloaded { path, .. } = slot {
        let path = *path;
        let bytes = store.get(&node_key(&path))?;
        *slot = Child::Loaded(Box::new(TreeNode::decode(path, &bytes, w)?));
        *size += 1;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn set_rec(
    store: &dyn TreeStore,
    node: &mut TreeNode,
    key: u64,
    tree_depth: u8,
    value_hash: &[u8],
    nil_leaf: &[u8],
    staged: &mut StagedChanges,
    size: &mut u64,
    w: usize,
) -> TreeResult<()> {
    // Capture the committed record before the first mutation.
    if !node.dirty {
        if node.version > 0 {
            staged.capture(node.path, || node.encode(w));
        }
        node.dirty = true;
    }

    let d = node.path.depth();
    let go_right = (key >> (tree_depth - 1 - d)) & 1 == 1;
    let child_path = node.path.child(go_right);
    let deleting = value_hash == nil_leaf;
    let slot = if go_right {
        &mut node.right
    } else {
        &mut node.left
    };

    if child_path.depth() == tree_depth {
        // The child slot holds the leaf itself.
        match slot {
            Child::Empty => {
                if !deleting {
                    *slot = Child::Loaded(Box::new(TreeNode::new_leaf(
                        child_path,
                        value_hash.to_vec(),
                    )));
                    *size += 1;
                }
            }
            Child::Unloaded { path, .. } => {
                let path = *path;
                let bytes = store.get(&node_key(&path))?;
                staged.capture(path, || bytes.clone());
                if deleting {
                    *slot = Child::Empty;
                } else {
                    let mut leaf = TreeNode::decode(path, &bytes, w)?;
                    leaf.hash = value_hash.to_vec();
                    leaf.dirty = true;
                    *slot = Child::Loaded(Box::new(leaf));
                    *size += 1;
                }
            }
            Child::Loaded(leaf) => {
                if !leaf.dirty && leaf.version > 0 {
                    staged.capture(leaf.path, || leaf.encode(w));
                }
                if deleting {
                    *size -= leaf.count_loaded();
                    *slot = Child::Empty;
                } else {
                    leaf.hash = value_hash.to_vec();
                    leaf.dirty = true;
                }
            }
        }
        return Ok(());
    }

    match slot {
        Child::Empty => {
            if deleting {
                // The key is already absent below this point.
                return Ok(());
            }
            *slot = Child::Loaded(Box::new(TreeNode::new_internal(child_path)));
            *size += 1;
        }
        Child::Unloaded { .. } => {
            materialize(store, slot, w, size)?;
        }
        Child::Loaded(_) => {}
    }

    match slot {
        Child::Loaded(child) => set_rec(
            store, child, key, tree_depth, value_hash, nil_leaf, staged, size, w,
        ),
        _ => Ok(()),
    }
}

/// Walk to the leaf of `key`, returning its hash and dirtiness when
/// present
fn walk_leaf(
    store: &dyn TreeStore,
    node: &mut TreeNode,
    key: u64,
    tree_depth: u8,
    w: usize,
    size: &mut u64,
) -> TreeResult<Option<(Vec<u8>, bool)>> {
    let d = node.path.depth();
    if d == tree_depth {
        return Ok(Some((node.hash.clone(), node.dirty)));
    }

    let go_right = (key >> (tree_depth - 1 - d)) & 1 == 1;
    let slot = if go_right {
        &mut node.right
    } else {
        &mut node.left
    };
    match slot {
        Child::Empty => Ok(None),
        _ => {
            materialize(store, slot, w, size)?;
            match slot {
                Child::Loaded(child) => walk_leaf(store, child, key, tree_depth, w, size),
                _ => Ok(None),
            }
        }
    }
}

/// Rehash the dirty frontier bottom-up, collecting every rewritten node
///
/// Returns true when the subtree rooted at `node` collapsed to empty; the
/// caller unlinks it.
#[allow(clippy::too_many_arguments)]
fn rehash_rec(
    hasher: &mut TreeHasher,
    node: &mut TreeNode,
    nil_hashes: &[Vec<u8>],
    tree_depth: u8,
    version: Version,
    w: usize,
    created: &mut Vec<(NodePath, Vec<u8>, Vec<u8>)>,
    size: &mut u64,
) -> bool {
    if !node.dirty {
        return false;
    }
    let d = node.path.depth();
    if d == tree_depth {
        created.push((node.path, node.hash.clone(), node.encode_at(version, w)));
        return false;
    }

    for slot in [&mut node.left, &mut node.right] {
        if let Child::Loaded(child) = slot {
            if child.dirty
                && rehash_rec(
                    hasher, child, nil_hashes, tree_depth, version, w, created, size,
                )
            {
                *size -= 1;
                *slot = Child::Empty;
            }
        }
    }

    if d > 0 && node.left.is_empty() && node.right.is_empty() {
        // The whole subtree vanished with its leaves.
        return true;
    }

    let left = node.left.hash_or(&nil_hashes[d as usize + 1]);
    let right = node.right.hash_or(&nil_hashes[d as usize + 1]);
    node.hash = hasher.hash_pair(left, right);
    created.push((node.path, node.hash.clone(), node.encode_at(version, w)));
    false
}

/// Clear dirty flags and stamp the commit version after a successful batch
fn finalize_rec(node: &mut TreeNode, version: Version) {
    if !node.dirty {
        return;
    }
    node.dirty = false;
    node.version = version;
    if let Child::Loaded(child) = &mut node.left {
        finalize_rec(child, version);
    }
    if let Child::Loaded(child) = &mut node.right {
        finalize_rec(child, version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn new_tree(store: &MemoryStore) -> SparseMerkleTree<'_> {
        SparseMerkleTree::new(
            TreeHasher::sha256(),
            store,
            8,
            vec![0u8; 32],
            TreeOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_fresh_tree_is_empty() {
        let store = MemoryStore::new();
        let mut tree = new_tree(&store);

        assert_eq!(tree.latest_version(), 0);
        assert_eq!(tree.size(), 1);
        assert!(matches!(tree.get(7, None), Err(TreeError::EmptyRoot)));
        assert!(matches!(tree.get(7, Some(0)), Err(TreeError::EmptyRoot)));
    }

    #[test]
    fn test_key_out_of_range() {
        let store = MemoryStore::new();
        let mut tree = new_tree(&store);

        assert!(matches!(
            tree.set(256, vec![1u8; 32]),
            Err(TreeError::KeyOutOfRange { key: 256, depth: 8 })
        ));
        assert!(matches!(
            tree.get(1 << 20, None),
            Err(TreeError::KeyOutOfRange { .. })
        ));
        assert!(matches!(
            tree.get_proof(300),
            Err(TreeError::KeyOutOfRange { .. })
        ));
    }

    #[test]
    fn test_set_visible_before_commit() {
        let store = MemoryStore::new();
        let mut tree = new_tree(&store);
        let value = TreeHasher::sha256().hash(b"value");

        tree.set(42, value.clone()).unwrap();
        assert!(tree.is_dirty());
        assert_eq!(tree.get(42, None).unwrap(), value);

        // Other keys resolve to the nil leaf
        assert_eq!(tree.get(43, None).unwrap(), vec![0u8; 32]);
    }

    #[test]
    fn test_commit_then_get_at_version() {
        let store = MemoryStore::new();
        let mut tree = new_tree(&store);
        let value = TreeHasher::sha256().hash(b"value");

        tree.set(42, value.clone()).unwrap();
        let v1 = tree.commit(None).unwrap();

        assert_eq!(v1, 1);
        assert!(!tree.is_dirty());
        assert_eq!(tree.get(42, Some(v1)).unwrap(), value);
        assert!(matches!(
            tree.get(42, Some(v1 + 1)),
            Err(TreeError::VersionTooHigh { .. })
        ));
    }

    #[test]
    fn test_pinned_read_ignores_staged_writes() {
        let store = MemoryStore::new();
        let mut tree = new_tree(&store);
        let mut hasher = TreeHasher::sha256();
        let old = hasher.hash(b"old");
        let new = hasher.hash(b"new");

        tree.set(5, old.clone()).unwrap();
        let v1 = tree.commit(None).unwrap();

        tree.set(5, new.clone()).unwrap();
        assert_eq!(tree.get(5, Some(v1)).unwrap(), old);
        assert_eq!(tree.get(5, None).unwrap(), new);
    }

    #[test]
    fn test_historical_get_across_versions() {
        let store = MemoryStore::new();
        let mut tree = new_tree(&store);
        let mut hasher = TreeHasher::sha256();
        let a = hasher.hash(b"a");
        let b = hasher.hash(b"b");

        tree.set(9, a.clone()).unwrap();
        let v1 = tree.commit(None).unwrap();
        tree.set(9, b.clone()).unwrap();
        tree.set(10, a.clone()).unwrap();
        let v2 = tree.commit(None).unwrap();

        assert_eq!(tree.get(9, Some(v1)).unwrap(), a);
        assert_eq!(tree.get(9, Some(v2)).unwrap(), b);
        // Key 10 did not exist at v1
        assert_eq!(tree.get(10, Some(v1)).unwrap(), vec![0u8; 32]);
    }

    #[test]
    fn test_empty_commits_keep_the_root() {
        let store = MemoryStore::new();
        let mut tree = new_tree(&store);

        tree.set(1, TreeHasher::sha256().hash(b"x")).unwrap();
        tree.commit(None).unwrap();
        let root = tree.root().to_vec();

        let v2 = tree.commit(None).unwrap();
        let v3 = tree.commit(None).unwrap();

        assert_eq!(v3, v2 + 1);
        assert_eq!(tree.root(), &root[..]);
    }

    #[test]
    fn test_delete_restores_the_nil_root() {
        let store = MemoryStore::new();
        let mut tree = new_tree(&store);
        let nil_root = tree.root().to_vec();
        let value = TreeHasher::sha256().hash(b"gone");

        tree.set(77, value).unwrap();
        tree.commit(None).unwrap();
        assert_ne!(tree.root(), &nil_root[..]);

        // Writing the nil leaf records the key as absent again
        tree.set(77, vec![0u8; 32]).unwrap();
        tree.commit(None).unwrap();
        assert_eq!(tree.root(), &nil_root[..]);
        assert_eq!(tree.size(), 1);
    }

    #[test]
    fn test_reset_discards_staged_writes() {
        let store = MemoryStore::new();
        let mut tree = new_tree(&store);
        let mut hasher = TreeHasher::sha256();
        let keep = hasher.hash(b"keep");

        tree.set(3, keep.clone()).unwrap();
        tree.commit(None).unwrap();
        let root = tree.root().to_vec();

        tree.set(3, hasher.hash(b"discard")).unwrap();
        tree.set(200, hasher.hash(b"also discard")).unwrap();
        tree.reset();

        assert!(!tree.is_dirty());
        assert_eq!(tree.root(), &root[..]);
        assert_eq!(tree.get(3, None).unwrap(), keep);
        assert_eq!(tree.get(200, None).unwrap(), vec![0u8; 32]);
    }

    #[test]
    fn test_reset_on_fresh_tree() {
        let store = MemoryStore::new();
        let mut tree = new_tree(&store);

        tree.set(1, TreeHasher::sha256().hash(b"staged")).unwrap();
        tree.reset();

        assert!(!tree.is_dirty());
        assert!(matches!(tree.get(1, None), Err(TreeError::EmptyRoot)));
    }

    #[test]
    fn test_prune_is_idempotent() {
        let store = MemoryStore::new();
        let mut tree = new_tree(&store);
        let mut hasher = TreeHasher::sha256();

        for key in 0..4u64 {
            tree.set(key, hasher.hash(&key.to_le_bytes())).unwrap();
            tree.commit(None).unwrap();
        }

        tree.set(4, hasher.hash(b"4")).unwrap();
        tree.commit(Some(2)).unwrap();
        // Same watermark again: already-missing journals are not an error
        tree.set(5, hasher.hash(b"5")).unwrap();
        tree.commit(Some(2)).unwrap();

        assert!(matches!(
            tree.get(0, Some(2)),
            Err(TreeError::VersionTooLow { .. })
        ));
        assert!(tree.get(0, Some(3)).is_ok());
    }

    #[test]
    fn test_pruned_versions_unreachable_after_reopen() {
        let store = MemoryStore::new();
        let mut hasher = TreeHasher::sha256();
        {
            let mut tree = new_tree(&store);
            for key in 0..4u64 {
                tree.set(key, hasher.hash(&key.to_le_bytes())).unwrap();
                tree.commit(None).unwrap();
            }
            tree.set(9, hasher.hash(b"9")).unwrap();
            tree.commit(Some(3)).unwrap();
        }

        let mut tree = new_tree(&store);
        assert_eq!(tree.latest_version(), 5);
        assert!(matches!(
            tree.get(0, Some(3)),
            Err(TreeError::VersionTooLow { .. })
        ));
        assert!(matches!(
            tree.rollback(3),
            Err(TreeError::VersionTooLow { .. })
        ));
        assert!(tree.get(0, Some(4)).is_ok());
    }

    #[test]
    fn test_mismatched_depth_on_reopen() {
        let store = MemoryStore::new();
        {
            let mut tree = new_tree(&store);
            tree.set(1, TreeHasher::sha256().hash(b"x")).unwrap();
            tree.commit(None).unwrap();
        }

        let result = SparseMerkleTree::new(
            TreeHasher::sha256(),
            &store,
            16,
            vec![0u8; 32],
            TreeOptions::default(),
        );
        assert!(matches!(
            result,
            Err(TreeError::MismatchedDepth {
                requested: 16,
                persisted: 8
            })
        ));
    }

    #[test]
    fn test_eviction_keeps_the_tree_usable() {
        let store = MemoryStore::new();
        let mut tree = SparseMerkleTree::new(
            TreeHasher::sha256(),
            &store,
            8,
            vec![0u8; 32],
            TreeOptions::new().gc_threshold(4),
        )
        .unwrap();
        let mut hasher = TreeHasher::sha256();

        for key in 0..32u64 {
            tree.set(key * 8, hasher.hash(&key.to_le_bytes())).unwrap();
            tree.commit(None).unwrap();
            assert!(tree.size() <= 4, "size {} after commit", tree.size());
        }

        // Evicted subtrees reload on demand
        for key in 0..32u64 {
            let expected = hasher.hash(&key.to_le_bytes());
            assert_eq!(tree.get(key * 8, None).unwrap(), expected);
            let proof = tree.get_proof(key * 8).unwrap();
            assert!(tree.verify_proof(key * 8, &proof));
        }
    }

    #[test]
    fn test_rollback_to_zero() {
        let store = MemoryStore::new();
        let mut tree = new_tree(&store);
        let nil_root = tree.root().to_vec();

        tree.set(12, TreeHasher::sha256().hash(b"x")).unwrap();
        tree.commit(None).unwrap();
        tree.set(13, TreeHasher::sha256().hash(b"y")).unwrap();
        tree.commit(None).unwrap();

        tree.rollback(0).unwrap();
        assert_eq!(tree.latest_version(), 0);
        assert_eq!(tree.root(), &nil_root[..]);
        assert!(matches!(tree.get(12, None), Err(TreeError::EmptyRoot)));
        assert!(store.get(b"r:\x01\0\0\0\0\0\0\0").is_err());
    }
}
