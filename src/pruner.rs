//! Memory-side eviction of clean, cold subtrees
//!
//! Runs synchronously at the tail of a commit once the materialized node
//! count exceeds the configured threshold. Eviction swaps a loaded child
//! handle for an unloaded one; the data is already persisted, so no store
//! access happens here.

use log::{debug, trace};

use crate::node::{Child, NodePath, TreeNode};
use crate::tree::Version;

/// An evictable subtree: clean, reachable, not the root itself
struct Candidate {
    path: NodePath,
    version: Version,
    nodes: u64,
}

/// Evict clean subtrees until at most `threshold` nodes stay materialized
///
/// Coldest (lowest version stamp) subtrees go first; among equals the
/// larger subtree wins so each step frees as much as possible. The root
/// node and dirty subtrees are never evicted.
pub(crate) fn evict(root: &mut TreeNode, size: &mut u64, threshold: u64) {
    if *size <= threshold {
        return;
    }

    let mut candidates = Vec::new();
    collect(root, &mut candidates);
    candidates.sort_by(|a, b| a.version.cmp(&b.version).then(b.nodes.cmp(&a.nodes)));

    let before = *size;
    for candidate in candidates {
        if *size <= threshold {
            break;
        }
        evict_path(root, &candidate.path, size);
    }

    debug!("evicted {} nodes, {} remain", before - *size, *size);
}

/// Collect the roots of maximal clean subtrees
fn collect(node: &TreeNode, out: &mut Vec<Candidate>) {
    for child in [&node.left, &node.right] {
        if let Child::Loaded(n) = child {
            if n.dirty {
                collect(n, out);
            } else {
                out.push(Candidate {
                    path: n.path,
                    version: n.version,
                    nodes: n.count_loaded(),
                });
            }
        }
    }
}

/// Re-resolve `path` from the root and unload it if still materialized
fn evict_path(root: &mut TreeNode, path: &NodePath, size: &mut u64) {
    let mut node = root;
    while node.path.depth() + 1 < path.depth() {
        let slot = if path_bit(path, node.path.depth()) {
            &mut node.right
        } else {
            &mut node.left
        };
        match slot {
            Child::Loaded(child) => node = child.as_mut(),
            // Already unloaded together with an ancestor
            _ => return,
        }
    }

    let slot = if path_bit(path, node.path.depth()) {
        &mut node.right
    } else {
        &mut node.left
    };
    if let Child::Loaded(child) = slot {
        if child.dirty {
            return;
        }
        let freed = child.count_loaded();
        let hash = std::mem::take(&mut child.hash);
        trace!("evicting subtree at depth {} ({} nodes)", path.depth(), freed);
        *slot = Child::Unloaded { path: *path, hash };
        *size -= freed;
    }
}

/// Bit of `path` selecting the child under the node at `parent_depth`
fn path_bit(path: &NodePath, parent_depth: u8) -> bool {
    (path.prefix() >> (path.depth() - 1 - parent_depth)) & 1 == 1
}
