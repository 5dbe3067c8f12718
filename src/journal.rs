//! Per-version change records
//!
//! Every commit persists one [`JournalRecord`]: the identities written at
//! that version and the prior record of every node it superseded or
//! removed. Rollback replays these records in reverse; version pruning
//! drops them wholesale; historical reads rewind a leaf through them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::node::NodePath;
use crate::store::{StoreError, StoreResult};

/// Identity of a node written at a version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeId {
    pub path: NodePath,
    pub hash: Vec<u8>,
}

/// What a journal record says about one path when stepping back a version
#[derive(Debug, PartialEq)]
pub enum Rewind<'a> {
    /// The version did not touch this path
    Untouched,
    /// The node first appeared at this version
    Remove,
    /// The node was superseded; the prior record is attached
    Restore(&'a [u8]),
}

/// Change record persisted for one committed version
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Nodes written at this version
    pub created: Vec<NodeId>,
    /// Prior serialized records of nodes superseded or removed at this
    /// version; a path listed here but not in `created` was deleted
    pub obsolete: Vec<(NodePath, Vec<u8>)>,
}

impl JournalRecord {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.obsolete.is_empty()
    }

    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| StoreError::Backend(format!("journal encode failed: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| StoreError::Corrupted(format!("journal decode failed: {}", e)))
    }

    /// Step the state of `path` back across this version
    pub fn rewind(&self, path: &NodePath) -> Rewind<'_> {
        if let Some((_, bytes)) = self.obsolete.iter().find(|(p, _)| p == path) {
            return Rewind::Restore(bytes);
        }
        if self.created.iter().any(|id| &id.path == path) {
            return Rewind::Remove;
        }
        Rewind::Untouched
    }
}

/// Prior state of the nodes dirtied since the last commit
///
/// The first time a committed node is touched by a write its serialized
/// record is captured here; at commit time the captured records become the
/// journal's obsolete list. `Reset` uses the same captures to restore the
/// root without store access.
#[derive(Debug, Default)]
pub struct StagedChanges {
    prior: BTreeMap<NodePath, Vec<u8>>,
}

impl StagedChanges {
    /// Capture the pre-write record of `path` unless already captured
    pub fn capture<F>(&mut self, path: NodePath, record: F)
    where
        F: FnOnce() -> Vec<u8>,
    {
        self.prior.entry(path).or_insert_with(record);
    }

    /// Captured record of `path`, if any
    pub fn prior_of(&self, path: &NodePath) -> Option<&[u8]> {
        self.prior.get(path).map(|bytes| bytes.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.prior.is_empty()
    }

    pub fn clear(&mut self) {
        self.prior.clear();
    }

    /// Paths captured so far
    pub fn paths(&self) -> impl Iterator<Item = &NodePath> {
        self.prior.keys()
    }

    /// Build the journal record for a commit writing `created`
    pub fn to_record(&self, created: Vec<NodeId>) -> JournalRecord {
        JournalRecord {
            created,
            obsolete: self
                .prior
                .iter()
                .map(|(path, bytes)| (*path, bytes.clone()))
                .collect(),
        }
    }
}
