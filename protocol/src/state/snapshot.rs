//! Ledger state snapshots.
//!
//! A snapshot is the state tree as of a committed block plus the set of
//! issuances already seen (with their expiry), which is what rejects a
//! replayed issuance. The storage layer writes one per block, keyed by
//! height; the encoding here is a flat pre-order node list so the exact
//! tree topology comes back on load.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::crypto::hash::Hash;
use crate::state::patricia::{NodeRecord, Tree, TreeError};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot encoding: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("snapshot tree: {0}")]
    Tree(#[from] TreeError),
}

/// On-disk form.
#[derive(Serialize, Deserialize)]
struct SnapshotRecord {
    nodes: Vec<NodeRecord>,
    prior_issuances: Vec<(Hash, u64)>,
}

#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub tree: Tree,
    /// Issuance hash -> expiry (ms since epoch).
    pub prior_issuances: HashMap<Hash, u64>,
}

impl Snapshot {
    pub fn new(tree: Tree) -> Self {
        Self {
            tree,
            prior_issuances: HashMap::new(),
        }
    }

    pub fn root_hash(&self) -> Hash {
        self.tree.root_hash()
    }

    pub fn has_issuance(&self, issuance_hash: &Hash) -> bool {
        self.prior_issuances.contains_key(issuance_hash)
    }

    /// Remember an issuance until `expires_at_ms`. Returns `false` if it was
    /// already recorded.
    pub fn record_issuance(&mut self, issuance_hash: Hash, expires_at_ms: u64) -> bool {
        self.prior_issuances
            .insert(issuance_hash, expires_at_ms)
            .is_none()
    }

    /// Drop issuances whose expiry is at or before `now_ms`. An expired
    /// issuance can no longer be included in a block, so it no longer needs
    /// replay protection.
    pub fn prune_issuances(&mut self, now_ms: u64) -> usize {
        let before = self.prior_issuances.len();
        self.prior_issuances.retain(|_, expiry| *expiry > now_ms);
        before - self.prior_issuances.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        let mut prior_issuances: Vec<_> = self
            .prior_issuances
            .iter()
            .map(|(h, e)| (*h, *e))
            .collect();
        prior_issuances.sort_unstable();

        let record = SnapshotRecord {
            nodes: self.tree.records(),
            prior_issuances,
        };
        Ok(bincode::serialize(&record)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let record: SnapshotRecord = bincode::deserialize(bytes)?;
        Ok(Self {
            tree: Tree::from_nodes(record.nodes)?,
            prior_issuances: record.prior_issuances.into_iter().collect(),
        })
    }
}
