//! # State Views
//!
//! A state view answers two questions: "is this output unspent?" and "how
//! many units of an asset are in circulation?". Writers record spends,
//! new outputs and issuance/destruction against it.
//!
//! [`MemView`] is the only implementation in the core. It is an in-memory
//! overlay that can sit on top of a [`Tree`] (mutated in lock-step) and/or
//! on top of another [`ViewReader`]. That lets the block engine stack
//!
//! ```text
//!   per-transaction MemView      (no tree, backed by ↓)
//!   per-block MemView            (owns a clone of the snapshot tree)
//!   snapshot tree                (durable commitment)
//! ```
//!
//! and throw away the top layer when a transaction is rejected.
//!
//! ## Tree encoding
//!
//! | key                               | value                                   |
//! |-----------------------------------|-----------------------------------------|
//! | `asset_id ‖ 'o' ‖ outpoint`       | `Value::Hash(output.commitment())`      |
//! | `asset_id ‖ 'c'`                  | `issuance u64 BE ‖ destroyed u64 BE`    |
//! | `asset_id ‖ 'd'`                  | `Value::Hash(definition pointer)`       |

use std::collections::HashMap;

use crate::crypto::hash::Hash;
use crate::state::patricia::{Tree, TreeError, Value};
use crate::transaction::types::{AssetId, Outpoint, Output};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state tree: {0}")]
    Tree(#[from] TreeError),

    #[error("view has no state tree to commit to")]
    NoTree,

    #[error("malformed circulation record for asset {0}")]
    MalformedCirculation(AssetId),

    #[error("{kind} total overflows for asset {asset}")]
    Overflow { asset: AssetId, kind: &'static str },

    #[error("backing view: {0}")]
    Backing(String),
}

pub type StateResult<T> = Result<T, StateError>;

// ---------------------------------------------------------------------------
// Key encoding
// ---------------------------------------------------------------------------

const OUTPUT_TAG: u8 = b'o';
const CIRCULATION_TAG: u8 = b'c';
const DEFINITION_TAG: u8 = b'd';

/// Tree key of an output commitment.
pub fn output_key(asset_id: &AssetId, outpoint: &Outpoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + 1 + Outpoint::ENCODED_LEN);
    key.extend_from_slice(asset_id.as_bytes());
    key.push(OUTPUT_TAG);
    key.extend_from_slice(&outpoint.to_bytes());
    key
}

pub fn circulation_key(asset_id: &AssetId) -> Vec<u8> {
    let mut key = asset_id.as_bytes().to_vec();
    key.push(CIRCULATION_TAG);
    key
}

pub fn definition_key(asset_id: &AssetId) -> Vec<u8> {
    let mut key = asset_id.as_bytes().to_vec();
    key.push(DEFINITION_TAG);
    key
}

// ---------------------------------------------------------------------------
// AssetState
// ---------------------------------------------------------------------------

/// Per-asset issuance bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AssetState {
    pub definition_pointer: Option<Hash>,
    pub issuance: u64,
    pub destroyed: u64,
}

impl AssetState {
    pub fn circulation(&self) -> i64 {
        clamp_i64(self.issuance as i128 - self.destroyed as i128)
    }

    pub fn is_zero(&self) -> bool {
        self.issuance == 0 && self.destroyed == 0 && self.definition_pointer.is_none()
    }

    /// Add another accumulator into this one.
    pub fn merge(&mut self, asset: AssetId, other: &AssetState) -> StateResult<()> {
        self.issuance = self
            .issuance
            .checked_add(other.issuance)
            .ok_or(StateError::Overflow { asset, kind: "issuance" })?;
        self.destroyed = self
            .destroyed
            .checked_add(other.destroyed)
            .ok_or(StateError::Overflow { asset, kind: "destroyed" })?;
        if other.definition_pointer.is_some() {
            self.definition_pointer = other.definition_pointer;
        }
        Ok(())
    }

    fn encode_totals(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&self.issuance.to_be_bytes());
        out.extend_from_slice(&self.destroyed.to_be_bytes());
        out
    }

    fn decode_totals(asset: AssetId, value: &Value) -> StateResult<Self> {
        let bytes = value
            .as_bytes()
            .filter(|b| b.len() == 16)
            .ok_or(StateError::MalformedCirculation(asset))?;
        let mut issuance = [0u8; 8];
        let mut destroyed = [0u8; 8];
        issuance.copy_from_slice(&bytes[..8]);
        destroyed.copy_from_slice(&bytes[8..]);
        Ok(Self {
            definition_pointer: None,
            issuance: u64::from_be_bytes(issuance),
            destroyed: u64::from_be_bytes(destroyed),
        })
    }
}

fn clamp_i64(v: i128) -> i64 {
    i64::try_from(v).unwrap_or(if v > 0 { i64::MAX } else { i64::MIN })
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Read side of a state view.
pub trait ViewReader: Send + Sync {
    /// True only if the outpoint is unspent *and* the stored entry matches
    /// the output's asset, amount and script.
    fn is_utxo(&self, output: &Output) -> StateResult<bool>;

    /// Circulation (issued minus destroyed) for each requested asset.
    fn circulation(&self, assets: &[AssetId]) -> StateResult<HashMap<AssetId, i64>>;

    fn state_root(&self) -> StateResult<Hash>;
}

/// Write side of a state view.
pub trait ViewWriter {
    fn consume_utxo(&mut self, output: &Output) -> StateResult<()>;

    fn add_utxo(&mut self, output: Output) -> StateResult<()>;

    fn save_asset_definition_pointer(&mut self, asset: AssetId, pointer: Hash) -> StateResult<()>;

    fn save_issuance(&mut self, asset: AssetId, amount: u64) -> StateResult<()>;

    fn save_destruction(&mut self, asset: AssetId, amount: u64) -> StateResult<()>;
}

// ---------------------------------------------------------------------------
// MemView
// ---------------------------------------------------------------------------

/// Everything a [`MemView`] recorded, detached from its backing layers.
#[derive(Clone, Debug, Default)]
pub struct ViewChanges {
    pub added: Vec<Output>,
    pub consumed: Vec<Output>,
    pub assets: Vec<(AssetId, AssetState)>,
}

/// In-memory state overlay.
pub struct MemView<'a> {
    added: HashMap<Outpoint, Output>,
    consumed: HashMap<Outpoint, Output>,
    assets: HashMap<AssetId, AssetState>,
    tree: Option<Tree>,
    backing: Option<&'a dyn ViewReader>,
}

impl<'a> MemView<'a> {
    pub fn new(tree: Option<Tree>, backing: Option<&'a dyn ViewReader>) -> Self {
        Self {
            added: HashMap::new(),
            consumed: HashMap::new(),
            assets: HashMap::new(),
            tree,
            backing,
        }
    }

    /// A view that owns a tree and has nothing underneath it.
    pub fn with_tree(tree: Tree) -> Self {
        Self::new(Some(tree), None)
    }

    /// A tree-less view over another reader.
    pub fn layered(backing: &'a dyn ViewReader) -> Self {
        Self::new(None, Some(backing))
    }

    pub fn tree(&self) -> Option<&Tree> {
        self.tree.as_ref()
    }

    pub fn added(&self) -> impl Iterator<Item = &Output> {
        self.added.values()
    }

    pub fn consumed(&self) -> impl Iterator<Item = &Output> {
        self.consumed.values()
    }

    /// Issuance/destruction accumulated locally and not yet folded.
    pub fn asset_changes(&self) -> &HashMap<AssetId, AssetState> {
        &self.assets
    }

    /// Fold the local asset accumulator into the tree's circulation
    /// commitments. Afterwards the tree alone carries those totals.
    pub fn finalize(&mut self) -> StateResult<()> {
        let tree = self.tree.as_mut().ok_or(StateError::NoTree)?;
        fold_assets(tree, &self.assets)?;
        self.assets.clear();
        Ok(())
    }

    /// Finalize and hand back the tree.
    pub fn into_tree(mut self) -> StateResult<Tree> {
        self.finalize()?;
        self.tree.take().ok_or(StateError::NoTree)
    }

    /// Detach the recorded changes, releasing the borrow on the backing view.
    pub fn into_changes(self) -> ViewChanges {
        let mut assets: Vec<_> = self.assets.into_iter().collect();
        assets.sort_by_key(|(id, _)| *id);
        ViewChanges {
            added: self.added.into_values().collect(),
            consumed: self.consumed.into_values().collect(),
            assets,
        }
    }

    /// Replay changes recorded by a view that was stacked on this one.
    pub fn apply(&mut self, changes: ViewChanges) -> StateResult<()> {
        for output in &changes.consumed {
            self.consume_utxo(output)?;
        }
        for output in changes.added {
            self.add_utxo(output)?;
        }
        for (asset, state) in changes.assets {
            self.asset_entry(asset).merge(asset, &state)?;
        }
        Ok(())
    }

    fn asset_entry(&mut self, asset: AssetId) -> &mut AssetState {
        self.assets.entry(asset).or_default()
    }
}

impl ViewReader for MemView<'_> {
    fn is_utxo(&self, output: &Output) -> StateResult<bool> {
        let outpoint = &output.outpoint;
        if self.consumed.contains_key(outpoint) {
            return Ok(false);
        }
        if let Some(local) = self.added.get(outpoint) {
            return Ok(local.asset_amount == output.asset_amount && local.script == output.script);
        }
        if let Some(tree) = &self.tree {
            let key = output_key(&output.asset_id(), outpoint);
            if let Some(Value::Hash(committed)) = tree.lookup(&key) {
                return Ok(*committed == output.commitment());
            }
        }
        match self.backing {
            Some(backing) => backing.is_utxo(output),
            None => Ok(false),
        }
    }

    fn circulation(&self, assets: &[AssetId]) -> StateResult<HashMap<AssetId, i64>> {
        let mut out: HashMap<AssetId, i128> = assets.iter().map(|a| (*a, 0)).collect();

        for asset in assets {
            let total = out.entry(*asset).or_default();
            if let Some(local) = self.assets.get(asset) {
                *total += local.issuance as i128 - local.destroyed as i128;
            }
            if let Some(tree) = &self.tree {
                if let Some(value) = tree.lookup(&circulation_key(asset)) {
                    let committed = AssetState::decode_totals(*asset, value)?;
                    *total += committed.issuance as i128 - committed.destroyed as i128;
                }
            }
        }

        if let Some(backing) = self.backing {
            for (asset, amount) in backing.circulation(assets)? {
                *out.entry(asset).or_default() += amount as i128;
            }
        }

        Ok(out.into_iter().map(|(k, v)| (k, clamp_i64(v))).collect())
    }

    fn state_root(&self) -> StateResult<Hash> {
        let Some(tree) = &self.tree else {
            return match self.backing {
                Some(backing) if self.is_clean() => backing.state_root(),
                _ => Err(StateError::NoTree),
            };
        };
        if self.assets.is_empty() {
            return Ok(tree.root_hash());
        }
        let mut folded = tree.clone();
        fold_assets(&mut folded, &self.assets)?;
        Ok(folded.root_hash())
    }
}

impl MemView<'_> {
    fn is_clean(&self) -> bool {
        self.added.is_empty() && self.consumed.is_empty() && self.assets.is_empty()
    }
}

impl ViewWriter for MemView<'_> {
    fn consume_utxo(&mut self, output: &Output) -> StateResult<()> {
        if let Some(tree) = &mut self.tree {
            tree.delete(&output_key(&output.asset_id(), &output.outpoint))?;
        }
        // Spending an output created in this same view cancels out.
        if self.added.remove(&output.outpoint).is_none() {
            self.consumed.insert(output.outpoint, output.clone());
        }
        Ok(())
    }

    fn add_utxo(&mut self, output: Output) -> StateResult<()> {
        if let Some(tree) = &mut self.tree {
            tree.insert(
                &output_key(&output.asset_id(), &output.outpoint),
                Value::Hash(output.commitment()),
            )?;
        }
        self.consumed.remove(&output.outpoint);
        self.added.insert(output.outpoint, output);
        Ok(())
    }

    fn save_asset_definition_pointer(&mut self, asset: AssetId, pointer: Hash) -> StateResult<()> {
        self.asset_entry(asset).definition_pointer = Some(pointer);
        Ok(())
    }

    fn save_issuance(&mut self, asset: AssetId, amount: u64) -> StateResult<()> {
        let entry = self.asset_entry(asset);
        entry.issuance = entry
            .issuance
            .checked_add(amount)
            .ok_or(StateError::Overflow { asset, kind: "issuance" })?;
        Ok(())
    }

    fn save_destruction(&mut self, asset: AssetId, amount: u64) -> StateResult<()> {
        let entry = self.asset_entry(asset);
        entry.destroyed = entry
            .destroyed
            .checked_add(amount)
            .ok_or(StateError::Overflow { asset, kind: "destroyed" })?;
        Ok(())
    }
}

fn fold_assets(tree: &mut Tree, assets: &HashMap<AssetId, AssetState>) -> StateResult<()> {
    for (asset, delta) in assets {
        if delta.issuance != 0 || delta.destroyed != 0 {
            let key = circulation_key(asset);
            let mut totals = match tree.lookup(&key) {
                Some(value) => AssetState::decode_totals(*asset, value)?,
                None => AssetState::default(),
            };
            totals.merge(
                *asset,
                &AssetState {
                    definition_pointer: None,
                    ..*delta
                },
            )?;
            tree.insert(&key, Value::Bytes(totals.encode_totals()))?;
        }
        if let Some(pointer) = delta.definition_pointer {
            tree.insert(&definition_key(asset), Value::Hash(pointer))?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
