//! # Block Engine
//!
//! The validation engine the generator drives. [`BlockEngine`] is the
//! contract: build a candidate block from the previous block, its snapshot,
//! the current time and a batch of transactions; re-derive the snapshot of
//! a block built elsewhere; commit a block that has been applied.
//!
//! [`BasicEngine`] is the reference implementation for a plain UTXO ledger.
//! For each transaction it stacks a throw-away [`MemView`] on the block's
//! view, so a rejected transaction leaves no trace:
//!
//! ```text
//!   tx view (MemView, no tree)  ──► validate ──► apply changes ──┐
//!   block view (MemView, tree)  ◄────────────────────────────────┘
//!   previous snapshot tree
//! ```
//!
//! A transaction is admitted when every spent prevout is unspent in the
//! block view, every issuance is inside its validity window and not a
//! replay, and every asset balances (issued + spent = created + retired).
//!
//! A block holds at most `max_txs_per_block` transactions. Offered
//! transactions past the cap are neither admitted nor rejected; they are
//! left for a later block.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{DEFAULT_MAX_TXS_PER_BLOCK, MAX_ISSUANCE_WINDOW_MS};
use crate::crypto::hash::Hash;
use crate::state::snapshot::Snapshot;
use crate::state::view::{MemView, StateError, ViewChanges, ViewReader, ViewWriter};
use crate::storage::block::{Block, BlockError};
use crate::storage::db::{BlockCommit, DbError, LedgerDB};
use crate::storage::pool::tx_asset_changes;
use crate::transaction::types::{AssetId, Outpoint, Output, Transaction, TxInput};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("state: {0}")]
    State(#[from] StateError),

    #[error("storage: {0}")]
    Db(#[from] DbError),

    #[error("block: {0}")]
    Block(#[from] BlockError),

    #[error("invalid block {height}: {reason}")]
    InvalidBlock { height: u64, reason: String },
}

/// Why a single transaction was left out of a block.
#[derive(Debug, thiserror::Error)]
pub enum TxRejection {
    #[error("transaction has no inputs")]
    NoInputs,

    #[error("prevout {0} does not exist")]
    MissingPrevout(Outpoint),

    #[error("prevout {0} is not unspent")]
    SpentPrevout(Outpoint),

    #[error("issuance expired at {expires_at_ms}")]
    IssuanceExpired { expires_at_ms: u64 },

    #[error("issuance expiry {expires_at_ms} is beyond the allowed window")]
    IssuanceWindow { expires_at_ms: u64 },

    #[error("issuance already seen")]
    IssuanceReplay,

    #[error("asset {0} does not balance")]
    Unbalanced(AssetId),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Db(#[from] DbError),
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// A generated block, the snapshot after it, and what was refused.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub block: Block,
    pub snapshot: Snapshot,
    /// Hashes of offered transactions that failed validation. Offered
    /// transactions that are in neither the block nor this list were not
    /// looked at and may be offered again.
    pub rejected: Vec<Hash>,
}

pub trait BlockEngine: Send + Sync {
    /// Build the next block. The returned block may carry no transactions
    /// if none were admitted; the caller decides what to do with that.
    fn generate_block(
        &self,
        previous: &Block,
        previous_snapshot: &Snapshot,
        now_ms: u64,
        txs: Vec<Transaction>,
    ) -> Result<Candidate, EngineError>;

    /// Re-derive the snapshot after `block`, rejecting it if any
    /// transaction is invalid or the state root does not match.
    fn apply_block(
        &self,
        previous: &Block,
        previous_snapshot: &Snapshot,
        block: &Block,
    ) -> Result<Snapshot, EngineError>;

    /// Durably commit an applied block and its snapshot.
    fn commit_applied_block(&self, block: &Block, snapshot: &Snapshot) -> Result<(), EngineError>;
}

// ---------------------------------------------------------------------------
// BasicEngine
// ---------------------------------------------------------------------------

pub struct BasicEngine {
    db: Arc<LedgerDB>,
    max_txs_per_block: usize,
}

impl BasicEngine {
    pub fn new(db: Arc<LedgerDB>) -> Self {
        Self {
            db,
            max_txs_per_block: DEFAULT_MAX_TXS_PER_BLOCK,
        }
    }

    pub fn with_max_txs(mut self, max: usize) -> Self {
        self.max_txs_per_block = max.max(1);
        self
    }

    fn find_output(
        &self,
        created_in_block: &HashMap<Outpoint, Output>,
        outpoint: &Outpoint,
    ) -> Result<Option<Output>, TxRejection> {
        if let Some(o) = created_in_block.get(outpoint) {
            return Ok(Some(o.clone()));
        }
        Ok(self.db.find_output(outpoint)?)
    }

    /// Check one transaction against the block view and return the changes
    /// it would make.
    fn validate_tx(
        &self,
        block_view: &MemView<'_>,
        snapshot: &Snapshot,
        created_in_block: &HashMap<Outpoint, Output>,
        tx: &Transaction,
        now_ms: u64,
    ) -> Result<ViewChanges, TxRejection> {
        if tx.inputs.is_empty() {
            return Err(TxRejection::NoInputs);
        }

        let mut tx_view = MemView::layered(block_view);
        let mut inflow: BTreeMap<AssetId, u128> = BTreeMap::new();
        let mut outflow: BTreeMap<AssetId, u128> = BTreeMap::new();

        for input in &tx.inputs {
            match input {
                TxInput::Spend { prevout } => {
                    let output = self
                        .find_output(created_in_block, prevout)?
                        .ok_or(TxRejection::MissingPrevout(*prevout))?;
                    if !tx_view.is_utxo(&output)? {
                        return Err(TxRejection::SpentPrevout(*prevout));
                    }
                    tx_view.consume_utxo(&output)?;
                    *inflow.entry(output.asset_id()).or_default() += output.amount() as u128;
                }
                TxInput::Issue(issuance) => {
                    if issuance.expires_at_ms < now_ms {
                        return Err(TxRejection::IssuanceExpired {
                            expires_at_ms: issuance.expires_at_ms,
                        });
                    }
                    if issuance.expires_at_ms > now_ms.saturating_add(MAX_ISSUANCE_WINDOW_MS) {
                        return Err(TxRejection::IssuanceWindow {
                            expires_at_ms: issuance.expires_at_ms,
                        });
                    }
                    if snapshot.has_issuance(&issuance.hash()) {
                        return Err(TxRejection::IssuanceReplay);
                    }
                    tx_view.save_issuance(issuance.asset_id, issuance.amount)?;
                    if let Some(pointer) = issuance.definition_hash {
                        tx_view.save_asset_definition_pointer(issuance.asset_id, pointer)?;
                    }
                    *inflow.entry(issuance.asset_id).or_default() += issuance.amount as u128;
                }
            }
        }

        for output in &tx.outputs {
            *outflow.entry(output.asset_amount.asset_id).or_default() +=
                output.asset_amount.amount as u128;
        }
        for retired in tx.retirements() {
            tx_view.save_destruction(retired.asset_id, retired.amount)?;
        }
        for output in tx.created_outputs() {
            tx_view.add_utxo(output)?;
        }

        let assets: HashSet<_> = inflow.keys().chain(outflow.keys()).copied().collect();
        for asset in assets {
            if inflow.get(&asset) != outflow.get(&asset) {
                return Err(TxRejection::Unbalanced(asset));
            }
        }

        Ok(tx_view.into_changes())
    }

    /// Run transactions over `previous_snapshot`. With `strict`, the first
    /// rejection fails the whole run; otherwise rejected transactions are
    /// reported and left out.
    fn run(
        &self,
        previous_snapshot: &Snapshot,
        now_ms: u64,
        txs: Vec<Transaction>,
        strict: bool,
    ) -> Result<RunOutcome, EngineError> {
        let mut snapshot = previous_snapshot.clone();
        let pruned = snapshot.prune_issuances(now_ms);
        if pruned > 0 {
            debug!(pruned, "expired issuances pruned");
        }

        let tree = std::mem::take(&mut snapshot.tree);
        let mut block_view = MemView::with_tree(tree);
        let mut created_in_block = HashMap::new();
        let mut admitted = Vec::new();
        let mut rejected = Vec::new();

        for tx in txs {
            if admitted.len() >= self.max_txs_per_block {
                break;
            }
            match self.validate_tx(&block_view, &snapshot, &created_in_block, &tx, now_ms) {
                Ok(changes) => {
                    block_view.apply(changes)?;
                    for issuance in tx.issuances() {
                        snapshot.record_issuance(issuance.hash(), issuance.expires_at_ms);
                    }
                    for output in tx.created_outputs() {
                        created_in_block.insert(output.outpoint, output);
                    }
                    admitted.push(tx);
                }
                Err(reason) if strict => {
                    return Err(EngineError::InvalidBlock {
                        height: 0,
                        reason: format!("transaction {}: {reason}", tx.hash_hex()),
                    });
                }
                Err(reason) => {
                    debug!(tx = %tx.hash_hex(), %reason, "transaction rejected");
                    rejected.push(tx.hash());
                }
            }
        }

        snapshot.tree = block_view.into_tree()?;
        Ok(RunOutcome {
            admitted,
            rejected,
            snapshot,
        })
    }
}

struct RunOutcome {
    admitted: Vec<Transaction>,
    rejected: Vec<Hash>,
    snapshot: Snapshot,
}

impl BlockEngine for BasicEngine {
    fn generate_block(
        &self,
        previous: &Block,
        previous_snapshot: &Snapshot,
        now_ms: u64,
        txs: Vec<Transaction>,
    ) -> Result<Candidate, EngineError> {
        let timestamp_ms = now_ms.max(previous.header.timestamp_ms + 1);
        let offered = txs.len();
        let RunOutcome {
            admitted,
            rejected,
            snapshot,
        } = self.run(previous_snapshot, timestamp_ms, txs, false)?;
        let block = Block::next(previous, timestamp_ms, admitted, snapshot.root_hash());
        debug!(
            height = block.height(),
            offered,
            admitted = block.tx_count(),
            rejected = rejected.len(),
            "candidate block generated"
        );
        Ok(Candidate {
            block,
            snapshot,
            rejected,
        })
    }

    fn apply_block(
        &self,
        previous: &Block,
        previous_snapshot: &Snapshot,
        block: &Block,
    ) -> Result<Snapshot, EngineError> {
        let height = block.height();
        let invalid = |reason: &str| EngineError::InvalidBlock {
            height,
            reason: reason.to_string(),
        };

        block.verify()?;
        if height != previous.height() + 1 {
            return Err(invalid("height does not follow previous block"));
        }
        if block.header.previous_block_hash != previous.hash() {
            return Err(invalid("previous block hash mismatch"));
        }
        if block.header.timestamp_ms <= previous.header.timestamp_ms {
            return Err(invalid("timestamp does not advance"));
        }
        if block.header.consensus_program != previous.header.consensus_program {
            return Err(invalid("consensus program changed"));
        }

        let RunOutcome { snapshot, .. } = self
            .run(
                previous_snapshot,
                block.header.timestamp_ms,
                block.transactions.clone(),
                true,
            )
            .map_err(|e| match e {
                EngineError::InvalidBlock { reason, .. } => EngineError::InvalidBlock { height, reason },
                other => other,
            })?;

        if snapshot.root_hash() != block.header.state_root {
            return Err(invalid("state root mismatch"));
        }
        Ok(snapshot)
    }

    fn commit_applied_block(&self, block: &Block, snapshot: &Snapshot) -> Result<(), EngineError> {
        let spent: Vec<Outpoint> = block
            .transactions
            .iter()
            .flat_map(|tx| tx.spent_outpoints())
            .collect();
        let spent_set: HashSet<Outpoint> = spent.iter().copied().collect();
        let created: Vec<Output> = block
            .transactions
            .iter()
            .flat_map(|tx| tx.created_outputs())
            .filter(|o| !spent_set.contains(&o.outpoint))
            .collect();

        let mut totals: BTreeMap<AssetId, crate::state::view::AssetState> = BTreeMap::new();
        for tx in &block.transactions {
            for (asset, delta) in tx_asset_changes(tx) {
                totals.entry(asset).or_default().merge(asset, &delta)?;
            }
        }

        self.db.commit_block(&BlockCommit {
            block,
            snapshot,
            spent,
            created,
            asset_changes: totals.into_iter().collect(),
        })?;
        info!(
            height = block.height(),
            root = %hex::encode(snapshot.root_hash()),
            "block applied"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
