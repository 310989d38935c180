//! # Pool Persistence
//!
//! Unconfirmed ("pool") transactions live in their own tables, apart from
//! the confirmed `utxos` and `blocks`:
//!
//! - `pool_txs` holds the transactions in arrival order (`seq`)
//! - `pool_outputs` holds the outputs they create
//! - `pool_inputs` records which pool transaction spends each outpoint
//!
//! Two pool transactions may reference the same prevout before either lands
//! in a block. `pool_inputs` is what catches that: a prevout already spent
//! by a pool transaction is not offered to validation again, and the insert
//! transaction re-checks it so concurrent submitters cannot both win.

use sled::transaction::{ConflictableTransactionError, TransactionalTree};
use sled::Transactional;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use super::db::{
    abort, decode_u64, read_output, txn_result, AssetTotals, DbError, DbResult, Executor,
    LedgerDB, META_POOL_SEQ,
};
use crate::config::POOL_SEQ_MAX_ATTEMPTS;
use crate::crypto::hash::Hash;
use crate::state::view::AssetState;
use crate::transaction::types::{AssetId, Outpoint, Output, Transaction};

pub(super) type TxnResult<T> = Result<T, ConflictableTransactionError<DbError>>;

/// Issuance and destruction a transaction causes, per asset.
pub fn tx_asset_changes(tx: &Transaction) -> Vec<(AssetId, AssetState)> {
    let mut changes: BTreeMap<AssetId, AssetState> = BTreeMap::new();
    for issuance in tx.issuances() {
        let entry = changes.entry(issuance.asset_id).or_default();
        entry.issuance = entry.issuance.saturating_add(issuance.amount);
        if issuance.definition_hash.is_some() {
            entry.definition_pointer = issuance.definition_hash;
        }
    }
    for retired in tx.retirements() {
        let entry = changes.entry(retired.asset_id).or_default();
        entry.destroyed = entry.destroyed.saturating_add(retired.amount);
    }
    changes.into_iter().collect()
}

/// Whether a pool transaction already spends `outpoint`.
fn spent_in_pool<E: Executor>(pool_inputs: &E, outpoint: &Outpoint) -> Result<bool, E::Error> {
    pool_inputs.contains_raw(&outpoint.to_bytes())
}

fn adjust_pool_totals(
    totals: &TransactionalTree,
    changes: &[(AssetId, AssetState)],
    add: bool,
) -> TxnResult<()> {
    for (asset, delta) in changes {
        let mut current = match totals.get(&asset.as_bytes()[..])? {
            Some(bytes) => match bincode::deserialize::<AssetTotals>(&bytes) {
                Ok(t) => t,
                Err(e) => return abort(e),
            },
            None => AssetTotals::default(),
        };
        let pool = &mut current.pool;
        if add {
            pool.issuance = pool.issuance.saturating_add(delta.issuance);
            pool.destroyed = pool.destroyed.saturating_add(delta.destroyed);
        } else {
            pool.issuance = pool.issuance.saturating_sub(delta.issuance);
            pool.destroyed = pool.destroyed.saturating_sub(delta.destroyed);
        }
        let bytes = match bincode::serialize(&current) {
            Ok(b) => b,
            Err(e) => return abort(e),
        };
        totals.insert(&asset.as_bytes()[..], bytes)?;
    }
    Ok(())
}

impl LedgerDB {
    /// Allocate the next pool sequence number.
    ///
    /// Compare-and-swap on the counter, retried a bounded number of times
    /// under contention.
    fn next_pool_seq(&self) -> DbResult<u64> {
        for attempt in 1..=POOL_SEQ_MAX_ATTEMPTS {
            let current = self.metadata.get(META_POOL_SEQ)?;
            let next = match &current {
                Some(bytes) => decode_u64(bytes, "pool seq")? + 1,
                None => 1,
            };
            match self.metadata.compare_and_swap(
                META_POOL_SEQ,
                current,
                Some(next.to_be_bytes().to_vec()),
            )? {
                Ok(()) => return Ok(next),
                Err(_) => debug!(attempt, "pool sequence contended, retrying"),
            }
        }
        Err(DbError::Contention {
            what: "pool sequence",
            attempts: POOL_SEQ_MAX_ATTEMPTS,
        })
    }

    /// Add a transaction to the pool. Fails with [`DbError::Conflict`] if it
    /// is already pooled or spends a prevout another pool transaction spends.
    pub fn insert_pool_tx(&self, tx: &Transaction) -> DbResult<u64> {
        let tx_hash = tx.hash();
        if self.pool_tx_index.contains_key(tx_hash)? {
            return Err(DbError::Conflict(format!(
                "transaction {} already pooled",
                hex::encode(tx_hash)
            )));
        }

        let seq = self.next_pool_seq()?;
        let seq_key = seq.to_be_bytes();
        let tx_bytes = bincode::serialize(tx)?;
        let spent: Vec<Outpoint> = tx.spent_outpoints().collect();
        let created: Vec<(Outpoint, Vec<u8>)> = tx
            .created_outputs()
            .iter()
            .map(|o| Ok((o.outpoint, bincode::serialize(o)?)))
            .collect::<DbResult<_>>()?;
        let changes = tx_asset_changes(tx);

        let result = (
            &self.pool_txs,
            &self.pool_tx_index,
            &self.pool_outputs,
            &self.pool_inputs,
            &self.asset_totals,
        )
            .transaction(|(txs, index, outputs, inputs, totals)| {
                if index.contains_raw(&tx_hash)? {
                    return abort(DbError::Conflict(format!(
                        "transaction {} already pooled",
                        hex::encode(tx_hash)
                    )));
                }
                for outpoint in &spent {
                    if spent_in_pool(inputs, outpoint)? {
                        return abort(DbError::Conflict(format!(
                            "prevout {outpoint} already spent in pool"
                        )));
                    }
                    inputs.insert_raw(&outpoint.to_bytes(), tx_hash.to_vec())?;
                }
                for (outpoint, bytes) in &created {
                    outputs.insert_raw(&outpoint.to_bytes(), bytes.clone())?;
                }
                txs.insert_raw(&seq_key, tx_bytes.clone())?;
                index.insert_raw(&tx_hash, seq_key.to_vec())?;
                adjust_pool_totals(totals, &changes, true)?;
                Ok(())
            });
        txn_result(result)?;

        debug!(seq, tx = %hex::encode(tx_hash), "transaction pooled");
        Ok(seq)
    }

    /// Pooled transactions in arrival order.
    pub fn load_pool_txs(&self) -> DbResult<Vec<Transaction>> {
        let mut out = Vec::with_capacity(self.pool_txs.len());
        for entry in self.pool_txs.iter() {
            let (_, bytes) = entry?;
            out.push(bincode::deserialize(&bytes)?);
        }
        Ok(out)
    }

    pub fn pool_tx_count(&self) -> usize {
        self.pool_txs.len()
    }

    pub fn is_pooled(&self, tx_hash: &Hash) -> DbResult<bool> {
        Ok(self.pool_tx_index.contains_key(tx_hash)?)
    }

    /// Outputs available to spend, from confirmed and pool outputs alike.
    /// Outpoints already spent by a pool transaction are left out, as are
    /// outpoints that exist nowhere.
    pub fn load_prevouts(&self, outpoints: &[Outpoint]) -> DbResult<HashMap<Outpoint, Output>> {
        let mut found = HashMap::with_capacity(outpoints.len());
        for outpoint in outpoints {
            if spent_in_pool(&self.pool_inputs, outpoint)? {
                continue;
            }
            let output = match read_output(&self.utxos, outpoint)? {
                Some(o) => Some(o),
                None => read_output(&self.pool_outputs, outpoint)?,
            };
            if let Some(o) = output {
                found.insert(*outpoint, o);
            }
        }
        Ok(found)
    }

    /// An output by outpoint from confirmed or pool outputs, whether or not
    /// a pool transaction has claimed it.
    pub fn find_output(&self, outpoint: &Outpoint) -> DbResult<Option<Output>> {
        match read_output(&self.utxos, outpoint)? {
            Some(o) => Ok(Some(o)),
            None => read_output(&self.pool_outputs, outpoint),
        }
    }

    /// Drop transactions from the pool, along with their outputs, input
    /// claims and pool totals. Unknown hashes are skipped.
    pub fn remove_pool_txs(&self, tx_hashes: &[Hash]) -> DbResult<usize> {
        let removals = self.prepare_pool_removal(tx_hashes)?;
        if removals.is_empty() {
            return Ok(0);
        }

        let result = (
            &self.pool_txs,
            &self.pool_tx_index,
            &self.pool_outputs,
            &self.pool_inputs,
            &self.asset_totals,
        )
            .transaction(|(txs, index, outputs, inputs, totals)| {
                apply_pool_removal(
                    PoolTables {
                        txs,
                        index,
                        outputs,
                        inputs,
                        totals,
                    },
                    &removals,
                )
            });
        txn_result(result)?;

        debug!(removed = removals.len(), "pool transactions removed");
        Ok(removals.len())
    }

    /// Look up the pooled entries for `tx_hashes` ahead of a removal
    /// transaction. Hashes that are not pooled are skipped.
    pub(super) fn prepare_pool_removal(&self, tx_hashes: &[Hash]) -> DbResult<Vec<PoolRemoval>> {
        let mut removals = Vec::new();
        for tx_hash in tx_hashes {
            let Some(seq_bytes) = self.pool_tx_index.get(tx_hash)? else {
                continue;
            };
            let seq = decode_u64(&seq_bytes, "pool seq")?;
            let Some(bytes) = self.pool_txs.get(seq.to_be_bytes())? else {
                warn!(seq, "pool index points at a missing transaction");
                continue;
            };
            let tx: Transaction = bincode::deserialize(&bytes)?;
            removals.push(PoolRemoval {
                seq,
                tx_hash: *tx_hash,
                spent: tx.spent_outpoints().collect(),
                created: tx.created_outputs().iter().map(|o| o.outpoint).collect(),
                changes: tx_asset_changes(&tx),
            });
        }
        Ok(removals)
    }
}

/// A pooled transaction about to leave the pool.
pub(super) struct PoolRemoval {
    seq: u64,
    tx_hash: Hash,
    spent: Vec<Outpoint>,
    created: Vec<Outpoint>,
    changes: Vec<(AssetId, AssetState)>,
}

/// The pool tables as seen from inside a sled transaction.
pub(super) struct PoolTables<'a> {
    pub txs: &'a TransactionalTree,
    pub index: &'a TransactionalTree,
    pub outputs: &'a TransactionalTree,
    pub inputs: &'a TransactionalTree,
    pub totals: &'a TransactionalTree,
}

/// Remove prepared entries. An input claim is only released if it still
/// belongs to the transaction being removed.
pub(super) fn apply_pool_removal(tables: PoolTables<'_>, removals: &[PoolRemoval]) -> TxnResult<()> {
    for removal in removals {
        tables.txs.remove_raw(&removal.seq.to_be_bytes())?;
        tables.index.remove_raw(&removal.tx_hash)?;
        for outpoint in &removal.created {
            tables.outputs.remove_raw(&outpoint.to_bytes())?;
        }
        for outpoint in &removal.spent {
            let key = outpoint.to_bytes();
            let claimed_by_us = tables
                .inputs
                .get_raw(&key)?
                .map(|v| v[..] == removal.tx_hash[..])
                .unwrap_or(false);
            if claimed_by_us {
                tables.inputs.remove_raw(&key)?;
            }
        }
        adjust_pool_totals(tables.totals, &removal.changes, false)?;
    }
    Ok(())
}
