//! # LedgerDB — Persistent Storage Engine
//!
//! The persistence layer for the ledger, built on sled's embedded
//! key-value store. All on-disk data flows through this module and its
//! sibling [`pool`](super::pool).
//!
//! ## Tree Layout
//!
//! | Tree            | Key                          | Value                        |
//! |-----------------|------------------------------|------------------------------|
//! | `blocks`        | `height` (8B BE)             | `bincode(Block)`             |
//! | `block_hashes`  | `hash` (32B)                 | `height` (8B BE)             |
//! | `utxos`         | `outpoint` (36B)             | `bincode(Output)`            |
//! | `snapshots`     | `height` (8B BE)             | `Snapshot::encode()`         |
//! | `pending_block` | `b"pending"`                 | `bincode(Block)`             |
//! | `state_nodes`   | `bit len (4B BE) ‖ packed`   | `bincode(NodeRecord)`        |
//! | `asset_totals`  | `asset_id` (32B)             | `bincode(AssetTotals)`       |
//! | `pool_txs`      | `seq` (8B BE)                | `bincode(Transaction)`       |
//! | `pool_tx_index` | `tx hash` (32B)              | `seq` (8B BE)                |
//! | `pool_outputs`  | `outpoint` (36B)             | `bincode(Output)`            |
//! | `pool_inputs`   | `outpoint` (36B)             | spending `tx hash` (32B)     |
//! | `metadata`      | key (UTF-8)                  | value (bytes)                |
//!
//! Heights are big-endian so that sled's lexicographic ordering matches
//! numeric ordering, which makes "latest snapshot" a `last()` call and
//! block reads a range scan.
//!
//! ## Atomicity
//!
//! Committing a block is one multi-tree sled transaction. It writes the
//! block and its hash index, the utxo changes and asset totals, the latest
//! height and the snapshot, and the state nodes the snapshot's tree changed.
//! The same transaction clears the pending row and removes the block's
//! transactions from the pool. Either everything lands or nothing does.

use serde::{Deserialize, Serialize};
use sled::transaction::{
    ConflictableTransactionError, TransactionError, TransactionResult, TransactionalTree,
    UnabortableTransactionError,
};
use sled::{Batch, Db, IVec, Transactional, Tree};
use std::path::Path;
use tracing::{debug, info};

use super::block::Block;
use super::pool::{apply_pool_removal, PoolTables};
use crate::config::SNAPSHOT_RETENTION;
use crate::crypto::hash::Hash;
use crate::state::patricia::{Delta, Node, NodeRecord, Tree as StateTree, TreeError};
use crate::state::snapshot::{Snapshot, SnapshotError};
use crate::state::view::AssetState;
use crate::transaction::types::{AssetId, Outpoint, Output};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("state tree: {0}")]
    Tree(#[from] TreeError),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("gave up after {attempts} contended attempts on {what}")]
    Contention { what: &'static str, attempts: usize },

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<bincode::Error> for DbError {
    fn from(e: bincode::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// Flatten a sled transaction result.
pub(super) fn txn_result<T>(result: TransactionResult<T, DbError>) -> DbResult<T> {
    result.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => DbError::Sled(e),
    })
}

/// Abort a sled transaction with a ledger error.
pub(super) fn abort<T>(e: impl Into<DbError>) -> Result<T, ConflictableTransactionError<DbError>> {
    Err(ConflictableTransactionError::Abort(e.into()))
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// The read/write surface shared by a plain sled tree and a tree inside a
/// transaction. Helpers written against it work in either context.
pub trait Executor {
    type Error;

    fn get_raw(&self, key: &[u8]) -> Result<Option<IVec>, Self::Error>;
    fn insert_raw(&self, key: &[u8], value: Vec<u8>) -> Result<(), Self::Error>;
    fn remove_raw(&self, key: &[u8]) -> Result<(), Self::Error>;

    fn contains_raw(&self, key: &[u8]) -> Result<bool, Self::Error> {
        Ok(self.get_raw(key)?.is_some())
    }
}

impl Executor for Tree {
    type Error = sled::Error;

    fn get_raw(&self, key: &[u8]) -> Result<Option<IVec>, sled::Error> {
        self.get(key)
    }

    fn insert_raw(&self, key: &[u8], value: Vec<u8>) -> Result<(), sled::Error> {
        self.insert(key, value).map(|_| ())
    }

    fn remove_raw(&self, key: &[u8]) -> Result<(), sled::Error> {
        self.remove(key).map(|_| ())
    }
}

impl Executor for TransactionalTree {
    type Error = UnabortableTransactionError;

    fn get_raw(&self, key: &[u8]) -> Result<Option<IVec>, UnabortableTransactionError> {
        self.get(key)
    }

    fn insert_raw(&self, key: &[u8], value: Vec<u8>) -> Result<(), UnabortableTransactionError> {
        self.insert(key, value).map(|_| ())
    }

    fn remove_raw(&self, key: &[u8]) -> Result<(), UnabortableTransactionError> {
        self.remove(key).map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Keys and records
// ---------------------------------------------------------------------------

const PENDING_KEY: &[u8] = b"pending";
pub(super) const META_LATEST_HEIGHT: &[u8] = b"latest_block_height";
pub(super) const META_POOL_SEQ: &[u8] = b"pool_seq";

pub(super) fn decode_u64(bytes: &[u8], what: &str) -> DbResult<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| DbError::Corrupt(format!("invalid {what} bytes")))?;
    Ok(u64::from_be_bytes(arr))
}

fn node_key(bits: &[u8]) -> Vec<u8> {
    let record_key = crate::state::patricia::pack_bits(bits);
    let mut key = Vec::with_capacity(4 + record_key.len());
    key.extend_from_slice(&(bits.len() as u32).to_be_bytes());
    key.extend_from_slice(&record_key);
    key
}

/// Per-asset totals split by scope. `pool` counts unconfirmed transactions,
/// `confirmed` counts committed blocks; the two are summable.
///
/// Derived from the committed state tree and the pool, and kept only for
/// cheap reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetTotals {
    pub pool: AssetState,
    pub confirmed: AssetState,
}

impl AssetTotals {
    pub fn circulation(&self) -> i64 {
        self.confirmed
            .circulation()
            .saturating_add(self.pool.circulation())
    }
}

/// Everything a block commit writes.
pub struct BlockCommit<'a> {
    pub block: &'a Block,
    pub snapshot: &'a Snapshot,
    pub spent: Vec<Outpoint>,
    pub created: Vec<Output>,
    pub asset_changes: Vec<(AssetId, AssetState)>,
}

// ---------------------------------------------------------------------------
// LedgerDB
// ---------------------------------------------------------------------------

/// Persistent storage for blocks, snapshots, the pool and derived indexes.
///
/// sled trees are safe for concurrent use, so a `LedgerDB` is shared via
/// `Arc` (or cloned: clones share the same handles).
#[derive(Debug, Clone)]
pub struct LedgerDB {
    db: Db,
    pub(super) blocks: Tree,
    block_hashes: Tree,
    pub(super) utxos: Tree,
    snapshots: Tree,
    pending_block: Tree,
    state_nodes: Tree,
    pub(super) asset_totals: Tree,
    pub(super) pool_txs: Tree,
    pub(super) pool_tx_index: Tree,
    pub(super) pool_outputs: Tree,
    pub(super) pool_inputs: Tree,
    pub(super) metadata: Tree,
    snapshot_retention: usize,
}

impl LedgerDB {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A database that lives in a temporary directory and is removed on drop.
    pub fn open_temporary() -> DbResult<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        Ok(Self {
            blocks: db.open_tree("blocks")?,
            block_hashes: db.open_tree("block_hashes")?,
            utxos: db.open_tree("utxos")?,
            snapshots: db.open_tree("snapshots")?,
            pending_block: db.open_tree("pending_block")?,
            state_nodes: db.open_tree("state_nodes")?,
            asset_totals: db.open_tree("asset_totals")?,
            pool_txs: db.open_tree("pool_txs")?,
            pool_tx_index: db.open_tree("pool_tx_index")?,
            pool_outputs: db.open_tree("pool_outputs")?,
            pool_inputs: db.open_tree("pool_inputs")?,
            metadata: db.open_tree("metadata")?,
            db,
            snapshot_retention: SNAPSHOT_RETENTION,
        })
    }

    /// Keep the `n` most recent snapshots instead of only the latest.
    pub fn with_snapshot_retention(mut self, n: usize) -> Self {
        self.snapshot_retention = n.max(1);
        self
    }

    // -- Blocks -------------------------------------------------------------

    /// Commit a block together with its state changes and snapshot.
    pub fn commit_block(&self, commit: &BlockCommit<'_>) -> DbResult<()> {
        let block = commit.block;
        let height = block.height();
        let height_key = height.to_be_bytes();
        let block_bytes = bincode::serialize(block)?;
        let snapshot_bytes = commit.snapshot.encode()?;
        let created: Vec<(Outpoint, Vec<u8>)> = commit
            .created
            .iter()
            .map(|o| Ok((o.outpoint, bincode::serialize(o)?)))
            .collect::<DbResult<_>>()?;
        let block_hash = block.hash();

        let delta = commit.snapshot.tree.delta();
        let node_writes: Vec<(Vec<u8>, Vec<u8>)> = delta
            .inserted()
            .chain(delta.updated())
            .map(|node| Ok((node_key(node.key()), encode_node(node)?)))
            .collect::<DbResult<_>>()?;
        let node_removals: Vec<Vec<u8>> = delta.deleted().map(|key| node_key(key)).collect();

        let tx_hashes: Vec<Hash> = block.transactions.iter().map(|tx| tx.hash()).collect();
        let pool_removals = self.prepare_pool_removal(&tx_hashes)?;

        let result = (
            &self.blocks,
            &self.block_hashes,
            &self.utxos,
            &self.asset_totals,
            &self.metadata,
            &self.snapshots,
            &self.pending_block,
            &self.state_nodes,
            &self.pool_txs,
            &self.pool_tx_index,
            &self.pool_outputs,
            &self.pool_inputs,
        )
            .transaction(
                |(
                    blocks,
                    hashes,
                    utxos,
                    totals,
                    meta,
                    snapshots,
                    pending,
                    nodes,
                    pool_txs,
                    pool_index,
                    pool_outputs,
                    pool_inputs,
                )| {
                    if blocks.get(&height_key[..])?.is_some() {
                        return abort(DbError::Conflict(format!("block {height} already exists")));
                    }
                    blocks.insert(&height_key[..], block_bytes.clone())?;
                    hashes.insert(&block_hash[..], &height_key[..])?;

                    for outpoint in &commit.spent {
                        utxos.remove(&outpoint.to_bytes()[..])?;
                    }
                    for (outpoint, bytes) in &created {
                        utxos.insert(&outpoint.to_bytes()[..], bytes.clone())?;
                    }

                    for (asset, delta) in &commit.asset_changes {
                        let mut current = match totals.get(&asset.as_bytes()[..])? {
                            Some(bytes) => match bincode::deserialize::<AssetTotals>(&bytes) {
                                Ok(t) => t,
                                Err(e) => return abort(e),
                            },
                            None => AssetTotals::default(),
                        };
                        if current.confirmed.merge(*asset, delta).is_err() {
                            return abort(DbError::Corrupt(format!("asset {asset} total overflow")));
                        }
                        let bytes = match bincode::serialize(&current) {
                            Ok(b) => b,
                            Err(e) => return abort(e),
                        };
                        totals.insert(&asset.as_bytes()[..], bytes)?;
                    }

                    meta.insert(META_LATEST_HEIGHT, &height_key[..])?;
                    snapshots.insert(&height_key[..], snapshot_bytes.clone())?;

                    if let Some(bytes) = pending.get(PENDING_KEY)? {
                        let stale = bincode::deserialize::<Block>(&bytes)
                            .map(|b| b.height() <= height)
                            .unwrap_or(true);
                        if stale {
                            pending.remove(PENDING_KEY)?;
                        }
                    }

                    for (key, bytes) in &node_writes {
                        nodes.insert(&key[..], bytes.clone())?;
                    }
                    for key in &node_removals {
                        nodes.remove(&key[..])?;
                    }

                    apply_pool_removal(
                        PoolTables {
                            txs: pool_txs,
                            index: pool_index,
                            outputs: pool_outputs,
                            inputs: pool_inputs,
                            totals,
                        },
                        &pool_removals,
                    )
                },
            );
        txn_result(result)?;

        self.prune_snapshots(height)?;
        info!(
            height,
            txs = block.tx_count(),
            nodes_written = node_writes.len(),
            nodes_removed = node_removals.len(),
            pool_removed = pool_removals.len(),
            hash = %hex::encode(block_hash),
            "block committed to storage"
        );
        Ok(())
    }

    pub fn get_block(&self, height: u64) -> DbResult<Option<Block>> {
        match self.blocks.get(height.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> DbResult<Option<Block>> {
        match self.block_hashes.get(hash)? {
            Some(height) => self.get_block(decode_u64(&height, "height")?),
            None => Ok(None),
        }
    }

    /// Up to `limit` blocks with height greater than `after`, ascending.
    pub fn get_blocks_after(&self, after: u64, limit: usize) -> DbResult<Vec<Block>> {
        let start = after.saturating_add(1).to_be_bytes();
        let mut out = Vec::new();
        for entry in self.blocks.range(start..).take(limit) {
            let (_, bytes) = entry?;
            out.push(bincode::deserialize(&bytes)?);
        }
        Ok(out)
    }

    /// Height of the latest committed block, `None` for an empty chain.
    pub fn latest_height(&self) -> DbResult<Option<u64>> {
        match self.metadata.get(META_LATEST_HEIGHT)? {
            Some(bytes) => Ok(Some(decode_u64(&bytes, "height")?)),
            None => Ok(None),
        }
    }

    pub fn latest_block(&self) -> DbResult<Option<Block>> {
        match self.latest_height()? {
            Some(h) => self.get_block(h),
            None => Ok(None),
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    // -- Confirmed outputs --------------------------------------------------

    pub fn get_utxo(&self, outpoint: &Outpoint) -> DbResult<Option<Output>> {
        read_output(&self.utxos, outpoint)
    }

    pub fn utxo_count(&self) -> usize {
        self.utxos.len()
    }

    pub fn asset_totals(&self, asset: &AssetId) -> DbResult<AssetTotals> {
        match self.asset_totals.get(asset.as_bytes())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(AssetTotals::default()),
        }
    }

    // -- Snapshots ----------------------------------------------------------

    /// Write a snapshot at `height`, replacing any existing one there.
    pub fn store_snapshot(&self, height: u64, snapshot: &Snapshot) -> DbResult<()> {
        let bytes = snapshot.encode()?;
        self.snapshots.insert(height.to_be_bytes(), bytes)?;
        self.prune_snapshots(height)?;
        debug!(height, root = %hex::encode(snapshot.root_hash()), "snapshot stored");
        Ok(())
    }

    /// Latest snapshot and its height; an empty snapshot at height 0 if
    /// none was ever stored.
    pub fn load_snapshot(&self) -> DbResult<(Snapshot, u64)> {
        match self.snapshots.last()? {
            Some((key, bytes)) => {
                let height = decode_u64(&key, "snapshot height")?;
                Ok((Snapshot::decode(&bytes)?, height))
            }
            None => Ok((Snapshot::default(), 0)),
        }
    }

    pub fn load_snapshot_at(&self, height: u64) -> DbResult<Option<Snapshot>> {
        match self.snapshots.get(height.to_be_bytes())? {
            Some(bytes) => Ok(Some(Snapshot::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn snapshot_heights(&self) -> DbResult<Vec<u64>> {
        self.snapshots
            .iter()
            .keys()
            .map(|k| decode_u64(&k?, "snapshot height"))
            .collect()
    }

    fn prune_snapshots(&self, latest: u64) -> DbResult<()> {
        let keep_from = latest.saturating_sub(self.snapshot_retention as u64 - 1);
        let mut batch = Batch::default();
        let mut pruned = 0usize;
        for key in self.snapshots.range(..keep_from.to_be_bytes()).keys() {
            batch.remove(key?);
            pruned += 1;
        }
        if pruned > 0 {
            self.snapshots.apply_batch(batch)?;
            debug!(pruned, keep_from, "old snapshots pruned");
        }
        Ok(())
    }

    // -- Pending block ------------------------------------------------------

    /// Record the block awaiting signatures. There is at most one.
    pub fn upsert_pending_block(&self, block: &Block) -> DbResult<()> {
        self.pending_block
            .insert(PENDING_KEY, bincode::serialize(block)?)?;
        self.pending_block.flush()?;
        Ok(())
    }

    pub fn pending_block(&self) -> DbResult<Option<Block>> {
        match self.pending_block.get(PENDING_KEY)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn clear_pending_block(&self) -> DbResult<()> {
        self.pending_block.remove(PENDING_KEY)?;
        Ok(())
    }

    // -- Incremental tree nodes ---------------------------------------------

    /// Persist only the nodes a tree changed since it was loaded.
    pub fn apply_tree_delta(&self, delta: &Delta) -> DbResult<()> {
        let mut batch = Batch::default();
        let mut written = 0usize;
        for node in delta.inserted().chain(delta.updated()) {
            batch.insert(node_key(node.key()), encode_node(node)?);
            written += 1;
        }
        let mut removed = 0usize;
        for key in delta.deleted() {
            batch.remove(node_key(key));
            removed += 1;
        }
        self.state_nodes.apply_batch(batch)?;
        debug!(written, removed, "state tree delta persisted");
        Ok(())
    }

    /// Rebuild the state tree from persisted nodes.
    pub fn load_tree(&self) -> DbResult<StateTree> {
        let mut records = Vec::with_capacity(self.state_nodes.len());
        for entry in self.state_nodes.iter() {
            let (_, bytes) = entry?;
            records.push(bincode::deserialize::<NodeRecord>(&bytes)?);
        }
        Ok(StateTree::from_nodes(records)?)
    }

    pub fn state_node_count(&self) -> usize {
        self.state_nodes.len()
    }

    // -- Utility ------------------------------------------------------------

    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn encode_node(node: &Node) -> DbResult<Vec<u8>> {
    Ok(bincode::serialize(&node.to_record())?)
}

pub(super) fn read_output(table: &Tree, outpoint: &Outpoint) -> DbResult<Option<Output>> {
    match table.get(outpoint.to_bytes())? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::patricia::Value;
    use crate::storage::block::ConsensusProgram;
    use crate::transaction::types::{AssetAmount, Issuance, Transaction, TxInput, TxOutput};

    fn asset(b: u8) -> AssetId {
        AssetId([b; 32])
    }

    fn output(tx: u8, amount: u64) -> Output {
        Output {
            outpoint: Outpoint::new([tx; 32], 0),
            asset_amount: AssetAmount {
                asset_id: asset(1),
                amount,
            },
            script: vec![0x51],
            metadata: vec![],
        }
    }

    fn issue(amount: u64, nonce: u64) -> Transaction {
        Transaction::new(
            vec![TxInput::Issue(Issuance {
                asset_id: asset(1),
                amount,
                nonce,
                expires_at_ms: u64::MAX,
                definition_hash: None,
            })],
            vec![TxOutput::new(asset(1), amount, vec![0x51])],
        )
    }

    fn chain(n: usize) -> Vec<Block> {
        let mut blocks = vec![Block::initial(1_000, ConsensusProgram::open())];
        for i in 1..n {
            let prev = &blocks[i - 1];
            blocks.push(Block::next(prev, 1_000 + i as u64, vec![], [i as u8; 32]));
        }
        blocks
    }

    fn commit(db: &LedgerDB, block: &Block, snapshot: &Snapshot) {
        db.commit_block(&BlockCommit {
            block,
            snapshot,
            spent: vec![],
            created: vec![],
            asset_changes: vec![],
        })
        .unwrap();
    }

    #[test]
    fn open_temporary_database() {
        let db = LedgerDB::open_temporary().expect("should create temp db");
        assert_eq!(db.block_count(), 0);
        assert_eq!(db.latest_height().unwrap(), None);
    }

    #[test]
    fn commit_and_read_blocks() {
        let db = LedgerDB::open_temporary().unwrap();
        let blocks = chain(4);
        for b in &blocks {
            commit(&db, b, &Snapshot::default());
        }

        assert_eq!(db.latest_height().unwrap(), Some(4));
        assert_eq!(db.get_block(2).unwrap().unwrap(), blocks[1]);
        assert_eq!(
            db.get_block_by_hash(&blocks[2].hash()).unwrap().unwrap().height(),
            3
        );
        assert!(db.get_block(99).unwrap().is_none());

        let after = db.get_blocks_after(1, 10).unwrap();
        assert_eq!(after.iter().map(Block::height).collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(db.get_blocks_after(0, 2).unwrap().len(), 2);
        assert!(db.get_blocks_after(4, 10).unwrap().is_empty());
    }

    #[test]
    fn duplicate_height_commit_is_rejected() {
        let db = LedgerDB::open_temporary().unwrap();
        let blocks = chain(1);
        commit(&db, &blocks[0], &Snapshot::default());
        let err = db
            .commit_block(&BlockCommit {
                block: &blocks[0],
                snapshot: &Snapshot::default(),
                spent: vec![],
                created: vec![],
                asset_changes: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
    }

    #[test]
    fn commit_applies_utxo_and_total_changes() {
        let db = LedgerDB::open_temporary().unwrap();
        let blocks = chain(2);
        let funding = output(1, 40);
        db.commit_block(&BlockCommit {
            block: &blocks[0],
            snapshot: &Snapshot::default(),
            spent: vec![],
            created: vec![funding.clone()],
            asset_changes: vec![(
                asset(1),
                AssetState {
                    issuance: 40,
                    ..Default::default()
                },
            )],
        })
        .unwrap();
        assert_eq!(db.get_utxo(&funding.outpoint).unwrap(), Some(funding.clone()));

        let paid = output(2, 30);
        db.commit_block(&BlockCommit {
            block: &blocks[1],
            snapshot: &Snapshot::default(),
            spent: vec![funding.outpoint],
            created: vec![paid.clone()],
            asset_changes: vec![(
                asset(1),
                AssetState {
                    destroyed: 10,
                    ..Default::default()
                },
            )],
        })
        .unwrap();

        assert!(db.get_utxo(&funding.outpoint).unwrap().is_none());
        assert!(db.get_utxo(&paid.outpoint).unwrap().is_some());
        let totals = db.asset_totals(&asset(1)).unwrap();
        assert_eq!(totals.confirmed.issuance, 40);
        assert_eq!(totals.confirmed.destroyed, 10);
        assert_eq!(totals.circulation(), 30);
    }

    #[test]
    fn snapshot_upsert_and_load_latest() {
        let db = LedgerDB::open_temporary().unwrap();
        assert_eq!(db.load_snapshot().unwrap().1, 0);

        let mut tree = StateTree::new();
        tree.insert(b"a", Value::Bytes(b"1".to_vec())).unwrap();
        let first = Snapshot::new(tree.clone());
        db.store_snapshot(5, &first).unwrap();

        tree.insert(b"b", Value::Bytes(b"2".to_vec())).unwrap();
        let second = Snapshot::new(tree);
        db.store_snapshot(5, &second).unwrap();

        let (loaded, height) = db.load_snapshot().unwrap();
        assert_eq!(height, 5);
        assert_eq!(loaded.root_hash(), second.root_hash());
        assert_eq!(db.snapshot_heights().unwrap(), vec![5]);
    }

    #[test]
    fn snapshot_retention_keeps_latest_n() {
        let db = LedgerDB::open_temporary()
            .unwrap()
            .with_snapshot_retention(2);
        for h in 1..=5 {
            db.store_snapshot(h, &Snapshot::default()).unwrap();
        }
        assert_eq!(db.snapshot_heights().unwrap(), vec![4, 5]);
        assert!(db.load_snapshot_at(3).unwrap().is_none());
    }

    #[test]
    fn pending_block_upsert_and_clear_on_commit() {
        let db = LedgerDB::open_temporary().unwrap();
        let blocks = chain(2);
        assert!(db.pending_block().unwrap().is_none());

        db.upsert_pending_block(&blocks[0]).unwrap();
        db.upsert_pending_block(&blocks[1]).unwrap();
        assert_eq!(db.pending_block().unwrap().unwrap().height(), 2);

        commit(&db, &blocks[0], &Snapshot::default());
        assert!(db.pending_block().unwrap().is_some(), "newer pending block survives");
        commit(&db, &blocks[1], &Snapshot::default());
        assert!(db.pending_block().unwrap().is_none());
    }

    #[test]
    fn tree_delta_persistence_matches_full_tree() {
        let db = LedgerDB::open_temporary().unwrap();
        let mut tree = StateTree::new();
        for i in 0u8..20 {
            tree.insert(&[i, 1], Value::Bytes(vec![i])).unwrap();
        }
        db.apply_tree_delta(&tree.take_delta()).unwrap();
        assert_eq!(db.load_tree().unwrap().root_hash(), tree.root_hash());

        for i in 0u8..10 {
            tree.delete(&[i * 2, 1]).unwrap();
        }
        tree.insert(&[3, 1], Value::Bytes(b"changed".to_vec())).unwrap();
        tree.insert(&[200, 1], Value::Hash([1u8; 32])).unwrap();
        db.apply_tree_delta(&tree.take_delta()).unwrap();

        let loaded = db.load_tree().unwrap();
        assert_eq!(loaded.root_hash(), tree.root_hash());
        assert_eq!(db.state_node_count(), tree.records().len());
    }

    #[test]
    fn commit_writes_tree_nodes_and_clears_pool_together() {
        let db = LedgerDB::open_temporary().unwrap();
        let initial = Block::initial(1_000, ConsensusProgram::open());
        commit(&db, &initial, &Snapshot::default());

        let pooled = issue(5, 1);
        let bystander = issue(7, 2);
        db.insert_pool_tx(&pooled).unwrap();
        db.insert_pool_tx(&bystander).unwrap();

        let mut tree = StateTree::new();
        tree.insert(b"k1", Value::Bytes(b"a".to_vec())).unwrap();
        tree.insert(b"k2", Value::Bytes(b"b".to_vec())).unwrap();
        let snapshot = Snapshot::new(tree);
        let block = Block::next(&initial, 2_000, vec![pooled], snapshot.root_hash());
        commit(&db, &block, &snapshot);

        assert_eq!(db.load_tree().unwrap().root_hash(), snapshot.root_hash());
        assert_eq!(db.state_node_count(), snapshot.tree.records().len());
        assert_eq!(db.pool_tx_count(), 1);
        assert_eq!(db.asset_totals(&asset(1)).unwrap().pool.issuance, 7);

        // A refused commit writes neither nodes nor pool changes.
        let mut later = snapshot.tree.clone();
        let _ = later.take_delta();
        later.insert(b"k3", Value::Bytes(b"c".to_vec())).unwrap();
        let conflicting = Block::next(&initial, 2_500, vec![bystander], later.root_hash());
        let err = db
            .commit_block(&BlockCommit {
                block: &conflicting,
                snapshot: &Snapshot::new(later),
                spent: vec![],
                created: vec![],
                asset_changes: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
        assert_eq!(db.load_tree().unwrap().root_hash(), snapshot.root_hash());
        assert_eq!(db.pool_tx_count(), 1);
    }

    #[test]
    fn reopen_preserves_blocks_and_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocks = chain(2);
        let mut tree = StateTree::new();
        tree.insert(b"k", Value::Bytes(b"v".to_vec())).unwrap();
        let snapshot = Snapshot::new(tree);
        {
            let db = LedgerDB::open(dir.path()).unwrap();
            commit(&db, &blocks[0], &Snapshot::default());
            commit(&db, &blocks[1], &snapshot);
            db.flush().unwrap();
        }
        let db = LedgerDB::open(dir.path()).unwrap();
        assert_eq!(db.latest_height().unwrap(), Some(2));
        let (loaded, height) = db.load_snapshot().unwrap();
        assert_eq!(height, 2);
        assert_eq!(loaded.root_hash(), snapshot.root_hash());
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn persisted_deltas_rebuild_the_live_tree(
            batches in prop::collection::vec(
                prop::collection::vec((prop::collection::vec(0u8..4, 2), any::<bool>()), 1..12),
                1..6,
            )
        ) {
            let db = LedgerDB::open_temporary().unwrap();
            let mut tree = StateTree::new();
            for (round, batch) in batches.into_iter().enumerate() {
                for (key, insert) in batch {
                    if insert {
                        tree.insert(&key, Value::Bytes(vec![round as u8, key[0], key[1]])).unwrap();
                    } else {
                        tree.delete(&key).unwrap();
                    }
                }
                db.apply_tree_delta(&tree.take_delta()).unwrap();

                let loaded = db.load_tree().unwrap();
                prop_assert_eq!(loaded.root_hash(), tree.root_hash());
                prop_assert_eq!(loaded.records(), tree.records());
            }
        }
    }
}
