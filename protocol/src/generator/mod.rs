//! # Block Generator
//!
//! The `Generator` turns submitted transactions into quorum-signed blocks.
//! One production cycle runs these stages in order:
//!
//! ```text
//! 1. DRAIN     — swap the in-memory pool out under its lock
//! 2. GENERATE  — engine builds a candidate on the latest block + snapshot
//! 3. PERSIST   — upsert the candidate into the pending-block row
//! 4. SIGN      — collect a quorum of signatures from the configured signers
//! 5. COMMIT    — attach the witness, commit through the engine, advance tip
//! ```
//!
//! A candidate with no admitted transactions ends the cycle at stage 2.
//! Transactions the engine refuses leave the pool for good; transactions it
//! did not get to (the block was full) go back to the front of the pool.
//!
//! ## Recovery
//!
//! The pending row is written before any signer is contacted. If signing
//! falls short of quorum, or the process dies before commit, the next cycle
//! (or startup) finds the row, re-derives its snapshot and asks for
//! signatures on the same candidate again. Signers see the identical block,
//! so their equivocation checks pass.
//!
//! ## Concurrency
//!
//! Cycles are serialized by an async mutex; the tree is only ever mutated
//! by the cycle that holds it. Submissions take the pool lock just long
//! enough to push, so they never wait on a cycle.

pub mod quorum;
pub mod signer;

pub use quorum::{collect_signatures, QuorumError};
pub use signer::{
    BlockSigner, LocalSigner, RemoteSigner, SignBlockRequest, SignBlockResponse, SignerError,
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{
    BLOCK_CACHE_CAPACITY, DEFAULT_BLOCK_PERIOD, DEFAULT_SIGNER_TIMEOUT, MAX_BLOCKS_PER_READ,
};
use crate::crypto::hash::Hash;
use crate::engine::{BlockEngine, Candidate, EngineError};
use crate::state::snapshot::Snapshot;
use crate::storage::block::{Block, ConsensusProgram};
use crate::storage::cache::{BlockCache, CacheError};
use crate::storage::db::{DbError, LedgerDB};
use crate::transaction::types::Transaction;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Runtime knobs for a generator. Durations are in milliseconds so the
/// struct reads naturally from TOML.
///
/// The block size cap belongs to the engine
/// ([`BasicEngine::with_max_txs`](crate::engine::BasicEngine::with_max_txs))
/// and snapshot retention to storage
/// ([`LedgerDB::with_snapshot_retention`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub block_period_ms: u64,
    pub signer_timeout_ms: u64,
    pub block_cache_capacity: usize,
    pub max_blocks_per_read: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            block_period_ms: DEFAULT_BLOCK_PERIOD.as_millis() as u64,
            signer_timeout_ms: DEFAULT_SIGNER_TIMEOUT.as_millis() as u64,
            block_cache_capacity: BLOCK_CACHE_CAPACITY,
            max_blocks_per_read: MAX_BLOCKS_PER_READ,
        }
    }
}

impl GeneratorConfig {
    pub fn block_period(&self) -> Duration {
        Duration::from_millis(self.block_period_ms)
    }

    pub fn signer_timeout(&self) -> Duration {
        Duration::from_millis(self.signer_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Generator failures, tagged with the stage that failed.
#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("generate: {0}")]
    Generate(#[source] EngineError),

    #[error("persist: {0}")]
    Persist(#[source] DbError),

    #[error("sign: {0}")]
    Sign(#[from] QuorumError),

    #[error("commit: {0}")]
    Commit(#[source] EngineError),

    #[error("read: {0}")]
    Read(#[from] CacheError),

    #[error("transaction rejected: {0}")]
    Rejected(String),

    #[error("chain has no blocks yet")]
    NotInitialized,

    #[error("chain already initialized at height {0}")]
    AlreadyInitialized(u64),
}

pub type GeneratorResult<T> = Result<T, GeneratorError>;

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// Latest committed block and the snapshot after it.
#[derive(Clone)]
struct ChainTip {
    block: Arc<Block>,
    snapshot: Snapshot,
}

pub struct Generator {
    config: GeneratorConfig,
    db: Arc<LedgerDB>,
    engine: Arc<dyn BlockEngine>,
    signers: Vec<Arc<dyn BlockSigner>>,
    cache: BlockCache<LedgerDB>,
    pool: Mutex<Vec<Transaction>>,
    tip: RwLock<Option<ChainTip>>,
    cycle: tokio::sync::Mutex<()>,
}

impl Generator {
    /// Build a generator over existing storage.
    ///
    /// Loads the latest block and snapshot, refills the in-memory pool from
    /// the persisted pool, and retries a pending block left by an earlier
    /// run. A pending block that still lacks quorum is kept for the next
    /// cycle rather than failing startup.
    pub async fn open(
        config: GeneratorConfig,
        db: Arc<LedgerDB>,
        engine: Arc<dyn BlockEngine>,
        signers: Vec<Arc<dyn BlockSigner>>,
    ) -> GeneratorResult<Self> {
        let tip = load_tip(&db)?;
        let pooled = db.load_pool_txs().map_err(GeneratorError::Persist)?;
        let cache = BlockCache::with_capacity(Arc::clone(&db), config.block_cache_capacity);
        if let Some(tip) = &tip {
            cache.insert(Arc::clone(&tip.block));
        }

        info!(
            height = tip.as_ref().map(|t| t.block.height()),
            pooled = pooled.len(),
            signers = signers.len(),
            "generator opened"
        );

        let generator = Self {
            config,
            db,
            engine,
            signers,
            cache,
            pool: Mutex::new(pooled),
            tip: RwLock::new(tip),
            cycle: tokio::sync::Mutex::new(()),
        };

        if generator.tip().is_ok() {
            match generator.retry_pending().await {
                Ok(Some(block)) => info!(height = block.height(), "pending block recovered"),
                Ok(None) => {}
                Err(e @ GeneratorError::Sign(_)) => {
                    warn!(error = %e, "pending block still unsigned, will retry")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(generator)
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<LedgerDB> {
        &self.db
    }

    /// Commit the first block of a new chain.
    pub fn init_chain(
        &self,
        program: ConsensusProgram,
        timestamp_ms: u64,
    ) -> GeneratorResult<Arc<Block>> {
        if let Some(height) = self.latest_height() {
            return Err(GeneratorError::AlreadyInitialized(height));
        }
        let block = Block::initial(timestamp_ms, program);
        let snapshot = Snapshot::default();
        self.engine
            .commit_applied_block(&block, &snapshot)
            .map_err(GeneratorError::Commit)?;

        let block = Arc::new(block);
        self.cache.insert(Arc::clone(&block));
        *self.tip.write() = Some(ChainTip {
            block: Arc::clone(&block),
            snapshot,
        });
        info!(
            quorum = block.header.consensus_program.quorum,
            keys = block.header.consensus_program.pubkeys.len(),
            "chain initialized"
        );
        Ok(block)
    }

    /// Accept a transaction into the pool.
    ///
    /// Every prevout must be available: committed or created by a pooled
    /// transaction, and not already spent by one.
    pub fn submit(&self, tx: Transaction) -> GeneratorResult<Hash> {
        let spent: Vec<_> = tx.spent_outpoints().collect();
        let available = self
            .db
            .load_prevouts(&spent)
            .map_err(GeneratorError::Persist)?;
        if let Some(missing) = spent.iter().find(|op| !available.contains_key(op)) {
            return Err(GeneratorError::Rejected(format!(
                "prevout {missing} is unknown or already spent"
            )));
        }

        match self.db.insert_pool_tx(&tx) {
            Ok(seq) => debug!(tx = %tx.hash_hex(), seq, "transaction pooled"),
            Err(DbError::Conflict(reason)) => return Err(GeneratorError::Rejected(reason)),
            Err(e) => return Err(GeneratorError::Persist(e)),
        }

        let hash = tx.hash();
        self.pool.lock().push(tx);
        Ok(hash)
    }

    /// Run one production cycle. `Ok(None)` means nothing was committed.
    pub async fn make_block(&self) -> GeneratorResult<Option<Arc<Block>>> {
        let _cycle = self.cycle.lock().await;

        if let Some(block) = self.retry_pending_locked().await? {
            return Ok(Some(block));
        }

        let tip = self.tip()?;
        let txs = std::mem::take(&mut *self.pool.lock());
        if txs.is_empty() {
            return Ok(None);
        }

        let generated =
            self.engine
                .generate_block(&tip.block, &tip.snapshot, now_ms(), txs.clone());
        let Candidate {
            block,
            snapshot,
            rejected,
        } = match generated {
            Ok(candidate) => candidate,
            Err(e) => {
                self.requeue(txs);
                return Err(GeneratorError::Generate(e));
            }
        };

        let settled: HashSet<Hash> = block
            .transactions
            .iter()
            .map(Transaction::hash)
            .chain(rejected.iter().copied())
            .collect();
        let deferred: Vec<Transaction> = txs
            .into_iter()
            .filter(|tx| !settled.contains(&tx.hash()))
            .collect();
        if !deferred.is_empty() {
            debug!(deferred = deferred.len(), "block full, transactions kept for next cycle");
            self.requeue(deferred);
        }

        self.drop_rejected(&rejected)?;
        if block.transactions.is_empty() {
            debug!("no transactions admitted, cycle skipped");
            return Ok(None);
        }

        self.db
            .upsert_pending_block(&block)
            .map_err(GeneratorError::Persist)?;
        self.sign_and_commit(&tip, block, snapshot).await.map(Some)
    }

    /// Committed blocks above `after_height`, at most
    /// `max_blocks_per_read` of them, oldest first.
    pub async fn get_blocks(&self, after_height: u64) -> GeneratorResult<Vec<Arc<Block>>> {
        let Some(latest) = self.latest_height() else {
            return Ok(Vec::new());
        };
        let last = latest.min(after_height.saturating_add(self.config.max_blocks_per_read as u64));

        let mut blocks = Vec::new();
        for height in after_height.saturating_add(1)..=last {
            match self.cache.get(height).await? {
                Some(block) => blocks.push(block),
                None => break,
            }
        }
        Ok(blocks)
    }

    pub fn latest_height(&self) -> Option<u64> {
        self.tip.read().as_ref().map(|t| t.block.height())
    }

    pub fn latest_block(&self) -> Option<Arc<Block>> {
        self.tip.read().as_ref().map(|t| Arc::clone(&t.block))
    }

    /// State root committed by the latest block.
    pub fn state_root(&self) -> Option<Hash> {
        self.tip.read().as_ref().map(|t| t.snapshot.root_hash())
    }

    /// Transactions waiting for the next cycle.
    pub fn pool_len(&self) -> usize {
        self.pool.lock().len()
    }

    /// Produce blocks every `block_period` until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(period_ms = self.config.block_period_ms, "block production starting");
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.make_block().await {
                Ok(Some(block)) => debug!(height = block.height(), "cycle committed a block"),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "block production cycle failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.block_period()) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("block production stopped");
    }

    // -- internals ----------------------------------------------------------

    fn tip(&self) -> GeneratorResult<ChainTip> {
        self.tip.read().clone().ok_or(GeneratorError::NotInitialized)
    }

    async fn retry_pending(&self) -> GeneratorResult<Option<Arc<Block>>> {
        let _cycle = self.cycle.lock().await;
        self.retry_pending_locked().await
    }

    /// Re-sign and commit the pending block if it extends the tip. A stale
    /// row is cleared. Caller holds the cycle lock.
    async fn retry_pending_locked(&self) -> GeneratorResult<Option<Arc<Block>>> {
        let Some(pending) = self.db.pending_block().map_err(GeneratorError::Persist)? else {
            return Ok(None);
        };
        let tip = self.tip()?;

        if pending.height() != tip.block.height() + 1 {
            warn!(
                pending = pending.height(),
                latest = tip.block.height(),
                "discarding stale pending block"
            );
            self.db
                .clear_pending_block()
                .map_err(GeneratorError::Persist)?;
            return Ok(None);
        }

        info!(height = pending.height(), "retrying pending block");
        let snapshot = self
            .engine
            .apply_block(&tip.block, &tip.snapshot, &pending)
            .map_err(GeneratorError::Generate)?;
        let block = self.sign_and_commit(&tip, pending, snapshot).await?;
        self.forget_committed(&block);
        Ok(Some(block))
    }

    async fn sign_and_commit(
        &self,
        tip: &ChainTip,
        mut block: Block,
        mut snapshot: Snapshot,
    ) -> GeneratorResult<Arc<Block>> {
        block.witness = collect_signatures(
            &self.signers,
            &tip.block.header.consensus_program,
            &block,
            self.config.signer_timeout(),
        )
        .await?;

        self.engine
            .commit_applied_block(&block, &snapshot)
            .map_err(GeneratorError::Commit)?;
        // Persisted; later blocks track their own changes.
        let _ = snapshot.tree.take_delta();

        let block = Arc::new(block);
        self.cache.insert(Arc::clone(&block));
        *self.tip.write() = Some(ChainTip {
            block: Arc::clone(&block),
            snapshot,
        });
        info!(
            height = block.height(),
            txs = block.tx_count(),
            signatures = block.witness.len(),
            "block committed"
        );
        Ok(block)
    }

    /// Remove transactions the engine refused from the persisted pool;
    /// they would otherwise hold their input claims forever.
    fn drop_rejected(&self, rejected: &[Hash]) -> GeneratorResult<()> {
        if rejected.is_empty() {
            return Ok(());
        }
        let removed = self
            .db
            .remove_pool_txs(rejected)
            .map_err(GeneratorError::Persist)?;
        debug!(removed, "rejected transactions dropped from pool");
        Ok(())
    }

    /// Put transactions back at the front of the in-memory pool, ahead of
    /// anything submitted while they were out.
    fn requeue(&self, mut txs: Vec<Transaction>) {
        let mut pool = self.pool.lock();
        txs.append(&mut pool);
        *pool = txs;
    }

    /// Drop transactions `block` committed from the in-memory pool. After a
    /// restart the pool is refilled before a pending block is recovered, so
    /// it can still hold that block's transactions.
    fn forget_committed(&self, block: &Block) {
        let committed: HashSet<Hash> = block.transactions.iter().map(Transaction::hash).collect();
        let mut pool = self.pool.lock();
        let before = pool.len();
        pool.retain(|tx| !committed.contains(&tx.hash()));
        if pool.len() < before {
            debug!(dropped = before - pool.len(), "committed transactions left the pool");
        }
    }
}

fn load_tip(db: &LedgerDB) -> GeneratorResult<Option<ChainTip>> {
    let Some(block) = db.latest_block().map_err(GeneratorError::Persist)? else {
        return Ok(None);
    };
    let (snapshot, height) = db.load_snapshot().map_err(GeneratorError::Persist)?;
    if height != block.height() {
        return Err(GeneratorError::Persist(DbError::Corrupt(format!(
            "latest snapshot is at height {height}, latest block at {}",
            block.height()
        ))));
    }
    Ok(Some(ChainTip {
        block: Arc::new(block),
        snapshot,
    }))
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
