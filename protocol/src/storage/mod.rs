//! # Storage Module
//!
//! Durable storage for the ledger.
//!
//! ## Architecture
//!
//! ```text
//! block.rs  — Block structure, consensus program, signing hash
//! db.rs     — LedgerDB: blocks, snapshots, pending block, tree nodes
//! pool.rs   — unconfirmed transactions, outputs and input claims
//! cache.rs  — LRU block cache with single-flight misses
//! ```
//!
//! ## Design Decisions
//!
//! 1. **sled trees as tables.** Each kind of record gets its own tree, and
//!    writes that must agree (a block and its utxo changes, a pool tx and
//!    its input claims) go through a multi-tree sled transaction.
//!
//! 2. **Bincode for on-disk serialization.** Compact, fast, deterministic.
//!    JSON is for the HTTP surface; bincode is for storage.
//!
//! 3. **The state tree is authoritative.** `asset_totals` and `utxos` are
//!    indexes for cheap reads; the committed snapshot tree is what block
//!    headers commit to.

pub mod block;
pub mod cache;
pub mod db;
pub mod pool;

pub use block::{Block, BlockError, BlockHeader, ConsensusProgram};
pub use cache::{BlockCache, BlockSource, CacheError};
pub use db::{AssetTotals, BlockCommit, DbError, DbResult, LedgerDB};
pub use pool::tx_asset_changes;
