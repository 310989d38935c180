//! # Protocol Configuration & Constants
//!
//! Every fixed number the ledger core depends on lives here. Runtime knobs
//! that operators tune per deployment live in
//! [`GeneratorConfig`](crate::generator::GeneratorConfig), which takes its
//! defaults from this module.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

pub const PROTOCOL_VERSION: &str = "0.1.0";

// ---------------------------------------------------------------------------
// Block Production
// ---------------------------------------------------------------------------

/// How often the node asks the generator for a new block.
pub const DEFAULT_BLOCK_PERIOD: Duration = Duration::from_secs(1);

/// Upper bound on transactions admitted into one block.
pub const DEFAULT_MAX_TXS_PER_BLOCK: usize = 10_000;

/// How long one signer may take before its response is abandoned.
pub const DEFAULT_SIGNER_TIMEOUT: Duration = Duration::from_secs(10);

/// An issuance may not expire further than this beyond the block time.
/// Bounds how long prior issuances must be remembered.
pub const MAX_ISSUANCE_WINDOW_MS: u64 = 7 * 24 * 60 * 60 * 1_000;

/// Path remote signers serve `sign-block` on.
pub const SIGNER_RPC_PATH: &str = "/rpc/signer/sign-block";

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Recently read blocks kept in memory.
pub const BLOCK_CACHE_CAPACITY: usize = 30;

/// Snapshots kept on disk. One is enough for fast recovery.
pub const SNAPSHOT_RETENTION: usize = 1;

/// Attempts at the pool sequence compare-and-swap before giving up.
pub const POOL_SEQ_MAX_ATTEMPTS: usize = 64;

/// Most blocks returned by a single chain read.
pub const MAX_BLOCKS_PER_READ: usize = 100;
