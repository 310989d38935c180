//! # Transaction Module
//!
//! The UTXO vocabulary the core operates on. Transactions are built and
//! validated elsewhere; the core only needs to identify them, enumerate
//! the outputs they create and the prevouts / issuances they consume.
//!
//! ```text
//! types.rs — AssetId, Outpoint, AssetAmount, Output, Issuance, TxInput, Transaction
//! ```
//!
//! ## Design Decisions
//!
//! - Transaction hashes are `double_sha256` of the bincode encoding, so the
//!   identifier is stable across processes and independent of field order
//!   in any JSON rendering.
//! - Amounts are `u64` in the asset's smallest unit. Circulation, which may
//!   be computed as a difference, is reported as `i64`.
//! - An output whose script is [`RETIRE_SCRIPT`] destroys its value instead
//!   of creating a spendable UTXO.

pub mod types;

pub use types::{
    AssetAmount, AssetId, Issuance, Outpoint, Output, Transaction, TxInput, TxOutput,
    RETIRE_SCRIPT,
};
