// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Quorum Ledger — Core Library
//!
//! State and consensus core for a permissioned, quorum-signed UTXO ledger.
//! A single generator assembles blocks; a fixed set of signers, named by
//! the previous block's consensus program, must sign each one before it
//! is committed.
//!
//! ## Architecture
//!
//! - **crypto** — BLAKE3 / double-SHA-256 hashing, Ed25519 keys.
//! - **transaction** — assets, outpoints, outputs, issuances, transactions.
//! - **state** — the persistent patricia tree, layered UTXO views, snapshots.
//! - **storage** — blocks, sled persistence, the transaction pool, block cache.
//! - **engine** — validation: builds, re-applies and commits blocks.
//! - **generator** — the block-production cycle and quorum signing.
//! - **config** — protocol constants.
//!
//! ## Design Philosophy
//!
//! 1. The state tree is the source of truth. Everything else in storage is
//!    an index that can be rebuilt from blocks.
//! 2. Trees are immutable values. Building the next state never disturbs
//!    the committed one.
//! 3. A block is persisted as pending before anyone is asked to sign it.

pub mod config;
pub mod crypto;
pub mod engine;
pub mod generator;
pub mod state;
pub mod storage;
pub mod transaction;

pub use engine::{BasicEngine, BlockEngine, Candidate, EngineError};
pub use generator::{Generator, GeneratorConfig, GeneratorError};
