//! # Cryptographic Primitives
//!
//! Hashing and signing for the ledger core. Two hash functions, one
//! signature scheme:
//!
//! - **BLAKE3** for every ledger-native commitment: patricia nodes, output
//!   commitments, block signing hashes.
//! - **SHA-256** (doubled) for transaction identifiers, which travel outside
//!   the core and are compared by external tooling.
//! - **Ed25519** for quorum signatures over blocks.
//!
//! Everything here is a thin, typed wrapper around audited crates.

pub mod hash;
pub mod keys;

pub use hash::{blake3_hash, blake3_hash_multi, double_sha256, Hash, ZERO_HASH};
pub use keys::{KeyError, Keypair, PublicKey, Signature};
