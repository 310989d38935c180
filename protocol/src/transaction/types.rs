//! Core type definitions for ledger transactions.
//!
//! `Outpoint` and `AssetId` are used as map keys everywhere in the core, so
//! both are `Copy` and `Ord`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::hash::{blake3_hash_multi, double_sha256, Hash};

/// Control program that marks an output as a retirement (value destroyed).
pub const RETIRE_SCRIPT: &[u8] = &[0x6a];

// ---------------------------------------------------------------------------
// AssetId
// ---------------------------------------------------------------------------

/// Identifier of an issued asset.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId(pub Hash);

impl AssetId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssetId({})", &self.to_hex()[..16])
    }
}

// ---------------------------------------------------------------------------
// Outpoint
// ---------------------------------------------------------------------------

/// Identifies a specific output: `(transaction_hash, output_index)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Outpoint {
    pub tx_hash: Hash,
    pub index: u32,
}

impl Outpoint {
    /// Serialized length: 32-byte hash + 4-byte big-endian index.
    pub const ENCODED_LEN: usize = 36;

    pub fn new(tx_hash: Hash, index: u32) -> Self {
        Self { tx_hash, index }
    }

    /// Fixed-width encoding used for storage keys and tree keys.
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..32].copy_from_slice(&self.tx_hash);
        out[32..].copy_from_slice(&self.index.to_be_bytes());
        out
    }

    /// Inverse of [`to_bytes`](Self::to_bytes). Returns `None` on a length mismatch.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        let mut tx_hash = [0u8; 32];
        tx_hash.copy_from_slice(&bytes[..32]);
        let index = u32::from_be_bytes(bytes[32..].try_into().ok()?);
        Some(Self { tx_hash, index })
    }
}

impl fmt::Display for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hex::encode(self.tx_hash), self.index)
    }
}

impl fmt::Debug for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Outpoint({}:{})", &hex::encode(self.tx_hash)[..16], self.index)
    }
}

// ---------------------------------------------------------------------------
// AssetAmount / Output
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetAmount {
    pub asset_id: AssetId,
    pub amount: u64,
}

/// An output as it appears in a transaction body, before it has an outpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub asset_amount: AssetAmount,
    /// Control program that must be satisfied to spend this output.
    pub script: Vec<u8>,
    pub metadata: Vec<u8>,
}

impl TxOutput {
    pub fn new(asset_id: AssetId, amount: u64, script: Vec<u8>) -> Self {
        Self {
            asset_amount: AssetAmount { asset_id, amount },
            script,
            metadata: Vec::new(),
        }
    }

    pub fn is_retirement(&self) -> bool {
        self.script == RETIRE_SCRIPT
    }
}

/// A spendable (or spent) unit of value in the state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub outpoint: Outpoint,
    pub asset_amount: AssetAmount,
    pub script: Vec<u8>,
    pub metadata: Vec<u8>,
}

impl Output {
    pub fn asset_id(&self) -> AssetId {
        self.asset_amount.asset_id
    }

    pub fn amount(&self) -> u64 {
        self.asset_amount.amount
    }

    /// Fixed-size commitment stored in the state tree.
    ///
    /// Covers the outpoint, the asset amount and the script, so a stale or
    /// substituted output never matches the committed leaf.
    pub fn commitment(&self) -> Hash {
        blake3_hash_multi(&[
            b"output",
            &self.outpoint.to_bytes(),
            self.asset_amount.asset_id.as_bytes(),
            &self.asset_amount.amount.to_be_bytes(),
            &self.script,
        ])
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// New units of an asset entering circulation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issuance {
    pub asset_id: AssetId,
    pub amount: u64,
    /// Distinguishes otherwise identical issuances.
    pub nonce: u64,
    /// After this time (ms since epoch) the issuance can no longer be
    /// included, which is what bounds the prior-issuance replay set.
    pub expires_at_ms: u64,
    /// Hash of the asset definition, recorded as the definition pointer.
    pub definition_hash: Option<Hash>,
}

impl Issuance {
    /// Replay-protection key recorded in the snapshot's prior issuances.
    pub fn hash(&self) -> Hash {
        blake3_hash_multi(&[
            b"issuance",
            self.asset_id.as_bytes(),
            &self.amount.to_be_bytes(),
            &self.nonce.to_be_bytes(),
            &self.expires_at_ms.to_be_bytes(),
        ])
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxInput {
    /// Consume an existing output.
    Spend { prevout: Outpoint },
    /// Create new units of an asset.
    Issue(Issuance),
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub reference_data: Vec<u8>,
}

impl Transaction {
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Self {
            version: 1,
            inputs,
            outputs,
            reference_data: Vec::new(),
        }
    }

    /// `double_sha256` of the bincode encoding.
    pub fn hash(&self) -> Hash {
        // Serializing plain structs and vectors cannot fail.
        let bytes = bincode::serialize(self).unwrap_or_default();
        double_sha256(&bytes)
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash())
    }

    /// Prevouts this transaction consumes.
    pub fn spent_outpoints(&self) -> impl Iterator<Item = Outpoint> + '_ {
        self.inputs.iter().filter_map(|input| match input {
            TxInput::Spend { prevout } => Some(*prevout),
            TxInput::Issue(_) => None,
        })
    }

    pub fn issuances(&self) -> impl Iterator<Item = &Issuance> + '_ {
        self.inputs.iter().filter_map(|input| match input {
            TxInput::Issue(iss) => Some(iss),
            TxInput::Spend { .. } => None,
        })
    }

    /// Outputs this transaction adds to the state, with their outpoints.
    /// Retirements are excluded.
    pub fn created_outputs(&self) -> Vec<Output> {
        let tx_hash = self.hash();
        self.outputs
            .iter()
            .enumerate()
            .filter(|(_, out)| !out.is_retirement())
            .map(|(i, out)| Output {
                outpoint: Outpoint::new(tx_hash, i as u32),
                asset_amount: out.asset_amount,
                script: out.script.clone(),
                metadata: out.metadata.clone(),
            })
            .collect()
    }

    pub fn retirements(&self) -> impl Iterator<Item = &AssetAmount> + '_ {
        self.outputs
            .iter()
            .filter(|out| out.is_retirement())
            .map(|out| &out.asset_amount)
    }
}
