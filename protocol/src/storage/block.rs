//! # Block Structure
//!
//! A block commits an ordered list of transactions and the state root that
//! results from applying them. Each block also names the consensus program
//! (a quorum of signer public keys) that must sign its *successor*.
//!
//! ## Block Layout
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  BlockHeader                                  │
//! │  ├── version: u32                             │
//! │  ├── height: u64             (first block = 1)│
//! │  ├── previous_block_hash: [u8; 32]            │
//! │  ├── timestamp_ms: u64                        │
//! │  ├── state_root: [u8; 32]                     │
//! │  ├── transactions_root: [u8; 32]              │
//! │  └── consensus_program: ConsensusProgram      │
//! ├───────────────────────────────────────────────┤
//! │  transactions: Vec<Transaction>               │
//! ├───────────────────────────────────────────────┤
//! │  witness: Vec<Signature>                      │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Hash Computation
//!
//! The block hash is BLAKE3 over the header fields only. The witness is
//! excluded: signers sign the hash, so the hash cannot cover the
//! signatures. The hash is therefore also the signing hash.

use serde::{Deserialize, Serialize};

use crate::crypto::hash::{blake3_hash, blake3_hash_multi, Hash, ZERO_HASH};
use crate::crypto::keys::{PublicKey, Signature};
use crate::transaction::Transaction;

/// Block format version written by this crate.
pub const BLOCK_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error("block {height}: transactions root mismatch")]
    TransactionsRoot { height: u64 },

    #[error("first block must have height 1 and a zero previous hash")]
    BadFirstBlock,

    #[error("quorum {quorum} exceeds {keys} program keys")]
    QuorumTooLarge { quorum: u32, keys: usize },
}

// ---------------------------------------------------------------------------
// ConsensusProgram
// ---------------------------------------------------------------------------

/// `quorum`-of-`pubkeys` multisig that authorizes the next block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusProgram {
    pub quorum: u32,
    pub pubkeys: Vec<PublicKey>,
}

impl ConsensusProgram {
    pub fn new(quorum: u32, pubkeys: Vec<PublicKey>) -> Result<Self, BlockError> {
        if quorum as usize > pubkeys.len() {
            return Err(BlockError::QuorumTooLarge {
                quorum,
                keys: pubkeys.len(),
            });
        }
        Ok(Self { quorum, pubkeys })
    }

    /// A program that needs no signatures. Only useful for single-node
    /// development chains.
    pub fn open() -> Self {
        Self {
            quorum: 0,
            pubkeys: Vec::new(),
        }
    }

    fn hash(&self) -> Hash {
        let mut preimage = Vec::with_capacity(4 + self.pubkeys.len() * 32);
        preimage.extend_from_slice(&self.quorum.to_be_bytes());
        for key in &self.pubkeys {
            preimage.extend_from_slice(key.as_bytes());
        }
        blake3_hash(&preimage)
    }

    /// Number of distinct program keys with a valid signature over `message`.
    pub fn count_satisfied(&self, message: &[u8], signatures: &[Signature]) -> usize {
        self.pubkeys
            .iter()
            .filter(|key| signatures.iter().any(|sig| key.verify(message, sig)))
            .count()
    }
}

// ---------------------------------------------------------------------------
// BlockHeader / Block
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub height: u64,
    /// All zeros for the first block.
    pub previous_block_hash: Hash,
    pub timestamp_ms: u64,
    /// Root of the state tree after applying this block.
    pub state_root: Hash,
    pub transactions_root: Hash,
    /// Signers required for the next block.
    pub consensus_program: ConsensusProgram,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    /// Signatures over [`signing_hash`](Self::signing_hash), ordered by the
    /// previous block's program keys.
    pub witness: Vec<Signature>,
}

impl Block {
    /// The first block of a chain. It carries no transactions and needs no
    /// signatures; it only establishes the consensus program.
    pub fn initial(timestamp_ms: u64, consensus_program: ConsensusProgram) -> Self {
        Self {
            header: BlockHeader {
                version: BLOCK_VERSION,
                height: 1,
                previous_block_hash: ZERO_HASH,
                timestamp_ms,
                state_root: ZERO_HASH,
                transactions_root: ZERO_HASH,
                consensus_program,
            },
            transactions: Vec::new(),
            witness: Vec::new(),
        }
    }

    /// A block extending `previous`. The consensus program is inherited.
    pub fn next(
        previous: &Block,
        timestamp_ms: u64,
        transactions: Vec<Transaction>,
        state_root: Hash,
    ) -> Self {
        Self {
            header: BlockHeader {
                version: BLOCK_VERSION,
                height: previous.height() + 1,
                previous_block_hash: previous.hash(),
                timestamp_ms,
                state_root,
                transactions_root: compute_transactions_root(&transactions),
                consensus_program: previous.header.consensus_program.clone(),
            },
            transactions,
            witness: Vec::new(),
        }
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn hash(&self) -> Hash {
        let h = &self.header;
        blake3_hash_multi(&[
            b"block",
            &h.version.to_be_bytes(),
            &h.height.to_be_bytes(),
            &h.previous_block_hash,
            &h.timestamp_ms.to_be_bytes(),
            &h.state_root,
            &h.transactions_root,
            &h.consensus_program.hash(),
        ])
    }

    /// What quorum signers sign.
    pub fn signing_hash(&self) -> Hash {
        self.hash()
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash())
    }

    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }

    /// Structural checks that need no other block.
    pub fn verify(&self) -> Result<(), BlockError> {
        if compute_transactions_root(&self.transactions) != self.header.transactions_root {
            return Err(BlockError::TransactionsRoot {
                height: self.header.height,
            });
        }
        if self.header.previous_block_hash == ZERO_HASH && self.header.height != 1 {
            return Err(BlockError::BadFirstBlock);
        }
        Ok(())
    }

    /// Whether the witness satisfies `program` (the previous block's).
    pub fn witness_satisfies(&self, program: &ConsensusProgram) -> bool {
        let satisfied = program.count_satisfied(&self.signing_hash(), &self.witness);
        satisfied >= program.quorum as usize
    }
}

// ---------------------------------------------------------------------------
// Merkle Tree
// ---------------------------------------------------------------------------

/// Binary Merkle root over transaction hashes.
///
/// Empty list → zero hash. An odd node at any level is paired with itself.
pub fn compute_transactions_root(transactions: &[Transaction]) -> Hash {
    if transactions.is_empty() {
        return ZERO_HASH;
    }

    let mut hashes: Vec<Hash> = transactions.iter().map(Transaction::hash).collect();
    while hashes.len() > 1 {
        hashes = hashes
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).unwrap_or(&pair[0]);
                blake3_hash_multi(&[&pair[0], right])
            })
            .collect();
    }
    hashes[0]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
