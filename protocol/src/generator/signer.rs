//! # Block Signers
//!
//! A [`BlockSigner`] turns a candidate block into a signature over its
//! signing hash. The generator does not care where the key lives:
//!
//! - [`LocalSigner`] holds an Ed25519 keypair in process.
//! - [`RemoteSigner`] posts the block as JSON to another node's
//!   `/rpc/signer/sign-block` endpoint and reads a hex signature back.
//!
//! A local signer also serves the remote endpoint on the node that owns
//! the key, so both paths end in the same equivocation check.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{DEFAULT_SIGNER_TIMEOUT, SIGNER_RPC_PATH};
use crate::crypto::hash::Hash;
use crate::crypto::keys::{KeyError, Keypair, PublicKey, Signature};
use crate::storage::block::{Block, BlockError};

/// Heights a local signer remembers for equivocation checks.
const SIGNED_HEIGHTS_KEPT: usize = 1_024;

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("already signed a different block at height {height}")]
    Equivocation { height: u64 },

    #[error("refusing to sign malformed block: {0}")]
    Block(#[from] BlockError),

    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("remote signer answered {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("remote signer returned a bad signature: {0}")]
    BadSignature(#[from] KeyError),

    #[error("no response within {0:?}")]
    Timeout(Duration),
}

/// Body of a `sign-block` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignBlockRequest {
    pub block: Block,
}

/// Body of a successful `sign-block` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignBlockResponse {
    /// Hex-encoded Ed25519 signature.
    pub signature: String,
}

#[async_trait]
pub trait BlockSigner: Send + Sync {
    /// Key the returned signatures verify under.
    fn public_key(&self) -> PublicKey;

    async fn sign_block(&self, block: &Block) -> Result<Signature, SignerError>;
}

// ---------------------------------------------------------------------------
// LocalSigner
// ---------------------------------------------------------------------------

pub struct LocalSigner {
    keypair: Keypair,
    /// height → block hash already signed at that height.
    signed: Mutex<BTreeMap<u64, Hash>>,
}

impl LocalSigner {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            signed: Mutex::new(BTreeMap::new()),
        }
    }

    /// Sign synchronously. Signing the same block twice is allowed; signing
    /// a different block at an already-signed height is not.
    pub fn sign(&self, block: &Block) -> Result<Signature, SignerError> {
        block.verify()?;
        let height = block.height();
        let hash = block.signing_hash();

        let mut signed = self.signed.lock();
        match signed.get(&height) {
            Some(previous) if *previous != hash => {
                warn!(height, "refusing to sign a conflicting block");
                return Err(SignerError::Equivocation { height });
            }
            Some(_) => {}
            None => {
                signed.insert(height, hash);
                while signed.len() > SIGNED_HEIGHTS_KEPT {
                    signed.pop_first();
                }
            }
        }
        drop(signed);

        debug!(height, key = %self.keypair.public_key(), "block signed");
        Ok(self.keypair.sign(&hash))
    }
}

#[async_trait]
impl BlockSigner for LocalSigner {
    fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    async fn sign_block(&self, block: &Block) -> Result<Signature, SignerError> {
        self.sign(block)
    }
}

// ---------------------------------------------------------------------------
// RemoteSigner
// ---------------------------------------------------------------------------

pub struct RemoteSigner {
    endpoint: String,
    public_key: PublicKey,
    client: reqwest::Client,
}

impl RemoteSigner {
    /// `base_url` is the signer node's address, e.g. `http://10.0.0.2:8080`.
    pub fn new(base_url: &str, public_key: PublicKey) -> Result<Self, SignerError> {
        Self::with_timeout(base_url, public_key, DEFAULT_SIGNER_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: &str,
        public_key: PublicKey,
        timeout: Duration,
    ) -> Result<Self, SignerError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), SIGNER_RPC_PATH),
            public_key,
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl BlockSigner for RemoteSigner {
    fn public_key(&self) -> PublicKey {
        self.public_key
    }

    async fn sign_block(&self, block: &Block) -> Result<Signature, SignerError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&SignBlockRequest {
                block: block.clone(),
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SignerError::Remote {
                status: status.as_u16(),
                body,
            });
        }

        let body: SignBlockResponse = response.json().await?;
        Ok(Signature::from_hex(&body.signature)?)
    }
}
