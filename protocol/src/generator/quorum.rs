//! # Quorum Signature Collection
//!
//! Every configured signer is asked for a signature at once, each on its own
//! task. Responses come back over a channel with one slot per signer, so no
//! task ever waits on the collector. The collector matches each signature
//! to the program key it verifies under and stops at the first `quorum`
//! distinct keys, then flips a watch flag so the remaining tasks can give
//! up. Stragglers that finish anyway are ignored.
//!
//! ```text
//!   signer A ─┐
//!   signer B ─┼─► mpsc(N) ─► match key ─► distinct ≥ quorum? ─► witness
//!   signer C ─┘                                  │
//!                                                └─► cancel.send(true)
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::signer::{BlockSigner, SignerError};
use crate::crypto::keys::Signature;
use crate::storage::block::{Block, ConsensusProgram};

#[derive(Debug, thiserror::Error)]
pub enum QuorumError {
    #[error("too few signers: {configured} configured, quorum is {quorum}")]
    TooFewSigners { configured: usize, quorum: usize },

    #[error("insufficient signatures: {collected} of {quorum}")]
    InsufficientSignatures { collected: usize, quorum: usize },
}

/// Collect `program.quorum` signatures over `block` from `signers`.
///
/// The returned witness is ordered by the program's key order. A program
/// with quorum zero needs no signatures and contacts nobody.
pub async fn collect_signatures(
    signers: &[Arc<dyn BlockSigner>],
    program: &ConsensusProgram,
    block: &Block,
    signer_timeout: Duration,
) -> Result<Vec<Signature>, QuorumError> {
    let quorum = program.quorum as usize;
    if quorum == 0 {
        return Ok(Vec::new());
    }
    if signers.len() < quorum {
        return Err(QuorumError::TooFewSigners {
            configured: signers.len(),
            quorum,
        });
    }

    let message = block.signing_hash();
    let shared_block = Arc::new(block.clone());
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (result_tx, mut result_rx) = mpsc::channel(signers.len());

    for (index, signer) in signers.iter().enumerate() {
        let signer = Arc::clone(signer);
        let block = Arc::clone(&shared_block);
        let results = result_tx.clone();
        let mut cancel = cancel_rx.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = tokio::time::timeout(signer_timeout, signer.sign_block(&block)) => {
                    outcome.unwrap_or(Err(SignerError::Timeout(signer_timeout)))
                }
                _ = cancel.changed() => return,
            };
            let _ = results.send((index, outcome)).await;
        });
    }
    drop(result_tx);

    let mut satisfied: Vec<Option<Signature>> = vec![None; program.pubkeys.len()];
    let mut collected = 0;

    while let Some((index, outcome)) = result_rx.recv().await {
        let signature = match outcome {
            Ok(signature) => signature,
            Err(e) => {
                warn!(signer = index, error = %e, "signer failed");
                continue;
            }
        };

        let Some(slot) = program
            .pubkeys
            .iter()
            .position(|key| key.verify(&message, &signature))
        else {
            warn!(signer = index, "signature matches no program key, discarded");
            continue;
        };

        if satisfied[slot].is_some() {
            debug!(signer = index, key = slot, "key already satisfied, discarded");
            continue;
        }
        satisfied[slot] = Some(signature);
        collected += 1;

        if collected >= quorum {
            let _ = cancel_tx.send(true);
            break;
        }
    }

    if collected < quorum {
        return Err(QuorumError::InsufficientSignatures { collected, quorum });
    }

    info!(height = block.height(), collected, quorum, "quorum reached");
    Ok(satisfied.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{Keypair, PublicKey};
    use crate::generator::signer::LocalSigner;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Test signer with configurable delay and behavior.
    struct ScriptedSigner {
        keypair: Keypair,
        delay: Duration,
        behavior: Behavior,
        finished: AtomicBool,
    }

    enum Behavior {
        Sign,
        Fail,
        /// Sign with a key outside the program.
        Forge(Keypair),
        /// Sign as another program member.
        Impersonate(Keypair),
    }

    impl ScriptedSigner {
        fn new(keypair: Keypair, delay_ms: u64, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                keypair,
                delay: Duration::from_millis(delay_ms),
                behavior,
                finished: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl BlockSigner for ScriptedSigner {
        fn public_key(&self) -> PublicKey {
            self.keypair.public_key()
        }

        async fn sign_block(&self, block: &Block) -> Result<Signature, SignerError> {
            tokio::time::sleep(self.delay).await;
            self.finished.store(true, Ordering::SeqCst);
            let hash = block.signing_hash();
            match &self.behavior {
                Behavior::Sign => Ok(self.keypair.sign(&hash)),
                Behavior::Fail => Err(SignerError::Remote {
                    status: 503,
                    body: "unavailable".into(),
                }),
                Behavior::Forge(other) | Behavior::Impersonate(other) => Ok(other.sign(&hash)),
            }
        }
    }

    fn keys(n: usize) -> Vec<Keypair> {
        (0..n).map(|i| Keypair::from_seed(&[i as u8 + 1; 32])).collect()
    }

    fn setup(quorum: u32, keys: &[Keypair]) -> (ConsensusProgram, Block) {
        let program =
            ConsensusProgram::new(quorum, keys.iter().map(Keypair::public_key).collect()).unwrap();
        let first = Block::initial(1_000, program.clone());
        let block = Block::next(&first, 2_000, vec![], [7u8; 32]);
        (program, block)
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn two_of_three_with_one_failure() {
        let k = keys(3);
        let (program, mut block) = setup(2, &k);
        let a = ScriptedSigner::new(k[0].clone(), 0, Behavior::Sign);
        let b = ScriptedSigner::new(k[1].clone(), 5, Behavior::Fail);
        let c = ScriptedSigner::new(k[2].clone(), 30, Behavior::Sign);
        let signers: Vec<Arc<dyn BlockSigner>> = vec![a, b, c];

        let witness = collect_signatures(&signers, &program, &block, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(witness.len(), 2);
        assert!(k[0].public_key().verify(&block.signing_hash(), &witness[0]));
        assert!(k[2].public_key().verify(&block.signing_hash(), &witness[1]));

        block.witness = witness;
        assert!(block.witness_satisfies(&program));
    }

    #[tokio::test]
    async fn duplicate_key_counts_once() {
        let k = keys(3);
        let (program, block) = setup(2, &k);
        let a = ScriptedSigner::new(k[0].clone(), 0, Behavior::Sign);
        let imposter = ScriptedSigner::new(k[1].clone(), 5, Behavior::Impersonate(k[0].clone()));
        let c = ScriptedSigner::new(k[2].clone(), 0, Behavior::Fail);
        let signers: Vec<Arc<dyn BlockSigner>> = vec![a, imposter, c];

        let err = collect_signatures(&signers, &program, &block, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QuorumError::InsufficientSignatures {
                collected: 1,
                quorum: 2
            }
        ));
    }

    #[tokio::test]
    async fn foreign_signatures_are_discarded() {
        let k = keys(2);
        let (program, block) = setup(2, &k);
        let a = ScriptedSigner::new(k[0].clone(), 0, Behavior::Sign);
        let forged = ScriptedSigner::new(k[1].clone(), 0, Behavior::Forge(Keypair::generate()));
        let signers: Vec<Arc<dyn BlockSigner>> = vec![a, forged];

        assert!(collect_signatures(&signers, &program, &block, TIMEOUT)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn too_few_signers_fails_fast() {
        let k = keys(3);
        let (program, block) = setup(3, &k);
        let signers: Vec<Arc<dyn BlockSigner>> =
            vec![Arc::new(LocalSigner::new(k[0].clone()))];
        assert!(matches!(
            collect_signatures(&signers, &program, &block, TIMEOUT).await,
            Err(QuorumError::TooFewSigners {
                configured: 1,
                quorum: 3
            })
        ));
    }

    #[tokio::test]
    async fn slow_signer_is_not_waited_for() {
        let k = keys(3);
        let (program, block) = setup(2, &k);
        let slow = ScriptedSigner::new(k[0].clone(), 10_000, Behavior::Sign);
        let b = ScriptedSigner::new(k[1].clone(), 0, Behavior::Sign);
        let c = ScriptedSigner::new(k[2].clone(), 10, Behavior::Sign);
        let signers: Vec<Arc<dyn BlockSigner>> = vec![slow.clone(), b, c];

        let started = std::time::Instant::now();
        let witness = collect_signatures(&signers, &program, &block, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(witness.len(), 2);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!slow.finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn timed_out_signer_counts_as_failure() {
        let k = keys(2);
        let (program, block) = setup(2, &k);
        let a = ScriptedSigner::new(k[0].clone(), 0, Behavior::Sign);
        let slow = ScriptedSigner::new(k[1].clone(), 10_000, Behavior::Sign);
        let signers: Vec<Arc<dyn BlockSigner>> = vec![a, slow];

        let err = collect_signatures(&signers, &program, &block, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, QuorumError::InsufficientSignatures { .. }));
    }

    #[tokio::test]
    async fn open_program_needs_nobody() {
        let program = ConsensusProgram::open();
        let block = Block::initial(1, program.clone());
        let witness = collect_signatures(&[], &program, &block, TIMEOUT)
            .await
            .unwrap();
        assert!(witness.is_empty());
    }
}
