// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Quorum Ledger Node
//!
//! Entry point for the `quorum-node` binary. Parses CLI arguments, sets up
//! logging and metrics, opens the ledger, and runs block production next to
//! the HTTP API.
//!
//! - `run`     — serve the API and produce blocks
//! - `init`    — write the first block from the configured signer set
//! - `keygen`  — create a signing key file
//! - `version` — print build version information

mod api;
mod cli;
mod config;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;

use quorum_ledger::crypto::keys::{Keypair, PublicKey};
use quorum_ledger::engine::{BasicEngine, BlockEngine};
use quorum_ledger::generator::{BlockSigner, LocalSigner, RemoteSigner};
use quorum_ledger::storage::{ConsensusProgram, LedgerDB};
use quorum_ledger::Generator;

use cli::{Commands, QuorumNodeCli};
use config::{read_key_file, write_key_file, NodeConfig, SignerEntry};
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = QuorumNodeCli::parse();
    logging::init_logging(logging::DEFAULT_FILTER, cli.log_format.into());

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_chain(args).await,
        Commands::Keygen(args) => keygen(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Signers built from config. A key that is both in the signer list and
/// this node's own signer maps to one `LocalSigner`, so both paths share
/// its equivocation record.
struct Signers {
    ordered: Vec<Arc<dyn BlockSigner>>,
    own: Option<Arc<LocalSigner>>,
}

fn load_signers(config: &NodeConfig) -> Result<Signers> {
    let mut locals: HashMap<PublicKey, Arc<LocalSigner>> = HashMap::new();
    let mut local = |keypair: Keypair| {
        Arc::clone(
            locals
                .entry(keypair.public_key())
                .or_insert_with(|| Arc::new(LocalSigner::new(keypair))),
        )
    };

    let own = match &config.signer {
        Some(own) => Some(local(read_key_file(&own.key_file)?)),
        None => None,
    };

    let mut ordered: Vec<Arc<dyn BlockSigner>> = Vec::with_capacity(config.signers.len());
    for entry in &config.signers {
        let signer: Arc<dyn BlockSigner> = match entry {
            SignerEntry::Local { key_file } => local(read_key_file(key_file)?),
            SignerEntry::Remote { url, public_key } => {
                let key = PublicKey::from_hex(public_key)
                    .with_context(|| format!("bad public key for {url}"))?;
                Arc::new(
                    RemoteSigner::with_timeout(url, key, config.generator.signer_timeout())
                        .with_context(|| format!("failed to build client for {url}"))?,
                )
            }
        };
        ordered.push(signer);
    }
    Ok(Signers { ordered, own })
}

async fn open_generator(config: &NodeConfig, signers: Vec<Arc<dyn BlockSigner>>) -> Result<Generator> {
    let db_path = config.db_path();
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory {}", db_path.display()))?;
    let db = Arc::new(
        LedgerDB::open(&db_path)
            .with_context(|| format!("failed to open ledger at {}", db_path.display()))?
            .with_snapshot_retention(config.ledger.snapshot_retention),
    );
    tracing::info!(path = %db_path.display(), "ledger opened");

    let engine: Arc<dyn BlockEngine> = Arc::new(
        BasicEngine::new(Arc::clone(&db)).with_max_txs(config.ledger.max_txs_per_block),
    );
    Generator::open(config.generator.clone(), db, engine, signers)
        .await
        .context("failed to open generator")
}

/// Serve the API and, unless `--signer-only`, produce blocks until a
/// shutdown signal arrives.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    let mut config = NodeConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let signers = load_signers(&config)?;
    let generator = Arc::new(open_generator(&config, signers.ordered).await?);
    if generator.latest_height().is_none() && !args.signer_only {
        anyhow::bail!("chain not initialized; run `quorum-node init` first");
    }

    tracing::info!(
        listen = %config.listen,
        metrics = %config.metrics_listen,
        height = generator.latest_height(),
        signs_blocks = signers.own.is_some(),
        "starting quorum-node"
    );

    let metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);
    let state = api::AppState {
        version: format!(
            "{} (protocol {})",
            env!("CARGO_PKG_VERSION"),
            quorum_ledger::config::PROTOCOL_VERSION,
        ),
        generator: Arc::clone(&generator),
        signer: signers.own,
        metrics,
    };

    let api_listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind API listener on {}", config.listen))?;
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(state.clone());
    let metrics_listener = tokio::net::TcpListener::bind(&config.metrics_listen)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", config.metrics_listen))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let producer = (!args.signer_only).then(|| tokio::spawn(Arc::clone(&generator).run(shutdown_rx)));

    tokio::select! {
        res = axum::serve(api_listener, api::create_router(state)) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "API server error");
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "metrics server error");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(producer) = producer {
        if let Err(e) = producer.await {
            tracing::error!(error = %e, "block production task failed");
        }
    }
    generator.db().flush().context("failed to flush ledger")?;
    tracing::info!("quorum-node stopped");
    Ok(())
}

/// Commit the first block. Its consensus program is the configured
/// signers' public keys with the configured quorum.
async fn init_chain(args: cli::InitArgs) -> Result<()> {
    let config = NodeConfig::load(&args.config)?;
    let signers = load_signers(&config)?;
    let pubkeys: Vec<PublicKey> = signers.ordered.iter().map(|s| s.public_key()).collect();
    let program = ConsensusProgram::new(config.quorum, pubkeys).context("invalid signer set")?;

    let generator = open_generator(&config, signers.ordered).await?;
    let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let block = generator
        .init_chain(program, now)
        .context("failed to write the first block")?;
    generator.db().flush().context("failed to flush ledger")?;

    println!("Chain initialized.");
    println!("  Ledger   : {}", config.db_path().display());
    println!("  Height   : {}", block.height());
    println!("  Hash     : {}", block.hash_hex());
    println!(
        "  Quorum   : {} of {}",
        block.header.consensus_program.quorum,
        block.header.consensus_program.pubkeys.len()
    );
    Ok(())
}

fn keygen(args: cli::KeygenArgs) -> Result<()> {
    if args.out.exists() && !args.force {
        anyhow::bail!("{} exists; pass --force to overwrite", args.out.display());
    }
    let keypair = Keypair::generate();
    write_key_file(&args.out, &keypair)?;
    tracing::info!(key_path = %args.out.display(), "signing key generated");

    println!("Key file   : {}", args.out.display());
    println!("Public key : {}", keypair.public_key().to_hex());
    Ok(())
}

fn print_version() {
    println!("quorum-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol    {}", quorum_ledger::config::PROTOCOL_VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
