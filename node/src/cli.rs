//! # CLI Interface
//!
//! Command-line arguments for `quorum-node`, built with `clap` derive.
//! Subcommands: `run`, `init`, `keygen`, `version`.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// Block generator and signer node for a quorum-signed ledger.
#[derive(Parser, Debug)]
#[command(
    name = "quorum-node",
    about = "Quorum ledger generator / signer node",
    version,
    propagate_version = true
)]
pub struct QuorumNodeCli {
    /// Log output format.
    #[arg(long, global = true, value_enum, env = "QUORUM_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node: HTTP API, signer endpoint and block production.
    Run(RunArgs),
    /// Create the first block from the configured signers and quorum.
    Init(InitArgs),
    /// Generate an Ed25519 signing key file.
    Keygen(KeygenArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the node configuration file (TOML).
    #[arg(long, short = 'c', env = "QUORUM_CONFIG", default_value = "quorum.toml")]
    pub config: PathBuf,

    /// Override the API listen address from the config file.
    #[arg(long, env = "QUORUM_LISTEN")]
    pub listen: Option<String>,

    /// Do not produce blocks; only serve reads and the signer endpoint.
    #[arg(long)]
    pub signer_only: bool,
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Path to the node configuration file (TOML).
    #[arg(long, short = 'c', env = "QUORUM_CONFIG", default_value = "quorum.toml")]
    pub config: PathBuf,
}

#[derive(Parser, Debug)]
pub struct KeygenArgs {
    /// Where to write the hex-encoded secret key.
    #[arg(long, short = 'o')]
    pub out: PathBuf,

    /// Overwrite an existing key file.
    #[arg(long)]
    pub force: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        QuorumNodeCli::command().debug_assert();
    }

    #[test]
    fn parses_run_with_overrides() {
        let cli = QuorumNodeCli::try_parse_from([
            "quorum-node",
            "--log-format",
            "json",
            "run",
            "-c",
            "/etc/q.toml",
            "--listen",
            "127.0.0.1:1",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormatArg::Json);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.config, PathBuf::from("/etc/q.toml"));
                assert_eq!(args.listen.as_deref(), Some("127.0.0.1:1"));
                assert!(!args.signer_only);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
