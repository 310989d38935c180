//! # Node Configuration
//!
//! A node reads one TOML file:
//!
//! ```toml
//! data_dir = "/var/lib/quorum"
//! listen = "0.0.0.0:9741"
//! metrics_listen = "0.0.0.0:9742"
//! quorum = 2
//!
//! [generator]
//! block_period_ms = 1000
//! signer_timeout_ms = 5000
//!
//! [ledger]
//! max_txs_per_block = 10000
//! snapshot_retention = 1
//!
//! [[signers]]
//! kind = "local"
//! key_file = "keys/generator.key"
//!
//! [[signers]]
//! kind = "remote"
//! url = "http://10.0.0.2:9741"
//! public_key = "5f1c…"
//!
//! [signer]
//! key_file = "keys/generator.key"
//! ```
//!
//! `signers` are the keys this node asks for block signatures; `quorum` and
//! their public keys form the consensus program written by `init`. The
//! optional `[signer]` table is this node's own key, served to other
//! generators at `/rpc/signer/sign-block`. Relative paths resolve against
//! the config file's directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use quorum_ledger::config::{DEFAULT_MAX_TXS_PER_BLOCK, SNAPSHOT_RETENTION};
use quorum_ledger::crypto::keys::{Keypair, PublicKey};
use quorum_ledger::GeneratorConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_metrics_listen")]
    pub metrics_listen: String,

    /// Signatures required per block, written into the first block.
    #[serde(default)]
    pub quorum: u32,

    #[serde(default)]
    pub generator: GeneratorConfig,

    #[serde(default)]
    pub ledger: LedgerSettings,

    #[serde(default)]
    pub signers: Vec<SignerEntry>,

    /// This node's own signing key, if it signs for other generators.
    #[serde(default)]
    pub signer: Option<OwnSigner>,
}

/// Engine and storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    /// Most transactions a generated block may carry.
    pub max_txs_per_block: usize,
    /// Snapshots kept behind the latest one, inclusive.
    pub snapshot_retention: usize,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            max_txs_per_block: DEFAULT_MAX_TXS_PER_BLOCK,
            snapshot_retention: SNAPSHOT_RETENTION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SignerEntry {
    Local { key_file: PathBuf },
    Remote { url: String, public_key: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnSigner {
    pub key_file: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_listen() -> String {
    "0.0.0.0:9741".into()
}

fn default_metrics_listen() -> String {
    "0.0.0.0:9742".into()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            listen: default_listen(),
            metrics_listen: default_metrics_listen(),
            quorum: 0,
            generator: GeneratorConfig::default(),
            ledger: LedgerSettings::default(),
            signers: Vec::new(),
            signer: None,
        }
    }
}

impl NodeConfig {
    /// Parse `path` and resolve relative paths against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config: NodeConfig = toml::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.data_dir);
        for entry in &mut self.signers {
            if let SignerEntry::Local { key_file } = entry {
                resolve(key_file);
            }
        }
        if let Some(own) = &mut self.signer {
            resolve(&mut own.key_file);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.quorum as usize > self.signers.len() {
            anyhow::bail!(
                "quorum {} exceeds the {} configured signers",
                self.quorum,
                self.signers.len()
            );
        }
        for entry in &self.signers {
            if let SignerEntry::Remote { public_key, .. } = entry {
                PublicKey::from_hex(public_key)
                    .with_context(|| format!("bad public key for remote signer {public_key}"))?;
            }
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("ledger")
    }
}

/// Read a hex-encoded Ed25519 secret key file.
pub fn read_key_file(path: &Path) -> Result<Keypair> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read key file {}", path.display()))?;
    Keypair::from_hex(text.trim())
        .with_context(|| format!("invalid key in {}", path.display()))
}

/// Write a secret key file readable only by its owner.
pub fn write_key_file(path: &Path, keypair: &Keypair) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    std::fs::write(path, keypair.to_hex())
        .with_context(|| format!("failed to write key file {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config_and_resolves_paths() {
        let dir = tempfile::tempdir().unwrap();
        let key = Keypair::generate();
        let path = dir.path().join("node.toml");
        std::fs::write(
            &path,
            format!(
                r#"
data_dir = "data"
quorum = 2

[generator]
block_period_ms = 250

[ledger]
max_txs_per_block = 64

[[signers]]
kind = "local"
key_file = "a.key"

[[signers]]
kind = "remote"
url = "http://10.0.0.2:9741"
public_key = "{}"

[signer]
key_file = "a.key"
"#,
                key.public_key().to_hex()
            ),
        )
        .unwrap();

        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.data_dir, dir.path().join("data"));
        assert_eq!(config.generator.block_period_ms, 250);
        assert_eq!(config.ledger.max_txs_per_block, 64);
        assert_eq!(
            config.ledger.snapshot_retention,
            LedgerSettings::default().snapshot_retention
        );
        assert_eq!(
            config.generator.signer_timeout_ms,
            GeneratorConfig::default().signer_timeout_ms
        );
        assert_eq!(config.signers.len(), 2);
        match &config.signers[0] {
            SignerEntry::Local { key_file } => assert_eq!(key_file, &dir.path().join("a.key")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(config.listen, "0.0.0.0:9741");
    }

    #[test]
    fn quorum_above_signer_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "quorum = 1\n").unwrap();
        assert!(NodeConfig::load(&path).is_err());
    }

    #[test]
    fn key_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys/k.key");
        let key = Keypair::generate();
        write_key_file(&path, &key).unwrap();
        assert_eq!(read_key_file(&path).unwrap().public_key(), key.public_key());
    }
}
