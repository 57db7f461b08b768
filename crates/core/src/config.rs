//! Configuration management for Trellis.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub sigchain: SigchainConfig,
    #[serde(default)]
    pub handshake: HandshakeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub db_file: String,
    /// Hex encoded ed25519 seed; generated on first start when missing
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigchainConfig {
    /// Entries fetched per store round trip by claim cursors
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Upper bound on waiting for a single peer message
    pub step_timeout_ms: u64,
    /// Upper bound on one complete cross-sign session
    pub total_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is unset
    pub filter: String,
    pub json: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            db_file: "trellis.db".to_string(),
            key_file: None,
        }
    }
}

impl Default for SigchainConfig {
    fn default() -> Self {
        Self { page_size: 64 }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: 15_000,
            total_timeout_ms: 60_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl HandshakeConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self {
            node: NodeConfig::default(),
            sigchain: SigchainConfig::default(),
            handshake: HandshakeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sigchain.page_size == 0 {
            return Err(StoreError::Config(
                "sigchain.page_size must be positive".to_string(),
            ));
        }
        if self.handshake.step_timeout_ms == 0 || self.handshake.total_timeout_ms == 0 {
            return Err(StoreError::Config(
                "handshake timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.node.data_dir.join(&self.node.db_file)
    }

    pub fn key_path(&self) -> PathBuf {
        self.node
            .key_file
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("node.key"))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
