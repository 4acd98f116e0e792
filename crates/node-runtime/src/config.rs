//! # Node Configuration
//!
//! Operator configuration loaded from a TOML file, with a static default
//! for development. Per-chain protocol constants are NOT configured here:
//! they come from [`NetworkParams`] selected by the `network` field.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use shared_types::NetworkParams;
use thiserror::Error;

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config file {path}: {message}")]
    Unreadable {
        /// Offending path.
        path: String,
        /// I/O description.
        message: String,
    },

    /// The file is not valid TOML for this structure.
    #[error("cannot parse config file: {0}")]
    Unparseable(String),

    /// The `network` field names no known chain.
    #[error("unknown network '{0}' (expected mainnet, testnet, or regtest)")]
    UnknownNetwork(String),
}

/// Operator configuration for one node.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Which chain to track: mainnet, testnet, or regtest.
    pub network: String,
    /// Database and state directory.
    pub data_dir: PathBuf,
    /// Listen address for inbound peers; empty disables listening.
    pub listen: String,
    /// Peers to dial at startup, as `host:port`.
    pub connect: Vec<String>,
    /// Ask peers for compact filters.
    pub peer_filters: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: "mainnet".to_string(),
            data_dir: PathBuf::from("./data"),
            listen: "0.0.0.0:8734".to_string(),
            connect: Vec::new(),
            peer_filters: true,
        }
    }
}

impl NodeConfig {
    /// Load from a TOML file.
    ///
    /// # Config File Format
    ///
    /// ```toml
    /// network = "testnet"
    /// data_dir = "/var/lib/lantern"
    /// listen = "0.0.0.0:18734"
    /// connect = ["198.51.100.7:18734"]
    /// peer_filters = true
    /// ```
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::Unparseable(e.to_string()))
    }

    /// Resolve the per-chain constants this node runs under.
    pub fn params(&self) -> Result<NetworkParams, ConfigError> {
        match self.network.as_str() {
            "mainnet" => Ok(NetworkParams::mainnet()),
            "testnet" => Ok(NetworkParams::testnet()),
            "regtest" => Ok(NetworkParams::regtest()),
            other => Err(ConfigError::UnknownNetwork(other.to_string())),
        }
    }
}
