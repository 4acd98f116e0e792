//! # Lantern Node Runtime
//!
//! Library surface of the node binary: configuration, production
//! adapters, and the wiring that assembles the chain-tracking subsystems.
//!
//! ## Structure
//!
//! - `config` - TOML operator configuration
//! - `adapters/` - RocksDB storage, bus sinks, store gateways, address
//!   book, transaction pool
//! - `wiring/` - `NodeRuntime`: subsystem assembly and session loops

pub mod adapters;
pub mod config;
pub mod wiring;

pub use config::{ConfigError, NodeConfig};
pub use wiring::NodeRuntime;
