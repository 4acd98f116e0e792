//! # Lantern Node
//!
//! Entry point: load configuration, assemble the runtime, serve peers
//! until interrupted.
//!
//! ```text
//!   sessions (ln-03) ──gateways──→ header chain (ln-01)
//!        │                              │
//!        │                              └──view──→ filter chain (ln-02)
//!        └───────────── events ─────────┴──→ internal / external buses
//! ```

use anyhow::{Context, Result};
use node_runtime::{NodeConfig, NodeRuntime};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => NodeConfig::load(&path).with_context(|| format!("loading {path}"))?,
        None => NodeConfig::default(),
    };

    let runtime = NodeRuntime::open(config)?;
    runtime.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Interrupt received");
    runtime.shutdown();
    Ok(())
}
