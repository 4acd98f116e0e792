//! # Outbound Ports (Driven Ports)
//!
//! The filter chain consumes the header chain through a narrow read-only
//! view and persists through the same `KeyValueStore` contract the header
//! store defines. Production adapters live in node-runtime.

use parking_lot::RwLock;
use shared_types::{ChainPosition, Hash};

// Layer compliant: the KV contract is defined once, by the header store.
pub use ln_01_header_chain::ports::outbound::{BatchOperation, ChainEventSink, KeyValueStore};

/// Read-only view of the header chain the filter chain reconciles against.
pub trait HeaderChainView: Send + Sync {
    /// Current header-chain tip.
    fn tip(&self) -> ChainPosition;

    /// Best-chain hash at `height`, if the index reaches that far.
    fn hash_at(&self, height: i64) -> Option<Hash>;
}

/// Scriptable header-chain view for unit tests.
#[derive(Default)]
pub struct StaticHeaderChain {
    chain: RwLock<Vec<Hash>>,
}

impl StaticHeaderChain {
    /// A view over `hashes`, index = height.
    pub fn new(hashes: Vec<Hash>) -> Self {
        Self {
            chain: RwLock::new(hashes),
        }
    }

    /// Replace the chain contents (simulates a header-chain reorg).
    pub fn set_chain(&self, hashes: Vec<Hash>) {
        *self.chain.write() = hashes;
    }

    /// Append one hash at the next height.
    pub fn push(&self, hash: Hash) {
        self.chain.write().push(hash);
    }
}

impl HeaderChainView for StaticHeaderChain {
    fn tip(&self) -> ChainPosition {
        let chain = self.chain.read();
        match chain.last() {
            Some(hash) => ChainPosition::new(chain.len() as i64 - 1, *hash),
            None => ChainPosition::sentinel(),
        }
    }

    fn hash_at(&self, height: i64) -> Option<Hash> {
        if height < 0 {
            return None;
        }
        self.chain.read().get(height as usize).copied()
    }
}
