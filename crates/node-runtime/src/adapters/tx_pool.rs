//! # In-Memory Transaction Pool
//!
//! Default implementation of the opaque relay-pool collaborator. The real
//! platform plugs its own pool in through the same trait; sessions only
//! ever see query/submit/dump.

use std::collections::HashMap;

use async_trait::async_trait;
use ln_03_peer_protocol::{ProtocolError, TransactionPool};
use parking_lot::RwLock;
use shared_types::{Hash, Transaction};
use tracing::debug;

/// Bound on pooled transactions; oldest entries fall out first.
const DEFAULT_POOL_CAP: usize = 5_000;

/// A bounded map-backed pool.
pub struct InMemoryTxPool {
    entries: RwLock<HashMap<Hash, Transaction>>,
    insertion_order: RwLock<Vec<Hash>>,
    cap: usize,
}

impl InMemoryTxPool {
    /// An empty pool with the default bound.
    pub fn new() -> Self {
        Self::with_cap(DEFAULT_POOL_CAP)
    }

    /// An empty pool bounded at `cap` transactions.
    pub fn with_cap(cap: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            insertion_order: RwLock::new(Vec::new()),
            cap,
        }
    }

    /// Number of pooled transactions.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for InMemoryTxPool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionPool for InMemoryTxPool {
    async fn query(&self, txid: Hash) -> Result<Option<Transaction>, ProtocolError> {
        Ok(self.entries.read().get(&txid).cloned())
    }

    async fn submit(&self, tx: Transaction) -> Result<(), ProtocolError> {
        let txid = tx.txid();
        let mut entries = self.entries.write();
        let mut order = self.insertion_order.write();

        if entries.contains_key(&txid) {
            return Ok(());
        }
        if entries.len() >= self.cap {
            if let Some(oldest) = order.first().copied() {
                entries.remove(&oldest);
                order.remove(0);
            }
        }
        entries.insert(txid, tx);
        order.push(txid);
        debug!(pooled = entries.len(), "Transaction pooled");
        Ok(())
    }

    async fn dump(&self) -> Result<Vec<Hash>, ProtocolError> {
        Ok(self.insertion_order.read().clone())
    }
}
