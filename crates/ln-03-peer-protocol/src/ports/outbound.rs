//! # Outbound Ports (Driven Ports)
//!
//! A session never touches a store directly: every query is an async
//! request/response through these gateway traits, so one slow store call
//! cannot stall another peer's event processing. Production adapters
//! (bus-backed store clients, the TCP sink) live in node-runtime and
//! `adapters/`; the mocks below serve unit tests.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use shared_types::{BlockHeader, ChainPosition, Hash, Transaction, U256};
use std::collections::HashMap;
use std::sync::Arc;

use ln_01_header_chain::{ChainUpdate, HeaderRecord};
use ln_02_filter_chain::CompactFilter;

use crate::domain::errors::ProtocolError;
use crate::domain::message::WireMessage;

/// Outbound half of the transport: frames and sends one message.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Send one message to the peer.
    async fn send(&self, message: WireMessage) -> Result<(), ProtocolError>;

    /// Release the transport handle. Idempotent.
    async fn close(&self);
}

/// Async request/response view of the header-chain store.
#[async_trait]
pub trait HeaderChainGateway: Send + Sync {
    /// Current tip.
    async fn best(&self) -> Result<ChainPosition, ProtocolError>;

    /// Trusted checkpoint; sentinel when unset.
    async fn checkpoint(&self) -> Result<ChainPosition, ProtocolError>;

    /// Most-recent-first locator hashes.
    async fn recent_hashes(&self, limit: usize) -> Result<Vec<Hash>, ProtocolError>;

    /// Load a stored header.
    async fn load_header(&self, hash: Hash) -> Result<Option<BlockHeader>, ProtocolError>;

    /// Load a header's metadata record.
    async fn load_record(&self, hash: Hash) -> Result<Option<HeaderRecord>, ProtocolError>;

    /// Best-chain hash at a height.
    async fn best_hash_at(&self, height: i64) -> Result<Option<Hash>, ProtocolError>;

    /// Height of `hash` when it sits on the best chain.
    async fn height_of(&self, hash: Hash) -> Result<Option<i64>, ProtocolError>;

    /// Submit one atomic update.
    async fn apply_update(&self, update: ChainUpdate) -> Result<(), ProtocolError>;
}

/// Async request/response view of the filter-chain store.
#[async_trait]
pub trait FilterChainGateway: Send + Sync {
    /// Current cfheader tip.
    async fn cfheader_tip(&self) -> Result<ChainPosition, ProtocolError>;

    /// Current cfilter tip.
    async fn cfilter_tip(&self) -> Result<ChainPosition, ProtocolError>;

    /// Stored filter header for a block.
    async fn load_cfheader(&self, block_hash: Hash) -> Result<Option<Hash>, ProtocolError>;

    /// Stored filter for a block.
    async fn load_cfilter(&self, block_hash: Hash)
        -> Result<Option<CompactFilter>, ProtocolError>;

    /// Persist a verified run of filter headers.
    async fn store_cfheaders(
        &self,
        previous_header: Hash,
        headers: Vec<(Hash, Hash)>,
    ) -> Result<(), ProtocolError>;

    /// Persist one verified filter.
    async fn store_cfilter(&self, filter: CompactFilter) -> Result<(), ProtocolError>;
}

/// A persisted peer address, as the address book stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    /// Address-format id (see [`crate::domain::message::network_id`]).
    pub network: u8,
    /// Raw address bytes.
    pub addr: Vec<u8>,
    /// TCP port.
    pub port: u16,
    /// Service bits last advertised for this address.
    pub services: u64,
    /// When we last completed a connection, if ever. Gossiped addresses
    /// are stored with this cleared.
    pub last_connected: Option<u32>,
}

/// The peer address book collaborator.
#[async_trait]
pub trait AddressBook: Send + Sync {
    /// Every address eligible for gossip.
    async fn known_addresses(&self) -> Result<Vec<PeerAddress>, ProtocolError>;

    /// Persist gossiped addresses.
    async fn record_addresses(&self, addresses: Vec<PeerAddress>) -> Result<(), ProtocolError>;
}

/// The transaction-relay pool, an opaque query/submit/dump service.
#[async_trait]
pub trait TransactionPool: Send + Sync {
    /// Look up a pooled transaction.
    async fn query(&self, txid: Hash) -> Result<Option<Transaction>, ProtocolError>;

    /// Submit a relayed transaction.
    async fn submit(&self, tx: Transaction) -> Result<(), ProtocolError>;

    /// Every txid currently pooled.
    async fn dump(&self) -> Result<Vec<Hash>, ProtocolError>;
}

// =============================================================================
// MOCK IMPLEMENTATIONS (unit tests; production adapters live in node-runtime)
// =============================================================================

/// Sink that records every message sent.
#[derive(Default)]
pub struct MockSink {
    sent: Mutex<Vec<WireMessage>>,
    closed: Mutex<bool>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far.
    pub fn sent(&self) -> Vec<WireMessage> {
        self.sent.lock().clone()
    }

    /// Drain the send log.
    pub fn take(&self) -> Vec<WireMessage> {
        std::mem::take(&mut self.sent.lock())
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

#[async_trait]
impl MessageSink for MockSink {
    async fn send(&self, message: WireMessage) -> Result<(), ProtocolError> {
        self.sent.lock().push(message);
        Ok(())
    }

    async fn close(&self) {
        *self.closed.lock() = true;
    }
}

struct MockChainInner {
    best: Vec<BlockHeader>,
    records: HashMap<Hash, HeaderRecord>,
    checkpoint: ChainPosition,
    updates: Vec<ChainUpdate>,
}

/// In-memory header chain scripted from a list of headers.
pub struct MockHeaderChain {
    inner: RwLock<MockChainInner>,
}

impl MockHeaderChain {
    /// A chain whose entry at index `i` is the best header at height `i`.
    pub fn with_chain(best: Vec<BlockHeader>) -> Arc<Self> {
        let mut records = HashMap::new();
        let mut cumulative = U256::zero();
        for (height, header) in best.iter().enumerate() {
            cumulative = cumulative + header.work();
            records.insert(
                header.block_hash(),
                HeaderRecord::new(header, height as i64, true, cumulative),
            );
        }
        Arc::new(Self {
            inner: RwLock::new(MockChainInner {
                best,
                records,
                checkpoint: ChainPosition::sentinel(),
                updates: Vec::new(),
            }),
        })
    }

    /// Updates submitted through the gateway, in order.
    pub fn updates(&self) -> Vec<ChainUpdate> {
        self.inner.read().updates.clone()
    }

    /// Pin a checkpoint for `checkpoint()` queries.
    pub fn set_checkpoint(&self, checkpoint: ChainPosition) {
        self.inner.write().checkpoint = checkpoint;
    }

    fn tip(inner: &MockChainInner) -> ChainPosition {
        match inner.best.last() {
            Some(header) => {
                ChainPosition::new(inner.best.len() as i64 - 1, header.block_hash())
            }
            None => ChainPosition::sentinel(),
        }
    }
}

#[async_trait]
impl HeaderChainGateway for MockHeaderChain {
    async fn best(&self) -> Result<ChainPosition, ProtocolError> {
        Ok(Self::tip(&self.inner.read()))
    }

    async fn checkpoint(&self) -> Result<ChainPosition, ProtocolError> {
        Ok(self.inner.read().checkpoint)
    }

    async fn recent_hashes(&self, limit: usize) -> Result<Vec<Hash>, ProtocolError> {
        let inner = self.inner.read();
        Ok(inner
            .best
            .iter()
            .rev()
            .take(limit)
            .map(BlockHeader::block_hash)
            .collect())
    }

    async fn load_header(&self, hash: Hash) -> Result<Option<BlockHeader>, ProtocolError> {
        let inner = self.inner.read();
        Ok(inner
            .best
            .iter()
            .find(|h| h.block_hash() == hash)
            .copied())
    }

    async fn load_record(&self, hash: Hash) -> Result<Option<HeaderRecord>, ProtocolError> {
        Ok(self.inner.read().records.get(&hash).cloned())
    }

    async fn best_hash_at(&self, height: i64) -> Result<Option<Hash>, ProtocolError> {
        if height < 0 {
            return Ok(None);
        }
        let inner = self.inner.read();
        Ok(inner
            .best
            .get(height as usize)
            .map(BlockHeader::block_hash))
    }

    async fn height_of(&self, hash: Hash) -> Result<Option<i64>, ProtocolError> {
        let inner = self.inner.read();
        Ok(inner
            .best
            .iter()
            .position(|h| h.block_hash() == hash)
            .map(|height| height as i64))
    }

    async fn apply_update(&self, update: ChainUpdate) -> Result<(), ProtocolError> {
        let mut inner = self.inner.write();

        if let Some(fork) = update.reorg_from {
            inner.best.truncate(fork.height as usize + 1);
        }
        let mut cumulative = inner
            .best
            .last()
            .and_then(|h| inner.records.get(&h.block_hash()))
            .map(HeaderRecord::cumulative_work)
            .unwrap_or_else(U256::zero);
        if !update.best.is_empty() {
            for header in &update.headers {
                let hash = header.block_hash();
                if update.best.iter().any(|p| p.hash == hash) {
                    let height = inner.best.len() as i64;
                    cumulative = cumulative + header.work();
                    inner
                        .records
                        .insert(hash, HeaderRecord::new(header, height, true, cumulative));
                    inner.best.push(*header);
                }
            }
        }
        inner.updates.push(update);
        Ok(())
    }
}

struct MockFilterInner {
    headers_by_block: HashMap<Hash, Hash>,
    filters_by_block: HashMap<Hash, CompactFilter>,
    cfheader_tip: ChainPosition,
    cfilter_tip: ChainPosition,
    stored_header_batches: Vec<(Hash, Vec<(Hash, Hash)>)>,
    stored_filters: Vec<CompactFilter>,
}

/// In-memory filter chain scripted per test.
pub struct MockFilterChain {
    inner: RwLock<MockFilterInner>,
}

impl MockFilterChain {
    /// An empty filter chain whose tips sit at `tip`.
    pub fn at_tip(tip: ChainPosition) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(MockFilterInner {
                headers_by_block: HashMap::new(),
                filters_by_block: HashMap::new(),
                cfheader_tip: tip,
                cfilter_tip: tip,
                stored_header_batches: Vec::new(),
                stored_filters: Vec::new(),
            }),
        })
    }

    /// Script a stored filter header.
    pub fn insert_cfheader(&self, block_hash: Hash, header: Hash) {
        self.inner.write().headers_by_block.insert(block_hash, header);
    }

    /// Script a stored filter.
    pub fn insert_cfilter(&self, filter: CompactFilter) {
        self.inner
            .write()
            .filters_by_block
            .insert(filter.block_hash, filter);
    }

    /// Header batches stored through the gateway.
    pub fn stored_header_batches(&self) -> Vec<(Hash, Vec<(Hash, Hash)>)> {
        self.inner.read().stored_header_batches.clone()
    }

    /// Filters stored through the gateway.
    pub fn stored_filters(&self) -> Vec<CompactFilter> {
        self.inner.read().stored_filters.clone()
    }
}

#[async_trait]
impl FilterChainGateway for MockFilterChain {
    async fn cfheader_tip(&self) -> Result<ChainPosition, ProtocolError> {
        Ok(self.inner.read().cfheader_tip)
    }

    async fn cfilter_tip(&self) -> Result<ChainPosition, ProtocolError> {
        Ok(self.inner.read().cfilter_tip)
    }

    async fn load_cfheader(&self, block_hash: Hash) -> Result<Option<Hash>, ProtocolError> {
        Ok(self.inner.read().headers_by_block.get(&block_hash).copied())
    }

    async fn load_cfilter(
        &self,
        block_hash: Hash,
    ) -> Result<Option<CompactFilter>, ProtocolError> {
        Ok(self.inner.read().filters_by_block.get(&block_hash).cloned())
    }

    async fn store_cfheaders(
        &self,
        previous_header: Hash,
        headers: Vec<(Hash, Hash)>,
    ) -> Result<(), ProtocolError> {
        let mut inner = self.inner.write();
        let count = headers.len() as i64;
        if let Some((block_hash, _)) = headers.last() {
            inner.cfheader_tip =
                ChainPosition::new(inner.cfheader_tip.height + count, *block_hash);
        }
        for (block_hash, header) in &headers {
            inner.headers_by_block.insert(*block_hash, *header);
        }
        inner.stored_header_batches.push((previous_header, headers));
        Ok(())
    }

    async fn store_cfilter(&self, filter: CompactFilter) -> Result<(), ProtocolError> {
        let mut inner = self.inner.write();
        inner.cfilter_tip = ChainPosition::new(inner.cfilter_tip.height + 1, filter.block_hash);
        inner.filters_by_block.insert(filter.block_hash, filter.clone());
        inner.stored_filters.push(filter);
        Ok(())
    }
}

/// Address book that records everything it is given.
#[derive(Default)]
pub struct MockAddressBook {
    known: Mutex<Vec<PeerAddress>>,
    recorded: Mutex<Vec<PeerAddress>>,
}

impl MockAddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the gossip-eligible address set.
    pub fn with_known(known: Vec<PeerAddress>) -> Self {
        Self {
            known: Mutex::new(known),
            recorded: Mutex::new(Vec::new()),
        }
    }

    /// Addresses persisted through the gateway.
    pub fn recorded(&self) -> Vec<PeerAddress> {
        self.recorded.lock().clone()
    }
}

#[async_trait]
impl AddressBook for MockAddressBook {
    async fn known_addresses(&self) -> Result<Vec<PeerAddress>, ProtocolError> {
        Ok(self.known.lock().clone())
    }

    async fn record_addresses(&self, addresses: Vec<PeerAddress>) -> Result<(), ProtocolError> {
        self.recorded.lock().extend(addresses);
        Ok(())
    }
}

/// Transaction pool over a plain map.
#[derive(Default)]
pub struct MockTxPool {
    txs: Mutex<HashMap<Hash, Transaction>>,
}

impl MockTxPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-load a transaction.
    pub fn insert(&self, tx: Transaction) {
        self.txs.lock().insert(tx.txid(), tx);
    }

    /// Whether the pool holds `txid`.
    pub fn contains(&self, txid: &Hash) -> bool {
        self.txs.lock().contains_key(txid)
    }
}

#[async_trait]
impl TransactionPool for MockTxPool {
    async fn query(&self, txid: Hash) -> Result<Option<Transaction>, ProtocolError> {
        Ok(self.txs.lock().get(&txid).cloned())
    }

    async fn submit(&self, tx: Transaction) -> Result<(), ProtocolError> {
        self.txs.lock().insert(tx.txid(), tx);
        Ok(())
    }

    async fn dump(&self) -> Result<Vec<Hash>, ProtocolError> {
        Ok(self.txs.lock().keys().copied().collect())
    }
}
