//! Shared builders: deterministic regtest chains, fully wired stores, and
//! sessions running over real services through the production gateways.

use std::sync::Arc;

use ln_01_header_chain::{
    ChainEventSink, ChainUpdate, HeaderChainService, InMemoryKVStore, RecordingEventSink,
};
use ln_02_filter_chain::{compute_filter_header, CompactFilter, FilterChainService};
use ln_03_peer_protocol::ports::outbound::MockSink;
use ln_03_peer_protocol::{Direction, PeerSessionService, SessionConfig};
use node_runtime::adapters::{FilterStoreClient, HeaderStoreClient, HeaderViewAdapter};
use shared_types::{BlockHeader, ChainPosition, FilterType, Hash, NetworkParams};

pub type TestHeaderService = HeaderChainService<InMemoryKVStore>;
pub type TestFilterService =
    FilterChainService<InMemoryKVStore, HeaderViewAdapter<InMemoryKVStore>>;
pub type TestSession = PeerSessionService<
    MockSink,
    HeaderStoreClient<InMemoryKVStore>,
    FilterStoreClient<InMemoryKVStore, HeaderViewAdapter<InMemoryKVStore>>,
    ln_03_peer_protocol::ports::outbound::MockAddressBook,
    ln_03_peer_protocol::ports::outbound::MockTxPool,
>;

/// A deterministic regtest chain: genesis plus `extra` descendants.
pub fn build_chain(params: &NetworkParams, extra: usize) -> Vec<BlockHeader> {
    let mut headers = vec![params.genesis_header];
    for n in 1..=extra {
        let parent = headers[n - 1];
        headers.push(BlockHeader {
            version: 1,
            parent_hash: parent.block_hash(),
            merkle_root: [(n % 251) as u8; 32],
            time: parent.time + 60,
            bits: 0x207F_FFFF,
            nonce: n as u32,
        });
    }
    headers
}

/// Ascending positions for `headers[1..]`, heights starting at 1.
pub fn positions_above_genesis(headers: &[BlockHeader]) -> Vec<ChainPosition> {
    headers[1..]
        .iter()
        .enumerate()
        .map(|(i, h)| ChainPosition::new(1 + i as i64, h.block_hash()))
        .collect()
}

/// One fully wired store pair over in-memory backends.
pub struct StorePair {
    pub headers: Arc<TestHeaderService>,
    pub filters: Arc<TestFilterService>,
    pub internal_events: Arc<RecordingEventSink>,
    pub external_events: Arc<RecordingEventSink>,
}

/// Build header + filter services the way the runtime wires them.
pub fn store_pair(params: &NetworkParams) -> StorePair {
    let internal_events = Arc::new(RecordingEventSink::new());
    let external_events = Arc::new(RecordingEventSink::new());
    let headers = Arc::new(
        HeaderChainService::new(
            params.clone(),
            InMemoryKVStore::new(),
            internal_events.clone() as Arc<dyn ChainEventSink>,
            external_events.clone() as Arc<dyn ChainEventSink>,
        )
        .unwrap(),
    );
    let filters = Arc::new(
        FilterChainService::new(
            params.clone(),
            InMemoryKVStore::new(),
            Arc::new(HeaderViewAdapter::new(headers.clone())),
            internal_events.clone() as Arc<dyn ChainEventSink>,
        )
        .unwrap(),
    );
    StorePair {
        headers,
        filters,
        internal_events,
        external_events,
    }
}

/// Extend a store pair's header chain with `headers[1..]`.
pub fn extend_headers(stores: &StorePair, headers: &[BlockHeader]) {
    stores
        .headers
        .apply_update(ChainUpdate::extend(
            headers[1..].to_vec(),
            positions_above_genesis(headers),
        ))
        .unwrap();
}

/// Deterministic filter bytes for the block at `height`; every block's
/// filter hash differs.
pub fn filter_data_for(height: usize) -> Vec<u8> {
    vec![1, (height % 251) as u8, ((height / 251) % 251) as u8]
}

/// Populate filters for heights `1..=limit`, returning the stored
/// (block hash, cfheader) pairs.
pub fn seed_filters(
    stores: &StorePair,
    headers: &[BlockHeader],
    limit: usize,
) -> Vec<(Hash, Hash)> {
    let genesis_hash = headers[0].block_hash();
    let prior = stores
        .filters
        .load_cfheader(FilterType::Basic, &genesis_hash)
        .unwrap()
        .unwrap();

    let mut previous = prior;
    let mut chained = Vec::with_capacity(limit);
    let mut filters = Vec::with_capacity(limit);
    for (offset, header) in headers[1..=limit].iter().enumerate() {
        let height = offset + 1;
        let filter = CompactFilter {
            filter_type: FilterType::Basic,
            block_hash: header.block_hash(),
            data: filter_data_for(height),
        };
        previous = compute_filter_header(&filter.filter_hash(), &previous);
        chained.push((filter.block_hash, previous));
        filters.push(filter);
    }

    stores
        .filters
        .store_cfheaders(FilterType::Basic, prior, chained.clone())
        .unwrap();
    stores
        .filters
        .store_cfilters(FilterType::Basic, filters)
        .unwrap();
    chained
}

/// Everything one simulated node needs for a session-level scenario.
pub struct SessionFixture {
    pub session: Arc<TestSession>,
    pub sink: Arc<MockSink>,
    pub stores: StorePair,
    pub events: Arc<RecordingEventSink>,
}

/// A session over real stores, capturing output in a `MockSink`.
pub fn session_over(params: &NetworkParams, direction: Direction) -> SessionFixture {
    let stores = store_pair(params);
    session_with_stores(params, direction, stores)
}

/// A session over the given stores.
pub fn session_with_stores(
    params: &NetworkParams,
    direction: Direction,
    stores: StorePair,
) -> SessionFixture {
    let sink = Arc::new(MockSink::new());
    let events = Arc::new(RecordingEventSink::new());
    let session = Arc::new(PeerSessionService::new(
        params.clone(),
        SessionConfig::default(),
        direction,
        sink.clone(),
        Arc::new(HeaderStoreClient::new(stores.headers.clone())),
        Arc::new(FilterStoreClient::new(stores.filters.clone())),
        Arc::new(ln_03_peer_protocol::ports::outbound::MockAddressBook::new()),
        Arc::new(ln_03_peer_protocol::ports::outbound::MockTxPool::new()),
        events.clone() as Arc<dyn ChainEventSink>,
    ));
    SessionFixture {
        session,
        sink,
        stores,
        events,
    }
}

/// Relay messages between two sessions until both go quiet.
pub async fn pump_until_quiescent(a: &SessionFixture, b: &SessionFixture) {
    // Bounded so a protocol loop fails the test instead of hanging it.
    for _ in 0..64 {
        let from_a = a.sink.take();
        let from_b = b.sink.take();
        if from_a.is_empty() && from_b.is_empty() {
            return;
        }
        for message in from_a {
            b.session.handle_message(message).await.unwrap();
        }
        for message in from_b {
            a.session.handle_message(message).await.unwrap();
        }
    }
    panic!("sessions never went quiescent");
}
