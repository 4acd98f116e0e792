//! # Store Gateways
//!
//! Async request/response clients the peer sessions use to reach the
//! stores. Every call hops onto the blocking pool, so a session task
//! never runs store I/O inline and a slow query cannot stall another
//! session's event processing. A torn-down session simply drops the
//! pending future; the result becomes a no-op.

use std::sync::Arc;

use async_trait::async_trait;
use ln_01_header_chain::{
    ChainUpdate, HeaderChainError, HeaderChainService, HeaderRecord, KeyValueStore,
};
use ln_02_filter_chain::{
    CompactFilter, FilterChainError, FilterChainService, HeaderChainView,
};
use ln_03_peer_protocol::{FilterChainGateway, HeaderChainGateway, ProtocolError};
use shared_types::{BlockHeader, ChainPosition, FilterType, Hash};

fn store_error(err: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::Store {
        message: err.to_string(),
    }
}

async fn on_pool<T, E, F>(task: F) -> Result<T, ProtocolError>
where
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(store_error)?
        .map_err(store_error)
}

/// Header-chain client over the in-process service.
pub struct HeaderStoreClient<K: KeyValueStore + 'static> {
    service: Arc<HeaderChainService<K>>,
}

impl<K: KeyValueStore + 'static> HeaderStoreClient<K> {
    pub fn new(service: Arc<HeaderChainService<K>>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<K: KeyValueStore + 'static> HeaderChainGateway for HeaderStoreClient<K> {
    async fn best(&self) -> Result<ChainPosition, ProtocolError> {
        let service = self.service.clone();
        on_pool(move || Ok::<_, HeaderChainError>(service.best())).await
    }

    async fn checkpoint(&self) -> Result<ChainPosition, ProtocolError> {
        let service = self.service.clone();
        on_pool(move || Ok::<_, HeaderChainError>(service.checkpoint())).await
    }

    async fn recent_hashes(&self, limit: usize) -> Result<Vec<Hash>, ProtocolError> {
        let service = self.service.clone();
        on_pool(move || service.recent_hashes(limit)).await
    }

    async fn load_header(&self, hash: Hash) -> Result<Option<BlockHeader>, ProtocolError> {
        let service = self.service.clone();
        on_pool(move || match service.load_header(&hash) {
            Ok(header) => Ok(Some(header)),
            Err(HeaderChainError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        })
        .await
    }

    async fn load_record(&self, hash: Hash) -> Result<Option<HeaderRecord>, ProtocolError> {
        let service = self.service.clone();
        on_pool(move || match service.load_record(&hash) {
            Ok(record) => Ok(Some(record)),
            Err(HeaderChainError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        })
        .await
    }

    async fn best_hash_at(&self, height: i64) -> Result<Option<Hash>, ProtocolError> {
        let service = self.service.clone();
        on_pool(move || service.best_hash_at(height)).await
    }

    async fn height_of(&self, hash: Hash) -> Result<Option<i64>, ProtocolError> {
        let service = self.service.clone();
        on_pool(move || {
            let record = match service.load_record(&hash) {
                Ok(record) => record,
                Err(HeaderChainError::NotFound { .. }) => return Ok(None),
                Err(e) => return Err(e),
            };
            if !record.on_best_chain {
                return Ok(None);
            }
            // The marker can be stale relative to the live index; confirm.
            Ok(service
                .best_hash_at(record.height)?
                .filter(|stored| *stored == hash)
                .map(|_| record.height))
        })
        .await
    }

    async fn apply_update(&self, update: ChainUpdate) -> Result<(), ProtocolError> {
        let service = self.service.clone();
        on_pool(move || service.apply_update(update)).await
    }
}

/// Filter-chain client over the in-process service.
pub struct FilterStoreClient<K, H>
where
    K: KeyValueStore + 'static,
    H: HeaderChainView + 'static,
{
    service: Arc<FilterChainService<K, H>>,
}

impl<K, H> FilterStoreClient<K, H>
where
    K: KeyValueStore + 'static,
    H: HeaderChainView + 'static,
{
    pub fn new(service: Arc<FilterChainService<K, H>>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<K, H> FilterChainGateway for FilterStoreClient<K, H>
where
    K: KeyValueStore + 'static,
    H: HeaderChainView + 'static,
{
    async fn cfheader_tip(&self) -> Result<ChainPosition, ProtocolError> {
        let service = self.service.clone();
        on_pool(move || Ok::<_, FilterChainError>(service.cfheader_tip(FilterType::Basic))).await
    }

    async fn cfilter_tip(&self) -> Result<ChainPosition, ProtocolError> {
        let service = self.service.clone();
        on_pool(move || Ok::<_, FilterChainError>(service.cfilter_tip(FilterType::Basic))).await
    }

    async fn load_cfheader(&self, block_hash: Hash) -> Result<Option<Hash>, ProtocolError> {
        let service = self.service.clone();
        on_pool(move || service.load_cfheader(FilterType::Basic, &block_hash)).await
    }

    async fn load_cfilter(
        &self,
        block_hash: Hash,
    ) -> Result<Option<CompactFilter>, ProtocolError> {
        let service = self.service.clone();
        on_pool(move || service.load_cfilter(FilterType::Basic, &block_hash)).await
    }

    async fn store_cfheaders(
        &self,
        previous_header: Hash,
        headers: Vec<(Hash, Hash)>,
    ) -> Result<(), ProtocolError> {
        let service = self.service.clone();
        on_pool(move || service.store_cfheaders(FilterType::Basic, previous_header, headers))
            .await
    }

    async fn store_cfilter(&self, filter: CompactFilter) -> Result<(), ProtocolError> {
        let service = self.service.clone();
        on_pool(move || service.store_cfilters(FilterType::Basic, vec![filter])).await
    }
}

/// Read-only header-chain view handed to the filter store.
pub struct HeaderViewAdapter<K: KeyValueStore> {
    service: Arc<HeaderChainService<K>>,
}

impl<K: KeyValueStore> HeaderViewAdapter<K> {
    pub fn new(service: Arc<HeaderChainService<K>>) -> Self {
        Self { service }
    }
}

impl<K: KeyValueStore> HeaderChainView for HeaderViewAdapter<K> {
    fn tip(&self) -> ChainPosition {
        self.service.best()
    }

    fn hash_at(&self, height: i64) -> Option<Hash> {
        self.service.best_hash_at(height).ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ln_01_header_chain::{InMemoryKVStore, NullEventSink};
    use shared_types::NetworkParams;

    fn header_service() -> Arc<HeaderChainService<InMemoryKVStore>> {
        Arc::new(
            HeaderChainService::new(
                NetworkParams::regtest(),
                InMemoryKVStore::new(),
                Arc::new(NullEventSink),
                Arc::new(NullEventSink),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_header_client_round_trip() {
        let service = header_service();
        let client = HeaderStoreClient::new(service.clone());

        let best = client.best().await.unwrap();
        assert_eq!(best.height, 0);
        assert_eq!(
            client.height_of(best.hash).await.unwrap(),
            Some(0)
        );
        assert_eq!(client.load_header([9; 32]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_header_view_adapter_tracks_service() {
        let service = header_service();
        let view = HeaderViewAdapter::new(service.clone());
        assert_eq!(view.tip(), service.best());
        assert_eq!(view.hash_at(0), Some(service.best().hash));
        assert_eq!(view.hash_at(5), None);
    }
}
