//! # Filter Chain Service
//!
//! Per-filter-type chains of compact filter headers and filters, kept
//! consistent with the header chain it reconciles against. The tip
//! ordering `cfilter ≤ cfheader ≤ header` holds in every reachable state;
//! writes that would break it are rejected outright.
//!
//! Peer-sourced data is admitted only after hash-chain verification:
//! `header[i] == dsha256(filter_hash[i] || header[i-1])` for every
//! element, anchored at an already-stored predecessor.

use std::sync::Arc;

use parking_lot::RwLock;
use shared_bus::ChainEvent;
use shared_types::{Block, ChainPosition, FilterType, Hash, NetworkParams};
use tracing::{debug, error, info, warn};

use crate::domain::entities::{build_block_filter, compute_filter_header, CompactFilter};
use crate::domain::errors::FilterChainError;
use crate::domain::keys;
use crate::ports::outbound::{
    BatchOperation, ChainEventSink, HeaderChainView, KeyValueStore,
};

/// Subsystem id used in fault events.
const SUBSYSTEM_ID: u8 = 2;

/// One element of a bulk sync batch: a block's filter plus the filter
/// header the source claims for it.
#[derive(Debug, Clone)]
pub struct SyncItem {
    /// Block the filter commits to.
    pub block_hash: Hash,
    /// Filter header claimed by the sync source.
    pub filter_header: Hash,
    /// Encoded filter bytes.
    pub filter_data: Vec<u8>,
}

/// Compact-filter chain store.
pub struct FilterChainService<K: KeyValueStore, H: HeaderChainView> {
    params: NetworkParams,
    store: RwLock<K>,
    headers: Arc<H>,
    events: Arc<dyn ChainEventSink>,
}

impl<K: KeyValueStore, H: HeaderChainView> FilterChainService<K, H> {
    /// Open the store, seeding the genesis filter position when absent.
    ///
    /// The genesis filter commits to no elements; its header chains from
    /// the all-zero hash. Seeding is idempotent across restarts.
    pub fn new(
        params: NetworkParams,
        store: K,
        headers: Arc<H>,
        events: Arc<dyn ChainEventSink>,
    ) -> Result<Self, FilterChainError> {
        let service = Self {
            params,
            store: RwLock::new(store),
            headers,
            events,
        };
        service.seed_genesis(FilterType::Basic)?;
        Ok(service)
    }

    fn seed_genesis(&self, filter_type: FilterType) -> Result<(), FilterChainError> {
        let mut store = self.store.write();
        if store.get(&keys::cfheader_tip_key(filter_type))?.is_some() {
            return Ok(());
        }

        let genesis_hash = self.params.genesis_hash();
        let genesis_filter = CompactFilter {
            filter_type,
            block_hash: genesis_hash,
            data: empty_filter_bytes(),
        };
        let genesis_header = genesis_filter.header(&[0u8; 32]);
        let position = ChainPosition::new(0, genesis_hash);

        let ops = vec![
            BatchOperation::put(
                keys::cfheader_key(filter_type, &genesis_hash),
                genesis_header.to_vec(),
            ),
            BatchOperation::put(
                keys::cfilter_key(filter_type, &genesis_hash),
                encode_filter(&genesis_filter)?,
            ),
            BatchOperation::put(keys::cfheader_tip_key(filter_type), encode_position(&position)?),
            BatchOperation::put(keys::cfilter_tip_key(filter_type), encode_position(&position)?),
        ];
        store.atomic_batch_write(ops)?;
        info!(network = self.params.name, ?filter_type, "Seeded genesis filter");
        Ok(())
    }

    /// Current cfheader tip for `filter_type`; sentinel before seeding.
    pub fn cfheader_tip(&self, filter_type: FilterType) -> ChainPosition {
        self.read_tip(&keys::cfheader_tip_key(filter_type))
    }

    /// Current cfilter tip for `filter_type`; sentinel before seeding.
    pub fn cfilter_tip(&self, filter_type: FilterType) -> ChainPosition {
        self.read_tip(&keys::cfilter_tip_key(filter_type))
    }

    fn read_tip(&self, key: &[u8]) -> ChainPosition {
        let store = self.store.read();
        match store.get(key) {
            Ok(Some(bytes)) => decode_position(&bytes).unwrap_or_else(|e| {
                error!(error = %e, "Corrupt filter tip record");
                ChainPosition::sentinel()
            }),
            Ok(None) => ChainPosition::sentinel(),
            Err(e) => {
                error!(error = %e, "Failed to read filter tip");
                ChainPosition::sentinel()
            }
        }
    }

    /// Stored filter header for `block_hash`, never synthesized.
    pub fn load_cfheader(
        &self,
        filter_type: FilterType,
        block_hash: &Hash,
    ) -> Result<Option<Hash>, FilterChainError> {
        let store = self.store.read();
        match store.get(&keys::cfheader_key(filter_type, block_hash))? {
            Some(bytes) => Ok(Some(hash_from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Stored filter for `block_hash`, never synthesized.
    pub fn load_cfilter(
        &self,
        filter_type: FilterType,
        block_hash: &Hash,
    ) -> Result<Option<CompactFilter>, FilterChainError> {
        let store = self.store.read();
        match store.get(&keys::cfilter_key(filter_type, block_hash))? {
            Some(bytes) => Ok(Some(decode_filter(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Build a block's filter. Pure: touches neither network nor store.
    #[must_use]
    pub fn process_block(&self, filter_type: FilterType, block: &Block) -> CompactFilter {
        build_block_filter(filter_type, block)
    }

    /// The best position to continue filter sync from.
    ///
    /// Returns the maximum of {candidate, cfheader tip, cfilter tip,
    /// header tip} when the candidate is consistent with the header chain
    /// at its height; an inconsistent candidate falls back to the last
    /// position our filter chain and the header chain still share.
    pub fn find_best_position(
        &self,
        filter_type: FilterType,
        candidate: ChainPosition,
    ) -> ChainPosition {
        let header_tip = self.headers.tip();
        let consistent = candidate.height >= 0
            && self.headers.hash_at(candidate.height) == Some(candidate.hash);

        if consistent {
            let mut best = candidate;
            for position in [
                self.cfheader_tip(filter_type),
                self.cfilter_tip(filter_type),
                header_tip,
            ] {
                if position > best {
                    best = position;
                }
            }
            best
        } else {
            debug!(%candidate, "Candidate not on best chain; falling back to last common");
            self.last_common_position(filter_type)
        }
    }

    /// Highest position where a stored cfheader still agrees with the
    /// header chain.
    fn last_common_position(&self, filter_type: FilterType) -> ChainPosition {
        let header_tip = self.headers.tip();
        let mut height = self.cfheader_tip(filter_type).height.min(header_tip.height);
        while height >= 0 {
            if let Some(block_hash) = self.headers.hash_at(height) {
                if matches!(self.load_cfheader(filter_type, &block_hash), Ok(Some(_))) {
                    return ChainPosition::new(height, block_hash);
                }
            }
            height -= 1;
        }
        ChainPosition::sentinel()
    }

    /// Bulk-ingest filters with their claimed headers from an aggregating
    /// sync source.
    ///
    /// Every element must verify `header[i] == dsha256(filter_hash[i] ||
    /// header[i-1])` anchored at `prior_header`; the first mismatch
    /// rejects the whole batch, storing nothing.
    pub fn process_sync_data(
        &self,
        filter_type: FilterType,
        prior_header: Hash,
        items: Vec<SyncItem>,
    ) -> Result<usize, FilterChainError> {
        if items.is_empty() {
            return Ok(0);
        }

        let tip = self.cfheader_tip(filter_type);
        let stored_prior = self
            .load_cfheader(filter_type, &tip.hash)?
            .ok_or(FilterChainError::CfheaderNotFound {
                filter_type,
                block_hash: tip.hash,
            })?;
        if prior_header != stored_prior {
            return Err(FilterChainError::ChainMismatch {
                stored: stored_prior,
                claimed: prior_header,
            });
        }

        // Verify the whole batch before anything is written.
        let mut previous = prior_header;
        for (index, item) in items.iter().enumerate() {
            let height = tip.height + 1 + index as i64;
            if self.headers.hash_at(height) != Some(item.block_hash) {
                return Err(FilterChainError::NotOnBestChain {
                    block_hash: item.block_hash,
                    height,
                });
            }
            let filter = CompactFilter {
                filter_type,
                block_hash: item.block_hash,
                data: item.filter_data.clone(),
            };
            let expected = compute_filter_header(&filter.filter_hash(), &previous);
            if expected != item.filter_header {
                warn!(index, "Sync batch failed hash-chain verification");
                return Err(FilterChainError::SyncDataMismatch { index });
            }
            previous = item.filter_header;
        }

        let count = items.len();
        let new_tip = ChainPosition::new(
            tip.height + count as i64,
            items.last().map(|i| i.block_hash).unwrap_or(tip.hash),
        );

        let mut ops = Vec::with_capacity(count * 2 + 2);
        for item in &items {
            ops.push(BatchOperation::put(
                keys::cfheader_key(filter_type, &item.block_hash),
                item.filter_header.to_vec(),
            ));
            let filter = CompactFilter {
                filter_type,
                block_hash: item.block_hash,
                data: item.filter_data.clone(),
            };
            ops.push(BatchOperation::put(
                keys::cfilter_key(filter_type, &item.block_hash),
                encode_filter(&filter)?,
            ));
        }
        ops.push(BatchOperation::put(
            keys::cfheader_tip_key(filter_type),
            encode_position(&new_tip)?,
        ));
        ops.push(BatchOperation::put(
            keys::cfilter_tip_key(filter_type),
            encode_position(&new_tip)?,
        ));
        self.commit(ops)?;

        debug!(count, tip = %new_tip, "Ingested sync batch");
        self.events.emit(ChainEvent::FilterTipAdvanced {
            filter_type,
            position: new_tip,
        });
        Ok(count)
    }

    /// Compare `cfheader_at_position` against the trusted checkpoint.
    ///
    /// When a checkpoint exists at or below `position.height` and the
    /// comparison fails, the affected tips roll back to the last
    /// known-good position and the call reports the mismatch.
    pub fn validate_against_checkpoint(
        &self,
        filter_type: FilterType,
        position: ChainPosition,
        cfheader_at_position: Hash,
    ) -> Result<(), FilterChainError> {
        let Some(checkpoint) = self.params.checkpoint else {
            return Ok(());
        };
        let cp_height = i64::from(checkpoint.height);
        if cp_height > position.height {
            // Checkpoint is above the examined position; nothing to compare.
            return Ok(());
        }

        let observed = if position.height == cp_height {
            Some(cfheader_at_position)
        } else {
            match self.headers.hash_at(cp_height) {
                Some(block_hash) => self.load_cfheader(filter_type, &block_hash)?,
                None => None,
            }
        };

        if observed == Some(checkpoint.cfheader) {
            return Ok(());
        }

        // Mismatch: everything at or above the checkpoint height is
        // suspect. Roll the tips back to the last good position below it.
        let rolled_back_to = self.rollback_below(filter_type, cp_height)?;
        warn!(
            %position,
            %rolled_back_to,
            "Filter checkpoint mismatch; tip rolled back"
        );
        self.events.emit(ChainEvent::FilterRollback {
            filter_type,
            position: rolled_back_to,
        });
        Err(FilterChainError::CheckpointMismatch {
            position,
            rolled_back_to,
        })
    }

    fn rollback_below(
        &self,
        filter_type: FilterType,
        height: i64,
    ) -> Result<ChainPosition, FilterChainError> {
        let mut h = height - 1;
        let target = loop {
            if h < 0 {
                break ChainPosition::sentinel();
            }
            if let Some(block_hash) = self.headers.hash_at(h) {
                if self.load_cfheader(filter_type, &block_hash)?.is_some() {
                    break ChainPosition::new(h, block_hash);
                }
            }
            h -= 1;
        };

        let mut ops = vec![BatchOperation::put(
            keys::cfheader_tip_key(filter_type),
            encode_position(&target)?,
        )];
        if self.cfilter_tip(filter_type) > target {
            ops.push(BatchOperation::put(
                keys::cfilter_tip_key(filter_type),
                encode_position(&target)?,
            ));
        }
        self.commit(ops)?;
        Ok(target)
    }

    /// Persist verified filter headers and advance the cfheader tip.
    ///
    /// `previous_header` must equal the cfheader already stored at the
    /// current tip; a batch whose first hash-chain predecessor mismatches
    /// is rejected whole. `headers` pair each block with its filter
    /// header, in ascending height order continuing the best chain.
    pub fn store_cfheaders(
        &self,
        filter_type: FilterType,
        previous_header: Hash,
        headers: Vec<(Hash, Hash)>,
    ) -> Result<(), FilterChainError> {
        if headers.is_empty() {
            return Ok(());
        }

        let tip = self.cfheader_tip(filter_type);
        let stored_prev = self
            .load_cfheader(filter_type, &tip.hash)?
            .ok_or(FilterChainError::CfheaderNotFound {
                filter_type,
                block_hash: tip.hash,
            })?;
        if previous_header != stored_prev {
            return Err(FilterChainError::ChainMismatch {
                stored: stored_prev,
                claimed: previous_header,
            });
        }

        let header_tip = self.headers.tip();
        let new_height = tip.height + headers.len() as i64;
        if new_height > header_tip.height {
            return Err(FilterChainError::TipOrderViolation {
                reason: "cfheader tip would pass the header tip",
            });
        }

        let mut ops = Vec::with_capacity(headers.len() + 1);
        let mut last_block = tip.hash;
        for (index, (block_hash, filter_header)) in headers.iter().enumerate() {
            let height = tip.height + 1 + index as i64;
            if self.headers.hash_at(height) != Some(*block_hash) {
                return Err(FilterChainError::NotOnBestChain {
                    block_hash: *block_hash,
                    height,
                });
            }
            ops.push(BatchOperation::put(
                keys::cfheader_key(filter_type, block_hash),
                filter_header.to_vec(),
            ));
            last_block = *block_hash;
        }

        let new_tip = ChainPosition::new(new_height, last_block);
        ops.push(BatchOperation::put(
            keys::cfheader_tip_key(filter_type),
            encode_position(&new_tip)?,
        ));
        self.commit(ops)?;

        debug!(count = headers.len(), tip = %new_tip, "Stored cfheaders");
        self.events.emit(ChainEvent::FilterTipAdvanced {
            filter_type,
            position: new_tip,
        });
        Ok(())
    }

    /// Persist verified filters and advance the cfilter tip.
    ///
    /// Each filter must hash-chain onto the cfheader already stored for
    /// its block; the cfilter tip can never pass the cfheader tip.
    pub fn store_cfilters(
        &self,
        filter_type: FilterType,
        filters: Vec<CompactFilter>,
    ) -> Result<(), FilterChainError> {
        if filters.is_empty() {
            return Ok(());
        }

        let tip = self.cfilter_tip(filter_type);
        let cfheader_tip = self.cfheader_tip(filter_type);
        let new_height = tip.height + filters.len() as i64;
        if new_height > cfheader_tip.height {
            return Err(FilterChainError::TipOrderViolation {
                reason: "cfilter tip would pass the cfheader tip",
            });
        }

        let mut previous = self
            .load_cfheader(filter_type, &tip.hash)?
            .ok_or(FilterChainError::CfheaderNotFound {
                filter_type,
                block_hash: tip.hash,
            })?;

        let mut ops = Vec::with_capacity(filters.len() + 1);
        let mut last_block = tip.hash;
        for (index, filter) in filters.iter().enumerate() {
            let height = tip.height + 1 + index as i64;
            if self.headers.hash_at(height) != Some(filter.block_hash) {
                return Err(FilterChainError::NotOnBestChain {
                    block_hash: filter.block_hash,
                    height,
                });
            }
            let stored_header = self
                .load_cfheader(filter_type, &filter.block_hash)?
                .ok_or(FilterChainError::CfheaderNotFound {
                    filter_type,
                    block_hash: filter.block_hash,
                })?;
            let expected = compute_filter_header(&filter.filter_hash(), &previous);
            if expected != stored_header {
                return Err(FilterChainError::ChainMismatch {
                    stored: stored_header,
                    claimed: expected,
                });
            }
            ops.push(BatchOperation::put(
                keys::cfilter_key(filter_type, &filter.block_hash),
                encode_filter(filter)?,
            ));
            previous = stored_header;
            last_block = filter.block_hash;
        }

        let new_tip = ChainPosition::new(new_height, last_block);
        ops.push(BatchOperation::put(
            keys::cfilter_tip_key(filter_type),
            encode_position(&new_tip)?,
        ));
        self.commit(ops)?;

        debug!(count = filters.len(), tip = %new_tip, "Stored cfilters");
        Ok(())
    }

    fn commit(&self, ops: Vec<BatchOperation>) -> Result<(), FilterChainError> {
        let mut store = self.store.write();
        if let Err(e) = store.atomic_batch_write(ops) {
            error!(error = %e, "Filter-chain transaction failed; prior state retained");
            self.events.emit(ChainEvent::StoreFault {
                subsystem_id: SUBSYSTEM_ID,
                error: e.to_string(),
            });
            return Err(e.into());
        }
        Ok(())
    }
}

/// Encoded filter committing to no elements.
fn empty_filter_bytes() -> Vec<u8> {
    vec![0]
}

fn encode_filter(filter: &CompactFilter) -> Result<Vec<u8>, FilterChainError> {
    bincode::serialize(filter).map_err(|e| FilterChainError::Serialization {
        message: e.to_string(),
    })
}

fn decode_filter(bytes: &[u8]) -> Result<CompactFilter, FilterChainError> {
    bincode::deserialize(bytes).map_err(|e| FilterChainError::Serialization {
        message: e.to_string(),
    })
}

fn encode_position(position: &ChainPosition) -> Result<Vec<u8>, FilterChainError> {
    bincode::serialize(position).map_err(|e| FilterChainError::Serialization {
        message: e.to_string(),
    })
}

fn decode_position(bytes: &[u8]) -> Result<ChainPosition, FilterChainError> {
    bincode::deserialize(bytes).map_err(|e| FilterChainError::Serialization {
        message: e.to_string(),
    })
}

fn hash_from_bytes(bytes: &[u8]) -> Result<Hash, FilterChainError> {
    bytes
        .try_into()
        .map_err(|_| FilterChainError::Serialization {
            message: "stored cfheader is not 32 bytes".to_string(),
        })
}
