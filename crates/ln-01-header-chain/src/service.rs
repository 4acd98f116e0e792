//! # Header Chain Service
//!
//! The authoritative, durable header chain. All mutation funnels through
//! [`HeaderChainService::apply_update`], which turns a [`ChainUpdate`] into
//! one atomic batch against the backing key-value store: header bodies,
//! metadata records, orphan/sibling deltas, best-chain rewrites, tip and
//! checkpoint movement all commit together or not at all.
//!
//! After a successful commit the service compares the new situation with
//! the last one it announced and, when different, emits exactly one event
//! with the same payload to the internal and external sinks.
//!
//! ## Concurrency
//!
//! The backing store sits behind an `RwLock`: reads proceed concurrently,
//! every mutation holds the write half for the whole transaction scope, so
//! readers never observe a partially-applied batch.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use shared_bus::ChainEvent;
use shared_types::{BlockHeader, ChainPosition, Hash, NetworkParams, U256};
use tracing::{debug, error, info, warn};

use crate::domain::entities::{ChainUpdate, HeaderRecord};
use crate::domain::errors::HeaderChainError;
use crate::domain::keys;
use crate::domain::notify::LastNotified;
use crate::ports::outbound::{BatchOperation, ChainEventSink, KeyValueStore};

/// Subsystem id used in fault events.
const SUBSYSTEM_ID: u8 = 1;

/// Default locator depth for [`HeaderChainService::recent_hashes`].
pub const DEFAULT_RECENT_HASHES: usize = 100;

/// Durable best-chain index with atomic reorg application.
pub struct HeaderChainService<K: KeyValueStore> {
    params: NetworkParams,
    store: RwLock<K>,
    last_notified: Mutex<LastNotified>,
    internal: Arc<dyn ChainEventSink>,
    external: Arc<dyn ChainEventSink>,
}

impl<K: KeyValueStore> HeaderChainService<K> {
    /// Open the store, seeding the genesis header when the chain is empty.
    ///
    /// Seeding is idempotent: a restart over an existing database leaves
    /// everything untouched.
    pub fn new(
        params: NetworkParams,
        store: K,
        internal: Arc<dyn ChainEventSink>,
        external: Arc<dyn ChainEventSink>,
    ) -> Result<Self, HeaderChainError> {
        let service = Self {
            params,
            store: RwLock::new(store),
            last_notified: Mutex::new(LastNotified::None),
            internal,
            external,
        };
        service.seed_genesis()?;
        Ok(service)
    }

    fn seed_genesis(&self) -> Result<(), HeaderChainError> {
        let mut store = self.store.write();
        if store.get(keys::KEY_TIP)?.is_some() {
            return Ok(());
        }

        let genesis = self.params.genesis_header;
        let hash = genesis.block_hash();
        let position = ChainPosition::new(0, hash);
        let record = HeaderRecord::new(&genesis, 0, true, genesis.work());

        let ops = vec![
            BatchOperation::put(keys::body_key(&hash), genesis.to_bytes()),
            BatchOperation::put(keys::meta_key(&hash), record.to_checksummed_bytes()?),
            BatchOperation::put(keys::best_key(0), hash.to_vec()),
            BatchOperation::put(keys::KEY_TIP, encode_position(&position)?),
        ];
        store.atomic_batch_write(ops)?;
        info!(network = self.params.name, genesis = %position, "Seeded genesis header");
        Ok(())
    }

    /// Current tip. Sentinel only before genesis seeding, which the
    /// constructor performs, so steady-state callers always see a real
    /// position.
    pub fn best(&self) -> ChainPosition {
        let store = self.store.read();
        match read_position(&*store, keys::KEY_TIP) {
            Ok(Some(position)) => position,
            Ok(None) => ChainPosition::sentinel(),
            Err(e) => {
                error!(error = %e, "Failed to read tip");
                ChainPosition::sentinel()
            }
        }
    }

    /// Trusted checkpoint; sentinel while unset.
    pub fn checkpoint(&self) -> ChainPosition {
        let store = self.store.read();
        match read_position(&*store, keys::KEY_CHECKPOINT) {
            Ok(Some(position)) => position,
            Ok(None) => ChainPosition::sentinel(),
            Err(e) => {
                error!(error = %e, "Failed to read checkpoint");
                ChainPosition::sentinel()
            }
        }
    }

    /// True when both the raw body and the metadata record exist.
    pub fn header_exists(&self, hash: &Hash) -> Result<bool, HeaderChainError> {
        let store = self.store.read();
        Ok(store.exists(&keys::body_key(hash))? && store.exists(&keys::meta_key(hash))?)
    }

    /// Load a header. A body without metadata (or vice versa) reads as
    /// missing, not partially available.
    pub fn load_header(&self, hash: &Hash) -> Result<BlockHeader, HeaderChainError> {
        let store = self.store.read();
        let body = store.get(&keys::body_key(hash))?;
        let meta = store.get(&keys::meta_key(hash))?;
        match (body, meta) {
            (Some(bytes), Some(_)) => {
                BlockHeader::from_bytes(&bytes).map_err(|e| HeaderChainError::Serialization {
                    message: e.to_string(),
                })
            }
            _ => Err(HeaderChainError::NotFound { hash: *hash }),
        }
    }

    /// Load the metadata record for a header.
    pub fn load_record(&self, hash: &Hash) -> Result<HeaderRecord, HeaderChainError> {
        let store = self.store.read();
        read_record(&*store, hash)?.ok_or(HeaderChainError::NotFound { hash: *hash })
    }

    /// Best-chain hash at `height`, if the index reaches that far.
    pub fn best_hash_at(&self, height: i64) -> Result<Option<Hash>, HeaderChainError> {
        if height < 0 {
            return Ok(None);
        }
        let store = self.store.read();
        read_best_hash(&*store, height)
    }

    /// Most-recent-first best-chain hashes for building peer locators.
    pub fn recent_hashes(&self, limit: usize) -> Result<Vec<Hash>, HeaderChainError> {
        let store = self.store.read();
        let tip = match read_position(&*store, keys::KEY_TIP)? {
            Some(position) => position,
            None => return Ok(Vec::new()),
        };

        let mut hashes = Vec::with_capacity(limit.min(tip.height as usize + 1));
        let mut height = tip.height;
        while height >= 0 && hashes.len() < limit {
            match read_best_hash(&*store, height)? {
                Some(hash) => hashes.push(hash),
                None => return Err(HeaderChainError::HeightNotFound { height }),
            }
            height -= 1;
        }
        Ok(hashes)
    }

    /// All buffered (parent, child) disconnected edges.
    pub fn disconnected_hashes(&self) -> Result<BTreeSet<(Hash, Hash)>, HeaderChainError> {
        let store = self.store.read();
        let mut edges = BTreeSet::new();
        for (key, _) in store.prefix_scan(&keys::orphan_prefix())? {
            if let Some(edge) = keys::parse_orphan_key(&key) {
                edges.insert(edge);
            }
        }
        Ok(edges)
    }

    /// True when `hash` is a valid header off the best chain.
    pub fn is_sibling(&self, hash: &Hash) -> Result<bool, HeaderChainError> {
        let store = self.store.read();
        Ok(store.exists(&keys::sibling_key(hash))?)
    }

    /// Apply one atomic update.
    ///
    /// Steps, all inside a single batch: persist new header bodies, apply
    /// orphan/sibling deltas, write metadata records, delete replaced
    /// best-chain entries when the batch carries a reorg, write the new
    /// best positions, advance the tip, update the checkpoint. On any
    /// validation or storage failure nothing is visible and the prior
    /// state stands.
    pub fn apply_update(&self, update: ChainUpdate) -> Result<(), HeaderChainError> {
        let situation = {
            let mut store = self.store.write();
            let ops = match self.plan_update(&*store, &update) {
                Ok(ops) => ops,
                Err(e) => {
                    warn!(error = %e, "Rejected chain update");
                    return Err(e);
                }
            };

            if let Err(e) = store.atomic_batch_write(ops) {
                error!(error = %e, "Header-chain transaction failed; prior state retained");
                self.internal.emit(ChainEvent::StoreFault {
                    subsystem_id: SUBSYSTEM_ID,
                    error: e.to_string(),
                });
                return Err(e.into());
            }

            match (&update.reorg_from, update.best.last()) {
                (Some(fork), Some(tip)) => Some(LastNotified::Reorg {
                    fork: *fork,
                    tip: *tip,
                }),
                (None, Some(tip)) => Some(LastNotified::Tip(*tip)),
                _ => None,
            }
        };

        if let Some(situation) = situation {
            self.notify(situation);
        }
        Ok(())
    }

    /// Validate `update` against current state and produce the batch.
    fn plan_update(
        &self,
        store: &K,
        update: &ChainUpdate,
    ) -> Result<Vec<BatchOperation>, HeaderChainError> {
        update.check_contiguous()?;

        let current_tip =
            read_position(store, keys::KEY_TIP)?.unwrap_or_else(ChainPosition::sentinel);
        let checkpoint = read_position(store, keys::KEY_CHECKPOINT)?;

        if !update.is_bookkeeping_only() {
            let first = update.best.first().copied();
            let new_tip = *update
                .best
                .last()
                .ok_or(HeaderChainError::NonContiguousBatch { height: -1 })?;

            match update.reorg_from {
                Some(fork) => {
                    let stored = read_best_hash(store, fork.height)?;
                    if stored != Some(fork.hash) {
                        return Err(HeaderChainError::UnknownForkPoint(fork));
                    }
                    if let Some(cp) = checkpoint {
                        if fork.height < cp.height {
                            return Err(HeaderChainError::ReorgBelowCheckpoint {
                                fork,
                                checkpoint_height: cp.height,
                            });
                        }
                    }
                    if let Some(first) = first {
                        if first.height != fork.height + 1 {
                            return Err(HeaderChainError::NonContiguousBatch {
                                height: first.height,
                            });
                        }
                    }
                }
                None => {
                    if new_tip.height <= current_tip.height {
                        return Err(HeaderChainError::TipRegression {
                            current: current_tip,
                            proposed: new_tip,
                        });
                    }
                    if let Some(first) = first {
                        if !current_tip.is_sentinel() && first.height != current_tip.height + 1 {
                            return Err(HeaderChainError::NonContiguousBatch {
                                height: first.height,
                            });
                        }
                    }
                }
            }
        }

        let mut ops = Vec::new();

        // (1) Header bodies.
        for header in &update.headers {
            let hash = header.block_hash();
            ops.push(BatchOperation::put(keys::body_key(&hash), header.to_bytes()));
        }

        // (2) Orphan / sibling index deltas.
        for (parent, child) in &update.orphans_add {
            ops.push(BatchOperation::put(keys::orphan_key(parent, child), vec![]));
        }
        for (parent, child) in &update.orphans_remove {
            ops.push(BatchOperation::delete(keys::orphan_key(parent, child)));
        }
        for hash in &update.siblings_add {
            ops.push(BatchOperation::put(keys::sibling_key(hash), vec![]));
        }
        for hash in &update.siblings_remove {
            ops.push(BatchOperation::delete(keys::sibling_key(hash)));
        }

        // (3) Metadata records for the new headers.
        let best_heights: HashMap<Hash, i64> = update
            .best
            .iter()
            .map(|pos| (pos.hash, pos.height))
            .collect();
        let orphan_children: BTreeSet<Hash> =
            update.orphans_add.iter().map(|(_, child)| *child).collect();
        let sibling_set: BTreeSet<Hash> = update.siblings_add.iter().copied().collect();

        let mut batch_records: HashMap<Hash, HeaderRecord> = HashMap::new();
        for header in &update.headers {
            let hash = header.block_hash();
            let parent_record = batch_records
                .get(&header.parent_hash)
                .cloned()
                .or(read_record(store, &header.parent_hash)?);
            let parent_work = parent_record
                .as_ref()
                .map(|r| r.cumulative_work())
                .unwrap_or_else(U256::zero);

            let record = if let Some(height) = best_heights.get(&hash) {
                HeaderRecord::new(header, *height, true, parent_work + header.work())
            } else if sibling_set.contains(&hash) {
                let height = parent_record.as_ref().map_or(-1, |r| r.height + 1);
                HeaderRecord::new(header, height, false, parent_work + header.work())
            } else if orphan_children.contains(&hash) {
                HeaderRecord::new(header, -1, false, header.work())
            } else {
                return Err(HeaderChainError::UnanchoredHeader { hash });
            };

            ops.push(BatchOperation::put(
                keys::meta_key(&hash),
                record.to_checksummed_bytes()?,
            ));
            batch_records.insert(hash, record);
        }

        // (4) On reorg, delete every replaced best-chain entry down to (not
        // including) the fork point, demoting the displaced records.
        if let Some(fork) = update.reorg_from {
            let mut height = fork.height + 1;
            while height <= current_tip.height {
                if let Some(displaced) = read_best_hash(store, height)? {
                    if let Some(mut record) = read_record(store, &displaced)? {
                        record.on_best_chain = false;
                        ops.push(BatchOperation::put(
                            keys::meta_key(&displaced),
                            record.to_checksummed_bytes()?,
                        ));
                    }
                }
                ops.push(BatchOperation::delete(keys::best_key(height as u64)));
                height += 1;
            }
        }

        // (5) New best-chain positions. Positions whose header was already
        // stored (a sibling being promoted) get their marker rewritten.
        for position in &update.best {
            ops.push(BatchOperation::put(
                keys::best_key(position.height as u64),
                position.hash.to_vec(),
            ));
            if !batch_records.contains_key(&position.hash) {
                let mut record = read_record(store, &position.hash)?
                    .ok_or(HeaderChainError::NotFound {
                        hash: position.hash,
                    })?;
                record.on_best_chain = true;
                record.height = position.height;
                ops.push(BatchOperation::put(
                    keys::meta_key(&position.hash),
                    record.to_checksummed_bytes()?,
                ));
            }
        }

        // (6) Advance the tip.
        if let Some(new_tip) = update.best.last() {
            ops.push(BatchOperation::put(keys::KEY_TIP, encode_position(new_tip)?));
        }

        // (7) Update the checkpoint.
        if let Some(cp) = update.checkpoint {
            let new_tip = update.best.last().copied().unwrap_or(current_tip);
            if cp.height > new_tip.height {
                return Err(HeaderChainError::CheckpointConflict(cp));
            }
            let hash_at = best_heights
                .iter()
                .find(|(_, h)| **h == cp.height)
                .map(|(hash, _)| *hash)
                .map_or_else(|| read_best_hash(store, cp.height), |h| Ok(Some(h)))?;
            if hash_at != Some(cp.hash) {
                return Err(HeaderChainError::CheckpointConflict(cp));
            }
            ops.push(BatchOperation::put(keys::KEY_CHECKPOINT, encode_position(&cp)?));
        }

        Ok(ops)
    }

    /// Announce `situation` once, to both listener classes, when it differs
    /// from the previous announcement.
    fn notify(&self, situation: LastNotified) {
        let mut last = self.last_notified.lock();
        if *last == situation {
            debug!("Situation unchanged since last notification");
            return;
        }
        *last = situation;
        drop(last);

        if let Some(event) = situation.to_event() {
            debug!(event = ?event, "Announcing chain update");
            self.internal.emit(event.clone());
            self.external.emit(event);
        }
    }
}

fn encode_position(position: &ChainPosition) -> Result<Vec<u8>, HeaderChainError> {
    bincode::serialize(position).map_err(|e| HeaderChainError::Serialization {
        message: e.to_string(),
    })
}

fn read_position<K: KeyValueStore + ?Sized>(
    store: &K,
    key: &[u8],
) -> Result<Option<ChainPosition>, HeaderChainError> {
    match store.get(key)? {
        Some(bytes) => bincode::deserialize(&bytes)
            .map(Some)
            .map_err(|e| HeaderChainError::Serialization {
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

fn read_best_hash<K: KeyValueStore + ?Sized>(
    store: &K,
    height: i64,
) -> Result<Option<Hash>, HeaderChainError> {
    if height < 0 {
        return Ok(None);
    }
    match store.get(&keys::best_key(height as u64))? {
        Some(bytes) => {
            let hash: Hash =
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| HeaderChainError::Serialization {
                        message: "best-chain entry is not 32 bytes".to_string(),
                    })?;
            Ok(Some(hash))
        }
        None => Ok(None),
    }
}

fn read_record<K: KeyValueStore + ?Sized>(
    store: &K,
    hash: &Hash,
) -> Result<Option<HeaderRecord>, HeaderChainError> {
    match store.get(&keys::meta_key(hash))? {
        Some(bytes) => HeaderRecord::from_checksummed_bytes(hash, &bytes).map(Some),
        None => Ok(None),
    }
}
