//! # Outbound Ports (Driven Ports)
//!
//! What the header-chain service requires from its host: a key-value
//! backend with atomic batches, and two notification outlets. The
//! filter-chain subsystem persists through this same `KeyValueStore`
//! contract under its own key prefixes, so one backend definition serves
//! both stores.
//!
//! Production adapters live in `node-runtime` (`RocksDbStore`, the bus
//! sinks); the in-memory implementations below back the unit tests.

use parking_lot::RwLock;
use shared_bus::ChainEvent;

use crate::domain::errors::KVStoreError;

/// One entry of an atomic write batch.
#[derive(Debug, Clone)]
pub enum BatchOperation {
    /// Write `key` → `value`.
    Put { key: Vec<u8>, value: Vec<u8> },
    /// Remove `key`.
    Delete { key: Vec<u8> },
}

impl BatchOperation {
    /// A write entry.
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        BatchOperation::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    /// A removal entry.
    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        BatchOperation::Delete { key: key.into() }
    }
}

/// Durable key-value backend.
///
/// `apply_update` leans entirely on `atomic_batch_write`: every operation
/// in a batch lands together or not at all, and a reader never observes a
/// half-applied batch.
pub trait KeyValueStore: Send + Sync {
    /// Value stored under `key`, if any.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KVStoreError>;

    /// Write one key outside a batch.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), KVStoreError>;

    /// Remove one key outside a batch.
    fn delete(&mut self, key: &[u8]) -> Result<(), KVStoreError>;

    /// Apply `operations` as one all-or-nothing transaction.
    fn atomic_batch_write(&mut self, operations: Vec<BatchOperation>) -> Result<(), KVStoreError>;

    /// Whether `key` is present, without loading its value.
    fn exists(&self, key: &[u8]) -> Result<bool, KVStoreError>;

    /// Every `(key, value)` under `prefix`, in ascending key order.
    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KVStoreError>;
}

/// Synchronous notification outlet.
///
/// The store calls this inside its commit path, so implementations must
/// not block; the runtime adapter forwards onto the broadcast bus.
pub trait ChainEventSink: Send + Sync {
    /// Deliver one event.
    fn emit(&self, event: ChainEvent);
}

/// Sink that drops every event. Used where a listener class is not wired.
#[derive(Debug, Default)]
pub struct NullEventSink;

impl ChainEventSink for NullEventSink {
    fn emit(&self, _event: ChainEvent) {}
}

/// Sink that records events for inspection in tests.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: RwLock<Vec<ChainEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything emitted so far.
    pub fn events(&self) -> Vec<ChainEvent> {
        self.events.read().clone()
    }

    /// Number of events emitted.
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// True when nothing was emitted.
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

impl ChainEventSink for RecordingEventSink {
    fn emit(&self, event: ChainEvent) {
        self.events.write().push(event);
    }
}

/// Test backend over an ordered map.
///
/// A `BTreeMap` mutated under exclusive access gives batch atomicity for
/// free and keeps `prefix_scan` in key order, matching what the RocksDB
/// adapter guarantees in production.
#[derive(Default)]
pub struct InMemoryKVStore {
    entries: std::collections::BTreeMap<Vec<u8>, Vec<u8>>,
}

impl InMemoryKVStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for InMemoryKVStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KVStoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), KVStoreError> {
        self.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), KVStoreError> {
        self.entries.remove(key);
        Ok(())
    }

    fn atomic_batch_write(&mut self, operations: Vec<BatchOperation>) -> Result<(), KVStoreError> {
        // Nothing here can fail, so applying in order is already atomic.
        for operation in operations {
            match operation {
                BatchOperation::Put { key, value } => {
                    self.entries.insert(key, value);
                }
                BatchOperation::Delete { key } => {
                    self.entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn exists(&self, key: &[u8]) -> Result<bool, KVStoreError> {
        Ok(self.entries.contains_key(key))
    }

    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KVStoreError> {
        Ok(self
            .entries
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}
