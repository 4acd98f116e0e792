//! # Header Chain Store (ln-01)
//!
//! The authoritative persistence layer for the header chain: a durable
//! best-chain index with checkpoint pinning, orphan/sibling tracking,
//! atomic reorg application, and change notification.
//!
//! ## Domain Invariants
//!
//! | Invariant | Description |
//! |-----------|-------------|
//! | Contiguous index | Exactly one hash per height from 0 to the tip |
//! | Atomic updates | Each `apply_update` commits entirely or not at all |
//! | Monotonic tip | Non-reorg batches move the tip strictly upward |
//! | Checkpoint pin | The index entry at the checkpoint height never changes |
//! | Paired records | A header exists only when body AND metadata exist |
//! | Single announcement | Each new situation is published exactly once |
//!
//! ## Crate Structure (Hexagonal Architecture)
//!
//! - `domain/` - Entities, key layout, errors, notification dedup
//! - `ports/` - `KeyValueStore` and `ChainEventSink` driven ports
//! - `service.rs` - `HeaderChainService` implementing the store

pub mod domain;
pub mod ports;
pub mod service;

// Re-export key types for convenience
pub use domain::entities::{ChainUpdate, HeaderRecord, ValidityState};
pub use domain::errors::{HeaderChainError, KVStoreError};
pub use domain::notify::LastNotified;
pub use ports::outbound::{
    BatchOperation, ChainEventSink, InMemoryKVStore, KeyValueStore, NullEventSink,
    RecordingEventSink,
};
pub use service::{HeaderChainService, DEFAULT_RECENT_HASHES};
