//! # Filter Chain Store (ln-02)
//!
//! Per-filter-type chains of compact filter headers and filters,
//! reconciled against the header chain.
//!
//! ## Domain Invariants
//!
//! | Invariant | Description |
//! |-----------|-------------|
//! | Tip ordering | `cfilter tip ≤ cfheader tip ≤ header tip`, always |
//! | Hash chaining | `header[i] = dsha256(filter_hash[i] ‖ header[i-1])` |
//! | No synthesis | Missing filters load as absent, never fabricated |
//! | Whole batches | Sync ingest stores everything or nothing |
//! | Checkpoint rollback | A failed checkpoint comparison moves tips back |
//!
//! ## Crate Structure (Hexagonal Architecture)
//!
//! - `domain/` - Golomb-coded sets, filter entities, key layout, errors
//! - `ports/` - `HeaderChainView` plus the shared `KeyValueStore` contract
//! - `service.rs` - `FilterChainService` implementing the store

pub mod domain;
pub mod ports;
pub mod service;

// Re-export key types for convenience
pub use domain::entities::{build_block_filter, compute_filter_header, CompactFilter};
pub use domain::errors::FilterChainError;
pub use ports::outbound::{HeaderChainView, StaticHeaderChain};
pub use service::{FilterChainService, SyncItem};
