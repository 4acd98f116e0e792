//! Domain layer: entities, key layout, errors, notification dedup.

pub mod entities;
pub mod errors;
pub mod keys;
pub mod notify;

pub use entities::{ChainUpdate, HeaderRecord, ValidityState};
pub use errors::{HeaderChainError, KVStoreError};
pub use notify::LastNotified;
