//! # Domain Errors
//!
//! Error types for the filter-chain subsystem.

use shared_types::{ChainPosition, FilterType, Hash};
use thiserror::Error;

/// Errors that can occur during filter-chain operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterChainError {
    /// No filter header stored for this block.
    #[error("no {filter_type:?} cfheader for block {}", hex::encode(.block_hash))]
    CfheaderNotFound {
        /// Filter chain queried.
        filter_type: FilterType,
        /// Block hash queried.
        block_hash: Hash,
    },

    /// No filter stored for this block.
    #[error("no {filter_type:?} cfilter for block {}", hex::encode(.block_hash))]
    CfilterNotFound {
        /// Filter chain queried.
        filter_type: FilterType,
        /// Block hash queried.
        block_hash: Hash,
    },

    /// The batch's first predecessor does not continue the stored chain.
    #[error("cfheader chain break: stored predecessor {}, batch claims {}",
        hex::encode(.stored), hex::encode(.claimed))]
    ChainMismatch {
        /// Header the store holds at the attachment point.
        stored: Hash,
        /// Header the batch claimed there.
        claimed: Hash,
    },

    /// One element of a sync batch failed hash-chain verification.
    #[error("filter header mismatch at index {index}: whole batch rejected")]
    SyncDataMismatch {
        /// Index of the first failing element.
        index: usize,
    },

    /// A write would break `cfilter ≤ cfheader ≤ header` tip ordering.
    #[error("tip-order violation: {reason}")]
    TipOrderViolation {
        /// Which bound would break.
        reason: &'static str,
    },

    /// A batch item does not sit on the header chain where it claims.
    #[error("block {} is not on the best chain at height {height}", hex::encode(.block_hash))]
    NotOnBestChain {
        /// Offending block hash.
        block_hash: Hash,
        /// Height it claimed.
        height: i64,
    },

    /// Checkpoint comparison failed; the tip was rolled back.
    #[error("filter checkpoint mismatch at {position}; rolled back to {rolled_back_to}")]
    CheckpointMismatch {
        /// Position that failed the comparison.
        position: ChainPosition,
        /// Last known-good position the tip now points at.
        rolled_back_to: ChainPosition,
    },

    /// Durable-store I/O failure.
    #[error("database error: {message}")]
    Database {
        /// Backend-reported description.
        message: String,
    },

    /// Record encode/decode failure.
    #[error("serialization error: {message}")]
    Serialization {
        /// Codec-reported description.
        message: String,
    },
}

impl From<ln_01_header_chain::KVStoreError> for FilterChainError {
    fn from(err: ln_01_header_chain::KVStoreError) -> Self {
        FilterChainError::Database {
            message: err.to_string(),
        }
    }
}
