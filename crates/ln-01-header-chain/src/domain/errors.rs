//! # Domain Errors
//!
//! Error types for the header-chain subsystem. A failed `apply_update`
//! leaves the store exactly as it was; every variant here describes why
//! the batch was refused or why a read could not be served.

use shared_types::{ChainPosition, Hash};
use thiserror::Error;

/// Errors that can occur during header-chain operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderChainError {
    /// Header body or metadata record missing; the header is treated as
    /// absent even when one half exists.
    #[error("header not found: {}", hex::encode(.hash))]
    NotFound {
        /// The requested block hash.
        hash: Hash,
    },

    /// No best-chain entry at this height.
    #[error("no best-chain entry at height {height}")]
    HeightNotFound {
        /// The requested height.
        height: i64,
    },

    /// Batch positions are not contiguous ascending heights.
    #[error("batch positions not contiguous at height {height}")]
    NonContiguousBatch {
        /// First height at which contiguity broke.
        height: i64,
    },

    /// A non-reorg batch must move the tip strictly upward.
    #[error("tip regression: current {current}, proposed {proposed}")]
    TipRegression {
        /// Tip before the batch.
        current: ChainPosition,
        /// Tip the batch proposed.
        proposed: ChainPosition,
    },

    /// The stated fork point is not on the stored best chain.
    #[error("fork point not on best chain: {0}")]
    UnknownForkPoint(ChainPosition),

    /// A reorg may not descend below the trusted checkpoint.
    #[error("reorg fork {fork} is below checkpoint height {checkpoint_height}")]
    ReorgBelowCheckpoint {
        /// Proposed fork point.
        fork: ChainPosition,
        /// Height pinned by the checkpoint.
        checkpoint_height: i64,
    },

    /// A checkpoint must sit on the best chain at or below the tip.
    #[error("checkpoint {0} conflicts with the best chain")]
    CheckpointConflict(ChainPosition),

    /// A stored record failed its integrity checksum.
    #[error(
        "metadata corruption for {}: expected checksum {expected:#010x}, got {actual:#010x}",
        hex::encode(.hash)
    )]
    DataCorruption {
        /// Hash whose record is damaged.
        hash: Hash,
        /// Checksum stored alongside the record.
        expected: u32,
        /// Checksum recomputed from the record bytes.
        actual: u32,
    },

    /// The batch referenced a position it never defined.
    #[error("batch header {} has no position or orphan edge", hex::encode(.hash))]
    UnanchoredHeader {
        /// The unanchored header's hash.
        hash: Hash,
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

/// Key-value store errors surfaced by storage adapters.
#[derive(Debug, Clone, Error)]
pub enum KVStoreError {
    /// I/O error during read/write.
    #[error("KV store I/O error: {message}")]
    Io {
        /// Backend-reported description.
        message: String,
    },

    /// Data corruption in the store.
    #[error("KV store corruption: {message}")]
    Corruption {
        /// Backend-reported description.
        message: String,
    },
}

impl From<KVStoreError> for HeaderChainError {
    fn from(err: KVStoreError) -> Self {
        HeaderChainError::Database {
            message: err.to_string(),
        }
    }
}
