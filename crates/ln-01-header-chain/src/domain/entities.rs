//! # Header Chain Entities
//!
//! The metadata record kept per header and the batch type consumed by
//! `apply_update`. Records are stored separately from the raw header
//! bodies; a header "exists" only when both halves are present.

use serde::{Deserialize, Serialize};
use shared_types::{BlockHeader, ChainPosition, Hash, U256};

use super::errors::HeaderChainError;

/// Local validity judgement for a stored header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ValidityState {
    /// Not yet judged (orphans buffered ahead of their parent).
    #[default]
    Unchecked,
    /// Linkage-checked and accepted.
    Valid,
    /// Rejected; kept so the hash is never re-requested.
    Invalid,
}

/// Metadata kept for every header the store has seen.
///
/// The raw 80 header bytes live in the body table; this record carries the
/// local bookkeeping around them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRecord {
    /// The header's hash.
    pub hash: Hash,
    /// Hash of the parent header.
    pub parent_hash: Hash,
    /// Height on the chain, or −1 while buffered as an orphan.
    pub height: i64,
    /// Local validity judgement.
    pub status: ValidityState,
    /// Mined-position marker: true while the header sits on the best chain.
    pub on_best_chain: bool,
    /// Cumulative work up to and including this header, big-endian.
    cumulative_work: [u8; 32],
}

impl HeaderRecord {
    /// Build a record for a header at a known position.
    #[must_use]
    pub fn new(
        header: &BlockHeader,
        height: i64,
        on_best_chain: bool,
        cumulative_work: U256,
    ) -> Self {
        let mut work_bytes = [0u8; 32];
        cumulative_work.to_big_endian(&mut work_bytes);
        Self {
            hash: header.block_hash(),
            parent_hash: header.parent_hash,
            height,
            status: if height >= 0 {
                ValidityState::Valid
            } else {
                ValidityState::Unchecked
            },
            on_best_chain,
            cumulative_work: work_bytes,
        }
    }

    /// Cumulative work up to and including this header.
    #[must_use]
    pub fn cumulative_work(&self) -> U256 {
        U256::from_big_endian(&self.cumulative_work)
    }

    /// Position this record occupies, when connected.
    #[must_use]
    pub fn position(&self) -> ChainPosition {
        ChainPosition::new(self.height, self.hash)
    }

    /// Serialize with a leading CRC32 over the record bytes.
    pub fn to_checksummed_bytes(&self) -> Result<Vec<u8>, HeaderChainError> {
        let body = bincode::serialize(self).map_err(|e| HeaderChainError::Serialization {
            message: e.to_string(),
        })?;
        let checksum = crc32fast::hash(&body);
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&checksum.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Deserialize, verifying the leading CRC32.
    pub fn from_checksummed_bytes(hash: &Hash, bytes: &[u8]) -> Result<Self, HeaderChainError> {
        if bytes.len() < 4 {
            return Err(HeaderChainError::Serialization {
                message: "record shorter than its checksum".to_string(),
            });
        }
        let expected = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let body = &bytes[4..];
        let actual = crc32fast::hash(body);
        if actual != expected {
            return Err(HeaderChainError::DataCorruption {
                hash: *hash,
                expected,
                actual,
            });
        }
        bincode::deserialize(body).map_err(|e| HeaderChainError::Serialization {
            message: e.to_string(),
        })
    }
}

/// One atomic update to the header chain.
///
/// A batch either extends the best chain (`reorg_from` is `None` and
/// `best` continues from the current tip), replaces a suffix of it
/// (`reorg_from` names the fork point and `best` restarts just above it),
/// or only adjusts orphan/sibling bookkeeping (`best` empty).
#[derive(Debug, Clone, Default)]
pub struct ChainUpdate {
    /// New header bodies to persist, parents before children.
    pub headers: Vec<BlockHeader>,
    /// New best-chain positions, contiguous ascending; the last entry
    /// becomes the tip.
    pub best: Vec<ChainPosition>,
    /// Fork point when this batch carries a reorg. Best-chain entries above
    /// it are deleted before `best` is written.
    pub reorg_from: Option<ChainPosition>,
    /// New checkpoint to pin, if any.
    pub checkpoint: Option<ChainPosition>,
    /// Disconnected edges to add: (parent, child).
    pub orphans_add: Vec<(Hash, Hash)>,
    /// Disconnected edges resolved by this batch.
    pub orphans_remove: Vec<(Hash, Hash)>,
    /// Headers that became valid non-best siblings.
    pub siblings_add: Vec<Hash>,
    /// Headers leaving the sibling set (promoted onto the best chain).
    pub siblings_remove: Vec<Hash>,
}

impl ChainUpdate {
    /// A batch that extends the best chain with `headers`, whose positions
    /// are `best`.
    #[must_use]
    pub fn extend(headers: Vec<BlockHeader>, best: Vec<ChainPosition>) -> Self {
        Self {
            headers,
            best,
            ..Self::default()
        }
    }

    /// A batch replacing everything above `fork` with `headers` at `best`.
    #[must_use]
    pub fn reorg(fork: ChainPosition, headers: Vec<BlockHeader>, best: Vec<ChainPosition>) -> Self {
        Self {
            headers,
            best,
            reorg_from: Some(fork),
            ..Self::default()
        }
    }

    /// True when the batch carries no tip movement.
    #[must_use]
    pub fn is_bookkeeping_only(&self) -> bool {
        self.best.is_empty() && self.reorg_from.is_none()
    }

    /// Verify `best` is a contiguous ascending run.
    pub fn check_contiguous(&self) -> Result<(), HeaderChainError> {
        for window in self.best.windows(2) {
            if window[1].height != window[0].height + 1 {
                return Err(HeaderChainError::NonContiguousBatch {
                    height: window[1].height,
                });
            }
        }
        Ok(())
    }
}
