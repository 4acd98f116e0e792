//! # Filter Chain Entities
//!
//! A compact filter, its hash, and the hash-chained filter header that
//! commits to every filter before it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use shared_types::encoding::double_sha256;
use shared_types::{Block, FilterType, Hash};

use super::gcs;

/// One block's compact filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactFilter {
    /// The filter-type rules this filter was built under.
    pub filter_type: FilterType,
    /// Block the filter commits to.
    pub block_hash: Hash,
    /// Encoded Golomb-coded set.
    pub data: Vec<u8>,
}

impl CompactFilter {
    /// Double-SHA256 of the encoded filter.
    #[must_use]
    pub fn filter_hash(&self) -> Hash {
        double_sha256(&self.data)
    }

    /// The filter header continuing the chain from `previous_header`.
    #[must_use]
    pub fn header(&self, previous_header: &Hash) -> Hash {
        compute_filter_header(&self.filter_hash(), previous_header)
    }
}

/// `header[i] = dsha256(filter_hash[i] || header[i-1])`.
#[must_use]
pub fn compute_filter_header(filter_hash: &Hash, previous_header: &Hash) -> Hash {
    let mut preimage = [0u8; 64];
    preimage[..32].copy_from_slice(filter_hash);
    preimage[32..].copy_from_slice(previous_header);
    double_sha256(&preimage)
}

/// Build a block's filter: pure function of the block contents.
///
/// The basic filter commits to every output locking script in the block,
/// excluding empty scripts and provably unspendable data carriers
/// (leading 0x6A). Input prevout scripts need undo data a light node does
/// not have; peer-sourced filters cover them and are admitted only through
/// hash-chain verification.
#[must_use]
pub fn build_block_filter(filter_type: FilterType, block: &Block) -> CompactFilter {
    let block_hash = block.block_hash();
    let elements: BTreeSet<Vec<u8>> = match filter_type {
        FilterType::Basic => block
            .transactions
            .iter()
            .flat_map(|tx| tx.outputs.iter())
            .filter(|out| !out.script_pubkey.is_empty() && out.script_pubkey[0] != 0x6A)
            .map(|out| out.script_pubkey.clone())
            .collect(),
    };

    CompactFilter {
        filter_type,
        block_hash,
        data: gcs::build(&gcs::filter_key(&block_hash), &elements),
    }
}
