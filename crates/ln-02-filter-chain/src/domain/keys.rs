//! # Persisted Key Layout
//!
//! Per-filter-type tables in the filter store's KV namespace. Prefixes are
//! disjoint from the header store's so both can share one backend in
//! simple deployments.

use shared_types::{FilterType, Hash};

/// Filter headers by block hash.
pub const PREFIX_CFHEADER: u8 = b'g';
/// Filter data by block hash.
pub const PREFIX_CFILTER: u8 = b'f';
/// Singleton cfheader tip per filter type.
pub const PREFIX_CFHEADER_TIP: u8 = b'u';
/// Singleton cfilter tip per filter type.
pub const PREFIX_CFILTER_TIP: u8 = b'v';

/// Key of the stored filter header for `block_hash`.
#[must_use]
pub fn cfheader_key(filter_type: FilterType, block_hash: &Hash) -> Vec<u8> {
    typed(PREFIX_CFHEADER, filter_type, block_hash)
}

/// Key of the stored filter for `block_hash`.
#[must_use]
pub fn cfilter_key(filter_type: FilterType, block_hash: &Hash) -> Vec<u8> {
    typed(PREFIX_CFILTER, filter_type, block_hash)
}

/// Key of the cfheader tip for `filter_type`.
#[must_use]
pub fn cfheader_tip_key(filter_type: FilterType) -> Vec<u8> {
    vec![PREFIX_CFHEADER_TIP, filter_type.to_wire()]
}

/// Key of the cfilter tip for `filter_type`.
#[must_use]
pub fn cfilter_tip_key(filter_type: FilterType) -> Vec<u8> {
    vec![PREFIX_CFILTER_TIP, filter_type.to_wire()]
}

fn typed(prefix: u8, filter_type: FilterType, hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(34);
    key.push(prefix);
    key.push(filter_type.to_wire());
    key.extend_from_slice(hash);
    key
}
