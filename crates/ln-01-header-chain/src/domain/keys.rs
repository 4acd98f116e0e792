//! # Persisted Key Layout
//!
//! Every table lives under a single-byte prefix in one KV namespace so an
//! `apply_update` batch can touch all of them in one atomic write. Heights
//! are encoded big-endian so lexicographic key order equals height order.

use shared_types::Hash;

/// Best-chain index: height → block hash.
pub const PREFIX_BEST: u8 = b'B';
/// Raw header bodies: block hash → 80 bytes. This table is the archive
/// surface consumed by external collaborators.
pub const PREFIX_BODY: u8 = b'H';
/// Header metadata records: block hash → checksummed record.
pub const PREFIX_META: u8 = b'M';
/// Disconnected edges: (parent hash, child hash) → ().
pub const PREFIX_ORPHAN: u8 = b'O';
/// Sibling markers: block hash → ().
pub const PREFIX_SIBLING: u8 = b'S';
/// Singleton checkpoint position.
pub const KEY_CHECKPOINT: &[u8] = b"C";
/// Singleton tip position.
pub const KEY_TIP: &[u8] = b"T";

/// Key of the best-chain entry at `height`.
#[must_use]
pub fn best_key(height: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(PREFIX_BEST);
    key.extend_from_slice(&height.to_be_bytes());
    key
}

/// Key of the raw header body for `hash`.
#[must_use]
pub fn body_key(hash: &Hash) -> Vec<u8> {
    prefixed(PREFIX_BODY, hash)
}

/// Key of the metadata record for `hash`.
#[must_use]
pub fn meta_key(hash: &Hash) -> Vec<u8> {
    prefixed(PREFIX_META, hash)
}

/// Key of the disconnected edge `parent → child`.
#[must_use]
pub fn orphan_key(parent: &Hash, child: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(65);
    key.push(PREFIX_ORPHAN);
    key.extend_from_slice(parent);
    key.extend_from_slice(child);
    key
}

/// Key of the sibling marker for `hash`.
#[must_use]
pub fn sibling_key(hash: &Hash) -> Vec<u8> {
    prefixed(PREFIX_SIBLING, hash)
}

/// Scan prefix covering all disconnected edges.
#[must_use]
pub fn orphan_prefix() -> Vec<u8> {
    vec![PREFIX_ORPHAN]
}

/// Scan prefix covering all sibling markers.
#[must_use]
pub fn sibling_prefix() -> Vec<u8> {
    vec![PREFIX_SIBLING]
}

/// Recover `(parent, child)` from a disconnected-edge key.
#[must_use]
pub fn parse_orphan_key(key: &[u8]) -> Option<(Hash, Hash)> {
    if key.len() != 65 || key[0] != PREFIX_ORPHAN {
        return None;
    }
    let mut parent = [0u8; 32];
    let mut child = [0u8; 32];
    parent.copy_from_slice(&key[1..33]);
    child.copy_from_slice(&key[33..65]);
    Some((parent, child))
}

fn prefixed(prefix: u8, hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(prefix);
    key.extend_from_slice(hash);
    key
}
