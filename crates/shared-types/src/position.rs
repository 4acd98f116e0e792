//! # Chain Position
//!
//! The comparable (height, hash) value every chain-tracking subsystem keys
//! on. Ordering is height-ascending with raw hash bytes breaking ties, so a
//! `ChainPosition` can serve as a set/map key with a strict total order.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entities::Hash;

/// Height value meaning "no chain yet".
pub const SENTINEL_HEIGHT: i64 = -1;

/// A position on a chain: height plus the block hash at that height.
///
/// Heights are signed so the pre-genesis sentinel (−1) is representable; in
/// steady state every position held by a store is ≥ 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainPosition {
    /// Block height, or [`SENTINEL_HEIGHT`] for "no chain".
    pub height: i64,
    /// Block hash at that height.
    pub hash: Hash,
}

impl ChainPosition {
    /// Construct a position at a concrete height.
    #[must_use]
    pub fn new(height: i64, hash: Hash) -> Self {
        Self { height, hash }
    }

    /// The pre-genesis sentinel: height −1, all-zero hash.
    #[must_use]
    pub fn sentinel() -> Self {
        Self {
            height: SENTINEL_HEIGHT,
            hash: [0u8; 32],
        }
    }

    /// True for the pre-genesis sentinel.
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.height == SENTINEL_HEIGHT
    }

    /// True when `candidate` occupies this position's height or beyond with
    /// a different identity: strictly higher, or same height under a
    /// different hash.
    ///
    /// This only flags a *different* candidate, not a *better* one. Callers
    /// must apply their own fork-choice rule (e.g. cumulative work) before
    /// acting on it.
    #[must_use]
    pub fn is_replaced_by(&self, candidate: &ChainPosition) -> bool {
        candidate.height > self.height
            || (candidate.height == self.height && candidate.hash != self.hash)
    }
}

impl Default for ChainPosition {
    fn default() -> Self {
        Self::sentinel()
    }
}

impl Ord for ChainPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.height
            .cmp(&other.height)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for ChainPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ChainPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at height {}", hex::encode(self.hash), self.height)
    }
}
