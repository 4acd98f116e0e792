//! # Session State
//!
//! Lifecycle states, negotiated peer capabilities, and the bounded
//! known-inventory caches used to deduplicate announcements.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use shared_types::{ChainPosition, Hash};

/// Lifecycle of one connection. Progression is strictly forward; any
/// state may drop to `Shutdown` on error or close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Constructed, nothing initialized.
    PreInit,
    /// Local resources ready, no transport yet.
    Init,
    /// Transport established.
    Connect,
    /// Version/verack exchange in progress.
    Handshake,
    /// Outbound checkpoint verification in progress.
    Verify,
    /// Full message service.
    Run,
    /// Terminal.
    Shutdown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::PreInit => "PreInit",
            SessionState::Init => "Init",
            SessionState::Connect => "Connect",
            SessionState::Handshake => "Handshake",
            SessionState::Verify => "Verify",
            SessionState::Run => "Run",
            SessionState::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialed; we verify the peer before Run.
    Outbound,
    /// The peer dialed us; the dialer carries verification duty.
    Inbound,
}

/// Per-session tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Whether this node wants peer-sourced filters (adds the filter
    /// checkpoint query to Verify).
    pub want_peer_filters: bool,
    /// Interval between liveness pings.
    pub ping_interval: Duration,
    /// How long an unanswered ping may stay outstanding.
    pub ping_timeout: Duration,
    /// Deadline for the whole Verify stage.
    pub verify_timeout: Duration,
    /// Interval between full transaction-pool reconciliations.
    pub mempool_interval: Duration,
    /// User agent advertised in the handshake.
    pub user_agent: String,
    /// Whether we ask peers for transaction relay.
    pub relay: bool,
    /// Bound on each known-inventory cache.
    pub known_inventory_cap: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            want_peer_filters: true,
            ping_interval: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(30),
            verify_timeout: Duration::from_secs(30),
            mempool_interval: Duration::from_secs(120),
            user_agent: "/lantern:0.1.0/".to_string(),
            relay: true,
            known_inventory_cap: 10_000,
        }
    }
}

/// What we know about the remote side after the handshake.
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    /// Negotiated protocol version (minimum of both sides).
    pub version: u32,
    /// Service bits the peer advertised.
    pub services: u64,
    /// Peer's user agent.
    pub user_agent: String,
    /// Peer understands v2 address gossip.
    pub wants_addr_v2: bool,
    /// Peer asked for transaction relay.
    pub relay: bool,
    /// Best position the peer is known to have reached.
    pub last_remote_position: Option<ChainPosition>,
}

/// Bounded LRU set of hashes a peer is known to have.
///
/// Used for both block and transaction announcements so the same item is
/// neither re-requested from nor re-announced to a peer. Eviction drops
/// the oldest insertion once the cap is reached.
pub struct KnownInventory {
    entries: RwLock<HashMap<Hash, Instant>>,
    insertion_order: RwLock<Vec<Hash>>,
    max_size: usize,
}

impl KnownInventory {
    /// An empty cache bounded at `max_size` entries.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(max_size)),
            insertion_order: RwLock::new(Vec::with_capacity(max_size)),
            max_size,
        }
    }

    /// Check whether the peer is known to have `hash`.
    #[must_use]
    pub fn contains(&self, hash: &Hash) -> bool {
        self.entries.read().contains_key(hash)
    }

    /// Record that the peer has `hash`. Returns false when it was
    /// already known.
    pub fn insert(&self, hash: Hash) -> bool {
        let mut entries = self.entries.write();
        let mut order = self.insertion_order.write();

        if entries.contains_key(&hash) {
            return false;
        }
        // Evict oldest if at capacity
        if entries.len() >= self.max_size {
            if let Some(oldest) = order.first().copied() {
                entries.remove(&oldest);
                order.remove(0);
            }
        }
        entries.insert(hash, Instant::now());
        order.push(hash);
        true
    }

    /// Number of cached hashes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
