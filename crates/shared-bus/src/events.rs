//! # Chain Events
//!
//! The payloads that cross subsystem boundaries. A store announces at most
//! one event per committed update; sessions announce their lifecycle; the
//! dead-letter topic carries operational faults that need an operator.

use serde::{Deserialize, Serialize};
use shared_types::{ChainPosition, FilterType};

/// One notification as published on a bus channel.
///
/// The header store sends the same payload to the internal and the
/// external channel; everything else goes to the internal channel only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainEvent {
    /// The best chain grew to a new tip without replacing anything.
    TipAdvanced {
        /// The new tip.
        tip: ChainPosition,
    },

    /// A contiguous suffix of the best chain was replaced.
    Reorg {
        /// Highest position common to the old and new chains.
        fork: ChainPosition,
        /// The new tip.
        tip: ChainPosition,
    },

    /// A filter chain's cfheader tip advanced.
    FilterTipAdvanced {
        /// Which filter chain.
        filter_type: FilterType,
        /// The new cfheader tip.
        position: ChainPosition,
    },

    /// A filter chain's tip was rolled back after a checkpoint mismatch.
    FilterRollback {
        /// Which filter chain.
        filter_type: FilterType,
        /// Last known-good position the tip now points at.
        position: ChainPosition,
    },

    /// A session completed its handshake (and verification, if outbound).
    PeerActive {
        /// Session correlation id.
        session: String,
        /// True for sessions this node dialed.
        outbound: bool,
    },

    /// A session reached Shutdown.
    PeerClosed {
        /// Session correlation id.
        session: String,
        /// Why the session ended.
        reason: String,
    },

    /// A durable-store transaction failed. Prior state is intact but the
    /// fault needs operator attention.
    StoreFault {
        /// Numeric id of the subsystem that hit the fault.
        subsystem_id: u8,
        /// Fault description.
        error: String,
    },
}

impl ChainEvent {
    /// The topic this event is filed under.
    #[must_use]
    pub fn topic(&self) -> EventTopic {
        match self {
            ChainEvent::TipAdvanced { .. } | ChainEvent::Reorg { .. } => EventTopic::HeaderChain,
            ChainEvent::FilterTipAdvanced { .. } | ChainEvent::FilterRollback { .. } => {
                EventTopic::FilterChain
            }
            ChainEvent::PeerActive { .. } | ChainEvent::PeerClosed { .. } => {
                EventTopic::PeerProtocol
            }
            ChainEvent::StoreFault { .. } => EventTopic::DeadLetterQueue,
        }
    }
}

/// Coarse subscription topics, one per event family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTopic {
    /// Tip movement and reorgs.
    HeaderChain,
    /// Filter-chain tips and rollbacks.
    FilterChain,
    /// Session lifecycle.
    PeerProtocol,
    /// Operational faults.
    DeadLetterQueue,
}

/// Which events a subscriber wants delivered.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    topics: Option<Vec<EventTopic>>,
}

impl EventFilter {
    /// Deliver everything.
    #[must_use]
    pub fn all() -> Self {
        Self { topics: None }
    }

    /// Deliver only the named topics.
    #[must_use]
    pub fn topics(topics: Vec<EventTopic>) -> Self {
        Self {
            topics: Some(topics),
        }
    }

    /// Whether `event` passes this filter.
    #[must_use]
    pub fn matches(&self, event: &ChainEvent) -> bool {
        match &self.topics {
            None => true,
            Some(topics) => topics.contains(&event.topic()),
        }
    }
}
