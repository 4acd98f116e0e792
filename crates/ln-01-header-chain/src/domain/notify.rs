//! # Notification Dedup
//!
//! The store remembers the last situation it announced and compares the
//! post-commit situation structurally before emitting anything, so each
//! distinct outcome is announced exactly once.

use shared_bus::ChainEvent;
use shared_types::ChainPosition;

/// The last situation announced on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LastNotified {
    /// Nothing announced yet.
    #[default]
    None,
    /// Best chain extended to this tip.
    Tip(ChainPosition),
    /// A suffix was replaced.
    Reorg {
        /// Fork point common to both chains.
        fork: ChainPosition,
        /// New tip.
        tip: ChainPosition,
    },
}

impl LastNotified {
    /// The event announcing this situation, if it is announceable.
    #[must_use]
    pub fn to_event(&self) -> Option<ChainEvent> {
        match *self {
            LastNotified::None => None,
            LastNotified::Tip(tip) => Some(ChainEvent::TipAdvanced { tip }),
            LastNotified::Reorg { fork, tip } => Some(ChainEvent::Reorg { fork, tip }),
        }
    }
}
