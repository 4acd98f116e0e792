//! # Shared Bus
//!
//! The only way chain state changes cross a subsystem boundary is as a
//! typed [`ChainEvent`] on a bus channel (or as an async gateway call);
//! subsystems never hand out references to their internals.
//!
//! The runtime constructs two channels with identical payload types: the
//! internal system channel that drives subsystems, and the external-facing
//! channel consumed by out-of-scope collaborators (wallet scanner, UI). A
//! store publishing a tip or reorg notification sends the same payload to
//! both.
//!
//! Delivery is broadcast fan-out with per-subscriber buffering: a slow
//! subscriber loses its oldest events instead of back-pressuring the
//! store's commit path.

pub mod bus;
pub mod events;

pub use bus::{InMemoryEventBus, Subscription, SubscriptionError};
pub use events::{ChainEvent, EventFilter, EventTopic};

/// Events buffered per subscriber before the oldest are dropped.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;
