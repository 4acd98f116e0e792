//! # Broadcast Bus
//!
//! A thin fan-out over `tokio::sync::broadcast`: publishers never block,
//! every subscriber sees every matching event, and a subscriber that falls
//! more than the channel capacity behind loses the oldest events rather
//! than stalling the publisher.

use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::events::{ChainEvent, EventFilter};
use crate::DEFAULT_CHANNEL_CAPACITY;

/// One bus channel. The runtime owns two with identical payload types:
/// the internal channel that drives subsystems and the external-facing
/// channel consumed by out-of-scope collaborators.
pub struct InMemoryEventBus {
    sender: broadcast::Sender<ChainEvent>,
}

impl InMemoryEventBus {
    /// A bus with the default per-subscriber buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// A bus buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish one event. Never blocks; store commit paths call this from
    /// synchronous code. Returns how many subscribers will see it.
    pub fn publish_now(&self, event: ChainEvent) -> usize {
        let topic = event.topic();
        match self.sender.send(event) {
            Ok(receivers) => {
                trace!(?topic, receivers, "Event published");
                receivers
            }
            Err(_) => {
                // send only fails when no receiver exists.
                warn!(?topic, "Event dropped: no subscribers");
                0
            }
        }
    }

    /// Open a subscription delivering events that pass `filter`.
    #[must_use]
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        debug!(?filter, "Subscription opened");
        Subscription {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber's end of the bus. Dropping it ends the subscription.
pub struct Subscription {
    receiver: broadcast::Receiver<ChainEvent>,
    filter: EventFilter,
}

impl Subscription {
    /// Wait for the next matching event.
    ///
    /// `None` means the bus itself was dropped. Events missed through lag
    /// are skipped silently after a log line; notifications are cheap to
    /// re-derive from store state.
    pub async fn recv(&mut self) -> Option<ChainEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Subscriber lagged; oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next matching event if one is already buffered.
    ///
    /// `Ok(None)` means nothing is pending; `Err(Closed)` means the bus
    /// was dropped.
    pub fn try_recv(&mut self) -> Result<Option<ChainEvent>, SubscriptionError> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Ok(Some(event)),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!(missed, "Subscriber lagged; oldest events dropped");
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Err(SubscriptionError::Closed)
                }
            }
        }
    }

    /// The filter this subscription was opened with.
    #[must_use]
    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }
}

/// Subscription-side failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// Every publisher handle is gone.
    #[error("event bus closed")]
    Closed,
}
