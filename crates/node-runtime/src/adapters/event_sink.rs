//! # Bus Event Sink
//!
//! Bridges the stores' synchronous `ChainEventSink` port onto a broadcast
//! bus. The runtime builds two of these: one over the internal system
//! bus, one over the external-facing bus.

use std::sync::Arc;

use ln_01_header_chain::ChainEventSink;
use shared_bus::{ChainEvent, InMemoryEventBus};

/// Forwards emitted events onto one bus.
pub struct BusEventSink {
    bus: Arc<InMemoryEventBus>,
}

impl BusEventSink {
    /// A sink publishing to `bus`.
    pub fn new(bus: Arc<InMemoryEventBus>) -> Self {
        Self { bus }
    }
}

impl ChainEventSink for BusEventSink {
    fn emit(&self, event: ChainEvent) {
        self.bus.publish_now(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_bus::EventFilter;
    use shared_types::ChainPosition;

    #[tokio::test]
    async fn test_emitted_events_reach_subscribers() {
        let bus = Arc::new(InMemoryEventBus::new());
        let mut subscription = bus.subscribe(EventFilter::all());
        let sink = BusEventSink::new(bus);

        sink.emit(ChainEvent::TipAdvanced {
            tip: ChainPosition::new(1, [1; 32]),
        });

        let received = subscription.try_recv().unwrap();
        assert!(matches!(received, Some(ChainEvent::TipAdvanced { .. })));
    }
}
