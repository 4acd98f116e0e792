//! Port traits required by the header-chain service.

pub mod outbound;

pub use outbound::{
    BatchOperation, ChainEventSink, InMemoryKVStore, KeyValueStore, NullEventSink,
    RecordingEventSink,
};
