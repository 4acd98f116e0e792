//! Port traits required by the filter-chain service.

pub mod outbound;

pub use outbound::{
    BatchOperation, ChainEventSink, HeaderChainView, KeyValueStore, StaticHeaderChain,
};
