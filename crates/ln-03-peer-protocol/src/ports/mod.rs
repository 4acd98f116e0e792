//! Port traits required by the peer session.

pub mod outbound;

pub use outbound::{
    AddressBook, FilterChainGateway, HeaderChainGateway, MessageSink, MockAddressBook,
    MockFilterChain, MockHeaderChain, MockSink, MockTxPool, PeerAddress, TransactionPool,
};
