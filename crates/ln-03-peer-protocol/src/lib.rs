//! # Peer Protocol (ln-03)
//!
//! The wire codec and the per-connection protocol state machine that
//! drives the header and filter chains.
//!
//! ## Lifecycle
//!
//! ```text
//! PreInit → Init → Connect → Handshake → Verify → Run
//!                                  │         │      │
//!                                  └─────────┴──────┴──→ Shutdown
//! ```
//!
//! Outbound sessions verify the peer against the trusted checkpoint tuple
//! before serving it; inbound sessions skip Verify (the dialer carries
//! that duty). Message handling is gated by state, and every protocol
//! violation is peer-local: the offending session shuts down, the stores
//! and the other sessions never notice.
//!
//! ## Relay caps
//!
//! | Message | Cap |
//! |---------|-----|
//! | `headers` | 2000 |
//! | `cfheaders` | 2001 |
//! | `cfilter` range | 1000 |
//! | `addr`/`addrv2` | 1000, randomly subsampled |
//!
//! ## Crate Structure (Hexagonal Architecture)
//!
//! - `domain/` - Wire messages, codec, session state, errors
//! - `ports/` - Transport sink and async store gateways
//! - `service.rs` - `PeerSessionService` state machine
//! - `adapters/` - tokio TCP transport

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod service;

// Re-export key types for convenience
pub use domain::codec::{decode_message, encode_message, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use domain::errors::ProtocolError;
pub use domain::message::{
    WireMessage, MAX_ADDRS_PER_MSG, MAX_CFHEADERS_PER_MSG, MAX_CFILTERS_PER_RANGE,
    MAX_HEADERS_PER_MSG,
};
pub use domain::session::{Direction, KnownInventory, PeerInfo, SessionConfig, SessionState};
pub use ports::outbound::{
    AddressBook, FilterChainGateway, HeaderChainGateway, MessageSink, PeerAddress,
    TransactionPool,
};
pub use service::PeerSessionService;
