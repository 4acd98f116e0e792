//! Domain layer: wire messages, the codec, session state, errors.

pub mod codec;
pub mod errors;
pub mod message;
pub mod session;

pub use errors::ProtocolError;
pub use message::WireMessage;
pub use session::{Direction, KnownInventory, PeerInfo, SessionConfig, SessionState};
