//! # Protocol Errors
//!
//! Everything that can end a session. Transport and protocol failures are
//! peer-local: they shut down the offending session and never touch the
//! shared stores.

use shared_types::{DecodeError, Hash};
use thiserror::Error;

use super::session::SessionState;

/// Errors raised by the wire codec and the session state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Frame carried the wrong network magic.
    #[error("bad network magic: expected {expected:02x?}, got {actual:02x?}")]
    BadMagic {
        /// Magic this session's network requires.
        expected: [u8; 4],
        /// Magic the frame carried.
        actual: [u8; 4],
    },

    /// Frame checksum did not cover the payload.
    #[error("checksum mismatch on '{command}'")]
    ChecksumMismatch {
        /// Command whose payload failed the check.
        command: String,
    },

    /// Command field was not NUL-padded ASCII.
    #[error("unparseable command field")]
    BadCommand,

    /// Payload length field exceeded the hard limit.
    #[error("oversized payload: {length} bytes (limit {limit})")]
    OversizedPayload {
        /// Declared payload length.
        length: u32,
        /// Maximum accepted.
        limit: u32,
    },

    /// Payload bytes did not decode as the command's structure.
    #[error("malformed '{command}' payload: {source}")]
    Malformed {
        /// Command being decoded.
        command: String,
        /// Underlying decode failure.
        source: DecodeError,
    },

    /// Peer spoke an unsupported protocol version.
    #[error("peer version {version} below minimum {minimum}")]
    VersionTooOld {
        /// Version the peer advertised.
        version: u32,
        /// Oldest version this node accepts.
        minimum: u32,
    },

    /// Handshake nonce matched our own: we dialed ourselves.
    #[error("connected to self (nonce match)")]
    SelfConnection,

    /// A message arrived that is illegal in the current state.
    #[error("'{command}' is not legal in state {state}")]
    StateViolation {
        /// Offending command.
        command: String,
        /// State the session was in.
        state: SessionState,
    },

    /// A checkpoint response did not match the trusted tuple.
    #[error("checkpoint mismatch: expected {}, received {}",
        hex::encode(.expected), hex::encode(.received))]
    CheckpointMismatch {
        /// Hash the trusted checkpoint pins.
        expected: Hash,
        /// Hash the peer delivered.
        received: Hash,
    },

    /// A verification response carried the wrong element count.
    #[error("expected exactly {expected} '{command}' items, received {actual}")]
    UnexpectedResponseCount {
        /// Command being verified.
        command: String,
        /// Required count.
        expected: usize,
        /// Delivered count.
        actual: usize,
    },

    /// A request exceeded a relay cap.
    #[error("'{command}' range of {requested} exceeds cap {cap}")]
    RangeTooLarge {
        /// Offending command.
        command: String,
        /// Requested element count.
        requested: u64,
        /// Hard cap.
        cap: u64,
    },

    /// The peer went silent past the liveness deadline.
    #[error("ping timeout")]
    PingTimeout,

    /// Checkpoint verification did not finish before its deadline.
    #[error("verification timeout")]
    VerifyTimeout,

    /// A store gateway call failed.
    #[error("store gateway error: {message}")]
    Store {
        /// Gateway-reported description.
        message: String,
    },

    /// Transport-level I/O failure.
    #[error("transport error: {message}")]
    Transport {
        /// I/O-reported description.
        message: String,
    },
}

impl From<DecodeError> for ProtocolError {
    fn from(source: DecodeError) -> Self {
        ProtocolError::Malformed {
            command: String::new(),
            source,
        }
    }
}
