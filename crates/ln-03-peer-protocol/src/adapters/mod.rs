//! Transport adapters implementing the session's driven ports.

pub mod tcp;

pub use tcp::{split, TcpMessageSink, TcpMessageSource};
