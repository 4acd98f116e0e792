//! # Shared Types Crate
//!
//! This crate contains the chain primitives used by every subsystem: the
//! fixed-size digest, block header and transaction entities, the comparable
//! `ChainPosition` value, per-network constants, and the consensus wire
//! encoding helpers.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: All cross-subsystem types are defined here.
//! - **Injected Constants**: Per-chain values (magic bytes, genesis header,
//!   checkpoint tuple) travel as a `NetworkParams` value handed to each
//!   subsystem at construction. There is no global registry.
//! - **Wire-Exact Encoding**: Consensus structures encode through the
//!   little-endian/CompactSize helpers in [`encoding`], never through a
//!   generic serialization framework.

pub mod encoding;
pub mod entities;
pub mod params;
pub mod position;

pub use encoding::{double_sha256, ByteReader, DecodeError};
pub use entities::{Block, BlockHeader, FilterType, Hash, OutPoint, Transaction, TxIn, TxOut};
pub use params::{Checkpoint, NetworkParams};
pub use position::ChainPosition;

// Re-export U256 from primitive-types for use across all subsystems
pub use primitive_types::U256;
