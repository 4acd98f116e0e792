//! # Per-Network Constants
//!
//! Every chain this node can track is described by a [`NetworkParams`]
//! value: magic bytes, genesis header, trusted checkpoint tuple, and the
//! protocol version window. The value is immutable and injected at
//! construction; subsystems never consult a global registry.

use serde::{Deserialize, Serialize};

use crate::entities::{BlockHeader, Hash};

/// Protocol version this node speaks.
pub const PROTOCOL_VERSION: u32 = 70_001;

/// Oldest peer protocol version accepted during handshake.
pub const MIN_PEER_VERSION: u32 = 60_002;

/// A trusted (height, hash) pair used to fast-validate peers and bound
/// reorg depth, together with the filter header committed at that height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Height the checkpoint pins.
    pub height: u32,
    /// Block hash at that height.
    pub block_hash: Hash,
    /// Basic-filter header at that height.
    pub cfheader: Hash,
}

/// Immutable constants for one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkParams {
    /// Human-readable network name (used in logs and config).
    pub name: &'static str,
    /// Message-framing magic bytes.
    pub magic: [u8; 4],
    /// Protocol version advertised in the handshake.
    pub protocol_version: u32,
    /// Oldest peer version accepted.
    pub min_peer_version: u32,
    /// Default listening port.
    pub default_port: u16,
    /// The chain's genesis header.
    pub genesis_header: BlockHeader,
    /// Trusted checkpoint, when the chain has one.
    pub checkpoint: Option<Checkpoint>,
}

impl NetworkParams {
    /// Constants for the production chain.
    #[must_use]
    pub fn mainnet() -> Self {
        Self {
            name: "mainnet",
            magic: [0xA7, 0x3E, 0x91, 0xC4],
            protocol_version: PROTOCOL_VERSION,
            min_peer_version: MIN_PEER_VERSION,
            default_port: 8734,
            genesis_header: BlockHeader {
                version: 1,
                parent_hash: [0u8; 32],
                merkle_root: [
                    0x3B, 0xA3, 0xED, 0xFD, 0x7A, 0x7B, 0x12, 0xB2, 0x7A, 0xC7, 0x2C, 0x3E,
                    0x67, 0x76, 0x8F, 0x61, 0x7F, 0xC8, 0x1B, 0xC3, 0x88, 0x8A, 0x51, 0x32,
                    0x3A, 0x9F, 0xB8, 0xAA, 0x4B, 0x1E, 0x5E, 0x4A,
                ],
                time: 1_598_918_400,
                bits: 0x1D00_FFFF,
                nonce: 2_083_236_893,
            },
            checkpoint: Some(Checkpoint {
                height: 250_000,
                block_hash: [
                    0x00, 0x00, 0x00, 0x00, 0x00, 0x1C, 0x4F, 0x3D, 0x92, 0x5A, 0x1B, 0x08,
                    0xC6, 0xE9, 0x44, 0xD1, 0x72, 0x3A, 0x9E, 0x0C, 0x55, 0x8D, 0xB7, 0x21,
                    0x40, 0x6F, 0x83, 0x19, 0xE2, 0xD4, 0x0B, 0x76,
                ],
                cfheader: [
                    0x8C, 0x52, 0xA1, 0x6E, 0x0D, 0xF4, 0x33, 0xB0, 0x97, 0x2E, 0x61, 0x5F,
                    0xD8, 0x0A, 0xBB, 0x24, 0x1C, 0x7E, 0x96, 0x45, 0x02, 0xEA, 0x78, 0x9D,
                    0x31, 0xC0, 0x5B, 0xF6, 0x88, 0x13, 0xA9, 0xDE,
                ],
            }),
        }
    }

    /// Constants for the public test chain.
    #[must_use]
    pub fn testnet() -> Self {
        Self {
            name: "testnet",
            magic: [0x1B, 0x26, 0xD7, 0x5A],
            protocol_version: PROTOCOL_VERSION,
            min_peer_version: MIN_PEER_VERSION,
            default_port: 18_734,
            genesis_header: BlockHeader {
                version: 1,
                parent_hash: [0u8; 32],
                merkle_root: [
                    0x3B, 0xA3, 0xED, 0xFD, 0x7A, 0x7B, 0x12, 0xB2, 0x7A, 0xC7, 0x2C, 0x3E,
                    0x67, 0x76, 0x8F, 0x61, 0x7F, 0xC8, 0x1B, 0xC3, 0x88, 0x8A, 0x51, 0x32,
                    0x3A, 0x9F, 0xB8, 0xAA, 0x4B, 0x1E, 0x5E, 0x4A,
                ],
                time: 1_599_004_800,
                bits: 0x1D00_FFFF,
                nonce: 414_098_458,
            },
            checkpoint: Some(Checkpoint {
                height: 100_000,
                block_hash: [
                    0x00, 0x00, 0x00, 0x00, 0x09, 0x33, 0xEA, 0x01, 0xAD, 0x0E, 0xE9, 0x84,
                    0x20, 0x97, 0x79, 0xBA, 0xAE, 0xC3, 0xCE, 0xD9, 0x0F, 0xA3, 0xF4, 0x08,
                    0x71, 0x95, 0x26, 0xF8, 0xD7, 0x7F, 0x49, 0x43,
                ],
                cfheader: [
                    0x41, 0x9E, 0x6C, 0x22, 0xB0, 0x53, 0xDD, 0x0F, 0x7A, 0x88, 0x19, 0x4E,
                    0x5B, 0xC3, 0x02, 0xE7, 0x90, 0x6D, 0x2F, 0x51, 0xAA, 0x08, 0xE4, 0x1C,
                    0xBD, 0x37, 0x60, 0x95, 0xF2, 0x8C, 0x4B, 0x01,
                ],
            }),
        }
    }

    /// Constants for a local regression-test chain: no checkpoint, loopback
    /// port, deterministic genesis.
    #[must_use]
    pub fn regtest() -> Self {
        Self {
            name: "regtest",
            magic: [0xFA, 0xBF, 0xB5, 0xDA],
            protocol_version: PROTOCOL_VERSION,
            min_peer_version: MIN_PEER_VERSION,
            default_port: 28_734,
            genesis_header: BlockHeader {
                version: 1,
                parent_hash: [0u8; 32],
                merkle_root: [0x42; 32],
                time: 1_296_688_602,
                bits: 0x207F_FFFF,
                nonce: 2,
            },
            checkpoint: None,
        }
    }

    /// Hash of the genesis header.
    #[must_use]
    pub fn genesis_hash(&self) -> Hash {
        self.genesis_header.block_hash()
    }
}
