//! # Core Chain Entities
//!
//! Block headers, transactions, and blocks as they appear on the wire and
//! in storage. Every structure here round-trips through the consensus
//! encoding in [`crate::encoding`]; block and transaction identity is the
//! double-SHA256 of that encoding.

use serde::{Deserialize, Serialize};

use crate::encoding::{
    double_sha256, write_compact_size, write_i32, write_u32, write_u64, write_var_bytes,
    ByteReader, DecodeError,
};
use crate::U256;

/// A 32-byte hash (double-SHA256 output).
pub type Hash = [u8; 32];

/// Serialized size of a block header.
pub const HEADER_SIZE: usize = 80;

/// Largest script a transaction output may carry through the decoder.
const MAX_SCRIPT_BYTES: u64 = 10_000;

/// The header of a block: chain linkage, commitment roots, and proof-of-work
/// fields. Exactly [`HEADER_SIZE`] bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BlockHeader {
    /// Protocol version for this block.
    pub version: i32,
    /// Hash of the parent block (creates the chain linkage).
    pub parent_hash: Hash,
    /// Merkle root of all transactions in the block.
    pub merkle_root: Hash,
    /// Unix timestamp when the block was mined.
    pub time: u32,
    /// Compact difficulty target.
    pub bits: u32,
    /// Proof-of-work nonce.
    pub nonce: u32,
}

impl BlockHeader {
    /// Consensus-encode into `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_i32(buf, self.version);
        buf.extend_from_slice(&self.parent_hash);
        buf.extend_from_slice(&self.merkle_root);
        write_u32(buf, self.time);
        write_u32(buf, self.bits);
        write_u32(buf, self.nonce);
    }

    /// The 80 raw bytes of this header.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        self.encode(&mut buf);
        buf
    }

    /// Decode one header from `reader`.
    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: reader.read_i32()?,
            parent_hash: reader.read_hash()?,
            merkle_root: reader.read_hash()?,
            time: reader.read_u32()?,
            bits: reader.read_u32()?,
            nonce: reader.read_u32()?,
        })
    }

    /// Decode a header from exactly its 80 serialized bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != HEADER_SIZE {
            return Err(DecodeError::InvalidValue("header must be 80 bytes"));
        }
        let mut reader = ByteReader::new(bytes);
        Self::decode(&mut reader)
    }

    /// The block hash: double-SHA256 of the consensus encoding.
    #[must_use]
    pub fn block_hash(&self) -> Hash {
        double_sha256(&self.to_bytes())
    }

    /// Expand the compact `bits` field into the full 256-bit target.
    ///
    /// Returns `None` for encodings with a negative sign bit or an exponent
    /// that would overflow 256 bits.
    #[must_use]
    pub fn target(&self) -> Option<U256> {
        let exponent = (self.bits >> 24) as usize;
        let mantissa = self.bits & 0x007F_FFFF;
        if self.bits & 0x0080_0000 != 0 {
            return None;
        }
        let value = if exponent <= 3 {
            U256::from(mantissa) >> (8 * (3 - exponent))
        } else {
            if exponent > 32 {
                return None;
            }
            U256::from(mantissa) << (8 * (exponent - 3))
        };
        Some(value)
    }

    /// Work contributed by a block meeting this header's target.
    ///
    /// Computed as `floor(2^256 / (target + 1))`, the conventional
    /// cumulative-work term. Zero for an invalid target encoding.
    #[must_use]
    pub fn work(&self) -> U256 {
        match self.target() {
            Some(target) if !target.is_zero() => {
                // 2^256 / (target + 1) == (!target / (target + 1)) + 1
                (!target / (target + U256::one())) + U256::one()
            }
            Some(_) | None => U256::zero(),
        }
    }
}

/// Compact-filter type identifier as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum FilterType {
    /// The basic output-script filter.
    #[default]
    Basic = 0,
}

impl FilterType {
    /// Wire byte for this filter type.
    #[must_use]
    pub fn to_wire(self) -> u8 {
        self as u8
    }

    /// Parse a wire byte; unknown types are `None`.
    #[must_use]
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Basic),
            _ => None,
        }
    }
}

/// Reference to a transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    /// Transaction the output belongs to.
    pub txid: Hash,
    /// Output index within that transaction.
    pub vout: u32,
}

impl OutPoint {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.txid);
        write_u32(buf, self.vout);
    }

    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            txid: reader.read_hash()?,
            vout: reader.read_u32()?,
        })
    }
}

/// A transaction input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    /// The output being spent.
    pub previous_output: OutPoint,
    /// Unlocking script.
    pub script_sig: Vec<u8>,
    /// Relative-locktime / replacement sequence field.
    pub sequence: u32,
}

impl TxIn {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        self.previous_output.encode(buf);
        write_var_bytes(buf, &self.script_sig);
        write_u32(buf, self.sequence);
    }

    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            previous_output: OutPoint::decode(reader)?,
            script_sig: reader.read_var_bytes(MAX_SCRIPT_BYTES)?,
            sequence: reader.read_u32()?,
        })
    }
}

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    /// Amount in base units.
    pub value: u64,
    /// Locking script.
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_u64(buf, self.value);
        write_var_bytes(buf, &self.script_pubkey);
    }

    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            value: reader.read_u64()?,
            script_pubkey: reader.read_var_bytes(MAX_SCRIPT_BYTES)?,
        })
    }
}

/// A transaction as relayed on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction format version.
    pub version: i32,
    /// Inputs being spent.
    pub inputs: Vec<TxIn>,
    /// Outputs being created.
    pub outputs: Vec<TxOut>,
    /// Absolute locktime.
    pub lock_time: u32,
}

impl Transaction {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_i32(buf, self.version);
        write_compact_size(buf, self.inputs.len() as u64);
        for input in &self.inputs {
            input.encode(buf);
        }
        write_compact_size(buf, self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode(buf);
        }
        write_u32(buf, self.lock_time);
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let version = reader.read_i32()?;
        let input_count = reader.read_vec_len()?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            inputs.push(TxIn::decode(reader)?);
        }
        let output_count = reader.read_vec_len()?;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            outputs.push(TxOut::decode(reader)?);
        }
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time: reader.read_u32()?,
        })
    }

    /// Transaction id: double-SHA256 of the consensus encoding.
    #[must_use]
    pub fn txid(&self) -> Hash {
        double_sha256(&self.to_bytes())
    }
}

/// A full block: header plus transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// The block header.
    pub header: BlockHeader,
    /// All transactions in the block.
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        self.header.encode(buf);
        write_compact_size(buf, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode(buf);
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let header = BlockHeader::decode(reader)?;
        let tx_count = reader.read_vec_len()?;
        let mut transactions = Vec::with_capacity(tx_count);
        for _ in 0..tx_count {
            transactions.push(Transaction::decode(reader)?);
        }
        Ok(Self {
            header,
            transactions,
        })
    }

    /// The block hash (hash of the header only).
    #[must_use]
    pub fn block_hash(&self) -> Hash {
        self.header.block_hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 2,
            parent_hash: [0x11; 32],
            merkle_root: [0x22; 32],
            time: 1_700_000_000,
            bits: 0x1D00_FFFF,
            nonce: 42,
        }
    }

    #[test]
    fn test_header_round_trip() {
        let header = sample_header();
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(BlockHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_hash_changes_with_nonce() {
        let a = sample_header();
        let mut b = a;
        b.nonce += 1;
        assert_ne!(a.block_hash(), b.block_hash());
    }

    #[test]
    fn test_header_wrong_length_rejected() {
        assert!(BlockHeader::from_bytes(&[0u8; 79]).is_err());
        assert!(BlockHeader::from_bytes(&[0u8; 81]).is_err());
    }

    #[test]
    fn test_work_monotonic_in_difficulty() {
        // A lower target (harder block) must contribute more work.
        let easy = BlockHeader {
            bits: 0x1D00_FFFF,
            ..sample_header()
        };
        let hard = BlockHeader {
            bits: 0x1C00_FFFF,
            ..sample_header()
        };
        assert!(hard.work() > easy.work());
    }

    #[test]
    fn test_negative_target_has_zero_work() {
        let header = BlockHeader {
            bits: 0x1D80_0000,
            ..sample_header()
        };
        assert_eq!(header.target(), None);
        assert_eq!(header.work(), U256::zero());
    }

    #[test]
    fn test_transaction_round_trip() {
        let tx = Transaction {
            version: 1,
            inputs: vec![TxIn {
                previous_output: OutPoint {
                    txid: [0xAA; 32],
                    vout: 3,
                },
                script_sig: vec![0x51],
                sequence: 0xFFFF_FFFF,
            }],
            outputs: vec![
                TxOut {
                    value: 5_000,
                    script_pubkey: vec![0x76, 0xA9, 0x14],
                },
                TxOut {
                    value: 0,
                    script_pubkey: vec![0x6A, 0x01, 0xFF],
                },
            ],
            lock_time: 0,
        };
        let bytes = tx.to_bytes();
        let mut reader = ByteReader::new(&bytes);
        let decoded = Transaction::decode(&mut reader).unwrap();
        assert!(reader.is_exhausted());
        assert_eq!(decoded, tx);
        assert_eq!(decoded.txid(), tx.txid());
    }

    #[test]
    fn test_block_round_trip() {
        let block = Block {
            header: sample_header(),
            transactions: vec![Transaction {
                version: 1,
                inputs: vec![],
                outputs: vec![TxOut {
                    value: 50,
                    script_pubkey: vec![0xAC],
                }],
                lock_time: 0,
            }],
        };
        let bytes = block.to_bytes();
        let mut reader = ByteReader::new(&bytes);
        let decoded = Block::decode(&mut reader).unwrap();
        assert!(reader.is_exhausted());
        assert_eq!(decoded, block);
    }
}
