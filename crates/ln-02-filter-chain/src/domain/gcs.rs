//! # Golomb-Coded Sets
//!
//! The probabilistic per-block filter: each element is hashed with a
//! SipHash-2-4 key derived from the block hash, mapped uniformly onto
//! `[0, N * M)`, and the sorted deltas are Golomb-Rice coded with
//! parameter `P`. Construction is deterministic, so two nodes filtering
//! the same block always produce identical bytes.

use std::collections::BTreeSet;
use std::hash::Hasher;

use siphasher::sip::SipHasher24;

use shared_types::encoding::{write_compact_size, ByteReader, DecodeError};
use shared_types::Hash;

/// Golomb-Rice remainder width.
pub const P: u8 = 19;

/// False-positive rate parameter; the hash range is `N * M`.
pub const M: u64 = 784_931;

/// Derive the SipHash key from a block hash: its first 16 bytes.
#[must_use]
pub fn filter_key(block_hash: &Hash) -> [u8; 16] {
    let mut key = [0u8; 16];
    key.copy_from_slice(&block_hash[..16]);
    key
}

fn siphash(key: &[u8; 16], element: &[u8]) -> u64 {
    let mut k0 = [0u8; 8];
    let mut k1 = [0u8; 8];
    k0.copy_from_slice(&key[..8]);
    k1.copy_from_slice(&key[8..]);
    let mut hasher = SipHasher24::new_with_keys(u64::from_le_bytes(k0), u64::from_le_bytes(k1));
    hasher.write(element);
    hasher.finish()
}

/// Map a 64-bit hash uniformly onto `[0, f)` without division.
fn map_to_range(hash: u64, f: u64) -> u64 {
    ((u128::from(hash) * u128::from(f)) >> 64) as u64
}

struct BitWriter {
    bytes: Vec<u8>,
    // Bits already used in the last byte, 0..8
    used: u8,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            bytes: Vec::new(),
            used: 8,
        }
    }

    fn write_bit(&mut self, bit: bool) {
        if self.used == 8 {
            self.bytes.push(0);
            self.used = 0;
        }
        if bit {
            let last = self.bytes.len() - 1;
            self.bytes[last] |= 1 << (7 - self.used);
        }
        self.used += 1;
    }

    fn write_bits(&mut self, value: u64, count: u8) {
        for i in (0..count).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

struct BitReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_bit(&mut self) -> Result<bool, DecodeError> {
        let byte = self.pos / 8;
        if byte >= self.bytes.len() {
            return Err(DecodeError::UnexpectedEnd {
                offset: byte,
                needed: 1,
            });
        }
        let bit = (self.bytes[byte] >> (7 - (self.pos % 8))) & 1 == 1;
        self.pos += 1;
        Ok(bit)
    }

    fn read_bits(&mut self, count: u8) -> Result<u64, DecodeError> {
        let mut value = 0u64;
        for _ in 0..count {
            value = (value << 1) | u64::from(self.read_bit()?);
        }
        Ok(value)
    }
}

/// Build the encoded filter over `elements`, keyed by `key`.
///
/// Output layout: CompactSize element count, then the Golomb-Rice coded
/// sorted deltas. Duplicate elements collapse before encoding.
#[must_use]
pub fn build(key: &[u8; 16], elements: &BTreeSet<Vec<u8>>) -> Vec<u8> {
    let n = elements.len() as u64;
    let mut out = Vec::new();
    write_compact_size(&mut out, n);
    if n == 0 {
        return out;
    }

    let f = n * M;
    let mut values: Vec<u64> = elements
        .iter()
        .map(|e| map_to_range(siphash(key, e), f))
        .collect();
    values.sort_unstable();

    let mut writer = BitWriter::new();
    let mut previous = 0u64;
    for value in values {
        let delta = value - previous;
        previous = value;

        // Unary quotient, then P remainder bits.
        let quotient = delta >> P;
        for _ in 0..quotient {
            writer.write_bit(true);
        }
        writer.write_bit(false);
        writer.write_bits(delta & ((1 << P) - 1), P);
    }
    out.extend_from_slice(&writer.into_bytes());
    out
}

/// Decode a filter back into its mapped hash values.
///
/// The element count is cross-checked against the coded stream.
pub fn decode_values(data: &[u8]) -> Result<Vec<u64>, DecodeError> {
    let mut reader = ByteReader::new(data);
    let n = reader.read_compact_size()?;
    let consumed = reader.position();
    let mut bits = BitReader::new(&data[consumed..]);

    let mut values = Vec::with_capacity(n as usize);
    let mut previous = 0u64;
    for _ in 0..n {
        let mut quotient = 0u64;
        while bits.read_bit()? {
            quotient += 1;
        }
        let remainder = bits.read_bits(P)?;
        let delta = (quotient << P) | remainder;
        previous += delta;
        values.push(previous);
    }
    Ok(values)
}

/// True when `element` hashes onto a value present in the decoded filter.
#[must_use]
pub fn contains(key: &[u8; 16], values: &[u64], n: u64, element: &[u8]) -> bool {
    if n == 0 {
        return false;
    }
    let target = map_to_range(siphash(key, element), n * M);
    values.binary_search(&target).is_ok()
}
