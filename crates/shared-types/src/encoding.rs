//! # Consensus Wire Encoding
//!
//! Little-endian integer and CompactSize helpers used by every structure
//! that crosses the wire or is hashed for consensus purposes. Writers append
//! to a plain `Vec<u8>`; reads go through [`ByteReader`], which tracks its
//! own cursor and fails cleanly on truncated input.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::entities::Hash;

/// Errors produced while decoding consensus-encoded bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Input ended before the structure was complete.
    #[error("unexpected end of input at offset {offset}, needed {needed} more bytes")]
    UnexpectedEnd { offset: usize, needed: usize },

    /// A CompactSize used more bytes than its value required.
    #[error("non-minimal CompactSize encoding at offset {offset}")]
    NonMinimalVarInt { offset: usize },

    /// A length prefix exceeded the decoder's sanity limit.
    #[error("declared length {len} exceeds limit {limit}")]
    OversizedLength { len: u64, limit: u64 },

    /// The bytes decoded but the value is not acceptable.
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
}

/// Maximum element count a single CompactSize-prefixed vector may declare.
///
/// Matches the largest cap any protocol message carries (2001 filter
/// headers) with generous headroom for inventory vectors.
pub const MAX_VEC_ELEMENTS: u64 = 50_000;

/// Double-SHA256 of `data`.
#[must_use]
pub fn double_sha256(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

// =============================================================================
// Writing
// =============================================================================

/// Append a `u16` little-endian.
pub fn write_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Append a `u32` little-endian.
pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Append an `i32` little-endian.
pub fn write_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Append a `u64` little-endian.
pub fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Append an `i64` little-endian.
pub fn write_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Append a CompactSize varint.
///
/// Values below 0xFD are a single byte; larger values carry a one-byte tag
/// followed by the minimal little-endian width.
pub fn write_compact_size(buf: &mut Vec<u8>, v: u64) {
    match v {
        0..=0xFC => buf.push(v as u8),
        0xFD..=0xFFFF => {
            buf.push(0xFD);
            write_u16(buf, v as u16);
        }
        0x1_0000..=0xFFFF_FFFF => {
            buf.push(0xFE);
            write_u32(buf, v as u32);
        }
        _ => {
            buf.push(0xFF);
            write_u64(buf, v);
        }
    }
}

/// Append a CompactSize-prefixed byte string.
pub fn write_var_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_compact_size(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Append a CompactSize-prefixed UTF-8 string.
pub fn write_var_string(buf: &mut Vec<u8>, s: &str) {
    write_var_bytes(buf, s.as_bytes());
}

// =============================================================================
// Reading
// =============================================================================

/// Cursor over a byte slice with checked reads.
#[derive(Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Wrap a slice for reading from the start.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current read offset.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// True when every byte has been consumed.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::UnexpectedEnd {
                offset: self.pos,
                needed: n - self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    /// Read a `u16` little-endian.
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a `u32` little-endian.
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read an `i32` little-endian.
    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a `u64` little-endian.
    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    /// Read an `i64` little-endian.
    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(i64::from_le_bytes(arr))
    }

    /// Read a 32-byte digest.
    pub fn read_hash(&mut self) -> Result<Hash, DecodeError> {
        let b = self.take(32)?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(b);
        Ok(hash)
    }

    /// Read `n` raw bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.take(n)
    }

    /// Read a CompactSize varint, rejecting non-minimal encodings.
    pub fn read_compact_size(&mut self) -> Result<u64, DecodeError> {
        let offset = self.pos;
        let tag = self.read_u8()?;
        let value = match tag {
            0xFD => {
                let v = u64::from(self.read_u16()?);
                if v < 0xFD {
                    return Err(DecodeError::NonMinimalVarInt { offset });
                }
                v
            }
            0xFE => {
                let v = u64::from(self.read_u32()?);
                if v <= 0xFFFF {
                    return Err(DecodeError::NonMinimalVarInt { offset });
                }
                v
            }
            0xFF => {
                let v = self.read_u64()?;
                if v <= 0xFFFF_FFFF {
                    return Err(DecodeError::NonMinimalVarInt { offset });
                }
                v
            }
            n => u64::from(n),
        };
        Ok(value)
    }

    /// Read a CompactSize-prefixed byte string, bounded by `limit`.
    pub fn read_var_bytes(&mut self, limit: u64) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_compact_size()?;
        if len > limit {
            return Err(DecodeError::OversizedLength { len, limit });
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    /// Read a CompactSize-prefixed UTF-8 string, bounded by `limit`.
    pub fn read_var_string(&mut self, limit: u64) -> Result<String, DecodeError> {
        let bytes = self.read_var_bytes(limit)?;
        String::from_utf8(bytes).map_err(|_| DecodeError::InvalidValue("string is not UTF-8"))
    }

    /// Read a CompactSize element count, bounded by [`MAX_VEC_ELEMENTS`].
    pub fn read_vec_len(&mut self) -> Result<usize, DecodeError> {
        let len = self.read_compact_size()?;
        if len > MAX_VEC_ELEMENTS {
            return Err(DecodeError::OversizedLength {
                len,
                limit: MAX_VEC_ELEMENTS,
            });
        }
        Ok(len as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_size_round_trip() {
        for v in [0u64, 1, 0xFC, 0xFD, 0xFFFF, 0x1_0000, 0xFFFF_FFFF, u64::MAX] {
            let mut buf = Vec::new();
            write_compact_size(&mut buf, v);
            let mut reader = ByteReader::new(&buf);
            assert_eq!(reader.read_compact_size().unwrap(), v);
            assert!(reader.is_exhausted());
        }
    }

    #[test]
    fn test_compact_size_boundary_widths() {
        let mut buf = Vec::new();
        write_compact_size(&mut buf, 0xFC);
        assert_eq!(buf.len(), 1);

        buf.clear();
        write_compact_size(&mut buf, 0xFD);
        assert_eq!(buf.len(), 3);

        buf.clear();
        write_compact_size(&mut buf, 0x1_0000);
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_non_minimal_varint_rejected() {
        // 0xFD prefix carrying a value that fits in one byte
        let buf = [0xFDu8, 0x01, 0x00];
        let mut reader = ByteReader::new(&buf);
        assert!(matches!(
            reader.read_compact_size(),
            Err(DecodeError::NonMinimalVarInt { offset: 0 })
        ));
    }

    #[test]
    fn test_truncated_read_reports_offset() {
        let buf = [0x01u8, 0x02];
        let mut reader = ByteReader::new(&buf);
        reader.read_u8().unwrap();
        let err = reader.read_u32().unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnexpectedEnd {
                offset: 1,
                needed: 3
            }
        );
    }

    #[test]
    fn test_var_bytes_limit_enforced() {
        let mut buf = Vec::new();
        write_var_bytes(&mut buf, &[0u8; 64]);
        let mut reader = ByteReader::new(&buf);
        assert!(matches!(
            reader.read_var_bytes(32),
            Err(DecodeError::OversizedLength { len: 64, limit: 32 })
        ));
    }

    #[test]
    fn test_double_sha256_known_vector() {
        // dsha256("") = 5df6e0e2...
        let hash = double_sha256(b"");
        assert_eq!(hash[0], 0x5d);
        assert_eq!(hash[1], 0xf6);
        assert_eq!(hash[2], 0xe0);
        assert_eq!(hash[3], 0xe2);
    }

    #[test]
    fn test_integer_round_trips() {
        let mut buf = Vec::new();
        write_u16(&mut buf, 0xBEEF);
        write_u32(&mut buf, 0xDEAD_BEEF);
        write_u64(&mut buf, 0x0123_4567_89AB_CDEF);
        write_i32(&mut buf, -7);
        write_i64(&mut buf, -1);

        let mut reader = ByteReader::new(&buf);
        assert_eq!(reader.read_u16().unwrap(), 0xBEEF);
        assert_eq!(reader.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.read_u64().unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(reader.read_i32().unwrap(), -7);
        assert_eq!(reader.read_i64().unwrap(), -1);
        assert!(reader.is_exhausted());
    }
}
