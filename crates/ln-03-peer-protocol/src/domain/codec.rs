//! # Wire Codec
//!
//! Fixed framing: network magic (4), NUL-padded ASCII command (12),
//! payload length (4, LE), payload checksum (4, leading bytes of the
//! payload's double-SHA256), then the payload. Payloads decode into
//! [`WireMessage`] exactly once, here; unknown commands pass framing and
//! surface as [`WireMessage::Unknown`].

use shared_types::encoding::{
    double_sha256, write_compact_size, write_i32, write_i64, write_u32, write_u64,
    write_var_bytes, write_var_string, ByteReader, DecodeError,
};
use shared_types::{Block, BlockHeader, FilterType, Transaction};

use super::errors::ProtocolError;
use super::message::{
    AddrEntry, AddrV2Entry, CfCheckptMessage, CfHeadersMessage, CfilterMessage, GetFilterRange,
    GetHeadersMessage, InvKind, InventoryItem, NetworkAddress, RejectMessage, VersionMessage,
    WireMessage, MAX_ADDRS_PER_MSG, MAX_CFHEADERS_PER_MSG, MAX_HEADERS_PER_MSG, MAX_INV_PER_MSG,
    MAX_LOCATOR_HASHES,
};

/// Bytes in a frame header.
pub const FRAME_HEADER_SIZE: usize = 24;

/// Hard cap on payload length; larger frames disconnect the peer.
pub const MAX_PAYLOAD_SIZE: u32 = 8 * 1024 * 1024;

/// Largest encoded filter accepted in a `cfilter` payload.
const MAX_FILTER_BYTES: u64 = 1_000_000;

/// Largest user agent accepted in a `version` payload.
const MAX_USER_AGENT_BYTES: u64 = 256;

/// Largest v2 address accepted (BIP155-style cap).
const MAX_ADDR_V2_BYTES: u64 = 512;

/// A parsed frame header; the payload follows on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Decoded command string.
    pub command: String,
    /// Payload length.
    pub length: u32,
    /// Payload checksum.
    pub checksum: [u8; 4],
}

/// Parse and validate the 24 fixed header bytes.
pub fn decode_frame_header(
    magic: [u8; 4],
    bytes: &[u8; FRAME_HEADER_SIZE],
) -> Result<FrameHeader, ProtocolError> {
    let actual: [u8; 4] = bytes[0..4].try_into().expect("4 bytes");
    if actual != magic {
        return Err(ProtocolError::BadMagic {
            expected: magic,
            actual,
        });
    }

    let raw_command = &bytes[4..16];
    let end = raw_command
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(raw_command.len());
    if raw_command[end..].iter().any(|b| *b != 0) {
        // Garbage after the NUL terminator
        return Err(ProtocolError::BadCommand);
    }
    let command = std::str::from_utf8(&raw_command[..end])
        .map_err(|_| ProtocolError::BadCommand)?
        .to_string();
    if !command.is_ascii() || command.is_empty() {
        return Err(ProtocolError::BadCommand);
    }

    let length = u32::from_le_bytes(bytes[16..20].try_into().expect("4 bytes"));
    if length > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::OversizedPayload {
            length,
            limit: MAX_PAYLOAD_SIZE,
        });
    }
    let checksum: [u8; 4] = bytes[20..24].try_into().expect("4 bytes");

    Ok(FrameHeader {
        command,
        length,
        checksum,
    })
}

/// Frame a message for the wire.
#[must_use]
pub fn encode_message(magic: [u8; 4], message: &WireMessage) -> Vec<u8> {
    let payload = encode_payload(message);
    let digest = double_sha256(&payload);

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&magic);

    let mut command = [0u8; 12];
    let name = message.command().as_bytes();
    command[..name.len()].copy_from_slice(name);
    frame.extend_from_slice(&command);

    write_u32(&mut frame, payload.len() as u32);
    frame.extend_from_slice(&digest[..4]);
    frame.extend_from_slice(&payload);
    frame
}

/// Decode one complete frame; returns the message and bytes consumed.
///
/// Convenience for tests and the in-memory transport; the TCP adapter
/// parses the header and payload separately.
pub fn decode_message(magic: [u8; 4], bytes: &[u8]) -> Result<(WireMessage, usize), ProtocolError> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return Err(ProtocolError::Malformed {
            command: String::new(),
            source: DecodeError::UnexpectedEnd {
                offset: bytes.len(),
                needed: FRAME_HEADER_SIZE - bytes.len(),
            },
        });
    }
    let header_bytes: [u8; FRAME_HEADER_SIZE] =
        bytes[..FRAME_HEADER_SIZE].try_into().expect("24 bytes");
    let header = decode_frame_header(magic, &header_bytes)?;

    let total = FRAME_HEADER_SIZE + header.length as usize;
    if bytes.len() < total {
        return Err(ProtocolError::Malformed {
            command: header.command,
            source: DecodeError::UnexpectedEnd {
                offset: bytes.len(),
                needed: total - bytes.len(),
            },
        });
    }
    let payload = &bytes[FRAME_HEADER_SIZE..total];
    let message = decode_payload(&header.command, payload, header.checksum)?;
    Ok((message, total))
}

/// Verify the checksum and decode a payload by command.
pub fn decode_payload(
    command: &str,
    payload: &[u8],
    checksum: [u8; 4],
) -> Result<WireMessage, ProtocolError> {
    let digest = double_sha256(payload);
    if digest[..4] != checksum {
        return Err(ProtocolError::ChecksumMismatch {
            command: command.to_string(),
        });
    }

    let mut reader = ByteReader::new(payload);
    let message = decode_body(command, &mut reader).map_err(|source| ProtocolError::Malformed {
        command: command.to_string(),
        source,
    })?;

    // Trailing bytes mean the sender framed a different structure.
    if !matches!(message, WireMessage::Unknown { .. }) && !reader.is_exhausted() {
        return Err(ProtocolError::Malformed {
            command: command.to_string(),
            source: DecodeError::InvalidValue("trailing bytes after payload"),
        });
    }
    Ok(message)
}

fn decode_body(command: &str, r: &mut ByteReader<'_>) -> Result<WireMessage, DecodeError> {
    Ok(match command {
        "version" => WireMessage::Version(decode_version(r)?),
        "verack" => WireMessage::Verack,
        "addr" => {
            let count = bounded_len(r, MAX_ADDRS_PER_MSG)?;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                entries.push(AddrEntry {
                    time: r.read_u32()?,
                    address: decode_network_address(r)?,
                });
            }
            WireMessage::Addr(entries)
        }
        "addrv2" => {
            let count = bounded_len(r, MAX_ADDRS_PER_MSG)?;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                entries.push(AddrV2Entry {
                    time: r.read_u32()?,
                    services: r.read_compact_size()?,
                    network: r.read_u8()?,
                    addr: r.read_var_bytes(MAX_ADDR_V2_BYTES)?,
                    port: u16::from_be_bytes([r.read_u8()?, r.read_u8()?]),
                });
            }
            WireMessage::AddrV2(entries)
        }
        "inv" => WireMessage::Inv(decode_inventory(r)?),
        "getdata" => WireMessage::GetData(decode_inventory(r)?),
        "notfound" => WireMessage::NotFound(decode_inventory(r)?),
        "getheaders" => WireMessage::GetHeaders(decode_locator(r)?),
        "getblocks" => WireMessage::GetBlocks(decode_locator(r)?),
        "headers" => {
            let count = bounded_len(r, MAX_HEADERS_PER_MSG)?;
            let mut headers = Vec::with_capacity(count);
            for _ in 0..count {
                headers.push(BlockHeader::decode(r)?);
                // Headers relay carries an always-zero tx count per entry.
                if r.read_compact_size()? != 0 {
                    return Err(DecodeError::InvalidValue("nonzero tx count in headers"));
                }
            }
            WireMessage::Headers(headers)
        }
        "getcfheaders" => WireMessage::GetCfHeaders(decode_filter_range(r)?),
        "getcfilters" => WireMessage::GetCfilters(decode_filter_range(r)?),
        "cfheaders" => {
            let filter_type = decode_filter_type(r)?;
            let stop_hash = r.read_hash()?;
            let previous_filter_header = r.read_hash()?;
            let count = bounded_len(r, MAX_CFHEADERS_PER_MSG)?;
            let mut filter_headers = Vec::with_capacity(count);
            for _ in 0..count {
                filter_headers.push(r.read_hash()?);
            }
            WireMessage::CfHeaders(CfHeadersMessage {
                filter_type,
                stop_hash,
                previous_filter_header,
                filter_headers,
            })
        }
        "cfilter" => WireMessage::Cfilter(CfilterMessage {
            filter_type: decode_filter_type(r)?,
            block_hash: r.read_hash()?,
            filter_data: r.read_var_bytes(MAX_FILTER_BYTES)?,
        }),
        "getcfcheckpt" => WireMessage::GetCfCheckpt {
            filter_type: decode_filter_type(r)?,
            stop_hash: r.read_hash()?,
        },
        "cfcheckpt" => {
            let filter_type = decode_filter_type(r)?;
            let stop_hash = r.read_hash()?;
            let count = bounded_len(r, MAX_CFHEADERS_PER_MSG)?;
            let mut filter_headers = Vec::with_capacity(count);
            for _ in 0..count {
                filter_headers.push(r.read_hash()?);
            }
            WireMessage::CfCheckpt(CfCheckptMessage {
                filter_type,
                stop_hash,
                filter_headers,
            })
        }
        "ping" => WireMessage::Ping {
            nonce: r.read_u64()?,
        },
        "pong" => WireMessage::Pong {
            nonce: r.read_u64()?,
        },
        "reject" => WireMessage::Reject(RejectMessage {
            message: r.read_var_string(64)?,
            code: r.read_u8()?,
            reason: r.read_var_string(MAX_USER_AGENT_BYTES)?,
        }),
        "sendaddrv2" => WireMessage::SendAddrV2,
        "mempool" => WireMessage::Mempool,
        "tx" => WireMessage::Tx(Transaction::decode(r)?),
        "block" => WireMessage::Block(Block::decode(r)?),
        "getaddr" => WireMessage::GetAddr,
        other => {
            // Unknown command: keep the raw payload for logging.
            let payload = r.read_bytes(r.remaining())?.to_vec();
            WireMessage::Unknown {
                command: other.to_string(),
                payload,
            }
        }
    })
}

/// Encode a payload without framing.
#[must_use]
pub fn encode_payload(message: &WireMessage) -> Vec<u8> {
    let mut buf = Vec::new();
    match message {
        WireMessage::Version(v) => encode_version(&mut buf, v),
        WireMessage::Verack
        | WireMessage::SendAddrV2
        | WireMessage::Mempool
        | WireMessage::GetAddr => {}
        WireMessage::Addr(entries) => {
            write_compact_size(&mut buf, entries.len() as u64);
            for entry in entries {
                write_u32(&mut buf, entry.time);
                encode_network_address(&mut buf, &entry.address);
            }
        }
        WireMessage::AddrV2(entries) => {
            write_compact_size(&mut buf, entries.len() as u64);
            for entry in entries {
                write_u32(&mut buf, entry.time);
                write_compact_size(&mut buf, entry.services);
                buf.push(entry.network);
                write_var_bytes(&mut buf, &entry.addr);
                buf.extend_from_slice(&entry.port.to_be_bytes());
            }
        }
        WireMessage::Inv(items) | WireMessage::GetData(items) | WireMessage::NotFound(items) => {
            write_compact_size(&mut buf, items.len() as u64);
            for item in items {
                write_u32(&mut buf, item.kind.to_wire());
                buf.extend_from_slice(&item.hash);
            }
        }
        WireMessage::GetHeaders(locator) | WireMessage::GetBlocks(locator) => {
            write_u32(&mut buf, locator.version);
            write_compact_size(&mut buf, locator.locator_hashes.len() as u64);
            for hash in &locator.locator_hashes {
                buf.extend_from_slice(hash);
            }
            buf.extend_from_slice(&locator.stop_hash);
        }
        WireMessage::Headers(headers) => {
            write_compact_size(&mut buf, headers.len() as u64);
            for header in headers {
                header.encode(&mut buf);
                write_compact_size(&mut buf, 0);
            }
        }
        WireMessage::GetCfHeaders(range) | WireMessage::GetCfilters(range) => {
            buf.push(range.filter_type.to_wire());
            write_u32(&mut buf, range.start_height);
            buf.extend_from_slice(&range.stop_hash);
        }
        WireMessage::CfHeaders(m) => {
            buf.push(m.filter_type.to_wire());
            buf.extend_from_slice(&m.stop_hash);
            buf.extend_from_slice(&m.previous_filter_header);
            write_compact_size(&mut buf, m.filter_headers.len() as u64);
            for header in &m.filter_headers {
                buf.extend_from_slice(header);
            }
        }
        WireMessage::Cfilter(m) => {
            buf.push(m.filter_type.to_wire());
            buf.extend_from_slice(&m.block_hash);
            write_var_bytes(&mut buf, &m.filter_data);
        }
        WireMessage::GetCfCheckpt {
            filter_type,
            stop_hash,
        } => {
            buf.push(filter_type.to_wire());
            buf.extend_from_slice(stop_hash);
        }
        WireMessage::CfCheckpt(m) => {
            buf.push(m.filter_type.to_wire());
            buf.extend_from_slice(&m.stop_hash);
            write_compact_size(&mut buf, m.filter_headers.len() as u64);
            for header in &m.filter_headers {
                buf.extend_from_slice(header);
            }
        }
        WireMessage::Ping { nonce } | WireMessage::Pong { nonce } => {
            write_u64(&mut buf, *nonce);
        }
        WireMessage::Reject(m) => {
            write_var_string(&mut buf, &m.message);
            buf.push(m.code);
            write_var_string(&mut buf, &m.reason);
        }
        WireMessage::Tx(tx) => tx.encode(&mut buf),
        WireMessage::Block(block) => block.encode(&mut buf),
        WireMessage::Unknown { payload, .. } => buf.extend_from_slice(payload),
    }
    buf
}

fn bounded_len(r: &mut ByteReader<'_>, limit: usize) -> Result<usize, DecodeError> {
    let len = r.read_compact_size()?;
    if len > limit as u64 {
        return Err(DecodeError::OversizedLength {
            len,
            limit: limit as u64,
        });
    }
    Ok(len as usize)
}

fn decode_filter_type(r: &mut ByteReader<'_>) -> Result<FilterType, DecodeError> {
    FilterType::from_wire(r.read_u8()?).ok_or(DecodeError::InvalidValue("unknown filter type"))
}

fn decode_filter_range(r: &mut ByteReader<'_>) -> Result<GetFilterRange, DecodeError> {
    Ok(GetFilterRange {
        filter_type: decode_filter_type(r)?,
        start_height: r.read_u32()?,
        stop_hash: r.read_hash()?,
    })
}

fn decode_inventory(r: &mut ByteReader<'_>) -> Result<Vec<InventoryItem>, DecodeError> {
    let count = bounded_len(r, MAX_INV_PER_MSG)?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(InventoryItem {
            kind: InvKind::from_wire(r.read_u32()?),
            hash: r.read_hash()?,
        });
    }
    Ok(items)
}

fn decode_locator(r: &mut ByteReader<'_>) -> Result<GetHeadersMessage, DecodeError> {
    let version = r.read_u32()?;
    let count = bounded_len(r, MAX_LOCATOR_HASHES)?;
    let mut locator_hashes = Vec::with_capacity(count);
    for _ in 0..count {
        locator_hashes.push(r.read_hash()?);
    }
    Ok(GetHeadersMessage {
        version,
        locator_hashes,
        stop_hash: r.read_hash()?,
    })
}

fn encode_network_address(buf: &mut Vec<u8>, address: &NetworkAddress) {
    write_u64(buf, address.services);
    buf.extend_from_slice(&address.ip);
    buf.extend_from_slice(&address.port.to_be_bytes());
}

fn decode_network_address(r: &mut ByteReader<'_>) -> Result<NetworkAddress, DecodeError> {
    let services = r.read_u64()?;
    let mut ip = [0u8; 16];
    ip.copy_from_slice(r.read_bytes(16)?);
    let port = u16::from_be_bytes([r.read_u8()?, r.read_u8()?]);
    Ok(NetworkAddress { services, ip, port })
}

fn encode_version(buf: &mut Vec<u8>, v: &VersionMessage) {
    write_u32(buf, v.version);
    write_u64(buf, v.services);
    write_i64(buf, v.timestamp);
    encode_network_address(buf, &v.receiver);
    encode_network_address(buf, &v.sender);
    write_u64(buf, v.nonce);
    write_var_string(buf, &v.user_agent);
    write_i32(buf, v.start_height);
    buf.push(u8::from(v.relay));
}

fn decode_version(r: &mut ByteReader<'_>) -> Result<VersionMessage, DecodeError> {
    Ok(VersionMessage {
        version: r.read_u32()?,
        services: r.read_u64()?,
        timestamp: r.read_i64()?,
        receiver: decode_network_address(r)?,
        sender: decode_network_address(r)?,
        nonce: r.read_u64()?,
        user_agent: r.read_var_string(MAX_USER_AGENT_BYTES)?,
        start_height: r.read_i32()?,
        relay: r.read_u8()? != 0,
    })
}
