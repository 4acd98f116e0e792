//! # Wire Messages
//!
//! Every protocol message decodes into the single [`WireMessage`] union at
//! the framing boundary and is matched exhaustively from there; there is
//! no per-type downcasting. Unknown commands survive framing as
//! [`WireMessage::Unknown`] and are logged, never dispatched.

use shared_types::{Block, BlockHeader, FilterType, Hash, Transaction};

/// Relay cap for `headers` responses.
pub const MAX_HEADERS_PER_MSG: usize = 2000;
/// Relay cap for `cfheaders` responses.
pub const MAX_CFHEADERS_PER_MSG: usize = 2001;
/// Relay cap for `cfilter` ranges.
pub const MAX_CFILTERS_PER_RANGE: usize = 1000;
/// Relay cap for address gossip.
pub const MAX_ADDRS_PER_MSG: usize = 1000;
/// Cap on inventory vectors.
pub const MAX_INV_PER_MSG: usize = 50_000;
/// Cap on locator hashes in `getheaders`/`getblocks`.
pub const MAX_LOCATOR_HASHES: usize = 101;
/// Cap on `getblocks` inventory responses.
pub const MAX_GETBLOCKS_RESPONSE: usize = 500;

/// Service bits advertised in the handshake.
pub mod services {
    /// Serves the header chain.
    pub const NETWORK_LIMITED: u64 = 1 << 10;
    /// Serves compact filters.
    pub const COMPACT_FILTERS: u64 = 1 << 6;
}

/// A v1 network address: services, IPv6-mapped IP, port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkAddress {
    /// Advertised service bits.
    pub services: u64,
    /// IPv6 address (IPv4 as v6-mapped).
    pub ip: [u8; 16],
    /// TCP port, big-endian on the wire.
    pub port: u16,
}

/// A timestamped v1 address-gossip entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrEntry {
    /// Last-seen time claimed by the sender.
    pub time: u32,
    /// The address itself.
    pub address: NetworkAddress,
}

/// Address-format network ids for v2 gossip.
pub mod network_id {
    /// 4-byte IPv4 address.
    pub const IPV4: u8 = 1;
    /// 16-byte IPv6 address.
    pub const IPV6: u8 = 2;
}

/// A v2 address-gossip entry: variable-length address keyed by network id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrV2Entry {
    /// Last-seen time claimed by the sender.
    pub time: u32,
    /// Advertised service bits.
    pub services: u64,
    /// Address-format id (see [`network_id`]).
    pub network: u8,
    /// Raw address bytes, length per network id.
    pub addr: Vec<u8>,
    /// TCP port, big-endian on the wire.
    pub port: u16,
}

/// The `version` handshake payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    /// Protocol version spoken by the sender.
    pub version: u32,
    /// Advertised service bits.
    pub services: u64,
    /// Sender's clock.
    pub timestamp: i64,
    /// Address the sender believes it is talking to.
    pub receiver: NetworkAddress,
    /// Sender's own address.
    pub sender: NetworkAddress,
    /// Random connection nonce (self-connection detection).
    pub nonce: u64,
    /// Free-form client identification.
    pub user_agent: String,
    /// Sender's best-chain height.
    pub start_height: i32,
    /// Whether the sender wants transaction relay.
    pub relay: bool,
}

/// Inventory item kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvKind {
    /// A transaction.
    Tx,
    /// A block.
    Block,
    /// Anything this node does not handle; kept for round-tripping.
    Other(u32),
}

impl InvKind {
    /// Wire encoding of this kind.
    #[must_use]
    pub fn to_wire(self) -> u32 {
        match self {
            InvKind::Tx => 1,
            InvKind::Block => 2,
            InvKind::Other(raw) => raw,
        }
    }

    /// Decode a wire kind; unknown values are preserved.
    #[must_use]
    pub fn from_wire(raw: u32) -> Self {
        match raw {
            1 => InvKind::Tx,
            2 => InvKind::Block,
            other => InvKind::Other(other),
        }
    }
}

/// One announced or requested inventory item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InventoryItem {
    /// What the hash names.
    pub kind: InvKind,
    /// The announced hash.
    pub hash: Hash,
}

/// The `getheaders`/`getblocks` payload: locator plus stop hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeadersMessage {
    /// Sender's protocol version.
    pub version: u32,
    /// Sparse most-recent-first sample of the sender's best chain.
    pub locator_hashes: Vec<Hash>,
    /// Last header wanted; all-zero means "as many as allowed".
    pub stop_hash: Hash,
}

/// The `getcfheaders`/`getcfilters` payload: a height range on one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetFilterRange {
    /// Filter chain queried.
    pub filter_type: FilterType,
    /// First height wanted.
    pub start_height: u32,
    /// Hash of the last block wanted.
    pub stop_hash: Hash,
}

/// The `cfheaders` payload: a hash-chained run of filter headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfHeadersMessage {
    /// Filter chain answered.
    pub filter_type: FilterType,
    /// Block the run ends at.
    pub stop_hash: Hash,
    /// Filter header immediately before the run.
    pub previous_filter_header: Hash,
    /// The run itself, ascending heights.
    pub filter_headers: Vec<Hash>,
}

/// The `cfilter` payload: one block's filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfilterMessage {
    /// Filter chain answered.
    pub filter_type: FilterType,
    /// Block the filter commits to.
    pub block_hash: Hash,
    /// Encoded filter bytes.
    pub filter_data: Vec<u8>,
}

/// The `cfcheckpt` payload: filter headers at checkpoint intervals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfCheckptMessage {
    /// Filter chain answered.
    pub filter_type: FilterType,
    /// Block the run ends at.
    pub stop_hash: Hash,
    /// Filter headers at every interval boundary.
    pub filter_headers: Vec<Hash>,
}

/// The `reject` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    /// Command being rejected.
    pub message: String,
    /// Machine-readable rejection code.
    pub code: u8,
    /// Human-readable reason.
    pub reason: String,
}

/// Every message this protocol can frame, as one tagged union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Handshake opener.
    Version(VersionMessage),
    /// Handshake acknowledgement.
    Verack,
    /// v1 address gossip.
    Addr(Vec<AddrEntry>),
    /// v2 address gossip.
    AddrV2(Vec<AddrV2Entry>),
    /// Inventory announcement.
    Inv(Vec<InventoryItem>),
    /// Inventory retrieval.
    GetData(Vec<InventoryItem>),
    /// Requested items this node does not have.
    NotFound(Vec<InventoryItem>),
    /// Header-range request.
    GetHeaders(GetHeadersMessage),
    /// Header relay.
    Headers(Vec<BlockHeader>),
    /// Filter-header range request.
    GetCfHeaders(GetFilterRange),
    /// Filter-header relay.
    CfHeaders(CfHeadersMessage),
    /// Filter range request.
    GetCfilters(GetFilterRange),
    /// Single-filter relay.
    Cfilter(CfilterMessage),
    /// Filter-checkpoint request.
    GetCfCheckpt {
        /// Filter chain queried.
        filter_type: FilterType,
        /// Block the run should end at.
        stop_hash: Hash,
    },
    /// Filter-checkpoint relay.
    CfCheckpt(CfCheckptMessage),
    /// Liveness probe.
    Ping {
        /// Echoed by the matching pong.
        nonce: u64,
    },
    /// Liveness answer.
    Pong {
        /// Nonce from the ping being answered.
        nonce: u64,
    },
    /// Peer complaint.
    Reject(RejectMessage),
    /// Announces v2 address capability (handshake only).
    SendAddrV2,
    /// Transaction-pool reconciliation request.
    Mempool,
    /// Transaction relay.
    Tx(Transaction),
    /// Full-block relay.
    Block(Block),
    /// Address-book request.
    GetAddr,
    /// Block-inventory request by locator.
    GetBlocks(GetHeadersMessage),
    /// Passed framing but has no decoder; logged, never dispatched.
    Unknown {
        /// Command string from the frame.
        command: String,
        /// Undecoded payload bytes.
        payload: Vec<u8>,
    },
}

impl WireMessage {
    /// Wire command string for this message.
    #[must_use]
    pub fn command(&self) -> &str {
        match self {
            WireMessage::Version(_) => "version",
            WireMessage::Verack => "verack",
            WireMessage::Addr(_) => "addr",
            WireMessage::AddrV2(_) => "addrv2",
            WireMessage::Inv(_) => "inv",
            WireMessage::GetData(_) => "getdata",
            WireMessage::NotFound(_) => "notfound",
            WireMessage::GetHeaders(_) => "getheaders",
            WireMessage::Headers(_) => "headers",
            WireMessage::GetCfHeaders(_) => "getcfheaders",
            WireMessage::CfHeaders(_) => "cfheaders",
            WireMessage::GetCfilters(_) => "getcfilters",
            WireMessage::Cfilter(_) => "cfilter",
            WireMessage::GetCfCheckpt { .. } => "getcfcheckpt",
            WireMessage::CfCheckpt(_) => "cfcheckpt",
            WireMessage::Ping { .. } => "ping",
            WireMessage::Pong { .. } => "pong",
            WireMessage::Reject(_) => "reject",
            WireMessage::SendAddrV2 => "sendaddrv2",
            WireMessage::Mempool => "mempool",
            WireMessage::Tx(_) => "tx",
            WireMessage::Block(_) => "block",
            WireMessage::GetAddr => "getaddr",
            WireMessage::GetBlocks(_) => "getblocks",
            WireMessage::Unknown { command, .. } => command,
        }
    }
}
