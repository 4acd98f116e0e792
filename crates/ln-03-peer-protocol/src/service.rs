//! # Peer Session Service
//!
//! One connection's protocol lifecycle:
//! `PreInit → Init → Connect → Handshake → Verify → Run → Shutdown`,
//! with any state dropping to Shutdown on error or close. Every inbound
//! message is gated by the current state; malformed, checksum-invalid, or
//! state-invalid traffic aborts that message and disconnects the peer.
//! No partial mutation from a rejected message survives: store writes
//! happen only after a message fully validates.
//!
//! The session talks to the stores exclusively through async gateways and
//! to the world through a `MessageSink`; tearing the session down makes
//! any in-flight gateway results no-ops (the state check in front of
//! every handler discards them).

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use rand::Rng;
use shared_bus::ChainEvent;
use shared_types::{BlockHeader, ChainPosition, DecodeError, FilterType, Hash, NetworkParams};
use tracing::{debug, info, warn};
use uuid::Uuid;

use ln_01_header_chain::{ChainEventSink, ChainUpdate};
use ln_02_filter_chain::CompactFilter;

use crate::domain::errors::ProtocolError;
use crate::domain::message::{
    network_id, services, AddrEntry, AddrV2Entry, CfCheckptMessage, CfHeadersMessage,
    CfilterMessage, GetFilterRange, GetHeadersMessage, InvKind, InventoryItem, NetworkAddress,
    VersionMessage, WireMessage, MAX_ADDRS_PER_MSG, MAX_CFHEADERS_PER_MSG,
    MAX_CFILTERS_PER_RANGE, MAX_GETBLOCKS_RESPONSE, MAX_HEADERS_PER_MSG, MAX_INV_PER_MSG,
};
use crate::domain::session::{Direction, KnownInventory, PeerInfo, SessionConfig, SessionState};
use crate::ports::outbound::{
    AddressBook, FilterChainGateway, HeaderChainGateway, MessageSink, PeerAddress,
    TransactionPool,
};

/// Locator depth requested from the header store.
const LOCATOR_DEPTH: usize = 100;

/// Spacing of cfcheckpt entries.
const CFCHECKPT_INTERVAL: i64 = 1000;

/// Longest sibling-branch climb before treating headers as orphans.
const MAX_BRANCH_CLIMB: usize = 1000;

#[derive(Debug, Default)]
struct HandshakeProgress {
    version_sent: bool,
    version_received: bool,
    verack_received: bool,
}

#[derive(Debug, Default)]
struct VerifyProgress {
    awaiting_header: bool,
    awaiting_cfheader: bool,
    deadline: Option<Instant>,
}

#[derive(Debug)]
struct Liveness {
    last_ping_sent: Option<Instant>,
    outstanding: Option<(u64, Instant)>,
    last_mempool_sync: Option<Instant>,
}

/// Per-connection protocol state machine.
pub struct PeerSessionService<S, H, F, A, P>
where
    S: MessageSink,
    H: HeaderChainGateway,
    F: FilterChainGateway,
    A: AddressBook,
    P: TransactionPool,
{
    params: NetworkParams,
    config: SessionConfig,
    session_id: String,
    direction: Direction,
    local_nonce: u64,
    state: RwLock<SessionState>,
    peer: RwLock<PeerInfo>,
    handshake: Mutex<HandshakeProgress>,
    verify: Mutex<VerifyProgress>,
    liveness: Mutex<Liveness>,
    known_blocks: KnownInventory,
    known_txs: KnownInventory,
    sink: Arc<S>,
    headers: Arc<H>,
    filters: Arc<F>,
    address_book: Arc<A>,
    tx_pool: Arc<P>,
    events: Arc<dyn ChainEventSink>,
}

impl<S, H, F, A, P> PeerSessionService<S, H, F, A, P>
where
    S: MessageSink,
    H: HeaderChainGateway,
    F: FilterChainGateway,
    A: AddressBook,
    P: TransactionPool,
{
    /// Create a session for an established connection.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: NetworkParams,
        config: SessionConfig,
        direction: Direction,
        sink: Arc<S>,
        headers: Arc<H>,
        filters: Arc<F>,
        address_book: Arc<A>,
        tx_pool: Arc<P>,
        events: Arc<dyn ChainEventSink>,
    ) -> Self {
        let known_cap = config.known_inventory_cap;
        Self {
            params,
            config,
            session_id: Uuid::new_v4().to_string(),
            direction,
            local_nonce: rand::thread_rng().gen(),
            state: RwLock::new(SessionState::PreInit),
            peer: RwLock::new(PeerInfo::default()),
            handshake: Mutex::new(HandshakeProgress::default()),
            verify: Mutex::new(VerifyProgress::default()),
            liveness: Mutex::new(Liveness {
                last_ping_sent: None,
                outstanding: None,
                last_mempool_sync: None,
            }),
            known_blocks: KnownInventory::new(known_cap),
            known_txs: KnownInventory::new(known_cap),
            sink,
            headers,
            filters,
            address_book,
            tx_pool,
            events,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Correlation id for logs and events.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Snapshot of the negotiated peer info.
    pub fn peer_info(&self) -> PeerInfo {
        self.peer.read().clone()
    }

    /// Which side opened this connection.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Drive the session from construction to Handshake.
    ///
    /// The transport is already established (inbound accept or outbound
    /// dial happened before construction), so Connect is immediate.
    /// Outbound sessions open the version exchange.
    pub async fn begin(&self) -> Result<(), ProtocolError> {
        self.set_state(SessionState::Init);
        self.set_state(SessionState::Connect);
        self.set_state(SessionState::Handshake);
        debug!(session = %self.session_id, direction = ?self.direction, "Session started");

        if self.direction == Direction::Outbound {
            self.send_version().await?;
            self.handshake.lock().version_sent = true;
        }
        Ok(())
    }

    /// Process one inbound message, gated by the current state.
    ///
    /// An `Err` means the session must be torn down; callers route it to
    /// [`PeerSessionService::shutdown`] with the error as the reason.
    pub async fn handle_message(&self, message: WireMessage) -> Result<(), ProtocolError> {
        let state = self.state();

        if let WireMessage::Unknown { command, payload } = &message {
            debug!(
                session = %self.session_id,
                command,
                bytes = payload.len(),
                "Unhandled command"
            );
            return Ok(());
        }

        match state {
            SessionState::Shutdown => Ok(()),
            SessionState::PreInit | SessionState::Init | SessionState::Connect => {
                debug!(
                    session = %self.session_id,
                    command = message.command(),
                    %state,
                    "Message before handshake; ignored"
                );
                Ok(())
            }
            SessionState::Handshake => self.handle_in_handshake(message).await,
            SessionState::Verify => self.handle_in_verify(message).await,
            SessionState::Run => self.handle_in_run(message).await,
        }
    }

    /// Periodic maintenance: liveness pings and stage deadlines.
    pub async fn on_tick(&self) -> Result<(), ProtocolError> {
        match self.state() {
            SessionState::Verify => {
                let deadline = self.verify.lock().deadline;
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        return Err(ProtocolError::VerifyTimeout);
                    }
                }
                Ok(())
            }
            SessionState::Run => {
                let now = Instant::now();
                let (send_ping, expired, reconcile_pool) = {
                    let liveness = self.liveness.lock();
                    let expired = matches!(
                        liveness.outstanding,
                        Some((_, sent)) if now.duration_since(sent) >= self.config.ping_timeout
                    );
                    let due = liveness.outstanding.is_none()
                        && liveness
                            .last_ping_sent
                            .map_or(true, |t| now.duration_since(t) >= self.config.ping_interval);
                    let reconcile = liveness.last_mempool_sync.map_or(true, |t| {
                        now.duration_since(t) >= self.config.mempool_interval
                    });
                    (due, expired, reconcile)
                };
                if expired {
                    return Err(ProtocolError::PingTimeout);
                }
                if send_ping {
                    let nonce: u64 = rand::thread_rng().gen();
                    self.sink.send(WireMessage::Ping { nonce }).await?;
                    let mut liveness = self.liveness.lock();
                    liveness.last_ping_sent = Some(now);
                    liveness.outstanding = Some((nonce, now));
                }
                if reconcile_pool {
                    // Periodic full reconciliation: ask for the peer's pool.
                    self.sink.send(WireMessage::Mempool).await?;
                    self.liveness.lock().last_mempool_sync = Some(now);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Tear the session down. Idempotent; cancels the transport and
    /// announces the closure once.
    pub async fn shutdown(&self, reason: &str) {
        {
            let mut state = self.state.write();
            if *state == SessionState::Shutdown {
                return;
            }
            *state = SessionState::Shutdown;
        }
        info!(session = %self.session_id, reason, "Session shut down");
        self.sink.close().await;
        self.events.emit(ChainEvent::PeerClosed {
            session: self.session_id.clone(),
            reason: reason.to_string(),
        });
    }

    fn set_state(&self, next: SessionState) {
        *self.state.write() = next;
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    async fn send_version(&self) -> Result<(), ProtocolError> {
        let best = self.headers.best().await?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let version = VersionMessage {
            version: self.params.protocol_version,
            services: services::NETWORK_LIMITED | services::COMPACT_FILTERS,
            timestamp,
            receiver: NetworkAddress::default(),
            sender: NetworkAddress::default(),
            nonce: self.local_nonce,
            user_agent: self.config.user_agent.clone(),
            start_height: best.height as i32,
            relay: self.config.relay,
        };
        self.sink.send(WireMessage::Version(version)).await
    }

    async fn handle_in_handshake(&self, message: WireMessage) -> Result<(), ProtocolError> {
        match message {
            WireMessage::Version(version) => self.on_version(version).await,
            WireMessage::Verack => {
                self.handshake.lock().verack_received = true;
                self.try_finish_handshake().await
            }
            WireMessage::SendAddrV2 => {
                self.peer.write().wants_addr_v2 = true;
                Ok(())
            }
            other => {
                // Not part of the handshake: logged, not an error.
                debug!(
                    session = %self.session_id,
                    command = other.command(),
                    "Non-handshake message during handshake; ignored"
                );
                Ok(())
            }
        }
    }

    async fn on_version(&self, version: VersionMessage) -> Result<(), ProtocolError> {
        if version.nonce == self.local_nonce {
            return Err(ProtocolError::SelfConnection);
        }
        if version.version < self.params.min_peer_version {
            return Err(ProtocolError::VersionTooOld {
                version: version.version,
                minimum: self.params.min_peer_version,
            });
        }

        {
            let mut peer = self.peer.write();
            peer.version = version.version.min(self.params.protocol_version);
            peer.services = version.services;
            peer.user_agent = version.user_agent.clone();
            peer.relay = version.relay;
        }
        debug!(
            session = %self.session_id,
            peer_version = version.version,
            user_agent = %version.user_agent,
            "Version received"
        );

        let version_sent = {
            let mut handshake = self.handshake.lock();
            handshake.version_received = true;
            std::mem::replace(&mut handshake.version_sent, true)
        };
        if !version_sent {
            self.send_version().await?;
        }
        // Capability announcement must precede the acknowledgement.
        self.sink.send(WireMessage::SendAddrV2).await?;
        self.sink.send(WireMessage::Verack).await?;
        self.try_finish_handshake().await
    }

    async fn try_finish_handshake(&self) -> Result<(), ProtocolError> {
        let complete = {
            let handshake = self.handshake.lock();
            handshake.version_received && handshake.verack_received
        };
        if !complete {
            return Ok(());
        }

        match self.direction {
            // The dialing side validates the peer before serving it.
            Direction::Outbound => self.enter_verify().await,
            // Inbound sessions skip Verify: the initiator carries that duty.
            Direction::Inbound => self.enter_run().await,
        }
    }

    // =========================================================================
    // Verify
    // =========================================================================

    async fn enter_verify(&self) -> Result<(), ProtocolError> {
        let Some(checkpoint) = self.params.checkpoint else {
            // Chains without a checkpoint have nothing to verify against.
            return self.enter_run().await;
        };

        self.set_state(SessionState::Verify);
        {
            let mut verify = self.verify.lock();
            verify.awaiting_header = true;
            verify.awaiting_cfheader = self.config.want_peer_filters;
            verify.deadline = Some(Instant::now() + self.config.verify_timeout);
        }
        debug!(
            session = %self.session_id,
            height = checkpoint.height,
            "Verifying peer against checkpoint"
        );

        // Empty locator + stop hash asks for exactly that one header.
        self.sink
            .send(WireMessage::GetHeaders(GetHeadersMessage {
                version: self.params.protocol_version,
                locator_hashes: Vec::new(),
                stop_hash: checkpoint.block_hash,
            }))
            .await?;

        if self.config.want_peer_filters {
            self.sink
                .send(WireMessage::GetCfHeaders(GetFilterRange {
                    filter_type: FilterType::Basic,
                    start_height: checkpoint.height,
                    stop_hash: checkpoint.block_hash,
                }))
                .await?;
        }
        Ok(())
    }

    async fn handle_in_verify(&self, message: WireMessage) -> Result<(), ProtocolError> {
        match message {
            WireMessage::Headers(headers) => self.on_verify_headers(&headers).await,
            WireMessage::CfHeaders(m) => self.on_verify_cfheaders(&m).await,
            WireMessage::Ping { nonce } => self.sink.send(WireMessage::Pong { nonce }).await,
            WireMessage::Pong { nonce } => {
                self.on_pong(nonce);
                Ok(())
            }
            other => {
                debug!(
                    session = %self.session_id,
                    command = other.command(),
                    "Message ignored during verification"
                );
                Ok(())
            }
        }
    }

    async fn on_verify_headers(&self, headers: &[BlockHeader]) -> Result<(), ProtocolError> {
        let Some(checkpoint) = self.params.checkpoint else {
            return Ok(());
        };
        if headers.len() != 1 {
            return Err(ProtocolError::UnexpectedResponseCount {
                command: "headers".into(),
                expected: 1,
                actual: headers.len(),
            });
        }
        let received = headers[0].block_hash();
        if received != checkpoint.block_hash {
            return Err(ProtocolError::CheckpointMismatch {
                expected: checkpoint.block_hash,
                received,
            });
        }

        self.verify.lock().awaiting_header = false;
        self.try_finish_verify().await
    }

    async fn on_verify_cfheaders(&self, m: &CfHeadersMessage) -> Result<(), ProtocolError> {
        let Some(checkpoint) = self.params.checkpoint else {
            return Ok(());
        };
        if m.filter_headers.len() != 1 {
            return Err(ProtocolError::UnexpectedResponseCount {
                command: "cfheaders".into(),
                expected: 1,
                actual: m.filter_headers.len(),
            });
        }
        if m.filter_headers[0] != checkpoint.cfheader {
            return Err(ProtocolError::CheckpointMismatch {
                expected: checkpoint.cfheader,
                received: m.filter_headers[0],
            });
        }

        self.verify.lock().awaiting_cfheader = false;
        self.try_finish_verify().await
    }

    async fn try_finish_verify(&self) -> Result<(), ProtocolError> {
        let done = {
            let verify = self.verify.lock();
            !verify.awaiting_header && !verify.awaiting_cfheader
        };
        if done {
            info!(session = %self.session_id, "Peer passed checkpoint verification");
            self.enter_run().await?;
        }
        Ok(())
    }

    // =========================================================================
    // Run
    // =========================================================================

    async fn enter_run(&self) -> Result<(), ProtocolError> {
        self.set_state(SessionState::Run);
        self.events.emit(ChainEvent::PeerActive {
            session: self.session_id.clone(),
            outbound: self.direction == Direction::Outbound,
        });

        // Open header sync immediately.
        self.request_headers().await?;
        if self.config.want_peer_filters {
            self.request_next_cfheaders().await?;
        }
        Ok(())
    }

    async fn request_headers(&self) -> Result<(), ProtocolError> {
        let locator_hashes = self.headers.recent_hashes(LOCATOR_DEPTH).await?;
        self.sink
            .send(WireMessage::GetHeaders(GetHeadersMessage {
                version: self.params.protocol_version,
                locator_hashes,
                stop_hash: [0u8; 32],
            }))
            .await
    }

    async fn request_next_cfheaders(&self) -> Result<(), ProtocolError> {
        let best = self.headers.best().await?;
        let cfheader_tip = self.filters.cfheader_tip().await?;
        if best.height <= cfheader_tip.height {
            return Ok(());
        }
        let stop_height = best
            .height
            .min(cfheader_tip.height + MAX_CFHEADERS_PER_MSG as i64);
        let Some(stop_hash) = self.headers.best_hash_at(stop_height).await? else {
            return Ok(());
        };
        self.sink
            .send(WireMessage::GetCfHeaders(GetFilterRange {
                filter_type: FilterType::Basic,
                start_height: (cfheader_tip.height + 1) as u32,
                stop_hash,
            }))
            .await
    }

    async fn request_next_cfilters(&self) -> Result<(), ProtocolError> {
        let cfheader_tip = self.filters.cfheader_tip().await?;
        let cfilter_tip = self.filters.cfilter_tip().await?;
        if cfheader_tip.height <= cfilter_tip.height {
            return Ok(());
        }
        let stop_height = cfheader_tip
            .height
            .min(cfilter_tip.height + MAX_CFILTERS_PER_RANGE as i64);
        let Some(stop_hash) = self.headers.best_hash_at(stop_height).await? else {
            return Ok(());
        };
        self.sink
            .send(WireMessage::GetCfilters(GetFilterRange {
                filter_type: FilterType::Basic,
                start_height: (cfilter_tip.height + 1) as u32,
                stop_hash,
            }))
            .await
    }

    async fn handle_in_run(&self, message: WireMessage) -> Result<(), ProtocolError> {
        match message {
            // A second handshake is a violation, not noise.
            WireMessage::Version(_) | WireMessage::Verack => Err(ProtocolError::StateViolation {
                command: message.command().to_string(),
                state: SessionState::Run,
            }),
            WireMessage::Ping { nonce } => self.sink.send(WireMessage::Pong { nonce }).await,
            WireMessage::Pong { nonce } => {
                self.on_pong(nonce);
                Ok(())
            }
            WireMessage::GetHeaders(request) => self.serve_headers(&request).await,
            WireMessage::Headers(headers) => self.on_headers(headers).await,
            WireMessage::GetCfHeaders(range) => self.serve_cfheaders(&range).await,
            WireMessage::CfHeaders(m) => self.on_cfheaders(m).await,
            WireMessage::GetCfilters(range) => self.serve_cfilters(&range).await,
            WireMessage::Cfilter(m) => self.on_cfilter(m).await,
            WireMessage::GetCfCheckpt {
                filter_type,
                stop_hash,
            } => self.serve_cfcheckpt(filter_type, stop_hash).await,
            WireMessage::CfCheckpt(_) => {
                debug!(session = %self.session_id, "cfcheckpt consumption not implemented");
                Ok(())
            }
            WireMessage::Inv(items) => self.on_inv(items).await,
            WireMessage::GetData(items) => self.serve_getdata(items).await,
            WireMessage::NotFound(items) => {
                debug!(session = %self.session_id, count = items.len(), "Peer reported notfound");
                Ok(())
            }
            WireMessage::Tx(tx) => {
                self.known_txs.insert(tx.txid());
                self.tx_pool.submit(tx).await
            }
            WireMessage::Block(_) => {
                debug!(session = %self.session_id, "Full-block relay not consumed here");
                Ok(())
            }
            WireMessage::Mempool => self.serve_mempool().await,
            WireMessage::GetAddr => self.serve_getaddr().await,
            WireMessage::Addr(entries) => self.on_addr(entries).await,
            WireMessage::AddrV2(entries) => self.on_addr_v2(entries).await,
            WireMessage::SendAddrV2 => {
                // Capability negotiation belongs to the handshake.
                debug!(session = %self.session_id, "sendaddrv2 outside handshake; ignored");
                Ok(())
            }
            WireMessage::Reject(m) => {
                warn!(
                    session = %self.session_id,
                    command = %m.message,
                    code = m.code,
                    reason = %m.reason,
                    "Peer rejected our message"
                );
                Ok(())
            }
            WireMessage::GetBlocks(request) => self.serve_getblocks(&request).await,
            // Stripped off in handle_message before dispatch.
            WireMessage::Unknown { .. } => Ok(()),
        }
    }

    fn on_pong(&self, nonce: u64) {
        let mut liveness = self.liveness.lock();
        if matches!(liveness.outstanding, Some((expected, _)) if expected == nonce) {
            liveness.outstanding = None;
        }
    }

    // -------------------------------------------------------------------------
    // Header relay
    // -------------------------------------------------------------------------

    async fn serve_headers(&self, request: &GetHeadersMessage) -> Result<(), ProtocolError> {
        // Checkpoint-verification convention: an empty locator plus a stop
        // hash asks for exactly that header.
        if request.locator_hashes.is_empty() && request.stop_hash != [0u8; 32] {
            let response = match self.headers.load_header(request.stop_hash).await? {
                Some(header) => vec![header],
                None => Vec::new(),
            };
            return self.sink.send(WireMessage::Headers(response)).await;
        }

        let start = self.locate_fork(&request.locator_hashes).await? + 1;
        let best = self.headers.best().await?;
        let mut response = Vec::new();
        let mut height = start;
        while height <= best.height && response.len() < MAX_HEADERS_PER_MSG {
            let Some(hash) = self.headers.best_hash_at(height).await? else {
                break;
            };
            let Some(header) = self.headers.load_header(hash).await? else {
                break;
            };
            response.push(header);
            if hash == request.stop_hash {
                break;
            }
            height += 1;
        }
        debug!(
            session = %self.session_id,
            start,
            count = response.len(),
            "Serving headers"
        );
        self.sink.send(WireMessage::Headers(response)).await
    }

    /// Height of the highest locator hash on our best chain.
    async fn locate_fork(&self, locator: &[Hash]) -> Result<i64, ProtocolError> {
        for hash in locator {
            if let Some(height) = self.headers.height_of(*hash).await? {
                return Ok(height);
            }
        }
        // No common point: serve from just above genesis.
        Ok(0)
    }

    async fn on_headers(&self, headers: Vec<BlockHeader>) -> Result<(), ProtocolError> {
        if headers.is_empty() {
            debug!(session = %self.session_id, "Peer has no further headers");
            return Ok(());
        }
        for window in headers.windows(2) {
            if window[1].parent_hash != window[0].block_hash() {
                return Err(ProtocolError::Malformed {
                    command: "headers".into(),
                    source: DecodeError::InvalidValue("headers batch is not linked"),
                });
            }
        }
        for header in &headers {
            self.known_blocks.insert(header.block_hash());
        }

        let batch_len = headers.len();
        let best = self.headers.best().await?;
        let parent = headers[0].parent_hash;
        let applied_tip = if parent == best.hash {
            Some(self.extend_chain(best, headers).await?)
        } else if let Some(fork_height) = self.headers.height_of(parent).await? {
            self.consider_branch(ChainPosition::new(fork_height, parent), Vec::new(), headers)
                .await?
        } else if self.headers.load_record(parent).await?.is_some() {
            self.consider_stored_branch(parent, headers).await?
        } else {
            self.buffer_orphans(headers).await?;
            None
        };

        if let Some(tip) = applied_tip {
            self.peer.write().last_remote_position = Some(tip);
            if self.config.want_peer_filters {
                self.request_next_cfheaders().await?;
            }
        }
        // A full batch means the peer has more; keep the sync going.
        if batch_len == MAX_HEADERS_PER_MSG {
            self.request_headers().await?;
        }
        Ok(())
    }

    async fn extend_chain(
        &self,
        best: ChainPosition,
        headers: Vec<BlockHeader>,
    ) -> Result<ChainPosition, ProtocolError> {
        let positions: Vec<ChainPosition> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| ChainPosition::new(best.height + 1 + i as i64, h.block_hash()))
            .collect();
        let tip = *positions.last().expect("nonempty batch");
        self.headers
            .apply_update(ChainUpdate::extend(headers, positions))
            .await?;
        debug!(session = %self.session_id, tip = %tip, "Extended best chain");
        Ok(tip)
    }

    /// Weigh a branch rooted at `fork` (with optional already-stored
    /// positions between fork and the new headers) against the current
    /// tip; apply a reorg when it carries more work, otherwise file the
    /// new headers as siblings.
    async fn consider_branch(
        &self,
        fork: ChainPosition,
        stored_branch: Vec<ChainPosition>,
        headers: Vec<BlockHeader>,
    ) -> Result<Option<ChainPosition>, ProtocolError> {
        let best = self.headers.best().await?;

        let branch_parent = stored_branch.last().map_or(fork.hash, |p| p.hash);
        let parent_work = self
            .headers
            .load_record(branch_parent)
            .await?
            .map(|r| r.cumulative_work())
            .unwrap_or_default();
        let branch_work = headers
            .iter()
            .fold(parent_work, |acc, h| acc + h.work());
        let tip_work = self
            .headers
            .load_record(best.hash)
            .await?
            .map(|r| r.cumulative_work())
            .unwrap_or_default();

        if branch_work <= tip_work {
            // Valid but not better: remember it as a sibling branch.
            let siblings: Vec<Hash> = headers.iter().map(BlockHeader::block_hash).collect();
            let update = ChainUpdate {
                headers,
                siblings_add: siblings,
                ..ChainUpdate::default()
            };
            self.headers.apply_update(update).await?;
            debug!(session = %self.session_id, fork = %fork, "Stored losing branch as siblings");
            return Ok(None);
        }

        // The branch wins: replace everything above the fork point.
        let first_new_height = fork.height + 1 + stored_branch.len() as i64;
        let mut positions = stored_branch;
        positions.extend(headers.iter().enumerate().map(|(i, h)| {
            ChainPosition::new(first_new_height + i as i64, h.block_hash())
        }));

        let mut displaced = Vec::new();
        let mut height = fork.height + 1;
        while height <= best.height {
            if let Some(hash) = self.headers.best_hash_at(height).await? {
                displaced.push(hash);
            }
            height += 1;
        }

        let tip = *positions.last().expect("nonempty branch");
        let mut update = ChainUpdate::reorg(fork, headers, positions);
        update.siblings_add = displaced;
        self.headers.apply_update(update).await?;
        info!(session = %self.session_id, fork = %fork, tip = %tip, "Applied reorg");
        Ok(Some(tip))
    }

    /// The batch attaches to a stored non-best header: climb to the
    /// best-chain ancestor to find the fork point and the stored part of
    /// the branch.
    async fn consider_stored_branch(
        &self,
        parent: Hash,
        headers: Vec<BlockHeader>,
    ) -> Result<Option<ChainPosition>, ProtocolError> {
        let mut path = Vec::new();
        let mut cursor = parent;
        for _ in 0..MAX_BRANCH_CLIMB {
            let Some(record) = self.headers.load_record(cursor).await? else {
                // Lineage breaks before reaching the best chain.
                self.buffer_orphans(headers).await?;
                return Ok(None);
            };
            if record.on_best_chain {
                let fork = record.position();
                path.reverse();
                let stored_branch: Vec<ChainPosition> = path
                    .iter()
                    .enumerate()
                    .map(|(i, hash)| ChainPosition::new(fork.height + 1 + i as i64, *hash))
                    .collect();
                return self.consider_branch(fork, stored_branch, headers).await;
            }
            path.push(cursor);
            cursor = record.parent_hash;
        }
        warn!(session = %self.session_id, "Branch climb exceeded limit; buffering as orphans");
        self.buffer_orphans(headers).await?;
        Ok(None)
    }

    /// Parent unknown: persist the headers as disconnected edges and ask
    /// the peer for the gap.
    async fn buffer_orphans(&self, headers: Vec<BlockHeader>) -> Result<(), ProtocolError> {
        let orphans_add: Vec<(Hash, Hash)> = headers
            .iter()
            .map(|h| (h.parent_hash, h.block_hash()))
            .collect();
        debug!(
            session = %self.session_id,
            count = headers.len(),
            "Buffered disconnected headers"
        );
        self.headers
            .apply_update(ChainUpdate {
                headers,
                orphans_add,
                ..ChainUpdate::default()
            })
            .await?;
        self.request_headers().await
    }

    // -------------------------------------------------------------------------
    // Filter relay
    // -------------------------------------------------------------------------

    async fn serve_cfheaders(&self, range: &GetFilterRange) -> Result<(), ProtocolError> {
        let Some(stop_height) = self.headers.height_of(range.stop_hash).await? else {
            debug!(session = %self.session_id, "getcfheaders stop hash unknown; ignored");
            return Ok(());
        };
        let start = i64::from(range.start_height);
        if stop_height < start {
            return Ok(());
        }
        let requested = (stop_height - start + 1) as u64;
        if requested > MAX_CFHEADERS_PER_MSG as u64 {
            return Err(ProtocolError::RangeTooLarge {
                command: "getcfheaders".into(),
                requested,
                cap: MAX_CFHEADERS_PER_MSG as u64,
            });
        }

        let previous_filter_header = if start == 0 {
            [0u8; 32]
        } else {
            match self.headers.best_hash_at(start - 1).await? {
                Some(hash) => self
                    .filters
                    .load_cfheader(hash)
                    .await?
                    .unwrap_or([0u8; 32]),
                None => [0u8; 32],
            }
        };

        // Missing entries truncate the response; nothing is invented.
        let mut filter_headers = Vec::with_capacity(requested as usize);
        let mut height = start;
        while height <= stop_height {
            let Some(block_hash) = self.headers.best_hash_at(height).await? else {
                break;
            };
            let Some(header) = self.filters.load_cfheader(block_hash).await? else {
                break;
            };
            filter_headers.push(header);
            height += 1;
        }
        debug!(
            session = %self.session_id,
            requested,
            served = filter_headers.len(),
            "Serving cfheaders"
        );
        self.sink
            .send(WireMessage::CfHeaders(CfHeadersMessage {
                filter_type: range.filter_type,
                stop_hash: range.stop_hash,
                previous_filter_header,
                filter_headers,
            }))
            .await
    }

    async fn on_cfheaders(&self, m: CfHeadersMessage) -> Result<(), ProtocolError> {
        if m.filter_headers.is_empty() {
            return Ok(());
        }
        let count = m.filter_headers.len();
        let tip = self.filters.cfheader_tip().await?;

        let mut batch = Vec::with_capacity(count);
        for (index, header) in m.filter_headers.iter().enumerate() {
            let height = tip.height + 1 + index as i64;
            let Some(block_hash) = self.headers.best_hash_at(height).await? else {
                // The run outpaces our header chain; keep the prefix.
                break;
            };
            batch.push((block_hash, *header));
        }
        if batch.is_empty() {
            return Ok(());
        }

        self.filters
            .store_cfheaders(m.previous_filter_header, batch)
            .await?;
        // Pull the filters behind the new headers, then keep paging.
        self.request_next_cfilters().await?;
        if count == MAX_CFHEADERS_PER_MSG {
            self.request_next_cfheaders().await?;
        }
        Ok(())
    }

    async fn serve_cfilters(&self, range: &GetFilterRange) -> Result<(), ProtocolError> {
        let Some(stop_height) = self.headers.height_of(range.stop_hash).await? else {
            debug!(session = %self.session_id, "getcfilters stop hash unknown; ignored");
            return Ok(());
        };
        let start = i64::from(range.start_height);
        if stop_height < start {
            return Ok(());
        }
        let requested = (stop_height - start + 1) as u64;
        if requested > MAX_CFILTERS_PER_RANGE as u64 {
            return Err(ProtocolError::RangeTooLarge {
                command: "getcfilters".into(),
                requested,
                cap: MAX_CFILTERS_PER_RANGE as u64,
            });
        }

        let mut height = start;
        let mut served = 0usize;
        while height <= stop_height {
            let Some(block_hash) = self.headers.best_hash_at(height).await? else {
                break;
            };
            let Some(filter) = self.filters.load_cfilter(block_hash).await? else {
                // Not stored: truncate rather than invent.
                break;
            };
            self.sink
                .send(WireMessage::Cfilter(CfilterMessage {
                    filter_type: range.filter_type,
                    block_hash,
                    filter_data: filter.data,
                }))
                .await?;
            served += 1;
            height += 1;
        }
        debug!(session = %self.session_id, requested, served, "Served cfilters");
        Ok(())
    }

    async fn on_cfilter(&self, m: CfilterMessage) -> Result<(), ProtocolError> {
        self.filters
            .store_cfilter(CompactFilter {
                filter_type: m.filter_type,
                block_hash: m.block_hash,
                data: m.filter_data,
            })
            .await
    }

    async fn serve_cfcheckpt(
        &self,
        filter_type: FilterType,
        stop_hash: Hash,
    ) -> Result<(), ProtocolError> {
        let Some(stop_height) = self.headers.height_of(stop_hash).await? else {
            return Ok(());
        };
        let mut filter_headers = Vec::new();
        let mut height = CFCHECKPT_INTERVAL;
        while height <= stop_height {
            let Some(block_hash) = self.headers.best_hash_at(height).await? else {
                break;
            };
            let Some(header) = self.filters.load_cfheader(block_hash).await? else {
                break;
            };
            filter_headers.push(header);
            height += CFCHECKPT_INTERVAL;
        }
        self.sink
            .send(WireMessage::CfCheckpt(CfCheckptMessage {
                filter_type,
                stop_hash,
                filter_headers,
            }))
            .await
    }

    // -------------------------------------------------------------------------
    // Inventory, transactions, addresses
    // -------------------------------------------------------------------------

    async fn on_inv(&self, items: Vec<InventoryItem>) -> Result<(), ProtocolError> {
        let mut want_txs = Vec::new();
        let mut new_blocks = false;
        for item in items {
            match item.kind {
                InvKind::Block => {
                    // First sighting of an unknown block triggers header sync.
                    if self.known_blocks.insert(item.hash)
                        && self.headers.load_header(item.hash).await?.is_none()
                    {
                        new_blocks = true;
                    }
                }
                InvKind::Tx => {
                    if self.known_txs.insert(item.hash)
                        && self.tx_pool.query(item.hash).await?.is_none()
                    {
                        want_txs.push(InventoryItem {
                            kind: InvKind::Tx,
                            hash: item.hash,
                        });
                    }
                }
                InvKind::Other(kind) => {
                    debug!(session = %self.session_id, kind, "Unhandled inventory kind");
                }
            }
        }

        if new_blocks {
            self.request_headers().await?;
        }
        if !want_txs.is_empty() {
            self.sink.send(WireMessage::GetData(want_txs)).await?;
        }
        Ok(())
    }

    async fn serve_getdata(&self, items: Vec<InventoryItem>) -> Result<(), ProtocolError> {
        let mut missing = Vec::new();
        for item in items {
            match item.kind {
                InvKind::Tx => match self.tx_pool.query(item.hash).await? {
                    Some(tx) => {
                        self.known_txs.insert(item.hash);
                        self.sink.send(WireMessage::Tx(tx)).await?;
                    }
                    None => missing.push(item),
                },
                // A header-only node holds no block bodies to serve.
                InvKind::Block | InvKind::Other(_) => missing.push(item),
            }
        }
        if !missing.is_empty() {
            self.sink.send(WireMessage::NotFound(missing)).await?;
        }
        Ok(())
    }

    async fn serve_mempool(&self) -> Result<(), ProtocolError> {
        let pooled = self.tx_pool.dump().await?;
        let announce: Vec<InventoryItem> = pooled
            .into_iter()
            .filter(|txid| !self.known_txs.contains(txid))
            .take(MAX_INV_PER_MSG)
            .map(|hash| InventoryItem {
                kind: InvKind::Tx,
                hash,
            })
            .collect();
        if announce.is_empty() {
            return Ok(());
        }
        for hash in announce.iter().map(|i| i.hash) {
            self.known_txs.insert(hash);
        }
        self.sink.send(WireMessage::Inv(announce)).await
    }

    /// Announce a newly adopted block to this peer.
    ///
    /// Driven by the runtime when the local tip moves; peers that already
    /// know the hash are skipped, and sessions outside Run stay silent.
    pub async fn announce_block(&self, hash: Hash) -> Result<(), ProtocolError> {
        if self.state() != SessionState::Run {
            return Ok(());
        }
        if !self.known_blocks.insert(hash) {
            return Ok(());
        }
        self.sink
            .send(WireMessage::Inv(vec![InventoryItem {
                kind: InvKind::Block,
                hash,
            }]))
            .await
    }

    async fn serve_getblocks(&self, request: &GetHeadersMessage) -> Result<(), ProtocolError> {
        let start = self.locate_fork(&request.locator_hashes).await? + 1;
        let best = self.headers.best().await?;
        let mut items = Vec::new();
        let mut height = start;
        while height <= best.height && items.len() < MAX_GETBLOCKS_RESPONSE {
            let Some(hash) = self.headers.best_hash_at(height).await? else {
                break;
            };
            items.push(InventoryItem {
                kind: InvKind::Block,
                hash,
            });
            if hash == request.stop_hash {
                break;
            }
            height += 1;
        }
        if items.is_empty() {
            return Ok(());
        }
        self.sink.send(WireMessage::Inv(items)).await
    }

    async fn serve_getaddr(&self) -> Result<(), ProtocolError> {
        let wants_v2 = self.peer.read().wants_addr_v2;
        let known = self.address_book.known_addresses().await?;

        // Only addresses the peer's negotiated format can carry.
        let mut eligible: Vec<PeerAddress> = known
            .into_iter()
            .filter(|a| {
                wants_v2 || matches!(a.network, network_id::IPV4 | network_id::IPV6)
            })
            .collect();

        if eligible.len() > MAX_ADDRS_PER_MSG {
            let mut rng = rand::thread_rng();
            eligible = eligible
                .choose_multiple(&mut rng, MAX_ADDRS_PER_MSG)
                .cloned()
                .collect();
        }
        if eligible.is_empty() {
            return Ok(());
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        if wants_v2 {
            let entries: Vec<AddrV2Entry> = eligible
                .into_iter()
                .map(|a| AddrV2Entry {
                    time: a.last_connected.unwrap_or(now),
                    services: a.services,
                    network: a.network,
                    addr: a.addr,
                    port: a.port,
                })
                .collect();
            self.sink.send(WireMessage::AddrV2(entries)).await
        } else {
            let entries: Vec<AddrEntry> = eligible
                .into_iter()
                .filter_map(|a| {
                    let ip = v6_mapped(&a)?;
                    Some(AddrEntry {
                        time: a.last_connected.unwrap_or(now),
                        address: NetworkAddress {
                            services: a.services,
                            ip,
                            port: a.port,
                        },
                    })
                })
                .collect();
            self.sink.send(WireMessage::Addr(entries)).await
        }
    }

    async fn on_addr(&self, entries: Vec<AddrEntry>) -> Result<(), ProtocolError> {
        let addresses: Vec<PeerAddress> = entries
            .into_iter()
            .map(|entry| {
                let (network, addr) = split_v6_mapped(&entry.address.ip);
                PeerAddress {
                    network,
                    addr,
                    port: entry.address.port,
                    services: entry.address.services,
                    // Gossiped addresses are untried by definition.
                    last_connected: None,
                }
            })
            .collect();
        self.address_book.record_addresses(addresses).await
    }

    async fn on_addr_v2(&self, entries: Vec<AddrV2Entry>) -> Result<(), ProtocolError> {
        let addresses: Vec<PeerAddress> = entries
            .into_iter()
            .map(|entry| PeerAddress {
                network: entry.network,
                addr: entry.addr,
                port: entry.port,
                services: entry.services,
                last_connected: None,
            })
            .collect();
        self.address_book.record_addresses(addresses).await
    }
}

/// Render an address as a v6-mapped 16-byte IP, when its format allows.
fn v6_mapped(address: &PeerAddress) -> Option<[u8; 16]> {
    match address.network {
        network_id::IPV4 if address.addr.len() == 4 => {
            let mut ip = [0u8; 16];
            ip[10] = 0xFF;
            ip[11] = 0xFF;
            ip[12..].copy_from_slice(&address.addr);
            Some(ip)
        }
        network_id::IPV6 if address.addr.len() == 16 => {
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&address.addr);
            Some(ip)
        }
        _ => None,
    }
}

/// Split a v6-mapped IP back into (network id, raw bytes).
fn split_v6_mapped(ip: &[u8; 16]) -> (u8, Vec<u8>) {
    let v4_prefix = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF];
    if ip[..12] == v4_prefix {
        (network_id::IPV4, ip[12..].to_vec())
    } else {
        (network_id::IPV6, ip.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::outbound::{
        MockAddressBook, MockFilterChain, MockHeaderChain, MockSink, MockTxPool,
    };
    use ln_01_header_chain::RecordingEventSink;
    use shared_types::{Checkpoint, Transaction, TxOut};

    type TestSession = PeerSessionService<
        MockSink,
        MockHeaderChain,
        MockFilterChain,
        MockAddressBook,
        MockTxPool,
    >;

    struct Harness {
        session: TestSession,
        sink: Arc<MockSink>,
        chain: Arc<MockHeaderChain>,
        filters: Arc<MockFilterChain>,
        address_book: Arc<MockAddressBook>,
        tx_pool: Arc<MockTxPool>,
        events: Arc<RecordingEventSink>,
        headers: Vec<BlockHeader>,
    }

    fn test_chain(params: &NetworkParams, len: usize) -> Vec<BlockHeader> {
        let mut headers = vec![params.genesis_header];
        for n in 1..len {
            let parent = headers[n - 1];
            headers.push(BlockHeader {
                version: 1,
                parent_hash: parent.block_hash(),
                merkle_root: [n as u8; 32],
                time: parent.time + 60,
                bits: 0x207F_FFFF,
                nonce: n as u32,
            });
        }
        headers
    }

    fn harness(params: NetworkParams, direction: Direction, chain_len: usize) -> Harness {
        let headers = test_chain(&params, chain_len);
        let chain = MockHeaderChain::with_chain(headers.clone());
        let genesis_position = ChainPosition::new(0, headers[0].block_hash());
        let filters = MockFilterChain::at_tip(genesis_position);
        filters.insert_cfheader(headers[0].block_hash(), [0x10; 32]);
        let sink = Arc::new(MockSink::new());
        let address_book = Arc::new(MockAddressBook::new());
        let tx_pool = Arc::new(MockTxPool::new());
        let events = Arc::new(RecordingEventSink::new());

        let session = PeerSessionService::new(
            params,
            SessionConfig::default(),
            direction,
            sink.clone(),
            chain.clone(),
            filters.clone(),
            address_book.clone(),
            tx_pool.clone(),
            events.clone(),
        );
        Harness {
            session,
            sink,
            chain,
            filters,
            address_book,
            tx_pool,
            events,
            headers,
        }
    }

    fn peer_version(h: &Harness) -> VersionMessage {
        VersionMessage {
            version: 70_001,
            services: services::NETWORK_LIMITED,
            timestamp: 1_700_000_000,
            receiver: NetworkAddress::default(),
            sender: NetworkAddress::default(),
            nonce: h.session.local_nonce.wrapping_add(1),
            user_agent: "/otherclient:2.1/".into(),
            start_height: 0,
            relay: true,
        }
    }

    async fn complete_handshake(h: &Harness) {
        h.session.begin().await.unwrap();
        h.session
            .handle_message(WireMessage::Version(peer_version(h)))
            .await
            .unwrap();
        h.session.handle_message(WireMessage::Verack).await.unwrap();
    }

    fn sent_commands(h: &Harness) -> Vec<String> {
        h.sink
            .sent()
            .iter()
            .map(|m| m.command().to_string())
            .collect()
    }

    fn tx_with_value(value: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![TxOut {
                value,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    // -------------------------------------------------------------------------
    // Handshake
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_outbound_reaches_run_without_checkpoint() {
        let h = harness(NetworkParams::regtest(), Direction::Outbound, 4);
        complete_handshake(&h).await;

        assert_eq!(h.session.state(), SessionState::Run);
        let commands = sent_commands(&h);
        assert_eq!(commands[0], "version");
        assert!(commands.contains(&"sendaddrv2".to_string()));
        assert!(commands.contains(&"verack".to_string()));
        // Sync opens immediately.
        assert!(commands.contains(&"getheaders".to_string()));
        assert!(h
            .events
            .events()
            .iter()
            .any(|e| matches!(e, ChainEvent::PeerActive { outbound: true, .. })));
    }

    #[tokio::test]
    async fn test_inbound_skips_verify() {
        let mut params = NetworkParams::regtest();
        params.checkpoint = Some(Checkpoint {
            height: 2,
            block_hash: [2; 32],
            cfheader: [3; 32],
        });
        let h = harness(params, Direction::Inbound, 4);
        complete_handshake(&h).await;

        // Inbound sessions never enter Verify even with a checkpoint.
        assert_eq!(h.session.state(), SessionState::Run);
    }

    #[tokio::test]
    async fn test_version_too_old_rejected() {
        let h = harness(NetworkParams::regtest(), Direction::Outbound, 2);
        h.session.begin().await.unwrap();

        let mut version = peer_version(&h);
        version.version = 1;
        let err = h
            .session
            .handle_message(WireMessage::Version(version))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::VersionTooOld { .. }));
    }

    #[tokio::test]
    async fn test_self_connection_detected() {
        let h = harness(NetworkParams::regtest(), Direction::Outbound, 2);
        h.session.begin().await.unwrap();

        let mut version = peer_version(&h);
        version.nonce = h.session.local_nonce;
        let err = h
            .session
            .handle_message(WireMessage::Version(version))
            .await
            .unwrap_err();
        assert_eq!(err, ProtocolError::SelfConnection);
    }

    #[tokio::test]
    async fn test_handshake_ignores_non_handshake_messages() {
        let h = harness(NetworkParams::regtest(), Direction::Outbound, 2);
        h.session.begin().await.unwrap();

        // Run-state traffic during handshake is logged, not an error.
        h.session.handle_message(WireMessage::GetAddr).await.unwrap();
        h.session
            .handle_message(WireMessage::Ping { nonce: 5 })
            .await
            .unwrap();
        assert_eq!(h.session.state(), SessionState::Handshake);
        // Only our own version went out; no pong, no addr.
        assert_eq!(sent_commands(&h), vec!["version".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_version_in_run_is_violation() {
        let h = harness(NetworkParams::regtest(), Direction::Outbound, 2);
        complete_handshake(&h).await;

        let err = h
            .session
            .handle_message(WireMessage::Version(peer_version(&h)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::StateViolation { .. }));
    }

    // -------------------------------------------------------------------------
    // Verify
    // -------------------------------------------------------------------------

    fn checkpointed_params(h_params: &NetworkParams, chain: &[BlockHeader]) -> NetworkParams {
        let mut params = h_params.clone();
        params.checkpoint = Some(Checkpoint {
            height: 2,
            block_hash: chain[2].block_hash(),
            cfheader: [0x77; 32],
        });
        params
    }

    #[tokio::test]
    async fn test_outbound_enters_verify_with_checkpoint() {
        let base = NetworkParams::regtest();
        let chain = test_chain(&base, 4);
        let params = checkpointed_params(&base, &chain);
        let h = harness(params, Direction::Outbound, 4);
        complete_handshake(&h).await;

        assert_eq!(h.session.state(), SessionState::Verify);
        let commands = sent_commands(&h);
        // One block-header request and one filter-header request.
        assert_eq!(
            commands
                .iter()
                .filter(|c| c.as_str() == "getheaders")
                .count(),
            1
        );
        assert_eq!(
            commands
                .iter()
                .filter(|c| c.as_str() == "getcfheaders")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_checkpoint_mismatch_shuts_down_before_run() {
        let base = NetworkParams::regtest();
        let chain = test_chain(&base, 4);
        let params = checkpointed_params(&base, &chain);
        let h = harness(params, Direction::Outbound, 4);
        complete_handshake(&h).await;
        assert_eq!(h.session.state(), SessionState::Verify);
        let requests_before = sent_commands(&h).len();

        // The peer answers with a header that is not the checkpoint.
        let wrong = chain[1];
        let err = h
            .session
            .handle_message(WireMessage::Headers(vec![wrong]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::CheckpointMismatch { .. }));

        // The driver routes the error to shutdown.
        h.session.shutdown(&err.to_string()).await;
        assert_eq!(h.session.state(), SessionState::Shutdown);
        assert!(h.sink.is_closed());
        // No Run-state requests were ever issued.
        assert_eq!(sent_commands(&h).len(), requests_before);
        assert!(!h
            .events
            .events()
            .iter()
            .any(|e| matches!(e, ChainEvent::PeerActive { .. })));
        assert!(h
            .events
            .events()
            .iter()
            .any(|e| matches!(e, ChainEvent::PeerClosed { .. })));
    }

    #[tokio::test]
    async fn test_checkpoint_response_count_must_be_one() {
        let base = NetworkParams::regtest();
        let chain = test_chain(&base, 4);
        let params = checkpointed_params(&base, &chain);
        let h = harness(params, Direction::Outbound, 4);
        complete_handshake(&h).await;

        let err = h
            .session
            .handle_message(WireMessage::Headers(vec![chain[1], chain[2]]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnexpectedResponseCount {
                expected: 1,
                actual: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_verify_success_enters_run() {
        let base = NetworkParams::regtest();
        let chain = test_chain(&base, 4);
        let params = checkpointed_params(&base, &chain);
        let checkpoint = params.checkpoint.unwrap();
        let h = harness(params, Direction::Outbound, 4);
        complete_handshake(&h).await;

        h.session
            .handle_message(WireMessage::Headers(vec![chain[2]]))
            .await
            .unwrap();
        assert_eq!(h.session.state(), SessionState::Verify);

        h.session
            .handle_message(WireMessage::CfHeaders(CfHeadersMessage {
                filter_type: FilterType::Basic,
                stop_hash: checkpoint.block_hash,
                previous_filter_header: [0; 32],
                filter_headers: vec![checkpoint.cfheader],
            }))
            .await
            .unwrap();
        assert_eq!(h.session.state(), SessionState::Run);
    }

    // -------------------------------------------------------------------------
    // Header relay
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_serve_headers_from_locator() {
        let h = harness(NetworkParams::regtest(), Direction::Outbound, 4);
        complete_handshake(&h).await;
        h.sink.take();

        h.session
            .handle_message(WireMessage::GetHeaders(GetHeadersMessage {
                version: 70_001,
                locator_hashes: vec![[0xEE; 32], h.headers[1].block_hash()],
                stop_hash: [0; 32],
            }))
            .await
            .unwrap();

        let sent = h.sink.take();
        let WireMessage::Headers(served) = &sent[0] else {
            panic!("expected headers, got {:?}", sent[0].command());
        };
        assert_eq!(served.len(), 2);
        assert_eq!(served[0], h.headers[2]);
        assert_eq!(served[1], h.headers[3]);
    }

    #[tokio::test]
    async fn test_serve_headers_checkpoint_convention() {
        let h = harness(NetworkParams::regtest(), Direction::Inbound, 4);
        complete_handshake(&h).await;
        h.sink.take();

        h.session
            .handle_message(WireMessage::GetHeaders(GetHeadersMessage {
                version: 70_001,
                locator_hashes: Vec::new(),
                stop_hash: h.headers[2].block_hash(),
            }))
            .await
            .unwrap();

        let sent = h.sink.take();
        let WireMessage::Headers(served) = &sent[0] else {
            panic!("expected headers");
        };
        assert_eq!(served.as_slice(), &[h.headers[2]]);
    }

    #[tokio::test]
    async fn test_received_headers_extend_chain() {
        let h = harness(NetworkParams::regtest(), Direction::Outbound, 4);
        complete_handshake(&h).await;

        let tip = h.headers[3];
        let child = BlockHeader {
            version: 1,
            parent_hash: tip.block_hash(),
            merkle_root: [0x44; 32],
            time: tip.time + 60,
            bits: 0x207F_FFFF,
            nonce: 44,
        };
        h.session
            .handle_message(WireMessage::Headers(vec![child]))
            .await
            .unwrap();

        let updates = h.chain.updates();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].reorg_from.is_none());
        assert_eq!(
            updates[0].best,
            vec![ChainPosition::new(4, child.block_hash())]
        );
        assert_eq!(
            h.session.peer_info().last_remote_position,
            Some(ChainPosition::new(4, child.block_hash()))
        );
    }

    #[tokio::test]
    async fn test_received_branch_with_more_work_reorgs() {
        let h = harness(NetworkParams::regtest(), Direction::Outbound, 4);
        complete_handshake(&h).await;

        // Three headers branching from height 1 outweigh the two above it.
        let mut branch = Vec::new();
        let mut parent = h.headers[1];
        for n in 0..3u32 {
            let header = BlockHeader {
                version: 1,
                parent_hash: parent.block_hash(),
                merkle_root: [0x60 + n as u8; 32],
                time: parent.time + 60,
                bits: 0x207F_FFFF,
                nonce: 600 + n,
            };
            branch.push(header);
            parent = header;
        }
        h.session
            .handle_message(WireMessage::Headers(branch.clone()))
            .await
            .unwrap();

        let updates = h.chain.updates();
        assert_eq!(updates.len(), 1);
        let update = &updates[0];
        assert_eq!(
            update.reorg_from,
            Some(ChainPosition::new(1, h.headers[1].block_hash()))
        );
        assert_eq!(update.best.len(), 3);
        assert_eq!(update.best[0].height, 2);
        // The displaced suffix is filed as siblings.
        assert_eq!(
            update.siblings_add,
            vec![h.headers[2].block_hash(), h.headers[3].block_hash()]
        );
    }

    #[tokio::test]
    async fn test_received_losing_branch_stored_as_siblings() {
        let h = harness(NetworkParams::regtest(), Direction::Outbound, 4);
        complete_handshake(&h).await;

        let alt = BlockHeader {
            version: 1,
            parent_hash: h.headers[1].block_hash(),
            merkle_root: [0x70; 32],
            time: h.headers[1].time + 60,
            bits: 0x207F_FFFF,
            nonce: 700,
        };
        h.session
            .handle_message(WireMessage::Headers(vec![alt]))
            .await
            .unwrap();

        let updates = h.chain.updates();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].reorg_from.is_none());
        assert!(updates[0].best.is_empty());
        assert_eq!(updates[0].siblings_add, vec![alt.block_hash()]);
        assert_eq!(h.session.peer_info().last_remote_position, None);
    }

    #[tokio::test]
    async fn test_received_orphans_buffered_and_gap_requested() {
        let h = harness(NetworkParams::regtest(), Direction::Outbound, 4);
        complete_handshake(&h).await;
        h.sink.take();

        let orphan = BlockHeader {
            version: 1,
            parent_hash: [0xDD; 32],
            merkle_root: [0x80; 32],
            time: 1_700_000_000,
            bits: 0x207F_FFFF,
            nonce: 800,
        };
        h.session
            .handle_message(WireMessage::Headers(vec![orphan]))
            .await
            .unwrap();

        let updates = h.chain.updates();
        assert_eq!(
            updates[0].orphans_add,
            vec![([0xDD; 32], orphan.block_hash())]
        );
        // The session immediately hunts for the gap.
        assert!(sent_commands(&h).contains(&"getheaders".to_string()));
    }

    #[tokio::test]
    async fn test_unlinked_headers_batch_rejected() {
        let h = harness(NetworkParams::regtest(), Direction::Outbound, 4);
        complete_handshake(&h).await;

        let a = h.headers[1];
        let unrelated = BlockHeader {
            version: 1,
            parent_hash: [0x99; 32],
            merkle_root: [0x99; 32],
            time: 1,
            bits: 0x207F_FFFF,
            nonce: 9,
        };
        let err = h
            .session
            .handle_message(WireMessage::Headers(vec![a, unrelated]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
        assert!(h.chain.updates().is_empty());
    }

    // -------------------------------------------------------------------------
    // Filter relay
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_serve_cfheaders_truncates_to_available() {
        let h = harness(NetworkParams::regtest(), Direction::Inbound, 5);
        complete_handshake(&h).await;
        // Only heights 1 and 2 have stored cfheaders; 3 and 4 do not.
        h.filters.insert_cfheader(h.headers[1].block_hash(), [0x21; 32]);
        h.filters.insert_cfheader(h.headers[2].block_hash(), [0x22; 32]);
        h.sink.take();

        h.session
            .handle_message(WireMessage::GetCfHeaders(GetFilterRange {
                filter_type: FilterType::Basic,
                start_height: 1,
                stop_hash: h.headers[4].block_hash(),
            }))
            .await
            .unwrap();

        let sent = h.sink.take();
        let WireMessage::CfHeaders(m) = &sent[0] else {
            panic!("expected cfheaders");
        };
        // Exactly the available prefix, never placeholders.
        assert_eq!(m.filter_headers, vec![[0x21; 32], [0x22; 32]]);
        assert_eq!(m.previous_filter_header, [0x10; 32]);
    }

    #[tokio::test]
    async fn test_serve_cfilters_range_cap_enforced() {
        let len = MAX_CFILTERS_PER_RANGE + 2;
        let h = harness(NetworkParams::regtest(), Direction::Inbound, len + 1);
        complete_handshake(&h).await;

        let err = h
            .session
            .handle_message(WireMessage::GetCfilters(GetFilterRange {
                filter_type: FilterType::Basic,
                start_height: 1,
                stop_hash: h.headers[len].block_hash(),
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::RangeTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_received_cfheaders_stored_and_cfilters_requested() {
        let h = harness(NetworkParams::regtest(), Direction::Outbound, 4);
        complete_handshake(&h).await;
        h.sink.take();

        h.session
            .handle_message(WireMessage::CfHeaders(CfHeadersMessage {
                filter_type: FilterType::Basic,
                stop_hash: h.headers[2].block_hash(),
                previous_filter_header: [0x10; 32],
                filter_headers: vec![[0x31; 32], [0x32; 32]],
            }))
            .await
            .unwrap();

        let batches = h.filters.stored_header_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, [0x10; 32]);
        assert_eq!(
            batches[0].1,
            vec![
                (h.headers[1].block_hash(), [0x31; 32]),
                (h.headers[2].block_hash(), [0x32; 32]),
            ]
        );
        // Filters trail the new headers.
        assert!(sent_commands(&h).contains(&"getcfilters".to_string()));
    }

    #[tokio::test]
    async fn test_received_cfilter_stored() {
        let h = harness(NetworkParams::regtest(), Direction::Outbound, 4);
        complete_handshake(&h).await;

        h.session
            .handle_message(WireMessage::Cfilter(CfilterMessage {
                filter_type: FilterType::Basic,
                block_hash: h.headers[1].block_hash(),
                filter_data: vec![1, 2, 3],
            }))
            .await
            .unwrap();

        let stored = h.filters.stored_filters();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].block_hash, h.headers[1].block_hash());
        assert_eq!(stored[0].data, vec![1, 2, 3]);
    }

    // -------------------------------------------------------------------------
    // Inventory and transactions
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_inv_deduplicated_against_known_set() {
        let h = harness(NetworkParams::regtest(), Direction::Outbound, 4);
        complete_handshake(&h).await;
        h.sink.take();

        let announcement = vec![InventoryItem {
            kind: InvKind::Tx,
            hash: [0xAB; 32],
        }];
        h.session
            .handle_message(WireMessage::Inv(announcement.clone()))
            .await
            .unwrap();
        assert_eq!(sent_commands(&h), vec!["getdata".to_string()]);

        // The same announcement again triggers nothing.
        h.sink.take();
        h.session
            .handle_message(WireMessage::Inv(announcement))
            .await
            .unwrap();
        assert!(h.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_getdata_serves_pool_and_notfound() {
        let h = harness(NetworkParams::regtest(), Direction::Outbound, 4);
        complete_handshake(&h).await;
        let pooled = tx_with_value(100);
        h.tx_pool.insert(pooled.clone());
        h.sink.take();

        h.session
            .handle_message(WireMessage::GetData(vec![
                InventoryItem {
                    kind: InvKind::Tx,
                    hash: pooled.txid(),
                },
                InventoryItem {
                    kind: InvKind::Tx,
                    hash: [0xCD; 32],
                },
                InventoryItem {
                    kind: InvKind::Block,
                    hash: h.headers[1].block_hash(),
                },
            ]))
            .await
            .unwrap();

        let sent = h.sink.take();
        assert!(matches!(&sent[0], WireMessage::Tx(tx) if *tx == pooled));
        let WireMessage::NotFound(missing) = &sent[1] else {
            panic!("expected notfound");
        };
        // The unknown tx and the block body we do not keep.
        assert_eq!(missing.len(), 2);
    }

    #[tokio::test]
    async fn test_mempool_reconciliation_skips_known() {
        let h = harness(NetworkParams::regtest(), Direction::Outbound, 4);
        complete_handshake(&h).await;
        let known = tx_with_value(1);
        let fresh = tx_with_value(2);
        h.tx_pool.insert(known.clone());
        h.tx_pool.insert(fresh.clone());
        h.known_txs_insert(known.txid());
        h.sink.take();

        h.session.handle_message(WireMessage::Mempool).await.unwrap();

        let sent = h.sink.take();
        let WireMessage::Inv(items) = &sent[0] else {
            panic!("expected inv");
        };
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].hash, fresh.txid());
    }

    impl Harness {
        fn known_txs_insert(&self, hash: Hash) {
            self.session.known_txs.insert(hash);
        }
    }

    // -------------------------------------------------------------------------
    // Address gossip
    // -------------------------------------------------------------------------

    fn sample_addresses() -> Vec<PeerAddress> {
        vec![
            PeerAddress {
                network: network_id::IPV4,
                addr: vec![203, 0, 113, 7],
                port: 8734,
                services: 1,
                last_connected: Some(1_700_000_000),
            },
            PeerAddress {
                network: network_id::IPV6,
                addr: vec![0x20; 16],
                port: 8734,
                services: 1,
                last_connected: None,
            },
            PeerAddress {
                // An address format v1 gossip cannot carry.
                network: 4,
                addr: vec![0xAA; 32],
                port: 8734,
                services: 1,
                last_connected: None,
            },
        ]
    }

    #[tokio::test]
    async fn test_getaddr_v1_filters_incompatible_formats() {
        let base = NetworkParams::regtest();
        let headers = test_chain(&base, 4);
        let chain = MockHeaderChain::with_chain(headers.clone());
        let filters = MockFilterChain::at_tip(ChainPosition::new(0, headers[0].block_hash()));
        filters.insert_cfheader(headers[0].block_hash(), [0x10; 32]);
        let sink = Arc::new(MockSink::new());
        let address_book = Arc::new(MockAddressBook::with_known(sample_addresses()));
        let session = PeerSessionService::new(
            base,
            SessionConfig::default(),
            Direction::Inbound,
            sink.clone(),
            chain,
            filters,
            address_book,
            Arc::new(MockTxPool::new()),
            Arc::new(RecordingEventSink::new()),
        );

        session.begin().await.unwrap();
        // Handshake WITHOUT sendaddrv2: the peer only speaks v1 gossip.
        let version = VersionMessage {
            version: 70_001,
            services: 0,
            timestamp: 0,
            receiver: NetworkAddress::default(),
            sender: NetworkAddress::default(),
            nonce: session.local_nonce.wrapping_add(1),
            user_agent: "/v1only/".into(),
            start_height: 0,
            relay: false,
        };
        session
            .handle_message(WireMessage::Version(version))
            .await
            .unwrap();
        session.handle_message(WireMessage::Verack).await.unwrap();
        sink.take();

        session.handle_message(WireMessage::GetAddr).await.unwrap();

        let sent = sink.take();
        let WireMessage::Addr(entries) = &sent[0] else {
            panic!("expected v1 addr, got {:?}", sent[0].command());
        };
        // The 32-byte-format address was filtered out.
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].address.ip[10..12], [0xFF, 0xFF]);
    }

    #[tokio::test]
    async fn test_getaddr_v2_carries_all_formats() {
        let base = NetworkParams::regtest();
        let headers = test_chain(&base, 4);
        let chain = MockHeaderChain::with_chain(headers.clone());
        let filters = MockFilterChain::at_tip(ChainPosition::new(0, headers[0].block_hash()));
        filters.insert_cfheader(headers[0].block_hash(), [0x10; 32]);
        let sink = Arc::new(MockSink::new());
        let address_book = Arc::new(MockAddressBook::with_known(sample_addresses()));
        let session = PeerSessionService::new(
            base,
            SessionConfig::default(),
            Direction::Inbound,
            sink.clone(),
            chain,
            filters,
            address_book,
            Arc::new(MockTxPool::new()),
            Arc::new(RecordingEventSink::new()),
        );

        session.begin().await.unwrap();
        session
            .handle_message(WireMessage::SendAddrV2)
            .await
            .unwrap();
        let version = VersionMessage {
            version: 70_001,
            services: 0,
            timestamp: 0,
            receiver: NetworkAddress::default(),
            sender: NetworkAddress::default(),
            nonce: session.local_nonce.wrapping_add(1),
            user_agent: "/v2capable/".into(),
            start_height: 0,
            relay: false,
        };
        session
            .handle_message(WireMessage::Version(version))
            .await
            .unwrap();
        session.handle_message(WireMessage::Verack).await.unwrap();
        sink.take();

        session.handle_message(WireMessage::GetAddr).await.unwrap();

        let sent = sink.take();
        let WireMessage::AddrV2(entries) = &sent[0] else {
            panic!("expected v2 addr");
        };
        assert_eq!(entries.len(), 3);
    }

    #[tokio::test]
    async fn test_incoming_addresses_recorded_untried() {
        let h = harness(NetworkParams::regtest(), Direction::Outbound, 4);
        complete_handshake(&h).await;

        let mut ip = [0u8; 16];
        ip[10] = 0xFF;
        ip[11] = 0xFF;
        ip[12..].copy_from_slice(&[198, 51, 100, 23]);
        h.session
            .handle_message(WireMessage::Addr(vec![AddrEntry {
                time: 1_700_000_000,
                address: NetworkAddress {
                    services: 1,
                    ip,
                    port: 8734,
                },
            }]))
            .await
            .unwrap();

        let recorded = h.address_book.recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].network, network_id::IPV4);
        assert_eq!(recorded[0].addr, vec![198, 51, 100, 23]);
        // Gossip never counts as a completed connection.
        assert_eq!(recorded[0].last_connected, None);
    }

    // -------------------------------------------------------------------------
    // Liveness
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let h = harness(NetworkParams::regtest(), Direction::Outbound, 4);
        complete_handshake(&h).await;
        h.sink.take();

        h.session
            .handle_message(WireMessage::Ping { nonce: 1234 })
            .await
            .unwrap();
        assert_eq!(h.sink.sent(), vec![WireMessage::Pong { nonce: 1234 }]);
    }

    #[tokio::test]
    async fn test_tick_sends_ping_and_pong_clears_it() {
        let h = harness(NetworkParams::regtest(), Direction::Outbound, 4);
        complete_handshake(&h).await;
        h.sink.take();

        h.session.on_tick().await.unwrap();
        let sent = h.sink.take();
        let WireMessage::Ping { nonce } = sent[0] else {
            panic!("expected ping");
        };
        assert!(h.session.liveness.lock().outstanding.is_some());

        h.session
            .handle_message(WireMessage::Pong { nonce })
            .await
            .unwrap();
        assert!(h.session.liveness.lock().outstanding.is_none());
    }

    #[tokio::test]
    async fn test_stale_ping_times_out() {
        let h = harness(NetworkParams::regtest(), Direction::Outbound, 4);
        complete_handshake(&h).await;

        let stale = Instant::now()
            .checked_sub(h.session.config.ping_timeout * 2)
            .unwrap();
        h.session.liveness.lock().outstanding = Some((7, stale));

        let err = h.session.on_tick().await.unwrap_err();
        assert_eq!(err, ProtocolError::PingTimeout);
    }

    #[tokio::test]
    async fn test_announce_block_respects_known_set_and_state() {
        let h = harness(NetworkParams::regtest(), Direction::Outbound, 4);

        // Before Run nothing is announced.
        h.session.announce_block([0x42; 32]).await.unwrap();
        assert!(h.sink.sent().is_empty());

        complete_handshake(&h).await;
        h.sink.take();

        h.session.announce_block([0x42; 32]).await.unwrap();
        let sent = h.sink.take();
        assert!(matches!(&sent[0], WireMessage::Inv(items) if items.len() == 1));

        // A hash the peer already knows is not re-announced.
        h.session.announce_block([0x42; 32]).await.unwrap();
        assert!(h.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_tick_requests_mempool_reconciliation() {
        let h = harness(NetworkParams::regtest(), Direction::Outbound, 4);
        complete_handshake(&h).await;
        h.sink.take();

        h.session.on_tick().await.unwrap();
        let commands: Vec<String> = h
            .sink
            .take()
            .iter()
            .map(|m| m.command().to_string())
            .collect();
        assert!(commands.contains(&"mempool".to_string()));

        // Inside the interval it is not repeated.
        h.session.on_tick().await.unwrap();
        let commands: Vec<String> = h
            .sink
            .take()
            .iter()
            .map(|m| m.command().to_string())
            .collect();
        assert!(!commands.contains(&"mempool".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_command_logged_not_dispatched() {
        let h = harness(NetworkParams::regtest(), Direction::Outbound, 4);
        complete_handshake(&h).await;
        h.sink.take();

        h.session
            .handle_message(WireMessage::Unknown {
                command: "filterload".into(),
                payload: vec![0x01],
            })
            .await
            .unwrap();
        assert!(h.sink.sent().is_empty());
        assert_eq!(h.session.state(), SessionState::Run);
    }
}
