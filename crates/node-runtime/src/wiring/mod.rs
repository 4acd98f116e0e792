//! # Node Wiring
//!
//! Builds the subsystems against their production adapters and runs the
//! accept/dial loops. Each peer session lives on its own task; the stores
//! are actors behind async gateways; the only cross-subsystem signals are
//! bus events.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use ln_01_header_chain::HeaderChainService;
use ln_02_filter_chain::FilterChainService;
use ln_03_peer_protocol::adapters::tcp::{split, TcpMessageSink, TcpMessageSource};
use ln_03_peer_protocol::{
    Direction, PeerAddress, PeerSessionService, SessionConfig, SessionState,
};
use shared_bus::{ChainEvent, EventFilter, EventTopic, InMemoryEventBus, Subscription};
use shared_types::NetworkParams;

use crate::adapters::{
    BusEventSink, FilterStoreClient, HeaderStoreClient, HeaderViewAdapter, InMemoryTxPool,
    KvAddressBook, RocksDbConfig, RocksDbStore,
};
use crate::config::NodeConfig;

/// Seconds between session maintenance ticks.
const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Per-session inbound message buffer.
const SESSION_QUEUE: usize = 64;

type Session = PeerSessionService<
    TcpMessageSink,
    HeaderStoreClient<RocksDbStore>,
    FilterStoreClient<RocksDbStore, HeaderViewAdapter<RocksDbStore>>,
    KvAddressBook<RocksDbStore>,
    InMemoryTxPool,
>;

/// The assembled node.
pub struct NodeRuntime {
    params: NetworkParams,
    config: NodeConfig,
    internal_bus: Arc<InMemoryEventBus>,
    external_bus: Arc<InMemoryEventBus>,
    header_chain: Arc<HeaderChainService<RocksDbStore>>,
    header_gateway: Arc<HeaderStoreClient<RocksDbStore>>,
    filter_gateway: Arc<FilterStoreClient<RocksDbStore, HeaderViewAdapter<RocksDbStore>>>,
    address_book: Arc<KvAddressBook<RocksDbStore>>,
    tx_pool: Arc<InMemoryTxPool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl NodeRuntime {
    /// Open the databases and assemble every subsystem.
    pub fn open(config: NodeConfig) -> Result<Self> {
        let params = config.params().context("resolving network parameters")?;
        info!(network = params.name, "Assembling node runtime");

        let internal_bus = Arc::new(InMemoryEventBus::new());
        let external_bus = Arc::new(InMemoryEventBus::new());

        let header_store = open_db(&config.data_dir, "headers")?;
        let header_chain = Arc::new(
            HeaderChainService::new(
                params.clone(),
                header_store,
                Arc::new(BusEventSink::new(internal_bus.clone())),
                Arc::new(BusEventSink::new(external_bus.clone())),
            )
            .context("opening header chain store")?,
        );

        let filter_store = open_db(&config.data_dir, "filters")?;
        let filter_chain = Arc::new(
            FilterChainService::new(
                params.clone(),
                filter_store,
                Arc::new(HeaderViewAdapter::new(header_chain.clone())),
                Arc::new(BusEventSink::new(internal_bus.clone())),
            )
            .context("opening filter chain store")?,
        );

        let address_book = Arc::new(KvAddressBook::new(open_db(&config.data_dir, "peers")?));
        let tx_pool = Arc::new(InMemoryTxPool::new());

        let header_gateway = Arc::new(HeaderStoreClient::new(header_chain.clone()));
        let filter_gateway = Arc::new(FilterStoreClient::new(filter_chain));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            params,
            config,
            internal_bus,
            external_bus,
            header_chain,
            header_gateway,
            filter_gateway,
            address_book,
            tx_pool,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// The bus subsystems listen on.
    pub fn internal_bus(&self) -> Arc<InMemoryEventBus> {
        self.internal_bus.clone()
    }

    /// The bus external collaborators (wallet scanner, UI) listen on.
    pub fn external_bus(&self) -> Arc<InMemoryEventBus> {
        self.external_bus.clone()
    }

    /// Current best position, for status reporting.
    pub fn best(&self) -> shared_types::ChainPosition {
        self.header_chain.best()
    }

    /// Start the accept and dial loops.
    pub async fn start(&self) -> Result<()> {
        info!("===========================================");
        info!("  Lantern Node Runtime v{}", env!("CARGO_PKG_VERSION"));
        info!("  Network: {}", self.params.name);
        info!("  Tip: {}", self.header_chain.best());
        info!("===========================================");

        if !self.config.listen.is_empty() {
            let listener = TcpListener::bind(&self.config.listen)
                .await
                .with_context(|| format!("binding {}", self.config.listen))?;
            info!(listen = %self.config.listen, "Accepting inbound peers");
            self.spawn_accept_loop(listener);
        }

        for target in self.config.connect.clone() {
            self.spawn_dialer(target);
        }
        Ok(())
    }

    /// Signal every session to wind down.
    pub fn shutdown(&self) {
        info!("Node shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    fn spawn_accept_loop(&self, listener: TcpListener) {
        let node = self.session_seed();
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            info!(%remote, "Inbound connection");
                            node.spawn_session(stream, Direction::Inbound);
                        }
                        Err(e) => {
                            error!(error = %e, "Accept failed");
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    fn spawn_dialer(&self, target: String) {
        let node = self.session_seed();
        tokio::spawn(async move {
            match TcpStream::connect(&target).await {
                Ok(stream) => {
                    info!(%target, "Outbound connection established");
                    if let Ok(remote) = stream.peer_addr() {
                        node.stamp_connected(remote);
                    }
                    node.spawn_session(stream, Direction::Outbound);
                }
                Err(e) => {
                    // Reconnection policy lives outside this core.
                    warn!(%target, error = %e, "Dial failed");
                }
            }
        });
    }

    fn session_seed(&self) -> SessionSeed {
        SessionSeed {
            params: self.params.clone(),
            session_config: SessionConfig {
                want_peer_filters: self.config.peer_filters,
                ..SessionConfig::default()
            },
            headers: self.header_gateway.clone(),
            filters: self.filter_gateway.clone(),
            address_book: self.address_book.clone(),
            tx_pool: self.tx_pool.clone(),
            internal_bus: self.internal_bus.clone(),
            shutdown_rx: self.shutdown_rx.clone(),
        }
    }
}

/// Everything a new session needs, cloneable per connection.
#[derive(Clone)]
struct SessionSeed {
    params: NetworkParams,
    session_config: SessionConfig,
    headers: Arc<HeaderStoreClient<RocksDbStore>>,
    filters: Arc<FilterStoreClient<RocksDbStore, HeaderViewAdapter<RocksDbStore>>>,
    address_book: Arc<KvAddressBook<RocksDbStore>>,
    tx_pool: Arc<InMemoryTxPool>,
    internal_bus: Arc<InMemoryEventBus>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SessionSeed {
    fn spawn_session(&self, stream: TcpStream, direction: Direction) {
        let (sink, source) = split(self.params.magic, stream);
        let session = Arc::new(PeerSessionService::new(
            self.params.clone(),
            self.session_config.clone(),
            direction,
            sink,
            self.headers.clone(),
            self.filters.clone(),
            self.address_book.clone(),
            self.tx_pool.clone(),
            Arc::new(BusEventSink::new(self.internal_bus.clone())),
        ));
        let chain_events = self
            .internal_bus
            .subscribe(EventFilter::topics(vec![EventTopic::HeaderChain]));
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(drive_session(session, source, chain_events, shutdown_rx));
    }

    fn stamp_connected(&self, remote: SocketAddr) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let address = peer_address_of(remote);
        if let Err(e) = self.address_book.mark_connected(&address, now) {
            warn!(error = %e, "Failed to stamp connection time");
        }
    }
}

/// Pump one session until it reaches Shutdown.
///
/// The reader runs on its own task so a slow handler never blocks frame
/// parsing; errors from either side route through `shutdown` with the
/// error text as the reason.
async fn drive_session(
    session: Arc<Session>,
    mut source: TcpMessageSource,
    mut chain_events: Subscription,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if let Err(e) = session.begin().await {
        session.shutdown(&e.to_string()).await;
        return;
    }

    let (message_tx, mut message_rx) = mpsc::channel(SESSION_QUEUE);
    tokio::spawn(async move {
        loop {
            let result = source.read_message().await;
            let failed = result.is_err();
            if message_tx.send(result).await.is_err() || failed {
                break;
            }
        }
    });

    let mut tick = tokio::time::interval(TICK_INTERVAL);
    loop {
        let outcome = tokio::select! {
            received = message_rx.recv() => match received {
                Some(Ok(message)) => session.handle_message(message).await,
                Some(Err(e)) => Err(e),
                None => {
                    session.shutdown("connection closed").await;
                    break;
                }
            },
            event = chain_events.recv() => match event {
                // Relay our own tip movement to the peer.
                Some(ChainEvent::TipAdvanced { tip })
                | Some(ChainEvent::Reorg { tip, .. }) => {
                    session.announce_block(tip.hash).await
                }
                Some(_) => Ok(()),
                None => Ok(()),
            },
            _ = tick.tick() => session.on_tick().await,
            _ = shutdown_rx.changed() => {
                session.shutdown("node shutdown").await;
                break;
            }
        };

        if let Err(e) = outcome {
            session.shutdown(&e.to_string()).await;
            break;
        }
        if session.state() == SessionState::Shutdown {
            break;
        }
    }
}

fn open_db(data_dir: &Path, name: &str) -> Result<RocksDbStore> {
    let path = data_dir.join(name);
    RocksDbStore::open(RocksDbConfig::at(&path))
        .with_context(|| format!("opening database {}", path.display()))
}

fn peer_address_of(remote: SocketAddr) -> PeerAddress {
    use ln_03_peer_protocol::domain::message::network_id;
    match remote {
        SocketAddr::V4(v4) => PeerAddress {
            network: network_id::IPV4,
            addr: v4.ip().octets().to_vec(),
            port: v4.port(),
            services: 0,
            last_connected: None,
        },
        SocketAddr::V6(v6) => PeerAddress {
            network: network_id::IPV6,
            addr: v6.ip().octets().to_vec(),
            port: v6.port(),
            services: 0,
            last_connected: None,
        },
    }
}
