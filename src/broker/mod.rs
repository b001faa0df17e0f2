//! MQTT Broker Core
//!
//! Owns the session and retained stores through the [`Router`], accepts TCP
//! connections and drives the start/stop lifecycle with a graceful drain.

mod connection;
mod router;


pub use connection::{Connection, ConnectionError};
pub use router::{Origin, Router};

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bridge::{BridgeId, BridgeMessage, BridgeRegistry};
use crate::hooks::{DefaultHooks, Hooks};
use crate::persistence::{PersistenceError, PersistenceManager};
use crate::protocol::{ProtocolVersion, Publish, QoS};
use crate::retained::RetainedMessage;
use crate::session::{SessionLimits, SessionStore};
use crate::topic::validate_topic_name;

/// Where and how persisted state is stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceSettings {
    pub path: PathBuf,
    pub flush_interval: Duration,
    pub max_batch_size: usize,
}

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Maximum concurrently connected clients
    pub max_connections: usize,
    /// Maximum stored sessions (0 = unlimited)
    pub max_sessions: usize,
    /// Maximum packet size
    pub max_packet_size: usize,
    /// Maximum outbound QoS 1/2 deliveries in flight per session
    pub max_inflight: usize,
    /// Maximum queued messages per session (0 = unlimited)
    pub max_queued_messages: usize,
    /// Capacity of each connection's outbound frame channel
    pub outbound_channel_capacity: usize,
    /// Keep alive applied when the client asks for 0 (0 = none)
    pub default_keep_alive: u16,
    /// Maximum keep alive
    pub max_keep_alive: u16,
    /// Time allowed between accept and CONNECT
    pub connect_timeout: Duration,
    /// How long an offline durable session is kept
    pub session_expiry: Duration,
    /// Session expiry check interval
    pub expiry_check_interval: Duration,
    /// Time before an unacknowledged QoS step is resent
    pub retry_interval: Duration,
    /// Resends before a delivery is abandoned
    pub max_retries: u32,
    /// Maximum QoS granted to subscriptions
    pub max_qos: QoS,
    /// Retain available
    pub retain_available: bool,
    /// Durable storage, disabled when `None`
    pub persistence: Option<PersistenceSettings>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1883)),
            max_connections: 10_000,
            max_sessions: 0,
            max_packet_size: 256 * 1024,
            max_inflight: 32,
            max_queued_messages: 1000,
            outbound_channel_capacity: 256,
            default_keep_alive: 0,
            max_keep_alive: 65535,
            connect_timeout: Duration::from_secs(10),
            session_expiry: Duration::from_secs(2 * 60 * 60),
            expiry_check_interval: Duration::from_secs(60),
            retry_interval: Duration::from_secs(20),
            max_retries: 5,
            max_qos: QoS::ExactlyOnce,
            retain_available: true,
            persistence: None,
        }
    }
}

impl BrokerConfig {
    fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_queued_messages: self.max_queued_messages,
            max_inflight: self.max_inflight,
        }
    }
}

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent DISCONNECT
    Disconnect,
    KeepAliveTimeout,
    /// Socket closed or failed without DISCONNECT
    NetworkError,
    ProtocolError,
    /// Another connection connected with the same client identifier
    TakenOver,
    /// Broker is stopping
    Shutdown,
}

/// Broker events, for logging and telemetry only
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    ConnectionOpened {
        client_id: Arc<str>,
        addr: SocketAddr,
        protocol_version: ProtocolVersion,
        clean_start: bool,
        session_present: bool,
    },
    ConnectionClosed {
        client_id: Arc<str>,
        reason: CloseReason,
    },
    ClientSubscribed {
        client_id: Arc<str>,
        filter: String,
        /// `None` when the filter was rejected
        granted: Option<QoS>,
    },
    ClientUnsubscribed {
        client_id: Arc<str>,
        filter: String,
    },
    MessagePublished {
        origin: Origin,
        topic: Arc<str>,
        qos: QoS,
        retain: bool,
    },
    /// A message a subscriber will never see
    MessageDropped {
        client_id: Arc<str>,
        topic: Arc<str>,
        qos: QoS,
    },
    /// An outbound or inbound delivery exceeded its retries
    DeliveryFailed {
        client_id: Arc<str>,
        packet_id: u16,
        topic: Option<Arc<str>>,
    },
    Error {
        client_id: Option<Arc<str>>,
        message: String,
    },
}

/// Broker lifecycle errors
#[derive(Debug)]
pub enum BrokerError {
    Io(std::io::Error),
    AlreadyRunning,
    NotRunning,
    Persistence(PersistenceError),
    /// Topic rejected by [`Broker::inject`]
    InvalidTopic(&'static str),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Io(e) => write!(f, "IO error: {}", e),
            BrokerError::AlreadyRunning => write!(f, "broker is already running"),
            BrokerError::NotRunning => write!(f, "broker is not running"),
            BrokerError::Persistence(e) => write!(f, "persistence error: {}", e),
            BrokerError::InvalidTopic(e) => write!(f, "invalid topic: {}", e),
        }
    }
}

impl std::error::Error for BrokerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BrokerError::Io(e) => Some(e),
            BrokerError::Persistence(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(e: std::io::Error) -> Self {
        BrokerError::Io(e)
    }
}

impl From<PersistenceError> for BrokerError {
    fn from(e: PersistenceError) -> Self {
        BrokerError::Persistence(e)
    }
}

/// State shared by the accept loop and every connection task
pub(crate) struct BrokerShared {
    pub(crate) config: BrokerConfig,
    pub(crate) router: Router,
    /// Connected client -> owning connection id
    pub(crate) connections: DashMap<Arc<str>, u64>,
    pub(crate) hooks: Arc<dyn Hooks>,
    next_conn_id: AtomicU64,
}

impl BrokerShared {
    fn new(
        config: BrokerConfig,
        hooks: Arc<dyn Hooks>,
        bridges: Arc<BridgeRegistry>,
        events: broadcast::Sender<BrokerEvent>,
    ) -> Self {
        let sessions = SessionStore::new(config.session_limits());
        let router = Router::new(sessions, bridges, events, config.retain_available);
        Self {
            config,
            router,
            connections: DashMap::new(),
            hooks,
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    fn expire_sessions(&self, now: Instant) {
        let sessions = self.router.sessions();
        for client_id in sessions.expire_sessions(now, self.config.session_expiry) {
            info!("Session expired: {}", client_id);
            self.router.forget_session(&client_id);
        }
    }
}

/// Resolves once the broker is told to stop (or the signal is gone)
pub(crate) async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    /// Yields `None` once every connection task has finished
    drain: mpsc::Receiver<()>,
    accept: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// The MQTT Broker
pub struct Broker {
    config: BrokerConfig,
    shared: Arc<BrokerShared>,
    hooks: Arc<dyn Hooks>,
    bridges: Arc<BridgeRegistry>,
    events: broadcast::Sender<BrokerEvent>,
    running: Mutex<Option<Running>>,
}

impl Broker {
    /// Create a new broker with default hooks (allows everything)
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a new broker with custom hooks
    pub fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Self {
        let (events, _) = broadcast::channel(1024);
        let bridges = Arc::new(BridgeRegistry::new());
        let shared = Arc::new(BrokerShared::new(
            config.clone(),
            hooks.clone(),
            bridges.clone(),
            events.clone(),
        ));

        Self {
            config,
            shared,
            hooks,
            bridges,
            events,
            running: Mutex::new(None),
        }
    }

    /// Replace the configuration of a stopped broker
    ///
    /// In-memory sessions and retained messages are discarded; with
    /// persistence enabled they are reloaded by the next [`Broker::start`].
    pub fn configure(&mut self, config: BrokerConfig) -> Result<(), BrokerError> {
        if self.running.get_mut().is_some() {
            return Err(BrokerError::AlreadyRunning);
        }
        self.shared = Arc::new(BrokerShared::new(
            config.clone(),
            self.hooks.clone(),
            self.bridges.clone(),
            self.events.clone(),
        ));
        self.config = config;
        Ok(())
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Bind the listener, restore persisted state and start accepting
    pub async fn start(&self) -> Result<SocketAddr, BrokerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(BrokerError::AlreadyRunning);
        }

        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        if let Some(settings) = &self.config.persistence {
            self.open_persistence(settings).await?;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (drain_tx, drain) = mpsc::channel(1);

        let accept = tokio::spawn(accept_loop(
            listener,
            self.shared.clone(),
            shutdown_rx.clone(),
            drain_tx,
        ));
        let sweeper = tokio::spawn(expiry_loop(self.shared.clone(), shutdown_rx));

        info!("MQTT/TCP listening on {}", local_addr);
        *running = Some(Running {
            shutdown,
            drain,
            accept,
            sweeper,
            local_addr,
        });
        Ok(local_addr)
    }

    async fn open_persistence(&self, settings: &PersistenceSettings) -> Result<(), BrokerError> {
        let manager = PersistenceManager::open_fjall(
            &settings.path,
            settings.flush_interval,
            settings.max_batch_size,
        )?;
        let loaded = manager.load_all().await?;

        let router = &self.shared.router;
        let retained = loaded.retained.len();
        for stored in loaded.retained {
            router.retained().restore(RetainedMessage::from(stored));
        }

        let limits = router.sessions().limits();
        let mut sessions = 0;
        for stored in loaded.sessions {
            let client_id = stored.client_id.clone();
            match stored.into_session(limits) {
                Ok(session) => {
                    router.sessions().restore(session);
                    sessions += 1;
                }
                Err(e) => error!("Discarding stored session {}: {}", client_id, e),
            }
        }

        info!(
            "Restored {} retained messages and {} sessions",
            retained, sessions
        );
        router.set_persistence(Some(Arc::new(manager)));
        Ok(())
    }

    /// Stop accepting, close every connection without wills and wait for
    /// all of them to finish, then flush persisted state
    pub async fn stop(&self) -> Result<(), BrokerError> {
        let mut running = self.running.lock().await;
        let Running {
            shutdown,
            mut drain,
            accept,
            sweeper,
            local_addr,
        } = running.take().ok_or(BrokerError::NotRunning)?;

        info!("Stopping broker on {}", local_addr);
        let _ = shutdown.send(true);

        if let Err(e) = accept.await {
            warn!("Accept loop ended abnormally: {}", e);
        }
        if let Err(e) = sweeper.await {
            warn!("Session sweeper ended abnormally: {}", e);
        }

        // Every connection task holds a sender
        while drain.recv().await.is_some() {}
        debug!("All connections drained");

        let router = &self.shared.router;
        if let Some(persistence) = router.persistence() {
            for session in router.sessions().all() {
                router.persist_session(&session.read());
            }
            persistence.flush().await?;
            router.set_persistence(None);
        }

        info!("Broker stopped");
        Ok(())
    }

    /// Start, wait for Ctrl-C, then stop
    pub async fn run(&self) -> Result<(), BrokerError> {
        self.start().await?;
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
        info!("Shutdown requested");
        self.stop().await
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Address the listener is bound to while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Subscribe to broker events
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    pub fn bridges(&self) -> &BridgeRegistry {
        &self.bridges
    }

    /// Invoke `callback` for every routed PUBLISH matching `filter`
    pub fn register_outbound<F>(&self, filter: &str, callback: F) -> Result<BridgeId, &'static str>
    where
        F: Fn(&BridgeMessage) + Send + Sync + 'static,
    {
        self.bridges.register_outbound(filter, callback)
    }

    pub fn unregister_outbound(&self, id: BridgeId) -> bool {
        self.bridges.unregister(id)
    }

    /// Publish a message as if a client had sent it
    ///
    /// Returns the number of sessions that accepted it.
    pub fn inject(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<usize, BrokerError> {
        validate_topic_name(topic).map_err(BrokerError::InvalidTopic)?;
        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic: Arc::from(topic),
            packet_id: None,
            payload,
        };
        Ok(self.shared.router.route(&publish, Origin::Bridge))
    }

    /// Get session count
    pub fn session_count(&self) -> usize {
        self.shared.router.sessions().len()
    }

    /// Get connection count
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Get retained message count
    pub fn retained_count(&self) -> usize {
        self.shared.router.retained().len()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<BrokerShared>,
    shutdown: watch::Receiver<bool>,
    drain: mpsc::Sender<()>,
) {
    let mut stop = shutdown.clone();
    debug!("Starting TCP accept loop");
    loop {
        tokio::select! {
            biased;

            _ = shutdown_signal(&mut stop) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("New TCP connection from {}", addr);
                    spawn_connection(stream, addr, shared.clone(), shutdown.clone(), drain.clone());
                }
                Err(e) => {
                    error!("Failed to accept TCP connection: {}", e);
                }
            },
        }
    }
    debug!("Accept loop stopped");
}

fn spawn_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<BrokerShared>,
    shutdown: watch::Receiver<bool>,
    drain: mpsc::Sender<()>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
    }

    tokio::spawn(async move {
        let _drain = drain;
        let conn_id = shared.next_conn_id();
        let mut conn = Connection::new(stream, addr, conn_id, shared, shutdown);
        if let Err(e) = conn.run().await {
            debug!("Connection error from {}: {}", addr, e);
        }
    });
}

async fn expiry_loop(shared: Arc<BrokerShared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(shared.config.expiry_check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;

            _ = shutdown_signal(&mut shutdown) => break,
            _ = ticker.tick() => shared.expire_sessions(Instant::now()),
        }
    }
}
