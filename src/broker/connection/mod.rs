//! MQTT Connection Handler
//!
//! Handles individual client connections, packet processing,
//! and the protocol state machine:
//! `Connecting -> Connected -> Closed`.
//!
//! Frames for the client arrive from the routing path through the session's
//! outlet channel and are written by this task only, so socket writes are
//! never shared between connections.

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;


use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, trace, warn};

use crate::broker::{shutdown_signal, BrokerEvent, BrokerShared, CloseReason};
use crate::codec::{Decoder, Encoder};
use crate::protocol::{DecodeError, Packet, ProtocolError, ProtocolVersion};
use crate::session::Session;

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    Decode(DecodeError),
    Timeout,
    Shutdown,
    /// Broker bookkeeping is inconsistent
    Invariant(String),
}

impl ConnectionError {
    fn close_reason(&self) -> CloseReason {
        match self {
            ConnectionError::Io(_) => CloseReason::NetworkError,
            ConnectionError::Protocol(_)
            | ConnectionError::Decode(_)
            | ConnectionError::Invariant(_) => CloseReason::ProtocolError,
            ConnectionError::Timeout => CloseReason::KeepAliveTimeout,
            ConnectionError::Shutdown => CloseReason::Shutdown,
        }
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Decode(e) => write!(f, "Decode error: {}", e),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
            ConnectionError::Shutdown => write!(f, "Shutdown"),
            ConnectionError::Invariant(msg) => write!(f, "Invariant violated: {}", msg),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

impl From<crate::delivery::DeliveryError> for ConnectionError {
    fn from(e: crate::delivery::DeliveryError) -> Self {
        ConnectionError::Invariant(e.to_string())
    }
}

/// Connection state
pub(crate) enum State {
    /// Waiting for CONNECT packet
    Connecting,
    /// Connected and running
    Connected {
        client_id: Arc<str>,
        session: Arc<RwLock<Session>>,
    },
    Closed,
}

/// Keep-alive deadline for a negotiated interval, 1.5 times the interval
pub(crate) fn keep_alive_timeout(keep_alive: u16) -> Option<Duration> {
    (keep_alive > 0).then(|| Duration::from_millis(keep_alive as u64 * 1500))
}

/// Period of the retransmission scan
///
/// A delivery becomes due `retry_interval` after it was last sent; scanning
/// at a quarter of that keeps the actual delay within 25% of the setting.
pub(crate) fn retry_tick_period(retry_interval: Duration) -> Duration {
    (retry_interval / 4).max(Duration::from_millis(10))
}

/// Keep alive the broker enforces for the one a client asked for
pub(crate) fn negotiate_keep_alive(requested: u16, default: u16, max: u16) -> u16 {
    let keep_alive = if requested == 0 { default } else { requested };
    if max > 0 {
        keep_alive.min(max)
    } else {
        keep_alive
    }
}

/// Connection handler - generic over the stream type
pub struct Connection<S> {
    pub(crate) stream: S,
    pub(crate) addr: SocketAddr,
    /// Unique per accepted socket, identifies the session owner
    pub(crate) conn_id: u64,
    pub(crate) state: State,
    pub(crate) decoder: Decoder,
    pub(crate) encoder: Encoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
    pub(crate) shared: Arc<BrokerShared>,
    /// Receiving end of this connection's outlet (set after CONNECT)
    pub(crate) outbound: Option<mpsc::Receiver<Packet>>,
    /// Notified when another connection takes the session over
    pub(crate) kick: Arc<Notify>,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) username: Option<String>,
    pub(crate) protocol_version: ProtocolVersion,
    pub(crate) keep_alive: u16,
    pub(crate) last_frame: Instant,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(
        stream: S,
        addr: SocketAddr,
        conn_id: u64,
        shared: Arc<BrokerShared>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let max_packet_size = shared.config.max_packet_size;
        Self {
            stream,
            addr,
            conn_id,
            state: State::Connecting,
            decoder: Decoder::new().with_max_packet_size(max_packet_size),
            encoder: Encoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            shared,
            outbound: None,
            kick: Arc::new(Notify::new()),
            shutdown,
            username: None,
            protocol_version: ProtocolVersion::V311,
            keep_alive: 0,
            last_frame: Instant::now(),
        }
    }

    /// Run the connection handler until the connection closes
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        let connect_timeout = self.shared.config.connect_timeout;
        let mut shutdown = self.shutdown.clone();

        let handshake = tokio::select! {
            biased;

            _ = shutdown_signal(&mut shutdown) => Err(ConnectionError::Shutdown),
            result = timeout(connect_timeout, self.read_connect()) => match result {
                Ok(result) => result,
                Err(_) => {
                    debug!("Connect timeout from {}", self.addr);
                    Err(ConnectionError::Timeout)
                }
            },
        };

        let result = match handshake {
            Ok(true) => self.run_connected().await,
            Ok(false) => {
                self.state = State::Closed;
                let _ = self.stream.shutdown().await;
                return Ok(());
            }
            Err(e) => Err(e),
        };

        if matches!(self.state, State::Connected { .. }) {
            let reason = match &result {
                Ok(reason) => *reason,
                Err(e) => e.close_reason(),
            };
            if let Err(ConnectionError::Invariant(message)) = &result {
                error!("Closing connection from {}: {}", self.addr, message);
                self.shared.router.emit(BrokerEvent::Error {
                    client_id: self.client_id(),
                    message: message.clone(),
                });
            }
            self.cleanup(reason).await;
        }
        self.state = State::Closed;
        let _ = self.stream.shutdown().await;

        result.map(|_| ())
    }

    fn client_id(&self) -> Option<Arc<str>> {
        match &self.state {
            State::Connected { client_id, .. } => Some(client_id.clone()),
            _ => None,
        }
    }

    /// Run the main connection loop
    async fn run_connected(&mut self) -> Result<CloseReason, ConnectionError> {
        let (client_id, session) = match &self.state {
            State::Connected { client_id, session } => (client_id.clone(), session.clone()),
            _ => {
                return Err(ConnectionError::Invariant(
                    "connection loop started before CONNECT".to_string(),
                ))
            }
        };
        let mut outbound = self.outbound.take().ok_or_else(|| {
            ConnectionError::Invariant("connected without an outbound channel".to_string())
        })?;
        let kick = self.kick.clone();
        let mut shutdown = self.shutdown.clone();

        let keep_alive = keep_alive_timeout(self.keep_alive);
        debug!(
            "Keep alive for {}: {}s -> timeout {:?}",
            client_id, self.keep_alive, keep_alive
        );

        let retry_period = retry_tick_period(self.shared.config.retry_interval);
        let mut retry_ticker =
            tokio::time::interval_at(Instant::now() + retry_period, retry_period);
        retry_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        self.last_frame = Instant::now();

        loop {
            let deadline = keep_alive.map(|timeout| self.last_frame + timeout);
            let keep_alive_expired = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                _ = shutdown_signal(&mut shutdown) => {
                    debug!("Connection {} shutting down", client_id);
                    return Ok(CloseReason::Shutdown);
                }
                _ = kick.notified() => {
                    debug!("Session {} taken over by a new connection", client_id);
                    return Ok(CloseReason::TakenOver);
                }
                _ = keep_alive_expired => {
                    warn!("Keep alive timeout for {}", client_id);
                    return Ok(CloseReason::KeepAliveTimeout);
                }
                result = self.stream.read_buf(&mut self.read_buf) => {
                    if result? == 0 {
                        debug!("Connection closed from {}", self.addr);
                        return Ok(CloseReason::NetworkError);
                    }
                    if let Some(reason) = self.process_frames(&client_id, &session).await? {
                        return Ok(reason);
                    }
                }
                Some(packet) = outbound.recv() => {
                    self.encode_frame(&packet)?;
                    // Batch whatever else is already waiting
                    while let Ok(packet) = outbound.try_recv() {
                        self.encode_frame(&packet)?;
                    }
                    self.flush_frames().await?;
                    self.release_session_queue(&session)?;
                }
                _ = retry_ticker.tick() => {
                    self.retry_deliveries(&client_id, &session).await?;
                }
            }
        }
    }

    /// Decode and dispatch every complete frame in the read buffer
    async fn process_frames(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
    ) -> Result<Option<CloseReason>, ConnectionError> {
        while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
            self.read_buf.advance(consumed);
            self.last_frame = Instant::now();
            session.write().touch();

            trace!("{} from {}", packet.name(), client_id);
            if let Some(reason) = self.handle_packet(client_id, session, packet).await? {
                self.flush_frames().await?;
                return Ok(Some(reason));
            }
        }
        self.flush_frames().await?;
        Ok(None)
    }

    /// Handle a packet received in the connected state
    async fn handle_packet(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        packet: Packet,
    ) -> Result<Option<CloseReason>, ConnectionError> {
        match packet {
            Packet::Connect(_) => {
                warn!("Second CONNECT from {}", client_id);
                return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                    "second CONNECT on a connection",
                )));
            }
            Packet::Publish(publish) => self.handle_publish(client_id, session, publish).await?,
            Packet::PubAck(ack) => self.handle_puback(client_id, session, ack.packet_id)?,
            Packet::PubRec(ack) => self.handle_pubrec(client_id, session, ack.packet_id)?,
            Packet::PubRel(ack) => self.handle_pubrel(session, ack.packet_id)?,
            Packet::PubComp(ack) => self.handle_pubcomp(client_id, session, ack.packet_id)?,
            Packet::Subscribe(subscribe) => {
                self.handle_subscribe(client_id, session, subscribe).await?
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(client_id, session, unsubscribe)?
            }
            Packet::PingReq => self.encode_frame(&Packet::PingResp)?,
            Packet::Disconnect => {
                debug!("DISCONNECT from {}", client_id);
                return Ok(Some(CloseReason::Disconnect));
            }
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                    "server-to-client packet received",
                )));
            }
        }
        Ok(None)
    }

    /// Append a frame to the write buffer
    pub(crate) fn encode_frame(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.encoder
            .encode(packet, &mut self.write_buf)
            .map_err(|e| ConnectionError::Protocol(e.into()))
    }

    /// Write out everything buffered by [`Connection::encode_frame`]
    pub(crate) async fn flush_frames(&mut self) -> Result<(), ConnectionError> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        self.write_buf.clear();
        Ok(())
    }

    /// Write a single packet immediately
    pub(crate) async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.encode_frame(packet)?;
        self.flush_frames().await
    }
}
