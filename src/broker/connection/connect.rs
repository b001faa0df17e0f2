//! CONNECT packet handling

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Buf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{negotiate_keep_alive, Connection, ConnectionError, State};
use crate::broker::BrokerEvent;
use crate::hooks::ClientInfo;
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolError,
};
use crate::session::Outlet;
use crate::topic::validate_topic_name;

/// Identifier assigned to a client that connected with an empty one
fn generate_client_id(conn_id: u64) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    format!("harbormq-{:x}-{:x}", nanos, conn_id)
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read and process the CONNECT packet
    ///
    /// Returns `false` when the client was refused with a CONNACK and the
    /// connection should close.
    pub(crate) async fn read_connect(&mut self) -> Result<bool, ConnectionError> {
        loop {
            match self.decoder.decode(&self.read_buf) {
                Ok(Some((packet, consumed))) => {
                    self.read_buf.advance(consumed);
                    return match packet {
                        Packet::Connect(connect) => self.handle_connect(*connect).await,
                        other => {
                            debug!(
                                "First packet from {} was {} instead of CONNECT",
                                self.addr,
                                other.name()
                            );
                            Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                                "first packet must be CONNECT",
                            )))
                        }
                    };
                }
                Ok(None) => {}
                Err(DecodeError::InvalidProtocolVersion(level)) => {
                    debug!("Unsupported protocol level {} from {}", level, self.addr);
                    return self
                        .refuse(ConnectReturnCode::UnacceptableProtocolVersion)
                        .await;
                }
                Err(e) => return Err(e.into()),
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before CONNECT",
                )));
            }
        }
    }

    async fn refuse(&mut self, code: ConnectReturnCode) -> Result<bool, ConnectionError> {
        self.write_packet(&Packet::ConnAck(ConnAck::refused(code)))
            .await?;
        Ok(false)
    }

    /// Handle CONNECT packet
    async fn handle_connect(&mut self, connect: Connect) -> Result<bool, ConnectionError> {
        let shared = self.shared.clone();
        let config = &shared.config;
        self.protocol_version = connect.protocol_version;

        // MQTT-3.1.3-8: zero-byte ClientId needs CleanSession=1
        let client_id: Arc<str> = if connect.client_id.is_empty() {
            if !connect.clean_start {
                debug!(
                    "Rejecting empty client ID with clean_start=false from {}",
                    self.addr
                );
                return self.refuse(ConnectReturnCode::IdentifierRejected).await;
            }
            generate_client_id(self.conn_id).into()
        } else {
            connect.client_id.as_str().into()
        };

        debug!("CONNECT from {} (client_id: {})", self.addr, client_id);

        if let Some(will) = &connect.will {
            if let Err(e) = validate_topic_name(&will.topic) {
                warn!("Invalid will topic from {}: {}", client_id, e);
                return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                    "invalid will topic",
                )));
            }
        }

        self.username = connect.username.clone();
        let info = ClientInfo {
            client_id: &client_id,
            username: connect.username.as_deref(),
            addr: self.addr,
        };
        match shared
            .hooks
            .authenticate(info, connect.password.as_deref())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!("Authentication failed for {} from {}", client_id, self.addr);
                return self.refuse(ConnectReturnCode::BadUsernameOrPassword).await;
            }
            Err(e) => {
                warn!("Authentication hook failed for {}: {}", client_id, e);
                return self.refuse(ConnectReturnCode::NotAuthorized).await;
            }
        }

        let sessions = shared.router.sessions();
        let reconnecting = shared.connections.contains_key(&client_id);
        if !reconnecting && shared.connections.len() >= config.max_connections {
            warn!("Connection limit reached, refusing {}", client_id);
            return self.refuse(ConnectReturnCode::ServerUnavailable).await;
        }
        if config.max_sessions > 0
            && sessions.get(&client_id).is_none()
            && sessions.len() >= config.max_sessions
        {
            warn!("Session limit reached, refusing {}", client_id);
            return self.refuse(ConnectReturnCode::ServerUnavailable).await;
        }

        // Takeover: the prior connection loses the session and its will
        if let Some(existing) = sessions.get(&client_id) {
            let mut s = existing.write();
            if let Some(outlet) = s.outlet().cloned() {
                info!("Client {} reconnected, closing previous connection", client_id);
                s.will = None;
                s.detach(outlet.conn_id, std::time::Instant::now());
                outlet.kick.notify_one();
            }
        }

        let (session, session_present) =
            sessions.create_or_resume_session(&client_id, connect.clean_start);
        if connect.clean_start {
            shared.router.forget_session(&client_id);
        }

        let keep_alive = negotiate_keep_alive(
            connect.keep_alive,
            config.default_keep_alive,
            config.max_keep_alive,
        );
        self.keep_alive = keep_alive;

        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity.max(1));
        let outlet = Outlet {
            conn_id: self.conn_id,
            tx,
            kick: self.kick.clone(),
        };

        let now = std::time::Instant::now();
        let resumed = {
            let mut s = session.write();
            s.keep_alive = keep_alive;
            s.will = connect.will.clone();
            s.touch();
            if let Some(previous) = s.attach(outlet) {
                previous.kick.notify_one();
            }
            s.inflight.resume_all(now)
        };

        shared.connections.insert(client_id.clone(), self.conn_id);
        self.outbound = Some(rx);
        self.state = State::Connected {
            client_id: client_id.clone(),
            session: session.clone(),
        };

        self.encode_frame(&Packet::ConnAck(ConnAck::accepted(session_present)))?;
        for packet in &resumed {
            self.encode_frame(packet)?;
        }
        self.flush_frames().await?;

        let released = session.write().release_queued(now)?;
        if session_present {
            debug!(
                "Resumed session {}: {} in flight, {} queued released",
                client_id,
                resumed.len(),
                released
            );
        }

        info!(
            "Client connected: {} from {} ({:?}, clean_start: {}, keep_alive: {}s)",
            client_id, self.addr, connect.protocol_version, connect.clean_start, keep_alive
        );

        shared.router.emit(BrokerEvent::ConnectionOpened {
            client_id: client_id.clone(),
            addr: self.addr,
            protocol_version: connect.protocol_version,
            clean_start: connect.clean_start,
            session_present,
        });

        let info = ClientInfo {
            client_id: &client_id,
            username: self.username.as_deref(),
            addr: self.addr,
        };
        shared.hooks.on_connected(info, session_present).await;

        Ok(true)
    }
}
