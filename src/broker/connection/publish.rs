//! PUBLISH packet handling

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace, warn};

use super::{Connection, ConnectionError};
use crate::broker::Origin;
use crate::delivery::InboundStatus;
use crate::hooks::ClientInfo;
use crate::protocol::{Packet, ProtocolError, PubAck, PubRec, Publish, QoS};
use crate::session::Session;
use crate::topic::validate_topic_name;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handle PUBLISH packet
    ///
    /// QoS 2 messages are routed once, on the first PUBLISH carrying a new
    /// identifier; retransmissions only repeat the PUBREC.
    pub(crate) async fn handle_publish(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        publish: Publish,
    ) -> Result<(), ConnectionError> {
        if let Err(e) = validate_topic_name(&publish.topic) {
            warn!("Invalid topic name from {}: {}", client_id, e);
            return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                "invalid topic name in PUBLISH",
            )));
        }

        trace!(
            "PUBLISH from {} to {} (QoS {:?}, retain: {})",
            client_id,
            publish.topic,
            publish.qos,
            publish.retain
        );

        let shared = self.shared.clone();
        let info = ClientInfo {
            client_id,
            username: self.username.as_deref(),
            addr: self.addr,
        };
        let allowed = match shared
            .hooks
            .authorize_publish(info, &publish.topic, publish.qos, publish.retain)
            .await
        {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!("Publish authorization failed for {}: {}", client_id, e);
                false
            }
        };
        if !allowed {
            // MQTT 3.1.1 has no negative PUBACK: acknowledge and discard
            debug!("PUBLISH to {} denied for {}", publish.topic, client_id);
        }

        let origin = Origin::Client(client_id.clone());
        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => {
                if allowed {
                    shared.router.route(&publish, origin);
                }
            }
            (QoS::AtLeastOnce, Some(packet_id)) => {
                if allowed {
                    shared.router.route(&publish, origin);
                }
                self.encode_frame(&Packet::PubAck(PubAck::new(packet_id)))?;
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                let status = session
                    .write()
                    .inflight
                    .begin_inbound(packet_id, Instant::now());
                match status {
                    InboundStatus::New => {
                        if allowed {
                            shared.router.route(&publish, origin);
                        }
                    }
                    InboundStatus::Duplicate => {
                        debug!(
                            "Duplicate QoS 2 PUBLISH {} from {}, not routed again",
                            packet_id, client_id
                        );
                    }
                }
                self.encode_frame(&Packet::PubRec(PubRec::new(packet_id)))?;
            }
            (_, None) => {
                return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                    "QoS > 0 PUBLISH without packet identifier",
                )));
            }
        }

        Ok(())
    }
}
