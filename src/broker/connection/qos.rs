//! QoS acknowledgement and retransmission handling

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace, warn};

use super::{Connection, ConnectionError};
use crate::broker::BrokerEvent;
use crate::delivery::{AckOutcome, Direction};
use crate::protocol::{Packet, PubComp};
use crate::session::Session;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handle PUBACK (QoS 1 complete)
    pub(crate) fn handle_puback(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        packet_id: u16,
    ) -> Result<(), ConnectionError> {
        let mut s = session.write();
        match s.inflight.on_puback(packet_id) {
            AckOutcome::Completed => {
                trace!("PUBACK {} from {}", packet_id, client_id);
                s.release_queued(Instant::now())?;
            }
            _ => debug!("Unexpected PUBACK {} from {}", packet_id, client_id),
        }
        Ok(())
    }

    /// Handle PUBREC (QoS 2 step 1), answered with PUBREL
    pub(crate) fn handle_pubrec(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        packet_id: u16,
    ) -> Result<(), ConnectionError> {
        let outcome = session.write().inflight.on_pubrec(packet_id, Instant::now());
        match outcome {
            AckOutcome::Release(pubrel) => self.encode_frame(&Packet::PubRel(pubrel)),
            _ => {
                debug!("Unexpected PUBREC {} from {}", packet_id, client_id);
                Ok(())
            }
        }
    }

    /// Handle PUBREL (inbound QoS 2 step 2)
    ///
    /// Always answered with PUBCOMP so a publisher retrying after a lost
    /// PUBCOMP can finish its handshake.
    pub(crate) fn handle_pubrel(
        &mut self,
        session: &Arc<RwLock<Session>>,
        packet_id: u16,
    ) -> Result<(), ConnectionError> {
        if !session.write().inflight.on_pubrel(packet_id) {
            trace!("PUBREL {} for an identifier already released", packet_id);
        }
        self.encode_frame(&Packet::PubComp(PubComp::new(packet_id)))
    }

    /// Handle PUBCOMP (QoS 2 complete)
    pub(crate) fn handle_pubcomp(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        packet_id: u16,
    ) -> Result<(), ConnectionError> {
        let mut s = session.write();
        match s.inflight.on_pubcomp(packet_id) {
            AckOutcome::Completed => {
                trace!("PUBCOMP {} from {}", packet_id, client_id);
                s.release_queued(Instant::now())?;
            }
            _ => debug!("Unexpected PUBCOMP {} from {}", packet_id, client_id),
        }
        Ok(())
    }

    /// Move queued messages to the outlet now that the channel has room
    pub(crate) fn release_session_queue(
        &self,
        session: &Arc<RwLock<Session>>,
    ) -> Result<(), ConnectionError> {
        let mut s = session.write();
        if s.queue_len() == 0 || !s.is_owned_by(self.conn_id) {
            return Ok(());
        }
        let released = s.release_queued(Instant::now())?;
        if released > 0 {
            trace!("Released {} queued messages for {}", released, s.client_id);
        }
        Ok(())
    }

    /// Resend unacknowledged steps and give up on exhausted deliveries
    pub(crate) async fn retry_deliveries(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
    ) -> Result<(), ConnectionError> {
        let config = &self.shared.config;
        let (retry_interval, max_retries) = (config.retry_interval, config.max_retries);

        let now = Instant::now();
        let scan = {
            let mut s = session.write();
            let scan = s.inflight.due_for_retry(now, retry_interval, max_retries);
            if !scan.failed.is_empty() {
                // Freed window slots can take queued messages
                s.release_queued(now)?;
            }
            scan
        };

        if !scan.resend.is_empty() {
            debug!(
                "Retrying {} unacknowledged frames for {}",
                scan.resend.len(),
                client_id
            );
            for packet in &scan.resend {
                self.encode_frame(packet)?;
            }
            self.flush_frames().await?;
        }

        for failed in scan.failed {
            let topic = failed.publish.as_ref().map(|p| p.topic.clone());
            match failed.direction {
                Direction::Outbound => warn!(
                    "Delivery {} to {} failed after {} retries",
                    failed.packet_id, client_id, max_retries
                ),
                Direction::Inbound => warn!(
                    "QoS 2 receipt {} from {} abandoned after {} retries",
                    failed.packet_id, client_id, max_retries
                ),
            }
            self.shared.router.emit(BrokerEvent::DeliveryFailed {
                client_id: client_id.clone(),
                packet_id: failed.packet_id,
                topic,
            });
        }

        Ok(())
    }
}
