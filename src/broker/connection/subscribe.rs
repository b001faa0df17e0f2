//! SUBSCRIBE and UNSUBSCRIBE packet handling

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, warn};

use super::{Connection, ConnectionError};
use crate::broker::BrokerEvent;
use crate::hooks::ClientInfo;
use crate::protocol::{Packet, QoS, SubAck, Subscribe, UnsubAck, Unsubscribe, SUBACK_FAILURE};
use crate::retained::RetainedMessage;
use crate::session::{DeliveryOutcome, Session};
use crate::topic::validate_topic_filter;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handle SUBSCRIBE packet
    ///
    /// Requested QoS above `max_qos` is downgraded. SUBACK goes out before
    /// the retained messages matching the new filters.
    pub(crate) async fn handle_subscribe(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let shared = self.shared.clone();
        let max_qos = shared.config.max_qos;
        let mut return_codes = Vec::with_capacity(subscribe.subscriptions.len());
        let mut retained: Vec<(RetainedMessage, QoS)> = Vec::new();

        for sub in &subscribe.subscriptions {
            if let Err(e) = validate_topic_filter(&sub.filter) {
                warn!("Invalid topic filter from {}: {} ({})", client_id, sub.filter, e);
                return_codes.push(SUBACK_FAILURE);
                self.subscribed_event(client_id, &sub.filter, None);
                continue;
            }

            let info = ClientInfo {
                client_id,
                username: self.username.as_deref(),
                addr: self.addr,
            };
            let allowed = match shared
                .hooks
                .authorize_subscribe(info, &sub.filter, sub.qos)
                .await
            {
                Ok(allowed) => allowed,
                Err(e) => {
                    warn!("Subscribe authorization failed for {}: {}", client_id, e);
                    false
                }
            };
            if !allowed {
                debug!("SUBSCRIBE to {} denied for {}", sub.filter, client_id);
                return_codes.push(SUBACK_FAILURE);
                self.subscribed_event(client_id, &sub.filter, None);
                continue;
            }

            let granted = sub.qos.min(max_qos);
            let owned = shared.router.sessions().add_owned_subscription(
                session,
                self.conn_id,
                &sub.filter,
                granted,
            );
            if owned.is_none() {
                debug!("{} was taken over, not subscribing to {}", client_id, sub.filter);
                return_codes.push(SUBACK_FAILURE);
                continue;
            }
            debug!(
                "{} subscribed to {} (granted QoS {:?})",
                client_id, sub.filter, granted
            );
            return_codes.push(granted as u8);
            self.subscribed_event(client_id, &sub.filter, Some(granted));

            retained.extend(
                shared
                    .router
                    .retained_for(&sub.filter)
                    .into_iter()
                    .map(|message| (message, granted)),
            );
        }

        self.encode_frame(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }))?;

        let now = Instant::now();
        let mut s = session.write();
        if !s.is_owned_by(self.conn_id) {
            return Ok(());
        }
        shared.router.persist_session(&s);
        for (message, granted) in retained {
            let publish = message.to_publish(message.qos.min(granted));
            match s.deliver(publish, now) {
                Ok(DeliveryOutcome::Dropped) => {
                    debug!("Retained {} dropped for {}", message.topic, client_id)
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Retained delivery to {} failed: {}", client_id, e);
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }

    fn subscribed_event(&self, client_id: &Arc<str>, filter: &str, granted: Option<QoS>) {
        self.shared.router.emit(BrokerEvent::ClientSubscribed {
            client_id: client_id.clone(),
            filter: filter.to_string(),
            granted,
        });
    }

    /// Handle UNSUBSCRIBE packet
    pub(crate) fn handle_unsubscribe(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        let shared = self.shared.clone();
        let sessions = shared.router.sessions();
        let mut changed = false;

        for filter in unsubscribe.filters {
            match sessions.remove_owned_subscription(session, self.conn_id, &filter) {
                Some(true) => {
                    debug!("{} unsubscribed from {}", client_id, filter);
                    changed = true;
                }
                Some(false) => debug!("{} was not subscribed to {}", client_id, filter),
                None => {
                    debug!("{} was taken over, not unsubscribing from {}", client_id, filter);
                    continue;
                }
            }
            shared.router.emit(BrokerEvent::ClientUnsubscribed {
                client_id: client_id.clone(),
                filter,
            });
        }

        if changed {
            let s = session.read();
            if s.is_owned_by(self.conn_id) {
                shared.router.persist_session(&s);
            }
        }

        self.encode_frame(&Packet::UnsubAck(UnsubAck::new(unsubscribe.packet_id)))
    }
}
