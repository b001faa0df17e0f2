//! Message Router
//!
//! The single dispatch path for every PUBLISH entering the broker, whether it
//! came from a client, a will or the external bus.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use smallvec::SmallVec;
use tokio::sync::broadcast;
use tracing::{debug, error, trace};

use crate::bridge::{BridgeMessage, BridgeRegistry};
use crate::broker::BrokerEvent;
use crate::persistence::PersistenceManager;
use crate::protocol::{Publish, QoS};
use crate::retained::{RetainedChange, RetainedMessage, RetainedStore};
use crate::session::{DeliveryOutcome, Session, SessionStore};

/// Where a routed message entered the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// PUBLISH from a connected client
    Client(Arc<str>),
    /// Will of a client whose connection ended abnormally
    Will(Arc<str>),
    /// Injected through [`crate::Broker::inject`]
    Bridge,
}

/// Message router for distributing messages to subscribers
pub struct Router {
    sessions: SessionStore,
    retained: RetainedStore,
    bridges: Arc<BridgeRegistry>,
    events: broadcast::Sender<BrokerEvent>,
    persistence: RwLock<Option<Arc<PersistenceManager>>>,
    retain_available: bool,
}

impl Router {
    pub fn new(
        sessions: SessionStore,
        bridges: Arc<BridgeRegistry>,
        events: broadcast::Sender<BrokerEvent>,
        retain_available: bool,
    ) -> Self {
        Self {
            sessions,
            retained: RetainedStore::new(),
            bridges,
            events,
            persistence: RwLock::new(None),
            retain_available,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn retained(&self) -> &RetainedStore {
        &self.retained
    }

    pub(crate) fn set_persistence(&self, persistence: Option<Arc<PersistenceManager>>) {
        *self.persistence.write() = persistence;
    }

    pub(crate) fn persistence(&self) -> Option<Arc<PersistenceManager>> {
        self.persistence.read().clone()
    }

    pub(crate) fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Emit a diagnostic event, ignoring the case of no listeners
    pub(crate) fn emit(&self, event: BrokerEvent) {
        let _ = self.events.send(event);
    }

    /// Persist a durable session snapshot, taken under the caller's lock
    pub(crate) fn persist_session(&self, session: &Session) {
        if session.clean_start {
            return;
        }
        if let Some(persistence) = self.persistence.read().as_ref() {
            persistence.save_session(session);
        }
    }

    pub(crate) fn forget_session(&self, client_id: &str) {
        if let Some(persistence) = self.persistence.read().as_ref() {
            persistence.delete_session(client_id);
        }
    }

    /// Route a publish to every matching subscriber
    ///
    /// Returns the number of sessions that accepted the message (sent or
    /// queued). Must not be called while holding a session lock.
    pub fn route(&self, publish: &Publish, origin: Origin) -> usize {
        if publish.retain && self.retain_available {
            self.update_retained(publish);
        }

        let subscribers = self.sessions.find_subscribers(&publish.topic);
        trace!(
            "Routing {} to {} subscribers (QoS {:?})",
            publish.topic,
            subscribers.len(),
            publish.qos
        );

        let now = Instant::now();
        let mut accepted = 0;
        let mut dropped: SmallVec<[(Arc<str>, QoS); 4]> = SmallVec::new();

        for (client_id, granted) in subscribers {
            let Some(session) = self.sessions.get(&client_id) else {
                continue;
            };

            let outgoing = Publish {
                dup: false,
                qos: publish.qos.min(granted),
                retain: false,
                topic: publish.topic.clone(),
                packet_id: None,
                payload: publish.payload.clone(),
            };
            let qos = outgoing.qos;

            let mut s = session.write();
            let offline = !s.is_online();
            match s.deliver(outgoing, now) {
                Ok(DeliveryOutcome::Sent) => accepted += 1,
                Ok(DeliveryOutcome::Queued) => {
                    accepted += 1;
                    if offline {
                        self.persist_session(&s);
                    }
                }
                Ok(DeliveryOutcome::QueuedDroppedOldest(oldest)) => {
                    accepted += 1;
                    if offline {
                        self.persist_session(&s);
                    }
                    drop(s);
                    debug!("Queue full for {}, dropped oldest on {}", client_id, oldest.topic);
                    self.emit(BrokerEvent::MessageDropped {
                        client_id: client_id.clone(),
                        topic: oldest.topic.clone(),
                        qos: oldest.qos,
                    });
                }
                Ok(DeliveryOutcome::Dropped) => dropped.push((client_id.clone(), qos)),
                Err(e) => {
                    drop(s);
                    error!("Delivery to {} failed: {}", client_id, e);
                    self.emit(BrokerEvent::Error {
                        client_id: Some(client_id.clone()),
                        message: e.to_string(),
                    });
                }
            }
        }

        for (client_id, qos) in dropped {
            trace!("Dropped {} for {}", publish.topic, client_id);
            self.emit(BrokerEvent::MessageDropped {
                client_id,
                topic: publish.topic.clone(),
                qos,
            });
        }

        if !self.bridges.is_empty() {
            self.bridges.dispatch(&BridgeMessage {
                topic: publish.topic.clone(),
                payload: publish.payload.clone(),
                qos: publish.qos,
                retain: publish.retain,
                origin: origin.clone(),
            });
        }

        self.emit(BrokerEvent::MessagePublished {
            origin,
            topic: publish.topic.clone(),
            qos: publish.qos,
            retain: publish.retain,
        });

        accepted
    }

    fn update_retained(&self, publish: &Publish) {
        match self.retained.apply(publish) {
            RetainedChange::Set(message) => {
                debug!("Retained message stored on {}", message.topic);
                if let Some(persistence) = self.persistence.read().as_ref() {
                    persistence.save_retained(&message);
                }
            }
            RetainedChange::Cleared(topic) => {
                debug!("Retained message cleared on {}", topic);
                if let Some(persistence) = self.persistence.read().as_ref() {
                    persistence.delete_retained(&topic);
                }
            }
            RetainedChange::Unchanged => {}
        }
    }

    /// Retained messages matching a new subscription
    pub fn retained_for(&self, filter: &str) -> Vec<RetainedMessage> {
        self.retained.match_retained(filter)
    }
}
