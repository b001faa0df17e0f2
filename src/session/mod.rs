//! MQTT session management
//!
//! Per-client session state (subscriptions, offline queue, in-flight
//! deliveries, will) and the concurrent store that owns every session.
//! Subscriptions are indexed in a topic trie so `find_subscribers` does not
//! need to visit every session.

#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Notify};

use crate::delivery::{Admission, DeliveryError, InflightTable};
use crate::protocol::{Packet, Publish, QoS, Will};
use crate::topic::TopicTrie;

/// Session store errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No session for this client identifier
    NotFound(Arc<str>),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "no session for client {}", id),
        }
    }
}

impl std::error::Error for SessionError {}

/// Handle used to push frames to the connection currently driving a session
#[derive(Debug, Clone)]
pub struct Outlet {
    /// Identifier of the owning connection
    pub conn_id: u64,
    pub tx: mpsc::Sender<Packet>,
    /// Woken to make the connection close (session takeover)
    pub kick: Arc<Notify>,
}

/// What happened to a message handed to a session
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// Pushed to the live connection
    Sent,
    /// Appended to the session queue
    Queued,
    /// Queued after dropping the oldest queued message
    QueuedDroppedOldest(Publish),
    /// Session is offline and not durable, or the connection is saturated for QoS 0
    Dropped,
}

/// Session limits taken from broker configuration
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Maximum queued messages (0 = unbounded)
    pub max_queued_messages: usize,
    /// Maximum outbound QoS 1/2 deliveries in flight
    pub max_inflight: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_queued_messages: 1000,
            max_inflight: 32,
        }
    }
}

/// Client session
#[derive(Debug)]
pub struct Session {
    pub client_id: Arc<str>,
    pub clean_start: bool,
    /// Keep alive negotiated on the last CONNECT
    pub keep_alive: u16,
    pub last_activity: Instant,
    /// Topic filter -> granted QoS
    pub subscriptions: AHashMap<String, QoS>,
    pub inflight: InflightTable,
    pub will: Option<Will>,
    pub disconnected_at: Option<Instant>,
    pending: VecDeque<Publish>,
    max_queued_messages: usize,
    outlet: Option<Outlet>,
}

impl Session {
    pub fn new(client_id: Arc<str>, clean_start: bool, limits: SessionLimits) -> Self {
        Self {
            client_id,
            clean_start,
            keep_alive: 0,
            last_activity: Instant::now(),
            subscriptions: AHashMap::new(),
            inflight: InflightTable::new(limits.max_inflight),
            will: None,
            disconnected_at: None,
            pending: VecDeque::new(),
            max_queued_messages: limits.max_queued_messages,
            outlet: None,
        }
    }

    /// Update last activity timestamp
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_online(&self) -> bool {
        self.outlet.is_some()
    }

    pub fn outlet(&self) -> Option<&Outlet> {
        self.outlet.as_ref()
    }

    /// Attach a connection, returning the previous one
    pub fn attach(&mut self, outlet: Outlet) -> Option<Outlet> {
        self.disconnected_at = None;
        self.outlet.replace(outlet)
    }

    /// Detach the connection `conn_id` if it still owns this session
    pub fn detach(&mut self, conn_id: u64, now: Instant) -> bool {
        if self.outlet.as_ref().map(|o| o.conn_id) != Some(conn_id) {
            return false;
        }
        self.outlet = None;
        self.disconnected_at = Some(now);
        true
    }

    /// Owned by connection `conn_id`
    pub fn is_owned_by(&self, conn_id: u64) -> bool {
        self.outlet.as_ref().map(|o| o.conn_id) == Some(conn_id)
    }

    /// Append to the FIFO queue, dropping the oldest message when full
    pub fn enqueue(&mut self, publish: Publish) -> Option<Publish> {
        let dropped = if self.max_queued_messages > 0
            && self.pending.len() >= self.max_queued_messages
        {
            self.pending.pop_front()
        } else {
            None
        };
        self.pending.push_back(publish);
        dropped
    }

    /// Take every queued message, in publish order
    pub fn drain_queue(&mut self) -> Vec<Publish> {
        self.pending.drain(..).collect()
    }

    pub fn queued(&self) -> impl Iterator<Item = &Publish> {
        self.pending.iter()
    }

    pub fn queue_len(&self) -> usize {
        self.pending.len()
    }

    /// Hand a routed message to this session
    ///
    /// Online sessions get the message on their outlet unless earlier
    /// messages are still queued, so queue order is always preserved.
    pub fn deliver(
        &mut self,
        publish: Publish,
        now: Instant,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        if self.outlet.is_none() {
            if self.clean_start {
                return Ok(DeliveryOutcome::Dropped);
            }
            return Ok(self.queue_outcome(publish));
        }

        if !self.pending.is_empty() {
            return Ok(self.queue_outcome(publish));
        }

        match self.try_send(publish, now)? {
            None => Ok(DeliveryOutcome::Sent),
            // A full outlet sheds QoS 0, higher QoS waits for the window
            Some(publish) if publish.qos == QoS::AtMostOnce => Ok(DeliveryOutcome::Dropped),
            Some(publish) => Ok(self.queue_outcome(publish)),
        }
    }

    /// Move queued messages to the outlet while the connection and the
    /// in-flight window have room. Returns the number released.
    pub fn release_queued(&mut self, now: Instant) -> Result<usize, DeliveryError> {
        let mut released = 0;
        while let Some(publish) = self.pending.pop_front() {
            if let Some(publish) = self.try_send(publish, now)? {
                self.pending.push_front(publish);
                break;
            }
            released += 1;
        }
        Ok(released)
    }

    fn queue_outcome(&mut self, publish: Publish) -> DeliveryOutcome {
        match self.enqueue(publish) {
            Some(dropped) => DeliveryOutcome::QueuedDroppedOldest(dropped),
            None => DeliveryOutcome::Queued,
        }
    }

    /// Push one message to the outlet, handing it back if there is no room
    fn try_send(&mut self, publish: Publish, now: Instant) -> Result<Option<Publish>, DeliveryError> {
        let Some(outlet) = self.outlet.as_ref() else {
            return Ok(Some(publish));
        };

        if publish.qos != QoS::AtMostOnce && !self.inflight.has_capacity() {
            return Ok(Some(publish));
        }

        let Ok(permit) = outlet.tx.try_reserve() else {
            return Ok(Some(publish));
        };

        if publish.qos == QoS::AtMostOnce {
            permit.send(Packet::Publish(publish));
            return Ok(None);
        }

        match self.inflight.begin_outbound(publish, now)? {
            Admission::Sent(publish) => {
                permit.send(Packet::Publish(publish));
                Ok(None)
            }
            Admission::Full(publish) => Ok(Some(publish)),
        }
    }

    /// Whether an offline durable session has outlived `expiry`
    pub fn is_expired(&self, now: Instant, expiry: Duration) -> bool {
        match self.disconnected_at {
            Some(at) if self.outlet.is_none() => now.saturating_duration_since(at) >= expiry,
            _ => false,
        }
    }
}

type SubscriberIndex = TopicTrie<AHashMap<Arc<str>, QoS>>;

/// Thread-safe session store
///
/// Lock order: a session lock may be held while taking the index lock,
/// never the other way around.
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
    index: RwLock<SubscriberIndex>,
    limits: SessionLimits,
}

impl SessionStore {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            sessions: DashMap::new(),
            index: RwLock::new(TopicTrie::new()),
            limits,
        }
    }

    /// Create a session or resume the durable one stored for `client_id`
    ///
    /// Returns the session and whether prior state was resumed. A clean start
    /// discards everything stored for the identifier.
    pub fn create_or_resume_session(
        &self,
        client_id: &str,
        clean_start: bool,
    ) -> (Arc<RwLock<Session>>, bool) {
        let client_id: Arc<str> = client_id.into();

        if !clean_start {
            if let Some(existing) = self.get(&client_id) {
                let resumable = !existing.read().clean_start;
                if resumable {
                    return (existing, true);
                }
            }
        }

        let session = Arc::new(RwLock::new(Session::new(
            client_id.clone(),
            clean_start,
            self.limits,
        )));
        if let Some(previous) = self.sessions.insert(client_id.clone(), session.clone()) {
            self.unindex(&client_id, &previous.read());
        }
        (session, false)
    }

    /// Remove a session and all of its subscriptions
    pub fn destroy_session(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        let (key, session) = self.sessions.remove(client_id)?;
        self.unindex(&key, &session.read());
        Some(session)
    }

    /// Remove `session` only if it is still the one stored for its client
    pub fn destroy_if_current(&self, session: &Arc<RwLock<Session>>) -> bool {
        let client_id = session.read().client_id.clone();
        let removed = self
            .sessions
            .remove_if(&client_id, |_, current| Arc::ptr_eq(current, session));
        if let Some((key, s)) = removed {
            self.unindex(&key, &s.read());
            true
        } else {
            false
        }
    }

    fn unindex(&self, client_id: &Arc<str>, session: &Session) {
        let mut index = self.index.write();
        for filter in session.subscriptions.keys() {
            remove_from_index(&mut index, filter, client_id);
        }
    }

    /// Add or replace a subscription, returns true when it replaced one
    pub fn add_subscription(
        &self,
        client_id: &str,
        filter: &str,
        qos: QoS,
    ) -> Result<bool, SessionError> {
        let session = self
            .get(client_id)
            .ok_or_else(|| SessionError::NotFound(client_id.into()))?;
        let mut s = session.write();
        Ok(self.insert_subscription(&mut s, filter, qos))
    }

    /// Add a subscription on behalf of connection `conn_id`
    ///
    /// Returns `None` without touching the session once another connection
    /// has taken it over.
    pub fn add_owned_subscription(
        &self,
        session: &Arc<RwLock<Session>>,
        conn_id: u64,
        filter: &str,
        qos: QoS,
    ) -> Option<bool> {
        let mut s = session.write();
        if !s.is_owned_by(conn_id) {
            return None;
        }
        Some(self.insert_subscription(&mut s, filter, qos))
    }

    /// Remove a subscription, returns true when it existed
    pub fn remove_subscription(&self, client_id: &str, filter: &str) -> Result<bool, SessionError> {
        let session = self
            .get(client_id)
            .ok_or_else(|| SessionError::NotFound(client_id.into()))?;
        let mut s = session.write();
        Ok(self.take_subscription(&mut s, filter))
    }

    /// Remove a subscription on behalf of connection `conn_id`, `None` once
    /// it no longer owns the session
    pub fn remove_owned_subscription(
        &self,
        session: &Arc<RwLock<Session>>,
        conn_id: u64,
        filter: &str,
    ) -> Option<bool> {
        let mut s = session.write();
        if !s.is_owned_by(conn_id) {
            return None;
        }
        Some(self.take_subscription(&mut s, filter))
    }

    fn insert_subscription(&self, s: &mut Session, filter: &str, qos: QoS) -> bool {
        let replaced = s.subscriptions.insert(filter.to_string(), qos).is_some();
        self.index
            .write()
            .get_or_insert_with(filter, AHashMap::new)
            .insert(s.client_id.clone(), qos);
        replaced
    }

    fn take_subscription(&self, s: &mut Session, filter: &str) -> bool {
        if s.subscriptions.remove(filter).is_none() {
            return false;
        }
        remove_from_index(&mut self.index.write(), filter, &s.client_id);
        true
    }

    /// Every session with a subscription matching `topic`
    ///
    /// A client with several matching filters appears once, with the highest
    /// granted QoS among them.
    pub fn find_subscribers(&self, topic: &str) -> Vec<(Arc<str>, QoS)> {
        let mut found: AHashMap<Arc<str>, QoS> = AHashMap::new();
        self.index.read().matches(topic, |subscribers| {
            for (client_id, qos) in subscribers {
                found
                    .entry(client_id.clone())
                    .and_modify(|q| *q = (*q).max(*qos))
                    .or_insert(*qos);
            }
        });

        let mut subscribers: Vec<(Arc<str>, QoS)> = found.into_iter().collect();
        subscribers.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        subscribers
    }

    /// Queue a message for an offline durable session
    ///
    /// Returns the oldest message if it was dropped to make room.
    pub fn enqueue_for_offline(
        &self,
        client_id: &str,
        publish: Publish,
    ) -> Result<Option<Publish>, SessionError> {
        let session = self
            .get(client_id)
            .ok_or_else(|| SessionError::NotFound(client_id.into()))?;
        let dropped = session.write().enqueue(publish);
        Ok(dropped)
    }

    /// Take the queued messages of a session in publish order
    pub fn drain_queue(&self, client_id: &str) -> Result<Vec<Publish>, SessionError> {
        let session = self
            .get(client_id)
            .ok_or_else(|| SessionError::NotFound(client_id.into()))?;
        let drained = session.write().drain_queue();
        Ok(drained)
    }

    /// Get a session by client ID
    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|r| r.clone())
    }

    /// Insert a session restored from storage
    pub fn restore(&self, session: Session) {
        let client_id = session.client_id.clone();
        {
            let mut index = self.index.write();
            for (filter, qos) in &session.subscriptions {
                index
                    .get_or_insert_with(filter, AHashMap::new)
                    .insert(client_id.clone(), *qos);
            }
        }
        self.sessions.insert(client_id, Arc::new(RwLock::new(session)));
    }

    /// Destroy offline durable sessions disconnected for longer than `expiry`
    pub fn expire_sessions(&self, now: Instant, expiry: Duration) -> Vec<Arc<str>> {
        let expired: Vec<Arc<RwLock<Session>>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().read().is_expired(now, expiry))
            .map(|entry| entry.value().clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|session| {
                // Re-check under the removal so a reconnect in between wins
                let client_id = session.read().client_id.clone();
                let removed = self.sessions.remove_if(&client_id, |_, current| {
                    Arc::ptr_eq(current, &session) && current.read().is_expired(now, expiry)
                });
                removed.map(|(key, s)| {
                    self.unindex(&key, &s.read());
                    key
                })
            })
            .collect()
    }

    /// Snapshot of every stored session handle
    pub fn all(&self) -> Vec<Arc<RwLock<Session>>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    /// Get session count
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SessionLimits::default())
    }
}

fn remove_from_index(index: &mut SubscriberIndex, filter: &str, client_id: &Arc<str>) {
    let now_empty = match index.get_mut(filter) {
        Some(subscribers) => {
            subscribers.remove(client_id);
            subscribers.is_empty()
        }
        None => false,
    };
    if now_empty {
        index.remove(filter);
    }
}
