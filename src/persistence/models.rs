//! Storage models
//!
//! bincode-encoded mirrors of the runtime types. Wall-clock seconds replace
//! `Instant`, which has no meaning across restarts.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use bytes::Bytes;

use crate::delivery::{DeliveryError, OutboundStage};
use crate::protocol::{Publish, QoS, Will};
use crate::retained::RetainedMessage;
use crate::session::{Session, SessionLimits};

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub packet_id: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredRetained {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub stored_at_secs: u64,
}

/// Outbound QoS 1/2 delivery still waiting for its acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredInflight {
    pub publish: StoredPublish,
    /// 0 = awaiting PUBACK, 1 = awaiting PUBREC, 2 = awaiting PUBCOMP
    pub stage: u8,
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredSession {
    pub client_id: String,
    pub keep_alive: u16,
    pub subscriptions: Vec<(String, QoS)>,
    pub queued: Vec<StoredPublish>,
    pub inflight: Vec<StoredInflight>,
    /// Inbound QoS 2 identifiers waiting for PUBREL
    pub inbound: Vec<u16>,
    pub disconnected_at_secs: Option<u64>,
}

/// Everything read back at startup
#[derive(Debug, Default)]
pub struct LoadedData {
    pub retained: Vec<StoredRetained>,
    pub sessions: Vec<StoredSession>,
}

pub(crate) fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn instant_to_unix_secs(instant: Instant) -> u64 {
    let elapsed = Instant::now().saturating_duration_since(instant);
    unix_secs(SystemTime::now().checked_sub(elapsed).unwrap_or(UNIX_EPOCH))
}

fn unix_secs_to_instant(secs: u64) -> Instant {
    let now = Instant::now();
    let ago = unix_secs(SystemTime::now()).saturating_sub(secs);
    now.checked_sub(Duration::from_secs(ago)).unwrap_or(now)
}

impl From<&Publish> for StoredPublish {
    fn from(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.to_string(),
            payload: publish.payload.to_vec(),
            qos: publish.qos,
            retain: publish.retain,
            packet_id: publish.packet_id,
        }
    }
}

impl From<StoredPublish> for Publish {
    fn from(stored: StoredPublish) -> Self {
        Self {
            dup: false,
            qos: stored.qos,
            retain: stored.retain,
            topic: Arc::from(stored.topic),
            packet_id: stored.packet_id,
            payload: Bytes::from(stored.payload),
        }
    }
}

impl From<&RetainedMessage> for StoredRetained {
    fn from(message: &RetainedMessage) -> Self {
        Self {
            topic: message.topic.to_string(),
            payload: message.payload.to_vec(),
            qos: message.qos,
            stored_at_secs: unix_secs(message.stored_at),
        }
    }
}

impl From<StoredRetained> for RetainedMessage {
    fn from(stored: StoredRetained) -> Self {
        Self {
            topic: Arc::from(stored.topic),
            payload: Bytes::from(stored.payload),
            qos: stored.qos,
            stored_at: UNIX_EPOCH + Duration::from_secs(stored.stored_at_secs),
        }
    }
}

impl From<&Will> for StoredWill {
    fn from(will: &Will) -> Self {
        Self {
            topic: will.topic.clone(),
            payload: will.payload.to_vec(),
            qos: will.qos,
            retain: will.retain,
        }
    }
}

impl From<StoredWill> for Will {
    fn from(stored: StoredWill) -> Self {
        Self {
            topic: stored.topic,
            payload: Bytes::from(stored.payload),
            qos: stored.qos,
            retain: stored.retain,
        }
    }
}

fn stage_code(stage: OutboundStage) -> u8 {
    match stage {
        OutboundStage::AwaitingPubAck => 0,
        OutboundStage::AwaitingPubRec => 1,
        OutboundStage::AwaitingPubComp => 2,
    }
}

fn stage_from_code(code: u8, qos: QoS) -> OutboundStage {
    match (code, qos) {
        (2, _) => OutboundStage::AwaitingPubComp,
        (_, QoS::ExactlyOnce) => OutboundStage::AwaitingPubRec,
        _ => OutboundStage::AwaitingPubAck,
    }
}

impl StoredSession {
    /// Snapshot of a durable session
    ///
    /// The will is not stored: a restored session is offline and its last
    /// connection is already gone.
    pub fn from_session(session: &Session) -> Self {
        let mut subscriptions: Vec<(String, QoS)> = session
            .subscriptions
            .iter()
            .map(|(filter, qos)| (filter.clone(), *qos))
            .collect();
        subscriptions.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let mut inbound = session.inflight.inbound_ids();
        inbound.sort_unstable();

        Self {
            client_id: session.client_id.to_string(),
            keep_alive: session.keep_alive,
            subscriptions,
            queued: session.queued().map(StoredPublish::from).collect(),
            inflight: session
                .inflight
                .outbound()
                .into_iter()
                .map(|d| StoredInflight {
                    publish: StoredPublish::from(&d.publish),
                    stage: stage_code(d.stage),
                    retry_count: d.retry_count,
                })
                .collect(),
            inbound,
            disconnected_at_secs: Some(
                session
                    .disconnected_at
                    .map(instant_to_unix_secs)
                    .unwrap_or_else(|| unix_secs(SystemTime::now())),
            ),
        }
    }

    /// Rebuild an offline durable session
    pub fn into_session(self, limits: SessionLimits) -> Result<Session, DeliveryError> {
        let now = Instant::now();
        let mut session = Session::new(Arc::from(self.client_id), false, limits);
        session.keep_alive = self.keep_alive;
        session.subscriptions = self.subscriptions.into_iter().collect();

        for record in self.inflight {
            let stage = stage_from_code(record.stage, record.publish.qos);
            session
                .inflight
                .restore_outbound(Publish::from(record.publish), stage, record.retry_count, now)?;
        }
        for packet_id in self.inbound {
            session.inflight.begin_inbound(packet_id, now);
        }
        for publish in self.queued {
            session.enqueue(Publish::from(publish));
        }

        session.disconnected_at = Some(
            self.disconnected_at_secs
                .map(unix_secs_to_instant)
                .unwrap_or(now),
        );
        Ok(session)
    }
}
