//! QoS delivery state machines
//!
//! Tracks every QoS 1/2 handshake a session has outstanding, in both
//! directions, and decides what to retransmit when a step times out.
//!
//! Outbound (broker -> subscriber):
//! - QoS 1: `AwaitingPubAck` until PUBACK
//! - QoS 2: `AwaitingPubRec` until PUBREC, then `AwaitingPubComp` until PUBCOMP
//!
//! Inbound (publisher -> broker), QoS 2 only: `AwaitingPubRel` from receipt of
//! the PUBLISH until PUBREL. The message is routed on first receipt; a retried
//! PUBLISH with the same identifier is recognised as a duplicate.


use std::fmt;
use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::protocol::{Packet, PubRec, PubRel, Publish, QoS};

/// Stage of an outbound delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundStage {
    /// QoS 1 PUBLISH sent
    AwaitingPubAck,
    /// QoS 2 PUBLISH sent
    AwaitingPubRec,
    /// QoS 2 PUBREL sent
    AwaitingPubComp,
}

/// Outbound in-flight delivery to a subscriber
#[derive(Debug, Clone)]
pub struct OutboundDelivery {
    /// Publish as first sent, with its packet identifier
    pub publish: Publish,
    pub stage: OutboundStage,
    pub retry_count: u32,
    pub last_sent: Instant,
    /// Admission order, used to resend in original order
    seq: u64,
}

impl OutboundDelivery {
    pub fn packet_id(&self) -> u16 {
        self.publish.packet_id.unwrap_or_default()
    }

    /// Frame that repeats the last step sent
    fn retransmission(&self) -> Packet {
        match self.stage {
            OutboundStage::AwaitingPubAck | OutboundStage::AwaitingPubRec => {
                let mut publish = self.publish.clone();
                publish.dup = true;
                Packet::Publish(publish)
            }
            OutboundStage::AwaitingPubComp => Packet::PubRel(PubRel::new(self.packet_id())),
        }
    }
}

/// Inbound QoS 2 delivery waiting for PUBREL
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    pub packet_id: u16,
    pub retry_count: u32,
    pub last_sent: Instant,
    /// PUBREC retries are exhausted; the identifier is still held for dedup
    pub abandoned: bool,
}

/// Result of admitting an outbound message
#[derive(Debug)]
pub enum Admission {
    /// Recorded in flight, send this publish (packet id assigned)
    Sent(Publish),
    /// No room in the in-flight window, the publish is handed back
    Full(Publish),
}

/// Result of processing an acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Handshake finished, the record was removed
    Completed,
    /// PUBREC accepted, send this PUBREL
    Release(PubRel),
    /// Nothing outstanding matches this acknowledgement
    Unexpected,
}

/// Whether an inbound QoS 2 PUBLISH is new
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundStatus {
    /// First receipt, route downstream and answer PUBREC
    New,
    /// Retried PUBLISH for an identifier already awaiting PUBREL
    Duplicate,
}

/// Direction of a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Delivery given up after exceeding the retry limit
#[derive(Debug, Clone)]
pub struct FailedDelivery {
    pub packet_id: u16,
    pub direction: Direction,
    /// Topic of the abandoned publish (outbound only)
    pub publish: Option<Publish>,
}

/// Output of a retry scan
#[derive(Debug, Default)]
pub struct RetryScan {
    /// Frames to retransmit, in original send order
    pub resend: Vec<Packet>,
    pub failed: Vec<FailedDelivery>,
}

/// Internal invariant violations in delivery bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// An identifier was admitted while a delivery for it is still outstanding
    DuplicateIdentifier(u16),
    /// QoS 0 messages have no in-flight state
    NotTracked,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateIdentifier(id) => {
                write!(f, "duplicate in-flight packet identifier {}", id)
            }
            Self::NotTracked => write!(f, "QoS 0 publish cannot be tracked in flight"),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Per-session table of outstanding deliveries
#[derive(Debug)]
pub struct InflightTable {
    outbound: AHashMap<u16, OutboundDelivery>,
    inbound: AHashMap<u16, InboundDelivery>,
    next_packet_id: u16,
    next_seq: u64,
    /// Maximum outbound deliveries in flight (0 = only identifier space)
    max_inflight: usize,
}

impl InflightTable {
    pub fn new(max_inflight: usize) -> Self {
        Self {
            outbound: AHashMap::new(),
            inbound: AHashMap::new(),
            next_packet_id: 1,
            next_seq: 0,
            max_inflight,
        }
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    /// Whether another outbound delivery can be admitted
    pub fn has_capacity(&self) -> bool {
        let window = if self.max_inflight == 0 {
            usize::from(u16::MAX)
        } else {
            self.max_inflight.min(usize::from(u16::MAX))
        };
        self.outbound.len() + self.inbound.len() < usize::from(u16::MAX)
            && self.outbound.len() < window
    }

    /// Allocate an identifier not outstanding in either direction
    fn allocate_packet_id(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }

            if !self.outbound.contains_key(&id) && !self.inbound.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    /// Admit a QoS 1/2 publish for delivery to the subscriber
    pub fn begin_outbound(
        &mut self,
        mut publish: Publish,
        now: Instant,
    ) -> Result<Admission, DeliveryError> {
        let stage = match publish.qos {
            QoS::AtMostOnce => return Err(DeliveryError::NotTracked),
            QoS::AtLeastOnce => OutboundStage::AwaitingPubAck,
            QoS::ExactlyOnce => OutboundStage::AwaitingPubRec,
        };

        if !self.has_capacity() {
            return Ok(Admission::Full(publish));
        }
        let Some(packet_id) = self.allocate_packet_id() else {
            return Ok(Admission::Full(publish));
        };

        publish.packet_id = Some(packet_id);
        publish.dup = false;

        let seq = self.next_seq;
        self.next_seq += 1;

        let delivery = OutboundDelivery {
            publish: publish.clone(),
            stage,
            retry_count: 0,
            last_sent: now,
            seq,
        };
        if let Some(previous) = self.outbound.insert(packet_id, delivery) {
            self.outbound.insert(packet_id, previous);
            return Err(DeliveryError::DuplicateIdentifier(packet_id));
        }

        Ok(Admission::Sent(publish))
    }

    /// Re-insert a delivery restored from storage
    pub fn restore_outbound(
        &mut self,
        publish: Publish,
        stage: OutboundStage,
        retry_count: u32,
        now: Instant,
    ) -> Result<(), DeliveryError> {
        let packet_id = publish.packet_id.ok_or(DeliveryError::NotTracked)?;
        if self.outbound.contains_key(&packet_id) {
            return Err(DeliveryError::DuplicateIdentifier(packet_id));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.outbound.insert(
            packet_id,
            OutboundDelivery {
                publish,
                stage,
                retry_count,
                last_sent: now,
                seq,
            },
        );
        Ok(())
    }

    /// PUBACK from the subscriber
    pub fn on_puback(&mut self, packet_id: u16) -> AckOutcome {
        match self.outbound.get(&packet_id) {
            Some(d) if d.stage == OutboundStage::AwaitingPubAck => {
                self.outbound.remove(&packet_id);
                AckOutcome::Completed
            }
            _ => AckOutcome::Unexpected,
        }
    }

    /// PUBREC from the subscriber
    ///
    /// A repeated PUBREC while awaiting PUBCOMP answers PUBREL again.
    pub fn on_pubrec(&mut self, packet_id: u16, now: Instant) -> AckOutcome {
        match self.outbound.get_mut(&packet_id) {
            Some(d)
                if matches!(
                    d.stage,
                    OutboundStage::AwaitingPubRec | OutboundStage::AwaitingPubComp
                ) =>
            {
                d.stage = OutboundStage::AwaitingPubComp;
                d.retry_count = 0;
                d.last_sent = now;
                AckOutcome::Release(PubRel::new(packet_id))
            }
            _ => AckOutcome::Unexpected,
        }
    }

    /// PUBCOMP from the subscriber
    pub fn on_pubcomp(&mut self, packet_id: u16) -> AckOutcome {
        match self.outbound.get(&packet_id) {
            Some(d) if d.stage == OutboundStage::AwaitingPubComp => {
                self.outbound.remove(&packet_id);
                AckOutcome::Completed
            }
            _ => AckOutcome::Unexpected,
        }
    }

    /// Record receipt of an inbound QoS 2 PUBLISH
    pub fn begin_inbound(&mut self, packet_id: u16, now: Instant) -> InboundStatus {
        match self.inbound.get_mut(&packet_id) {
            Some(d) => {
                d.last_sent = now;
                InboundStatus::Duplicate
            }
            None => {
                self.inbound.insert(
                    packet_id,
                    InboundDelivery {
                        packet_id,
                        retry_count: 0,
                        last_sent: now,
                        abandoned: false,
                    },
                );
                InboundStatus::New
            }
        }
    }

    /// PUBREL from the publisher, returns whether the identifier was outstanding
    pub fn on_pubrel(&mut self, packet_id: u16) -> bool {
        self.inbound.remove(&packet_id).is_some()
    }

    /// Collect retransmissions for steps unacknowledged for `retry_interval`
    ///
    /// Outbound deliveries already retried `max_retries` times are removed
    /// and reported as failed instead. An exhausted inbound receipt is
    /// reported once and stops resending PUBREC, but its identifier stays
    /// recorded until PUBREL.
    pub fn due_for_retry(
        &mut self,
        now: Instant,
        retry_interval: Duration,
        max_retries: u32,
    ) -> RetryScan {
        let mut scan = RetryScan::default();

        let mut due: Vec<(u64, u16)> = self
            .outbound
            .values()
            .filter(|d| now.saturating_duration_since(d.last_sent) >= retry_interval)
            .map(|d| (d.seq, d.packet_id()))
            .collect();
        due.sort_unstable();

        for (_, packet_id) in due {
            let Some(delivery) = self.outbound.get_mut(&packet_id) else {
                continue;
            };
            if delivery.retry_count >= max_retries {
                if let Some(d) = self.outbound.remove(&packet_id) {
                    scan.failed.push(FailedDelivery {
                        packet_id,
                        direction: Direction::Outbound,
                        publish: Some(d.publish),
                    });
                }
                continue;
            }
            delivery.retry_count += 1;
            delivery.last_sent = now;
            scan.resend.push(delivery.retransmission());
        }

        let mut inbound_due: Vec<u16> = self
            .inbound
            .values()
            .filter(|d| !d.abandoned)
            .filter(|d| now.saturating_duration_since(d.last_sent) >= retry_interval)
            .map(|d| d.packet_id)
            .collect();
        inbound_due.sort_unstable();

        for packet_id in inbound_due {
            let Some(delivery) = self.inbound.get_mut(&packet_id) else {
                continue;
            };
            if delivery.retry_count >= max_retries {
                // Keep the identifier until PUBREL so a late retransmit is
                // still recognised as a duplicate
                delivery.abandoned = true;
                scan.failed.push(FailedDelivery {
                    packet_id,
                    direction: Direction::Inbound,
                    publish: None,
                });
                continue;
            }
            delivery.retry_count += 1;
            delivery.last_sent = now;
            scan.resend.push(Packet::PubRec(PubRec::new(packet_id)));
        }

        scan
    }

    /// Frames that resume every outbound delivery after a reconnect
    ///
    /// PUBLISH frames carry DUP=1, deliveries awaiting PUBCOMP resend PUBREL.
    pub fn resume_all(&mut self, now: Instant) -> Vec<Packet> {
        let mut deliveries: Vec<&mut OutboundDelivery> = self.outbound.values_mut().collect();
        deliveries.sort_unstable_by_key(|d| d.seq);

        deliveries
            .into_iter()
            .map(|d| {
                d.last_sent = now;
                d.retransmission()
            })
            .collect()
    }

    /// Outbound deliveries in admission order
    pub fn outbound(&self) -> Vec<&OutboundDelivery> {
        let mut deliveries: Vec<&OutboundDelivery> = self.outbound.values().collect();
        deliveries.sort_unstable_by_key(|d| d.seq);
        deliveries
    }

    /// Inbound QoS 2 identifiers still awaiting PUBREL
    pub fn inbound_ids(&self) -> Vec<u16> {
        self.inbound.keys().copied().collect()
    }

    /// Drop all state, used when a session is discarded
    pub fn clear(&mut self) {
        self.outbound.clear();
        self.inbound.clear();
    }
}
