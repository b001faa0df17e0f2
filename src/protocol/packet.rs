//! MQTT packet definitions

use std::sync::Arc;

use bytes::Bytes;

use super::{ConnectReturnCode, ProtocolVersion, QoS};

/// MQTT control packet
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Get packet type as u8
    pub fn packet_type(&self) -> u8 {
        match self {
            Packet::Connect(_) => 1,
            Packet::ConnAck(_) => 2,
            Packet::Publish(_) => 3,
            Packet::PubAck(_) => 4,
            Packet::PubRec(_) => 5,
            Packet::PubRel(_) => 6,
            Packet::PubComp(_) => 7,
            Packet::Subscribe(_) => 8,
            Packet::SubAck(_) => 9,
            Packet::Unsubscribe(_) => 10,
            Packet::UnsubAck(_) => 11,
            Packet::PingReq => 12,
            Packet::PingResp => 13,
            Packet::Disconnect => 14,
        }
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::PubRec(_) => "PUBREC",
            Packet::PubRel(_) => "PUBREL",
            Packet::PubComp(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck(_) => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}

/// CONNECT packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Protocol level
    pub protocol_version: ProtocolVersion,
    /// Client identifier, may be empty
    pub client_id: String,
    /// Clean session flag
    pub clean_start: bool,
    /// Keep alive interval in seconds
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<Will>,
}

impl Default for Connect {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::V311,
            client_id: String::new(),
            clean_start: true,
            keep_alive: 60,
            username: None,
            password: None,
            will: None,
        }
    }
}

/// Will message registered at CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAck {
    /// Session present flag
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

impl ConnAck {
    pub fn accepted(session_present: bool) -> Self {
        Self {
            session_present,
            return_code: ConnectReturnCode::Accepted,
        }
    }

    pub fn refused(return_code: ConnectReturnCode) -> Self {
        Self {
            session_present: false,
            return_code,
        }
    }
}

/// PUBLISH packet (bidirectional)
///
/// The topic is an `Arc<str>` so fan-out to many subscribers clones a pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Duplicate delivery flag
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: Arc<str>,
    /// Packet identifier (present only for QoS > 0)
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl Default for Publish {
    fn default() -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Arc::from(""),
            packet_id: None,
            payload: Bytes::new(),
        }
    }
}

macro_rules! ack_packet {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            pub packet_id: u16,
        }

        impl $name {
            pub fn new(packet_id: u16) -> Self {
                Self { packet_id }
            }
        }
    };
}

ack_packet!(
    /// PUBACK packet (QoS 1 acknowledgement)
    PubAck
);
ack_packet!(
    /// PUBREC packet (QoS 2 step 1)
    PubRec
);
ack_packet!(
    /// PUBREL packet (QoS 2 step 2)
    PubRel
);
ack_packet!(
    /// PUBCOMP packet (QoS 2 step 3)
    PubComp
);
ack_packet!(
    /// UNSUBACK packet (server -> client)
    UnsubAck
);

/// Single topic filter request inside SUBSCRIBE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    /// Requested maximum QoS
    pub qos: QoS,
}

/// SUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub subscriptions: Vec<Subscription>,
}

/// SUBACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    /// Granted QoS (0-2) or 0x80 per requested filter
    pub return_codes: Vec<u8>,
}

/// UNSUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}
