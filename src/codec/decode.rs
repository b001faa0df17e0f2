//! MQTT packet decoder

use std::sync::Arc;

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolVersion, PubAck, PubComp,
    PubRec, PubRel, Publish, QoS, SubAck, Subscribe, Subscription, UnsubAck, Unsubscribe, Will,
};

/// Streaming MQTT packet decoder
///
/// Each connection owns one decoder; it holds no buffered bytes itself, the
/// caller keeps the read buffer and advances it by the consumed length.
#[derive(Debug)]
pub struct Decoder {
    /// Maximum accepted remaining length
    max_packet_size: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Decode one packet from the front of `buf`
    ///
    /// Returns `Ok(None)` until the complete frame is available.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        // Reject oversized frames before buffering their body
        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total_len];

        let packet = decode_body(packet_type, flags, body).map_err(|e| match e {
            // The frame is complete, so running out of bytes means a field
            // length lied about its size
            DecodeError::InsufficientData => DecodeError::MalformedPacket("truncated packet"),
            other => other,
        })?;

        Ok(Some((packet, total_len)))
    }
}

fn decode_body(packet_type: u8, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    match packet_type {
        1 => {
            expect_flags(flags, 0)?;
            decode_connect(body)
        }
        2 => {
            expect_flags(flags, 0)?;
            decode_connack(body)
        }
        3 => decode_publish(flags, body),
        4 => {
            expect_flags(flags, 0)?;
            Ok(Packet::PubAck(PubAck::new(decode_packet_id(body)?)))
        }
        5 => {
            expect_flags(flags, 0)?;
            Ok(Packet::PubRec(PubRec::new(decode_packet_id(body)?)))
        }
        6 => {
            // [MQTT-3.6.1-1]
            expect_flags(flags, 0x02)?;
            Ok(Packet::PubRel(PubRel::new(decode_packet_id(body)?)))
        }
        7 => {
            expect_flags(flags, 0)?;
            Ok(Packet::PubComp(PubComp::new(decode_packet_id(body)?)))
        }
        8 => {
            // [MQTT-3.8.1-1]
            expect_flags(flags, 0x02)?;
            decode_subscribe(body)
        }
        9 => {
            expect_flags(flags, 0)?;
            decode_suback(body)
        }
        10 => {
            // [MQTT-3.10.1-1]
            expect_flags(flags, 0x02)?;
            decode_unsubscribe(body)
        }
        11 => {
            expect_flags(flags, 0)?;
            Ok(Packet::UnsubAck(UnsubAck::new(decode_packet_id(body)?)))
        }
        12 => {
            expect_flags(flags, 0)?;
            expect_empty(body)?;
            Ok(Packet::PingReq)
        }
        13 => {
            expect_flags(flags, 0)?;
            expect_empty(body)?;
            Ok(Packet::PingResp)
        }
        14 => {
            expect_flags(flags, 0)?;
            expect_empty(body)?;
            Ok(Packet::Disconnect)
        }
        _ => Err(DecodeError::InvalidPacketType(packet_type)),
    }
}

#[inline]
fn expect_flags(flags: u8, expected: u8) -> Result<(), DecodeError> {
    if flags != expected {
        return Err(DecodeError::InvalidFlags);
    }
    Ok(())
}

#[inline]
fn expect_empty(body: &[u8]) -> Result<(), DecodeError> {
    if !body.is_empty() {
        return Err(DecodeError::MalformedPacket("unexpected payload"));
    }
    Ok(())
}

fn decode_packet_id(body: &[u8]) -> Result<u16, DecodeError> {
    if body.len() != 2 {
        return Err(DecodeError::MalformedPacket("invalid remaining length"));
    }
    non_zero_packet_id(read_u16(body)?)
}

#[inline]
fn non_zero_packet_id(id: u16) -> Result<u16, DecodeError> {
    if id == 0 {
        return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
    }
    Ok(id)
}

fn decode_connect(payload: &[u8]) -> Result<Packet, DecodeError> {
    let mut pos = 0;

    let (protocol_name, len) = read_string(payload)?;
    pos += len;

    if protocol_name != "MQTT" && protocol_name != "MQIsdp" {
        return Err(DecodeError::InvalidProtocolName);
    }

    let level = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
    pos += 1;

    let protocol_version = match ProtocolVersion::from_u8(level) {
        Some(v) if v.protocol_name() == protocol_name => v,
        _ => return Err(DecodeError::InvalidProtocolVersion(level)),
    };

    let connect_flags = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
    pos += 1;

    // [MQTT-3.1.2-3] Reserved bit must be 0
    if (connect_flags & 0x01) != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let clean_start = (connect_flags & 0x02) != 0;
    let will_flag = (connect_flags & 0x04) != 0;
    let will_qos_bits = (connect_flags >> 3) & 0x03;
    let will_retain = (connect_flags & 0x20) != 0;
    let password_flag = (connect_flags & 0x40) != 0;
    let username_flag = (connect_flags & 0x80) != 0;

    // [MQTT-3.1.2-22]
    if !username_flag && password_flag {
        return Err(DecodeError::InvalidFlags);
    }

    let will_qos = QoS::from_u8(will_qos_bits).ok_or(DecodeError::InvalidQoS(will_qos_bits))?;

    // [MQTT-3.1.2-13] [MQTT-3.1.2-15]
    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(DecodeError::InvalidFlags);
    }

    let keep_alive = read_u16(&payload[pos..])?;
    pos += 2;

    let (client_id, len) = read_string(&payload[pos..])?;
    pos += len;

    let will = if will_flag {
        let (topic, len) = read_string(&payload[pos..])?;
        pos += len;
        if topic.is_empty() || topic.contains(['+', '#']) {
            return Err(DecodeError::MalformedPacket("invalid will topic"));
        }

        let (will_payload, len) = read_binary(&payload[pos..])?;
        pos += len;

        Some(Will {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(will_payload),
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        let (s, len) = read_string(&payload[pos..])?;
        pos += len;
        Some(s.to_string())
    } else {
        None
    };

    let password = if password_flag {
        let (data, len) = read_binary(&payload[pos..])?;
        pos += len;
        Some(Bytes::copy_from_slice(data))
    } else {
        None
    };

    if pos != payload.len() {
        return Err(DecodeError::MalformedPacket("trailing bytes in CONNECT"));
    }

    Ok(Packet::Connect(Box::new(Connect {
        protocol_version,
        client_id: client_id.to_string(),
        clean_start,
        keep_alive,
        username,
        password,
        will,
    })))
}

fn decode_connack(payload: &[u8]) -> Result<Packet, DecodeError> {
    if payload.len() != 2 {
        return Err(DecodeError::MalformedPacket("invalid remaining length"));
    }

    // Only bit 0 (session present) may be set
    if (payload[0] & 0xFE) != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let return_code = ConnectReturnCode::from_u8(payload[1])
        .ok_or(DecodeError::MalformedPacket("unknown return code"))?;

    Ok(Packet::ConnAck(ConnAck {
        session_present: (payload[0] & 0x01) != 0,
        return_code,
    }))
}

fn decode_publish(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    let dup = (flags & 0x08) != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let retain = (flags & 0x01) != 0;

    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

    // [MQTT-3.3.1-2]
    if qos == QoS::AtMostOnce && dup {
        return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
    }

    let mut pos = 0;

    let (topic, len) = read_string(payload)?;
    pos += len;

    // [MQTT-3.3.2-2]
    if topic.contains(['+', '#']) {
        return Err(DecodeError::MalformedPacket("topic contains wildcard"));
    }

    let packet_id = if qos != QoS::AtMostOnce {
        let id = non_zero_packet_id(read_u16(&payload[pos..])?)?;
        pos += 2;
        Some(id)
    } else {
        None
    };

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic: Arc::from(topic),
        packet_id,
        payload: Bytes::copy_from_slice(&payload[pos..]),
    }))
}

fn decode_subscribe(payload: &[u8]) -> Result<Packet, DecodeError> {
    let packet_id = non_zero_packet_id(read_u16(payload)?)?;
    let mut pos = 2;
    let mut subscriptions = Vec::new();

    while pos < payload.len() {
        let (filter, len) = read_string(&payload[pos..])?;
        pos += len;

        let options = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;

        // [MQTT-3.8.3-4] Upper six bits are reserved
        if (options & 0xFC) != 0 {
            return Err(DecodeError::MalformedPacket("reserved subscription bits set"));
        }
        let qos = QoS::from_u8(options).ok_or(DecodeError::InvalidQoS(options))?;

        subscriptions.push(Subscription {
            filter: filter.to_string(),
            qos,
        });
    }

    // [MQTT-3.8.3-3]
    if subscriptions.is_empty() {
        return Err(DecodeError::MalformedPacket("SUBSCRIBE with no filters"));
    }

    Ok(Packet::Subscribe(Subscribe {
        packet_id,
        subscriptions,
    }))
}

fn decode_suback(payload: &[u8]) -> Result<Packet, DecodeError> {
    let packet_id = non_zero_packet_id(read_u16(payload)?)?;
    let return_codes = payload[2..].to_vec();

    if return_codes.is_empty() {
        return Err(DecodeError::MalformedPacket("SUBACK with no return codes"));
    }
    if let Some(bad) = return_codes.iter().find(|&&c| c > 2 && c != 0x80) {
        return Err(DecodeError::InvalidQoS(*bad));
    }

    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(payload: &[u8]) -> Result<Packet, DecodeError> {
    let packet_id = non_zero_packet_id(read_u16(payload)?)?;
    let mut pos = 2;
    let mut filters = Vec::new();

    while pos < payload.len() {
        let (filter, len) = read_string(&payload[pos..])?;
        pos += len;
        filters.push(filter.to_string());
    }

    // [MQTT-3.10.3-2]
    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket("UNSUBSCRIBE with no filters"));
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}
