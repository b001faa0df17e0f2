//! Relay of device status documents into MQTT
//!
//! The host bus carries JSON status documents with one field per consumer.
//! A [`StatusRelay`] picks its field out of each document and turns it into a
//! payload for a fixed topic.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use crate::protocol::QoS;
use crate::topic::validate_topic_name;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusError {
    /// The document is not valid JSON
    InvalidJson(String),
    /// The document is not a JSON object
    NotAnObject,
    /// The relay topic is not a valid topic name
    InvalidTopic(&'static str),
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson(e) => write!(f, "invalid status document: {}", e),
            Self::NotAnObject => write!(f, "status document is not an object"),
            Self::InvalidTopic(e) => write!(f, "invalid relay topic: {}", e),
        }
    }
}

impl std::error::Error for StatusError {}

/// Extracts one field of a status document and republishes it
#[derive(Debug, Clone)]
pub struct StatusRelay {
    field: String,
    topic: Arc<str>,
    qos: QoS,
}

impl StatusRelay {
    pub fn new(field: impl Into<String>, topic: &str, qos: QoS) -> Result<Self, StatusError> {
        validate_topic_name(topic).map_err(StatusError::InvalidTopic)?;
        Ok(Self {
            field: field.into(),
            topic: Arc::from(topic),
            qos,
        })
    }

    pub fn topic(&self) -> &Arc<str> {
        &self.topic
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Payload for the relay field, `None` when the document lacks it
    ///
    /// String values are relayed as their raw text, anything else as JSON.
    pub fn extract(&self, document: &[u8]) -> Result<Option<Bytes>, StatusError> {
        let value: Value = serde_json::from_slice(document)
            .map_err(|e| StatusError::InvalidJson(e.to_string()))?;
        let Value::Object(mut fields) = value else {
            return Err(StatusError::NotAnObject);
        };

        Ok(fields.remove(&self.field).map(|v| match v {
            Value::String(s) => Bytes::from(s),
            other => Bytes::from(other.to_string()),
        }))
    }
}
