//! Retained message store
//!
//! At most one retained message per exact topic. Publishing an empty payload
//! with the retain flag clears the entry.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use dashmap::DashMap;

use crate::protocol::{Publish, QoS};
use crate::topic::topic_matches_filter;

/// Retained message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub stored_at: SystemTime,
}

impl RetainedMessage {
    /// Publish frame for delivery to a new subscriber at `qos`
    pub fn to_publish(&self, qos: QoS) -> Publish {
        Publish {
            dup: false,
            qos,
            retain: true,
            topic: self.topic.clone(),
            packet_id: None,
            payload: self.payload.clone(),
        }
    }
}

/// Change applied by [`RetainedStore::apply`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetainedChange {
    Set(RetainedMessage),
    Cleared(Arc<str>),
    /// Nothing was stored for the topic
    Unchanged,
}

/// Concurrent retained message store
#[derive(Debug, Default)]
pub struct RetainedStore {
    messages: DashMap<Arc<str>, RetainedMessage>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `payload` as the retained message for `topic`
    pub fn set_retained(&self, topic: Arc<str>, payload: Bytes, qos: QoS) -> RetainedMessage {
        let message = RetainedMessage {
            topic: topic.clone(),
            payload,
            qos,
            stored_at: SystemTime::now(),
        };
        self.messages.insert(topic, message.clone());
        message
    }

    /// Remove the retained message for `topic`, returns whether one existed
    pub fn clear_retained(&self, topic: &str) -> bool {
        self.messages.remove(topic).is_some()
    }

    /// Update the store from a PUBLISH with the retain flag set
    pub fn apply(&self, publish: &Publish) -> RetainedChange {
        if publish.payload.is_empty() {
            if self.clear_retained(&publish.topic) {
                RetainedChange::Cleared(publish.topic.clone())
            } else {
                RetainedChange::Unchanged
            }
        } else {
            RetainedChange::Set(self.set_retained(
                publish.topic.clone(),
                publish.payload.clone(),
                publish.qos,
            ))
        }
    }

    /// Every retained message whose topic matches `filter`, ordered by topic
    pub fn match_retained(&self, filter: &str) -> Vec<RetainedMessage> {
        if !filter.contains(['+', '#']) {
            return self
                .messages
                .get(filter)
                .map(|m| vec![m.clone()])
                .unwrap_or_default();
        }

        let mut matched: Vec<RetainedMessage> = self
            .messages
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.value().clone())
            .collect();
        matched.sort_unstable_by(|a, b| a.topic.cmp(&b.topic));
        matched
    }

    /// Insert a message restored from storage
    pub fn restore(&self, message: RetainedMessage) {
        self.messages.insert(message.topic.clone(), message);
    }

    /// Copy of every retained message
    pub fn snapshot(&self) -> Vec<RetainedMessage> {
        self.messages.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn retain_publish(topic: &str, payload: &'static str) -> Publish {
        Publish {
            retain: true,
            qos: QoS::AtLeastOnce,
            topic: Arc::from(topic),
            payload: Bytes::from_static(payload.as_bytes()),
            ..Default::default()
        }
    }

    #[test]
    fn test_set_then_match() {
        let store = RetainedStore::new();
        store.apply(&retain_publish("sensor/temp", "temp=20"));
        store.apply(&retain_publish("sensor/humidity", "50"));
        store.apply(&retain_publish("other/temp", "1"));

        let matched = store.match_retained("sensor/+");
        let topics: Vec<&str> = matched.iter().map(|m| m.topic.as_ref()).collect();
        assert_eq!(topics, vec!["sensor/humidity", "sensor/temp"]);

        let exact = store.match_retained("sensor/temp");
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].payload, Bytes::from_static(b"temp=20"));
    }

    #[test]
    fn test_one_entry_per_topic() {
        let store = RetainedStore::new();
        store.apply(&retain_publish("a", "1"));
        store.apply(&retain_publish("a", "2"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.match_retained("a")[0].payload, Bytes::from_static(b"2"));
    }

    #[test]
    fn test_empty_payload_clears() {
        let store = RetainedStore::new();
        store.apply(&retain_publish("sensor/temp", "temp=20"));

        assert_eq!(
            store.apply(&retain_publish("sensor/temp", "")),
            RetainedChange::Cleared(Arc::from("sensor/temp"))
        );
        assert!(store.match_retained("sensor/+").is_empty());
        assert_eq!(
            store.apply(&retain_publish("sensor/temp", "")),
            RetainedChange::Unchanged
        );
    }

    #[test]
    fn test_system_topics_not_matched_by_wildcard() {
        let store = RetainedStore::new();
        store.set_retained(Arc::from("$SYS/uptime"), Bytes::from_static(b"1"), QoS::AtMostOnce);
        assert!(store.match_retained("#").is_empty());
        assert_eq!(store.match_retained("$SYS/#").len(), 1);
    }

    #[test]
    fn test_to_publish_sets_retain() {
        let store = RetainedStore::new();
        let message = store.set_retained(Arc::from("a"), Bytes::from_static(b"x"), QoS::ExactlyOnce);
        let publish = message.to_publish(QoS::AtMostOnce);
        assert!(publish.retain);
        assert_eq!(publish.qos, QoS::AtMostOnce);
    }
}
