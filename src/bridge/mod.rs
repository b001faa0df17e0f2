//! External bus bridge
//!
//! The host relays messages between MQTT and its own message bus through two
//! narrow interfaces:
//!
//! - outbound: [`BridgeRegistry::register_outbound`] installs a callback run
//!   for every routed PUBLISH whose topic matches a filter
//! - inbound: [`crate::Broker::inject`] publishes into the router as if a
//!   client had sent the PUBLISH
//!
//! Callbacks run on the routing path and must not block.

mod status;
mod toggle;


use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;

use crate::broker::Origin;
use crate::protocol::QoS;
use crate::topic::{topic_matches_filter, validate_topic_filter};

pub use status::{StatusError, StatusRelay};
pub use toggle::CommandToggle;

/// Message handed to outbound bridge callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub origin: Origin,
}

/// Handle returned by [`BridgeRegistry::register_outbound`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BridgeId(u64);

impl fmt::Display for BridgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bridge-{}", self.0)
    }
}

pub type OutboundCallback = Arc<dyn Fn(&BridgeMessage) + Send + Sync>;

struct Outbound {
    id: BridgeId,
    filter: String,
    callback: OutboundCallback,
}

/// Outbound bridge callbacks keyed by topic filter
#[derive(Default)]
pub struct BridgeRegistry {
    outbound: RwLock<Vec<Outbound>>,
    next_id: AtomicU64,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `callback` for every routed message whose topic matches `filter`
    pub fn register_outbound<F>(&self, filter: &str, callback: F) -> Result<BridgeId, &'static str>
    where
        F: Fn(&BridgeMessage) + Send + Sync + 'static,
    {
        validate_topic_filter(filter)?;
        let id = BridgeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.outbound.write().push(Outbound {
            id,
            filter: filter.to_string(),
            callback: Arc::new(callback),
        });
        debug!("Registered outbound {} for '{}'", id, filter);
        Ok(id)
    }

    /// Remove a callback, returns whether it was registered
    pub fn unregister(&self, id: BridgeId) -> bool {
        let mut outbound = self.outbound.write();
        let before = outbound.len();
        outbound.retain(|o| o.id != id);
        outbound.len() != before
    }

    /// Invoke every callback whose filter matches the message topic
    ///
    /// Returns the number of callbacks run.
    pub fn dispatch(&self, message: &BridgeMessage) -> usize {
        // Callbacks run outside the lock so they may register or unregister
        let matched: Vec<OutboundCallback> = self
            .outbound
            .read()
            .iter()
            .filter(|o| topic_matches_filter(&message.topic, &o.filter))
            .map(|o| o.callback.clone())
            .collect();

        for callback in &matched {
            callback(message);
        }
        matched.len()
    }

    pub fn len(&self) -> usize {
        self.outbound.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.read().is_empty()
    }
}

impl fmt::Debug for BridgeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeRegistry")
            .field("outbound", &self.len())
            .finish()
    }
}
