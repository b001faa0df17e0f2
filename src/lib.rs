//! HarborMQ - embeddable MQTT v3.1/v3.1.1 broker core
//!
//! Connection and session lifecycle, topic routing with QoS 0/1/2 delivery
//! state machines, retained messages, wills and keep-alive enforcement,
//! plus a narrow bridge for hosts that relay messages in and out.

pub mod bridge;
pub mod broker;
pub mod codec;
pub mod config;
pub mod delivery;
pub mod hooks;
pub mod persistence;
pub mod protocol;
pub mod retained;
pub mod session;
pub mod topic;

pub use bridge::{BridgeId, BridgeMessage, BridgeRegistry, CommandToggle, StatusRelay};
pub use broker::{Broker, BrokerConfig, BrokerError, BrokerEvent, CloseReason, Origin};
pub use config::Config;
pub use hooks::{ClientInfo, CompositeHooks, DefaultHooks, HookError, Hooks};
pub use persistence::{FjallBackend, PersistenceManager, StorageBackend};
pub use protocol::{ProtocolVersion, QoS};
