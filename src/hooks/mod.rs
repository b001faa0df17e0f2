//! Verification hooks
//!
//! The broker asks a [`Hooks`] implementation whether a client may connect,
//! publish and subscribe. Everything is allowed by default.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::QoS;


/// Hook error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    /// The hook itself failed (backend unreachable, bad data)
    Internal(String),
    /// Credentials were checked and rejected
    AuthenticationFailed,
    /// The client is known but the action is not permitted
    AuthorizationDenied,
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "hook error: {}", msg),
            HookError::AuthenticationFailed => write!(f, "authentication failed"),
            HookError::AuthorizationDenied => write!(f, "authorization denied"),
        }
    }
}

impl std::error::Error for HookError {}

/// Hook result type
pub type HookResult<T> = Result<T, HookError>;

/// Identity of the client a hook is consulted about
#[derive(Debug, Clone, Copy)]
pub struct ClientInfo<'a> {
    pub client_id: &'a str,
    pub username: Option<&'a str>,
    pub addr: SocketAddr,
}

/// Broker verification hooks
///
/// `Ok(false)` denies the request. `Err(_)` is reported to the client as a
/// server-side failure where the protocol allows it (CONNACK code 5 for
/// authentication) and as a denial otherwise.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// CONNECT credentials check
    async fn authenticate(
        &self,
        _client: ClientInfo<'_>,
        _password: Option<&[u8]>,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// Called for every PUBLISH received from a client
    async fn authorize_publish(
        &self,
        _client: ClientInfo<'_>,
        _topic: &str,
        _qos: QoS,
        _retain: bool,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// Called for every filter of a SUBSCRIBE, denial yields SUBACK 0x80
    async fn authorize_subscribe(
        &self,
        _client: ClientInfo<'_>,
        _filter: &str,
        _qos: QoS,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// The client was accepted and CONNACK was sent
    async fn on_connected(&self, _client: ClientInfo<'_>, _session_present: bool) {}

    /// The connection is gone, `graceful` when it ended with DISCONNECT
    async fn on_disconnected(&self, _client_id: &str, _graceful: bool) {}
}

/// Allows everything
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

#[async_trait]
impl Hooks for DefaultHooks {}

#[async_trait]
impl<T: Hooks + ?Sized> Hooks for Arc<T> {
    async fn authenticate(
        &self,
        client: ClientInfo<'_>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        (**self).authenticate(client, password).await
    }

    async fn authorize_publish(
        &self,
        client: ClientInfo<'_>,
        topic: &str,
        qos: QoS,
        retain: bool,
    ) -> HookResult<bool> {
        (**self).authorize_publish(client, topic, qos, retain).await
    }

    async fn authorize_subscribe(
        &self,
        client: ClientInfo<'_>,
        filter: &str,
        qos: QoS,
    ) -> HookResult<bool> {
        (**self).authorize_subscribe(client, filter, qos).await
    }

    async fn on_connected(&self, client: ClientInfo<'_>, session_present: bool) {
        (**self).on_connected(client, session_present).await;
    }

    async fn on_disconnected(&self, client_id: &str, graceful: bool) {
        (**self).on_disconnected(client_id, graceful).await;
    }
}

/// Runs several hooks in order
///
/// Checks pass only if every hook allows, stopping at the first denial or
/// error. Notifications reach every hook.
#[derive(Default)]
pub struct CompositeHooks {
    hooks: Vec<Box<dyn Hooks>>,
}

impl CompositeHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<H: Hooks + 'static>(&mut self, hooks: H) {
        self.hooks.push(Box::new(hooks));
    }

    pub fn with<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.add(hooks);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

#[async_trait]
impl Hooks for CompositeHooks {
    async fn authenticate(
        &self,
        client: ClientInfo<'_>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks.authenticate(client, password).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn authorize_publish(
        &self,
        client: ClientInfo<'_>,
        topic: &str,
        qos: QoS,
        retain: bool,
    ) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks.authorize_publish(client, topic, qos, retain).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn authorize_subscribe(
        &self,
        client: ClientInfo<'_>,
        filter: &str,
        qos: QoS,
    ) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks.authorize_subscribe(client, filter, qos).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_connected(&self, client: ClientInfo<'_>, session_present: bool) {
        for hooks in &self.hooks {
            hooks.on_connected(client, session_present).await;
        }
    }

    async fn on_disconnected(&self, client_id: &str, graceful: bool) {
        for hooks in &self.hooks {
            hooks.on_disconnected(client_id, graceful).await;
        }
    }
}
