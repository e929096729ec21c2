//! Signaling and discovery
//!
//! The signaling service assigns each participant an identifier, relays call
//! offers between participants and hands back a [`PeerTransport`] once a call
//! is set up. Implement [`SignalingService`] for your broker; the loopback
//! module ships an in-process one.

use crate::events::{SessionEvent, SessionEvents};
use crate::identity::PeerId;
use crate::media::LocalStream;
use crate::transport::{ConnectionEvents, PeerTransport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// No identifier has been assigned yet, or the link was torn down
    #[error("Signaling link not ready")]
    NotReady,

    /// The remote peer is not reachable through the broker
    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    /// The call was closed before it could be answered
    #[error("Call closed before it was answered")]
    CallClosed,

    /// Broker or network failure
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Invalid signaling configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Where to reach the signaling broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Broker host name
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Path of the broker endpoint
    pub path: String,
    /// Use TLS
    pub secure: bool,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9000,
            path: "/peerjs".to_string(),
            secure: false,
        }
    }
}

impl SignalingConfig {
    /// Websocket URL of the broker
    #[must_use]
    pub fn endpoint(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, self.path)
    }

    /// Check the configuration
    ///
    /// # Errors
    ///
    /// Returns error if the host is blank, the port is zero or the path is
    /// not absolute
    pub fn validate(&self) -> Result<(), SignalingError> {
        if self.host.trim().is_empty() {
            return Err(SignalingError::ConfigError(
                "host cannot be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(SignalingError::ConfigError(
                "port cannot be zero".to_string(),
            ));
        }
        if !self.path.starts_with('/') {
            return Err(SignalingError::ConfigError(format!(
                "path must start with '/': {}",
                self.path
            )));
        }
        Ok(())
    }
}

/// An answerable inbound call
pub trait InboundCall: Send {
    /// Answer with our local stream
    ///
    /// # Errors
    ///
    /// Returns error if the caller hung up or the broker failed
    fn answer(
        self: Box<Self>,
        local: &LocalStream,
        events: ConnectionEvents,
    ) -> Result<Box<dyn PeerTransport>, SignalingError>;

    /// Decline the call
    fn reject(self: Box<Self>);
}

/// Inbound call notification
pub struct IncomingCall {
    caller: Option<PeerId>,
    handle: Box<dyn InboundCall>,
}

impl std::fmt::Debug for IncomingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingCall")
            .field("caller", &self.caller)
            .finish_non_exhaustive()
    }
}

impl IncomingCall {
    /// Wrap an answerable call handle
    #[must_use]
    pub fn new(caller: Option<PeerId>, handle: Box<dyn InboundCall>) -> Self {
        Self { caller, handle }
    }

    /// Caller identifier, if the broker disclosed it
    #[must_use]
    pub fn caller(&self) -> Option<&PeerId> {
        self.caller.as_ref()
    }

    /// Answer with our local stream
    ///
    /// # Errors
    ///
    /// Returns error if the caller hung up or the broker failed
    pub fn answer(
        self,
        local: &LocalStream,
        events: ConnectionEvents,
    ) -> Result<Box<dyn PeerTransport>, SignalingError> {
        self.handle.answer(local, events)
    }

    /// Decline the call
    pub fn reject(self) {
        self.handle.reject();
    }
}

/// Sink for broker notifications
#[derive(Debug, Clone)]
pub struct SignalingEvents {
    events: SessionEvents,
}

impl SignalingEvents {
    pub(crate) fn new(events: SessionEvents) -> Self {
        Self { events }
    }

    /// Deliver an inbound call; returns `false` if the session is gone
    pub fn incoming_call(&self, call: IncomingCall) -> bool {
        self.events.post(SessionEvent::InboundCall(call))
    }

    /// Report a broker failure
    pub fn error(&self, error: SignalingError) -> bool {
        self.events.post(SessionEvent::SignalingFailed(error))
    }

    /// Whether the session still listens
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.events.is_open()
    }
}

/// Signaling service
///
/// Implement this for your specific broker (websocket peer server, DHT, ...).
#[async_trait]
pub trait SignalingService: Send + Sync {
    /// Connect to the broker and obtain our identifier
    ///
    /// Inbound calls and later broker failures are delivered to `events`.
    async fn register(
        &self,
        config: &SignalingConfig,
        events: SignalingEvents,
    ) -> Result<PeerId, SignalingError>;

    /// Call a peer, offering our local stream
    fn call(
        &self,
        remote: &PeerId,
        local: &LocalStream,
        events: ConnectionEvents,
    ) -> Result<Box<dyn PeerTransport>, SignalingError>;

    /// Disconnect from the broker; idempotent
    fn destroy(&self);
}
