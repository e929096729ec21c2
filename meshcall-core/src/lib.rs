//! Meshcall - call-session lifecycle for small peer-to-peer media sessions
//!
//! This library manages one participant's side of a mesh of direct audio/video
//! connections. It features:
//!
//! - **Single-owner state**: one orchestrator owns streams, connections and flags
//! - **Event queue**: signaling and transports report through sinks, never callbacks
//! - **Live source switching**: camera and screen swap without renegotiation
//! - **Guaranteed teardown**: leaving (or dropping) the session stops every device
//!
//! Signaling, transports and capture devices are capabilities supplied by the
//! caller; [`loopback`] provides in-process ones.
//!
//! # Examples
//!
//! ```rust,no_run
//! use meshcall_core::loopback::{LoopbackNetwork, LoopbackSignaling, SyntheticDevices};
//! use meshcall_core::SessionOrchestrator;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), meshcall_core::SessionError> {
//! let network = LoopbackNetwork::new();
//! let mut session = SessionOrchestrator::builder(
//!     Arc::new(SyntheticDevices::new()),
//!     Arc::new(LoopbackSignaling::new(network)),
//! )
//! .build()?;
//!
//! session.start().await?;
//! session.toggle_mute();
//! session.leave();
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Core types and identifiers
pub mod types;

/// Peer identifiers
pub mod identity;

/// Local capture and media streams
pub mod media;

/// Session event queue
pub mod events;

/// Peer transport capability
pub mod transport;

/// Signaling capability and configuration
pub mod signaling;

/// Connections and the connection registry
pub mod call;

/// Camera/screen source switching
pub mod switcher;

/// Session orchestration
pub mod service;

/// In-process collaborators
pub mod loopback;

// Re-export main types at crate root
pub use call::{CloseReport, Connection, ConnectionRegistry, DuplicateError};
pub use events::{SessionAction, SessionEvent, SessionEvents, SessionNotice};
pub use identity::PeerId;
pub use media::{
    DeviceError, LocalMediaController, LocalStream, MediaDevices, MediaTrack, RemoteStream,
    TrackState,
};
pub use service::{SessionConfig, SessionError, SessionOrchestrator, SessionOrchestratorBuilder};
pub use signaling::{
    InboundCall, IncomingCall, SignalingConfig, SignalingError, SignalingEvents, SignalingService,
};
pub use switcher::{SwitchReport, TrackSwitcher};
pub use transport::{ConnectionEvents, PeerTransport, TrackReplaceError, TransportError};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::events::{SessionAction, SessionNotice};
    pub use crate::identity::PeerId;
    pub use crate::media::{DeviceError, LocalStream, MediaDevices, MediaTrack};
    pub use crate::service::{SessionConfig, SessionError, SessionOrchestrator};
    pub use crate::signaling::{SignalingConfig, SignalingError, SignalingService};
    pub use crate::transport::PeerTransport;
    pub use crate::types::{MediaKind, SessionPhase, SessionSnapshot};
}
