//! Session events and notices
//!
//! Everything that happens to a session arrives as a [`SessionEvent`] on a
//! single queue owned by the orchestrator. Collaborators hold sinks that can
//! only post events, never touch session state. What the session wants the
//! outside world to know goes out as a [`SessionNotice`].

use crate::identity::PeerId;
use crate::media::RemoteStream;
use crate::signaling::{IncomingCall, SignalingError};
use crate::types::{ConnectionId, TrackId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Input to the session state machine
#[derive(Debug)]
pub enum SessionEvent {
    /// A peer is calling us
    InboundCall(IncomingCall),
    /// A connection delivered a remote stream
    StreamReceived(RemoteStream),
    /// A connection was closed by its transport
    ConnectionClosed(ConnectionId),
    /// The signaling link reported a failure
    SignalingFailed(SignalingError),
    /// A local track ended outside the session's control
    TrackEnded(TrackId),
    /// A user action queued for in-order processing
    Action(SessionAction),
}

/// User actions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionAction {
    /// Flip the microphone enabled bit
    ToggleMute,
    /// Flip the video enabled bit
    ToggleVideo,
    /// Start or stop sharing the screen
    ToggleScreenShare,
    /// Call a peer by identifier
    Call(String),
    /// Leave the session
    Leave,
}

/// Outgoing notifications for presentation layers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionNotice {
    /// Signaling assigned our identifier
    PeerIdAssigned(PeerId),
    /// The visible remote stream set changed
    RemoteStreamsChanged {
        /// Visible stream identifiers after the change
        streams: Vec<String>,
    },
    /// A non-fatal failure the user should hear about
    Warning {
        /// User-facing message
        message: String,
    },
    /// The session has ended
    Ended,
}

/// Sender half of a session's event queue
#[derive(Debug, Clone)]
pub struct SessionEvents {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionEvents {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    /// Queue an event; returns `false` if the session is gone
    pub fn post(&self, event: SessionEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Queue a user action
    pub fn action(&self, action: SessionAction) -> bool {
        self.post(SessionEvent::Action(action))
    }

    /// Whether the session still accepts events
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}
