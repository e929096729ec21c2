//! Peer transport capability
//!
//! A [`PeerTransport`] is the opaque handle to one negotiated peer-to-peer
//! media connection. ICE, codecs and congestion control live behind it; the
//! session only swaps outgoing tracks and closes it. Transports report back
//! through a [`ConnectionEvents`] sink that is bound to a single connection.

use crate::events::{SessionEvent, SessionEvents};
use crate::media::{MediaTrack, RemoteStream};
use crate::types::{ConnectionId, MediaKind};
use thiserror::Error;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transport was already torn down
    #[error("Transport closed")]
    Closed,

    /// No outgoing sender exists for the media kind
    #[error("No {0} sender")]
    NoSender(MediaKind),

    /// The transport refused the operation
    #[error("Rejected: {0}")]
    Rejected(String),
}

/// A connection refused a new outgoing track
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Connection {connection} failed to replace {kind} track: {source}")]
pub struct TrackReplaceError {
    /// Connection that failed
    pub connection: ConnectionId,
    /// Kind of the track being replaced
    pub kind: MediaKind,
    /// Underlying transport failure
    pub source: TransportError,
}

/// Per-connection transport handle
pub trait PeerTransport: Send + Sync {
    /// Stable identifier of the underlying transport handle
    fn transport_id(&self) -> &str;

    /// Whether an outgoing sender for `kind` exists
    fn has_sender(&self, kind: MediaKind) -> bool;

    /// Swap the outgoing track of `kind` without renegotiation
    ///
    /// # Errors
    ///
    /// Returns error if the transport is closed or refuses the track
    fn replace_outgoing_track(&self, kind: MediaKind, track: &MediaTrack)
        -> Result<(), TransportError>;

    /// Tear down the transport
    ///
    /// # Errors
    ///
    /// Returns error if teardown fails; callers treat the transport as closed
    /// regardless
    fn close(&self) -> Result<(), TransportError>;
}

/// Event sink bound to one connection
///
/// Holds only the connection id and a queue sender, so a transport can never
/// keep the session alive or report on behalf of another connection.
#[derive(Debug, Clone)]
pub struct ConnectionEvents {
    connection: ConnectionId,
    events: SessionEvents,
}

impl ConnectionEvents {
    pub(crate) fn new(connection: ConnectionId, events: SessionEvents) -> Self {
        Self { connection, events }
    }

    /// Connection this sink reports for
    #[must_use]
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Report a remote stream; duplicates are tolerated
    pub fn stream_received(&self, stream_id: impl Into<String>, kinds: Vec<MediaKind>) -> bool {
        let stream = RemoteStream::new(stream_id.into(), self.connection, kinds);
        self.events.post(SessionEvent::StreamReceived(stream))
    }

    /// Report that the connection closed
    pub fn closed(&self) -> bool {
        self.events
            .post(SessionEvent::ConnectionClosed(self.connection))
    }
}
