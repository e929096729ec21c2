//! Session types and data structures

use crate::identity::PeerId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one peer-to-peer call leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a local device track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackId(pub Uuid);

impl TrackId {
    /// Create a new random track ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TrackId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a locally published stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub Uuid);

impl StreamId {
    /// Create a new random stream ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Device a track was captured from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    /// Microphone
    Microphone,
    /// Camera
    Camera,
    /// Screen capture
    Screen,
}

impl TrackSource {
    /// Media kind produced by this source
    #[must_use]
    pub fn kind(self) -> MediaKind {
        match self {
            Self::Microphone => MediaKind::Audio,
            Self::Camera | Self::Screen => MediaKind::Video,
        }
    }
}

/// What a capture request asks the device layer for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureKind {
    /// Camera and microphone together
    CameraAndMic,
    /// Screen capture (video only)
    Screen,
}

impl std::fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CameraAndMic => f.write_str("camera/microphone"),
            Self::Screen => f.write_str("screen capture"),
        }
    }
}

/// Who opened a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// The remote peer called us
    Inbound,
    /// We called the remote peer
    Outbound,
}

/// Connection lifecycle
///
/// ```text
///   Pending ──(first remote stream)──► Open
///      │                                │
///      └──────────(close)──────► Closed ◄┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Transport created, no media received yet
    Pending,
    /// Remote media is flowing
    Open,
    /// Torn down; holds no remote streams
    Closed,
}

/// Session phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    /// Waiting for local devices and signaling
    Initializing,
    /// Ready, no open connection
    Idle,
    /// At least one connection is open
    InCall,
    /// Left the session; terminal
    Ended,
}

/// User-facing session flags
///
/// Written only by the session orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Display label of the current user
    pub local_identity: String,
    /// Identifier assigned by signaling, once known
    pub my_peer_id: Option<PeerId>,
    /// Microphone track disabled
    pub muted: bool,
    /// Video track disabled
    pub video_off: bool,
    /// Screen capture is being sent instead of the camera
    pub screen_sharing: bool,
}

/// Read-only view of a session for presentation layers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Identifier assigned by signaling, once known
    pub my_identifier: Option<PeerId>,
    /// Display label of the current user
    pub display_name: String,
    /// Current phase
    pub phase: SessionPhase,
    /// Microphone track disabled
    pub is_muted: bool,
    /// Video track disabled
    pub is_video_off: bool,
    /// Screen capture is being sent
    pub is_screen_sharing: bool,
    /// Visible remote stream identifiers, in arrival order
    pub remote_streams: Vec<String>,
    /// Number of registered connections
    pub connections: usize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_track_source_kind() {
        assert_eq!(TrackSource::Microphone.kind(), MediaKind::Audio);
        assert_eq!(TrackSource::Camera.kind(), MediaKind::Video);
        assert_eq!(TrackSource::Screen.kind(), MediaKind::Video);
    }

    #[test]
    fn test_session_state_defaults() {
        let state = SessionState::default();
        assert!(state.my_peer_id.is_none());
        assert!(!state.muted);
        assert!(!state.video_off);
        assert!(!state.screen_sharing);
    }

    #[test]
    fn test_snapshot_serialization() {
        let snapshot = SessionSnapshot {
            my_identifier: Some(PeerId::new("abc123")),
            display_name: "alice".to_string(),
            phase: SessionPhase::Idle,
            is_muted: false,
            is_video_off: true,
            is_screen_sharing: false,
            remote_streams: vec!["s1".to_string()],
            connections: 1,
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"my_identifier\":\"abc123\""));
        let back: SessionSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
