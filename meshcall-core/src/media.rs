//! Local media management
//!
//! This module owns everything captured from local devices: individual
//! [`MediaTrack`] handles, the [`LocalStream`] that is published to peers, and
//! the [`LocalMediaController`] that acquires and releases them.
//!
//! # Track lifecycle
//!
//! ```text
//!   Live ──(stop)──► Stopped
//!     │
//!     └──(ended externally)──► Ended
//! ```
//!
//! A track handle is cheap to clone; clones share the enabled bit and the
//! lifecycle state, so the same track can be referenced by the local stream
//! and by every connection that sends it.

use crate::types::{CaptureKind, ConnectionId, MediaKind, StreamId, TrackId, TrackSource};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Device acquisition errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The user or platform refused access
    #[error("Permission denied for {0}")]
    PermissionDenied(CaptureKind),

    /// No device of the requested kind exists
    #[error("No {0} device available")]
    NotFound(CaptureKind),

    /// The user dismissed the capture picker
    #[error("{0} was cancelled")]
    Cancelled(CaptureKind),

    /// The captured stream lacks a usable track
    #[error("Captured stream has no live {0} track")]
    MissingTrack(MediaKind),

    /// Tracks do not fit a stream
    #[error("Invalid stream: {0}")]
    InvalidStream(String),
}

impl DeviceError {
    /// Which capture request failed, when known
    #[must_use]
    pub fn capture(&self) -> Option<CaptureKind> {
        match self {
            Self::PermissionDenied(kind) | Self::NotFound(kind) | Self::Cancelled(kind) => {
                Some(*kind)
            }
            Self::MissingTrack(_) | Self::InvalidStream(_) => None,
        }
    }
}

/// Lifecycle state of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackState {
    /// Producing media
    Live,
    /// Stopped by us; the device handle is released
    Stopped,
    /// Ended outside our control (device unplugged, native stop control)
    Ended,
}

struct TrackInner {
    id: TrackId,
    source: TrackSource,
    label: String,
    enabled: AtomicBool,
    state: watch::Sender<TrackState>,
}

/// Handle to one captured device track
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MediaTrack {}

impl MediaTrack {
    /// Create a live, enabled track
    #[must_use]
    pub fn new(source: TrackSource, label: impl Into<String>) -> Self {
        let (state, _) = watch::channel(TrackState::Live);
        Self {
            inner: Arc::new(TrackInner {
                id: TrackId::new(),
                source,
                label: label.into(),
                enabled: AtomicBool::new(true),
                state,
            }),
        }
    }

    /// Track identifier
    #[must_use]
    pub fn id(&self) -> TrackId {
        self.inner.id
    }

    /// Media kind
    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.inner.source.kind()
    }

    /// Capturing device
    #[must_use]
    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    /// Human readable device label
    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Whether media is delivered (a disabled track sends silence/black)
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Toggle delivery without releasing the device
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> TrackState {
        *self.inner.state.borrow()
    }

    /// Whether the track still produces media
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state() == TrackState::Live
    }

    /// Stop the track and release its device
    ///
    /// Returns `true` if this call stopped it; stopping a track that is
    /// already stopped or ended does nothing.
    pub fn stop(&self) -> bool {
        self.transition(TrackState::Stopped)
    }

    /// Mark the track as ended by its device
    ///
    /// Used by device layers when capture ends outside the session's control.
    /// Returns `true` if the track was live.
    pub fn end(&self) -> bool {
        self.transition(TrackState::Ended)
    }

    fn transition(&self, to: TrackState) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == TrackState::Live {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Wait until the track leaves the `Live` state
    pub async fn finished(&self) -> TrackState {
        let mut rx = self.inner.state.subscribe();
        let result = rx.wait_for(|state| *state != TrackState::Live).await;
        match result {
            Ok(state) => *state,
            Err(_) => TrackState::Stopped,
        }
    }
}

/// The locally published stream
///
/// Holds at most one audio track and at most one video track, so camera and
/// screen video can never be published together.
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: StreamId,
    audio: Option<MediaTrack>,
    video: Option<MediaTrack>,
}

impl LocalStream {
    /// Build a stream from an optional audio and an optional video track
    ///
    /// # Errors
    ///
    /// Returns error if a track is passed in the wrong slot
    pub fn new(audio: Option<MediaTrack>, video: Option<MediaTrack>) -> Result<Self, DeviceError> {
        if let Some(track) = &audio {
            if track.kind() != MediaKind::Audio {
                return Err(DeviceError::InvalidStream(format!(
                    "{:?} track in audio slot",
                    track.source()
                )));
            }
        }
        if let Some(track) = &video {
            if track.kind() != MediaKind::Video {
                return Err(DeviceError::InvalidStream(format!(
                    "{:?} track in video slot",
                    track.source()
                )));
            }
        }
        Ok(Self {
            id: StreamId::new(),
            audio,
            video,
        })
    }

    /// Same audio, different video; gets a new stream id
    #[must_use]
    pub(crate) fn with_video(&self, video: MediaTrack) -> Self {
        Self {
            id: StreamId::new(),
            audio: self.audio.clone(),
            video: Some(video),
        }
    }

    /// Stream identifier
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Audio track, if any
    #[must_use]
    pub fn audio_track(&self) -> Option<&MediaTrack> {
        self.audio.as_ref()
    }

    /// Video track, if any
    #[must_use]
    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.video.as_ref()
    }

    /// Track of the given kind, if any
    #[must_use]
    pub fn track(&self, kind: MediaKind) -> Option<&MediaTrack> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    /// All tracks, audio first
    pub fn tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.audio.iter().chain(self.video.iter())
    }

    /// Kinds of the tracks present
    #[must_use]
    pub fn kinds(&self) -> Vec<MediaKind> {
        self.tracks().map(MediaTrack::kind).collect()
    }

    /// Whether the stream carries the given track
    #[must_use]
    pub fn contains(&self, track: &MediaTrack) -> bool {
        self.tracks().any(|t| t == track)
    }

    /// Whether the video track is a screen capture
    #[must_use]
    pub fn is_screen(&self) -> bool {
        self.video
            .as_ref()
            .is_some_and(|track| track.source() == TrackSource::Screen)
    }

    /// Whether every track has been stopped or has ended
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.tracks().all(|track| !track.is_live())
    }
}

/// A stream received from a peer
///
/// Remote streams are read-only; the session only tracks which connection
/// produced them so they can be dropped when that connection closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    id: String,
    origin: ConnectionId,
    kinds: Vec<MediaKind>,
}

impl RemoteStream {
    pub(crate) fn new(id: String, origin: ConnectionId, kinds: Vec<MediaKind>) -> Self {
        Self { id, origin, kinds }
    }

    /// Opaque stream identifier chosen by the sender
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Connection the stream arrived on
    #[must_use]
    pub fn origin(&self) -> ConnectionId {
        self.origin
    }

    /// Kinds of media in the stream
    #[must_use]
    pub fn kinds(&self) -> &[MediaKind] {
        &self.kinds
    }
}

/// Device capability
///
/// Implement this for the platform's capture API. Each returned stream holds
/// device handles until its tracks are stopped.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Capture camera and microphone
    async fn camera_and_mic(&self) -> Result<LocalStream, DeviceError>;

    /// Capture the screen (video only)
    async fn screen(&self) -> Result<LocalStream, DeviceError>;
}

/// Owner of the local stream and of every captured device track
///
/// Besides the published stream the controller holds the active screen
/// stream and, while sharing, the parked camera stream whose video is
/// disabled. [`release_all`](Self::release_all) stops all of them.
pub struct LocalMediaController<D: MediaDevices> {
    devices: Arc<D>,
    local: Option<LocalStream>,
    screen: Option<LocalStream>,
    parked_camera: Option<LocalStream>,
}

impl<D: MediaDevices> LocalMediaController<D> {
    /// Create a controller with nothing acquired
    #[must_use]
    pub fn new(devices: Arc<D>) -> Self {
        Self {
            devices,
            local: None,
            screen: None,
            parked_camera: None,
        }
    }

    /// Request camera and microphone access
    ///
    /// # Errors
    ///
    /// Returns error if permission is denied or no device is available
    pub async fn acquire_camera_and_mic(&self) -> Result<LocalStream, DeviceError> {
        let stream = self.devices.camera_and_mic().await?;
        tracing::debug!(
            stream_id = %stream.id(),
            kinds = ?stream.kinds(),
            "Camera and microphone acquired"
        );
        Ok(stream)
    }

    /// Request a video-only screen capture
    ///
    /// Any audio captured alongside the screen is stopped and dropped.
    ///
    /// # Errors
    ///
    /// Returns error if the picker is cancelled, no source is available, or
    /// the capture has no live video track
    pub async fn acquire_screen(&self) -> Result<LocalStream, DeviceError> {
        let captured = self.devices.screen().await?;
        let video = match captured.video_track() {
            Some(track) if track.is_live() => track.clone(),
            _ => {
                Self::release(&captured);
                return Err(DeviceError::MissingTrack(MediaKind::Video));
            }
        };
        if let Some(audio) = captured.audio_track() {
            audio.stop();
        }
        let stream = LocalStream::new(None, Some(video))?;
        tracing::debug!(stream_id = %stream.id(), "Screen capture acquired");
        Ok(stream)
    }

    /// Enable or disable the local track of the given kind
    ///
    /// Returns `false` if there is no local stream or no such track.
    pub fn set_track_enabled(&self, kind: MediaKind, enabled: bool) -> bool {
        match self.local.as_ref().and_then(|stream| stream.track(kind)) {
            Some(track) => {
                track.set_enabled(enabled);
                tracing::debug!(kind = %kind, enabled, "Local track toggled");
                true
            }
            None => false,
        }
    }

    /// Stop every track of a stream
    ///
    /// Idempotent; returns how many tracks this call stopped.
    pub fn release(stream: &LocalStream) -> usize {
        stream.tracks().filter(|track| track.stop()).count()
    }

    /// Stop the tracks of `stream` that `keep` does not carry
    pub fn release_except(stream: &LocalStream, keep: &LocalStream) -> usize {
        stream
            .tracks()
            .filter(|track| !keep.contains(track))
            .filter(|track| track.stop())
            .count()
    }

    /// Currently published stream
    #[must_use]
    pub fn local_stream(&self) -> Option<&LocalStream> {
        self.local.as_ref()
    }

    /// Replace the published stream, returning the previous one
    pub fn publish(&mut self, stream: LocalStream) -> Option<LocalStream> {
        tracing::debug!(stream_id = %stream.id(), screen = stream.is_screen(), "Publishing local stream");
        self.local.replace(stream)
    }

    /// Active screen capture, if sharing
    #[must_use]
    pub fn screen_stream(&self) -> Option<&LocalStream> {
        self.screen.as_ref()
    }

    /// Hold the active screen capture, returning the previous one
    pub fn set_screen(&mut self, stream: LocalStream) -> Option<LocalStream> {
        self.screen.replace(stream)
    }

    /// Take the active screen capture
    pub fn take_screen(&mut self) -> Option<LocalStream> {
        self.screen.take()
    }

    /// Camera stream set aside while sharing
    #[must_use]
    pub fn parked_camera(&self) -> Option<&LocalStream> {
        self.parked_camera.as_ref()
    }

    /// Set the camera stream aside, returning a previously parked one
    pub fn park_camera(&mut self, stream: LocalStream) -> Option<LocalStream> {
        self.parked_camera.replace(stream)
    }

    /// Take the parked camera stream
    pub fn take_parked_camera(&mut self) -> Option<LocalStream> {
        self.parked_camera.take()
    }

    /// Release the published, screen and parked streams
    ///
    /// Returns how many tracks were stopped by this call.
    pub fn release_all(&mut self) -> usize {
        let stopped: usize = [
            self.local.take(),
            self.screen.take(),
            self.parked_camera.take(),
        ]
        .iter()
        .flatten()
        .map(Self::release)
        .sum();
        tracing::debug!(stopped, "Released local media");
        stopped
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::SyntheticDevices;

    fn camera_stream() -> LocalStream {
        LocalStream::new(
            Some(MediaTrack::new(TrackSource::Microphone, "mic")),
            Some(MediaTrack::new(TrackSource::Camera, "cam")),
        )
        .unwrap()
    }

    #[test]
    fn test_stop_is_idempotent() {
        let track = MediaTrack::new(TrackSource::Camera, "cam");
        assert!(track.is_live());
        assert!(track.stop());
        assert!(!track.stop());
        assert_eq!(track.state(), TrackState::Stopped);
    }

    #[test]
    fn test_end_after_stop_keeps_stopped() {
        let track = MediaTrack::new(TrackSource::Screen, "screen");
        track.stop();
        assert!(!track.end());
        assert_eq!(track.state(), TrackState::Stopped);
    }

    #[test]
    fn test_clones_share_state() {
        let track = MediaTrack::new(TrackSource::Microphone, "mic");
        let clone = track.clone();
        clone.set_enabled(false);
        assert!(!track.is_enabled());
        clone.stop();
        assert!(!track.is_live());
        assert_eq!(track, clone);
    }

    #[test]
    fn test_stream_rejects_wrong_slot() {
        let cam = MediaTrack::new(TrackSource::Camera, "cam");
        let err = LocalStream::new(Some(cam), None).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidStream(_)));
    }

    #[test]
    fn test_release_twice_and_after_external_end() {
        let stream = camera_stream();
        stream.video_track().unwrap().end();

        assert_eq!(LocalMediaController::<SyntheticDevices>::release(&stream), 1);
        assert_eq!(LocalMediaController::<SyntheticDevices>::release(&stream), 0);
        assert!(stream.is_released());
    }

    #[test]
    fn test_release_except_keeps_shared_tracks() {
        let stream = camera_stream();
        let screen = MediaTrack::new(TrackSource::Screen, "screen");
        let composite = stream.with_video(screen.clone());

        let stopped = LocalMediaController::<SyntheticDevices>::release_except(&composite, &stream);
        assert_eq!(stopped, 1);
        assert!(!screen.is_live());
        assert!(stream.audio_track().unwrap().is_live());
    }

    #[tokio::test]
    async fn test_finished_reports_external_end() {
        let track = MediaTrack::new(TrackSource::Screen, "screen");
        let watcher = track.clone();
        let handle = tokio::spawn(async move { watcher.finished().await });
        track.end();
        assert_eq!(handle.await.unwrap(), TrackState::Ended);
    }

    #[tokio::test]
    async fn test_set_track_enabled_without_stream() {
        let controller = LocalMediaController::new(Arc::new(SyntheticDevices::new()));
        assert!(!controller.set_track_enabled(MediaKind::Audio, false));
    }

    #[tokio::test]
    async fn test_set_track_enabled_toggles_published_track() {
        let mut controller = LocalMediaController::new(Arc::new(SyntheticDevices::new()));
        let stream = controller.acquire_camera_and_mic().await.unwrap();
        controller.publish(stream.clone());

        assert!(controller.set_track_enabled(MediaKind::Audio, false));
        assert!(!stream.audio_track().unwrap().is_enabled());
        assert!(stream.audio_track().unwrap().is_live());
        assert!(stream.video_track().unwrap().is_enabled());
    }

    #[tokio::test]
    async fn test_acquire_screen_drops_audio() {
        let devices = Arc::new(SyntheticDevices::new().with_screen_audio(true));
        let controller = LocalMediaController::new(devices);
        let screen = controller.acquire_screen().await.unwrap();
        assert!(screen.audio_track().is_none());
        assert!(screen.is_screen());
    }

    #[tokio::test]
    async fn test_acquire_screen_cancelled() {
        let devices = Arc::new(SyntheticDevices::new());
        devices.set_screen_cancelled(true);
        let controller = LocalMediaController::new(devices);
        let err = controller.acquire_screen().await.unwrap_err();
        assert_eq!(err, DeviceError::Cancelled(CaptureKind::Screen));
    }

    #[tokio::test]
    async fn test_release_all_stops_everything() {
        let devices = Arc::new(SyntheticDevices::new());
        let mut controller = LocalMediaController::new(devices.clone());
        let camera = controller.acquire_camera_and_mic().await.unwrap();
        let screen = controller.acquire_screen().await.unwrap();
        controller.publish(camera.with_video(screen.video_track().unwrap().clone()));
        controller.park_camera(camera);
        controller.set_screen(screen);

        assert_eq!(controller.release_all(), 3);
        assert!(controller.local_stream().is_none());
        assert_eq!(devices.live_track_count(), 0);
    }
}
