//! Session orchestration
//!
//! [`SessionOrchestrator`] owns every piece of session state: the local media
//! streams, the connection registry and the user-facing flags. Collaborators
//! never touch that state directly; they post [`SessionEvent`]s into the
//! session's queue and the orchestrator applies them one at a time.

use crate::call::{Connection, ConnectionRegistry, DuplicateError};
use crate::events::{SessionAction, SessionEvent, SessionEvents, SessionNotice};
use crate::identity::PeerId;
use crate::media::{
    DeviceError, LocalMediaController, LocalStream, MediaDevices, RemoteStream, TrackState,
};
use crate::signaling::{IncomingCall, SignalingConfig, SignalingError, SignalingEvents, SignalingService};
use crate::switcher::TrackSwitcher;
use crate::transport::ConnectionEvents;
use crate::types::{
    CaptureKind, ConnectionId, Direction, MediaKind, SessionPhase, SessionSnapshot, SessionState,
    TrackId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Local capture failed
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Broker or peer failure
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Connection bookkeeping failure
    #[error("Registry error: {0}")]
    Duplicate(#[from] DuplicateError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Operation not allowed in the current phase
    #[error("Invalid session phase: {0:?}")]
    InvalidPhase(SessionPhase),
}

impl SessionError {
    /// Message suitable for showing to the user
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Device(DeviceError::MissingTrack(kind)) => {
                format!("The selected source has no usable {} track.", kind)
            }
            Self::Device(err) => match err.capture() {
                Some(CaptureKind::Screen) => "Screen sharing was cancelled or failed.".to_string(),
                _ => "Could not access camera or microphone. Please check permissions.".to_string(),
            },
            Self::Signaling(err) => format!("Peer or network error: {}", err),
            Self::Duplicate(_) => "Internal error: connection registered twice.".to_string(),
            Self::ConfigError(msg) => format!("Invalid configuration: {}", msg),
            Self::InvalidPhase(phase) => format!("Not available while the session is {:?}.", phase),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Display label of the local user
    pub display_name: String,
    /// Signaling broker location
    pub signaling: SignalingConfig,
    /// Buffered notices per subscriber
    pub notice_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display_name: "User".to_string(),
            signaling: SignalingConfig::default(),
            notice_capacity: 100,
        }
    }
}

impl SessionConfig {
    /// Check the configuration
    ///
    /// # Errors
    ///
    /// Returns error if the display name is blank, the notice capacity is
    /// zero or the signaling section is invalid
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.display_name.trim().is_empty() {
            return Err(SessionError::ConfigError(
                "display name cannot be empty".to_string(),
            ));
        }
        if self.notice_capacity == 0 {
            return Err(SessionError::ConfigError(
                "notice capacity must be positive".to_string(),
            ));
        }
        self.signaling.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Initializing,
    Running,
    Ended,
}

/// Single-owner session state machine
pub struct SessionOrchestrator<D: MediaDevices, S: SignalingService> {
    config: SessionConfig,
    media: LocalMediaController<D>,
    registry: ConnectionRegistry,
    signaling: Arc<S>,
    signaling_ready: bool,
    state: SessionState,
    lifecycle: Lifecycle,
    remote_streams: Vec<RemoteStream>,
    events_tx: SessionEvents,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    notices: broadcast::Sender<SessionNotice>,
}

impl<D: MediaDevices, S: SignalingService> SessionOrchestrator<D, S> {
    /// Create a session in the `Initializing` phase
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(
        config: SessionConfig,
        devices: Arc<D>,
        signaling: Arc<S>,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let (tx, events_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(config.notice_capacity);
        let state = SessionState {
            local_identity: config.display_name.clone(),
            ..SessionState::default()
        };

        Ok(Self {
            config,
            media: LocalMediaController::new(devices),
            registry: ConnectionRegistry::new(),
            signaling,
            signaling_ready: false,
            state,
            lifecycle: Lifecycle::Initializing,
            remote_streams: Vec::new(),
            events_tx: SessionEvents::new(tx),
            events_rx,
            notices,
        })
    }

    /// Create a session builder
    #[must_use]
    pub fn builder(devices: Arc<D>, signaling: Arc<S>) -> SessionOrchestratorBuilder<D, S> {
        SessionOrchestratorBuilder::new(devices, signaling)
    }

    /// Acquire local media and register with signaling
    ///
    /// A signaling failure is reported as a warning notice and leaves the
    /// session usable without an identifier.
    ///
    /// # Errors
    ///
    /// Returns error if camera/microphone capture fails (the call may be
    /// retried) or the session already started
    #[tracing::instrument(skip(self), fields(user = %self.config.display_name))]
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.lifecycle != Lifecycle::Initializing {
            return Err(SessionError::InvalidPhase(self.phase()));
        }
        tracing::info!("Starting session");

        let stream = match self.media.acquire_camera_and_mic().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "Could not acquire camera and microphone");
                return Err(e.into());
            }
        };
        if let Some(stale) = self.media.publish(stream) {
            LocalMediaController::<D>::release(&stale);
        }
        self.lifecycle = Lifecycle::Running;

        let sink = SignalingEvents::new(self.events_tx.clone());
        match self.signaling.register(&self.config.signaling, sink).await {
            Ok(id) => {
                tracing::info!(peer_id = %id, "Registered with signaling");
                self.state.my_peer_id = Some(id.clone());
                self.signaling_ready = true;
                self.notify(SessionNotice::PeerIdAssigned(id));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Signaling unavailable; continuing without an identifier");
                self.warn(&SessionError::Signaling(e));
            }
        }

        tracing::info!("Session started");
        Ok(())
    }

    /// Answer an inbound call with the current local stream
    ///
    /// Calls arriving before local media exists or after the session ended
    /// are rejected.
    #[tracing::instrument(skip(self, call), fields(caller = ?call.caller()))]
    pub fn on_inbound_call(&mut self, call: IncomingCall) {
        if self.lifecycle == Lifecycle::Ended {
            tracing::debug!("Rejecting inbound call after session end");
            call.reject();
            return;
        }
        let Some(local) = self.media.local_stream().cloned() else {
            tracing::warn!("Rejecting inbound call: no local stream");
            call.reject();
            return;
        };

        let id = ConnectionId::new();
        let caller = call.caller().cloned();
        let sink = ConnectionEvents::new(id, self.events_tx.clone());
        match call.answer(&local, sink) {
            Ok(transport) => {
                let connection = Connection::new(id, caller, Direction::Inbound, transport);
                if let Err(e) = self.register_connection(connection) {
                    tracing::error!(connection_id = %id, error = %e, "Could not register inbound connection");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not answer inbound call");
                self.warn(&SessionError::Signaling(e));
            }
        }
    }

    /// Call a remote peer
    ///
    /// Returns `Ok(None)` without side effects when the id is blank, no local
    /// stream exists, signaling is not ready or the session has ended.
    ///
    /// # Errors
    ///
    /// Returns error if signaling refuses the call
    #[tracing::instrument(skip(self))]
    pub fn call(&mut self, remote_peer_id: &str) -> Result<Option<ConnectionId>, SessionError> {
        let Some(remote) = PeerId::parse(remote_peer_id) else {
            tracing::debug!("Ignoring call with empty peer id");
            return Ok(None);
        };
        if self.lifecycle != Lifecycle::Running || !self.signaling_ready {
            tracing::debug!(phase = ?self.phase(), "Ignoring call: signaling not ready");
            return Ok(None);
        }
        let Some(local) = self.media.local_stream().cloned() else {
            tracing::debug!("Ignoring call: no local stream");
            return Ok(None);
        };

        let id = ConnectionId::new();
        let sink = ConnectionEvents::new(id, self.events_tx.clone());
        let transport = match self.signaling.call(&remote, &local, sink) {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!(remote = %remote, error = %e, "Call failed");
                let err = SessionError::Signaling(e);
                self.warn(&err);
                return Err(err);
            }
        };

        self.register_connection(Connection::new(id, Some(remote), Direction::Outbound, transport))?;
        tracing::info!(connection_id = %id, "Outbound call placed");
        Ok(Some(id))
    }

    /// Flip the muted flag and the microphone track
    ///
    /// Returns the new flag; a no-op without local media.
    pub fn toggle_mute(&mut self) -> bool {
        if self.media.local_stream().is_none() {
            return self.state.muted;
        }
        self.state.muted = !self.state.muted;
        self.media.set_track_enabled(MediaKind::Audio, !self.state.muted);
        tracing::info!(muted = self.state.muted, "Microphone toggled");
        self.state.muted
    }

    /// Flip the video-off flag and the outgoing video track
    ///
    /// Returns the new flag; a no-op without local media.
    pub fn toggle_video(&mut self) -> bool {
        if self.media.local_stream().is_none() {
            return self.state.video_off;
        }
        self.state.video_off = !self.state.video_off;
        self.media.set_track_enabled(MediaKind::Video, !self.state.video_off);
        tracing::info!(video_off = self.state.video_off, "Video toggled");
        self.state.video_off
    }

    /// Start or stop screen sharing
    ///
    /// # Errors
    ///
    /// Returns error if the screen or the camera could not be acquired; the
    /// session stays usable either way
    #[tracing::instrument(skip(self), fields(sharing = self.state.screen_sharing))]
    pub async fn toggle_screen_share(&mut self) -> Result<(), SessionError> {
        if self.lifecycle != Lifecycle::Running {
            return Err(SessionError::InvalidPhase(self.phase()));
        }
        if self.state.screen_sharing {
            return self.stop_screen_share().await;
        }

        let result = match self.media.acquire_screen().await {
            Ok(screen) => {
                if let Some(video) = screen.video_track() {
                    video.set_enabled(!self.state.video_off);
                }
                TrackSwitcher::switch_to_screen(&mut self.media, &self.registry, screen)
            }
            Err(e) => Err(e),
        };
        let report = match result {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, "Screen share not started");
                let err = SessionError::Device(e);
                self.warn(&err);
                return Err(err);
            }
        };

        self.state.screen_sharing = true;
        self.watch_screen_track();
        tracing::info!(
            replaced = report.replaced,
            failed = report.failures.len(),
            "Screen share started"
        );
        Ok(())
    }

    /// Tear the session down; repeated calls are no-ops
    #[tracing::instrument(skip(self))]
    pub fn leave(&mut self) {
        if self.lifecycle == Lifecycle::Ended {
            tracing::debug!("Session already ended");
            return;
        }
        tracing::info!("Leaving session");

        let report = self.registry.close_all();
        self.remote_streams.clear();
        let stopped = self.media.release_all();
        self.signaling.destroy();
        self.signaling_ready = false;
        self.state.screen_sharing = false;
        self.lifecycle = Lifecycle::Ended;

        self.events_rx.close();
        while let Ok(event) = self.events_rx.try_recv() {
            if let SessionEvent::InboundCall(call) = event {
                call.reject();
            }
        }

        self.notify(SessionNotice::Ended);
        tracing::info!(
            closed = report.closed,
            failed = report.failed.len(),
            tracks_stopped = stopped,
            "Session ended"
        );
    }

    /// Run a user action
    ///
    /// # Errors
    ///
    /// Returns the error of the underlying operation
    pub async fn dispatch(&mut self, action: SessionAction) -> Result<(), SessionError> {
        match action {
            SessionAction::ToggleMute => {
                self.toggle_mute();
                Ok(())
            }
            SessionAction::ToggleVideo => {
                self.toggle_video();
                Ok(())
            }
            SessionAction::ToggleScreenShare => self.toggle_screen_share().await,
            SessionAction::Call(peer) => self.call(&peer).map(|_| ()),
            SessionAction::Leave => {
                self.leave();
                Ok(())
            }
        }
    }

    /// Sender for posting events into this session
    #[must_use]
    pub fn events(&self) -> SessionEvents {
        self.events_tx.clone()
    }

    /// Subscribe to session notices
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    /// Wait for one event and apply it
    ///
    /// Returns `false` once the session has ended.
    pub async fn next_event(&mut self) -> bool {
        if self.lifecycle == Lifecycle::Ended {
            return false;
        }
        match self.events_rx.recv().await {
            Some(event) => {
                self.handle_event(event).await;
                true
            }
            None => false,
        }
    }

    /// Apply every queued event; returns how many were handled
    pub async fn drain_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event).await;
            handled += 1;
        }
        handled
    }

    /// Process events until the session ends
    pub async fn run(&mut self) {
        while self.next_event().await {}
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        match self.lifecycle {
            Lifecycle::Initializing => SessionPhase::Initializing,
            Lifecycle::Ended => SessionPhase::Ended,
            Lifecycle::Running if self.registry.has_open() => SessionPhase::InCall,
            Lifecycle::Running => SessionPhase::Idle,
        }
    }

    /// User-facing flags
    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Identifier assigned by signaling
    #[must_use]
    pub fn my_identifier(&self) -> Option<&PeerId> {
        self.state.my_peer_id.as_ref()
    }

    /// Whether the microphone is muted
    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.state.muted
    }

    /// Whether video is turned off
    #[must_use]
    pub fn is_video_off(&self) -> bool {
        self.state.video_off
    }

    /// Whether the screen is being shared
    #[must_use]
    pub fn is_screen_sharing(&self) -> bool {
        self.state.screen_sharing
    }

    /// Visible remote streams in arrival order
    #[must_use]
    pub fn remote_streams(&self) -> &[RemoteStream] {
        &self.remote_streams
    }

    /// Stream currently offered to peers
    #[must_use]
    pub fn local_stream(&self) -> Option<&LocalStream> {
        self.media.local_stream()
    }

    /// Registered connections
    #[must_use]
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Session configuration
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Read-only view for presentation layers
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            my_identifier: self.state.my_peer_id.clone(),
            display_name: self.state.local_identity.clone(),
            phase: self.phase(),
            is_muted: self.state.muted,
            is_video_off: self.state.video_off,
            is_screen_sharing: self.state.screen_sharing,
            remote_streams: self.remote_streams.iter().map(|s| s.id().to_string()).collect(),
            connections: self.registry.len(),
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        if self.lifecycle == Lifecycle::Ended {
            if let SessionEvent::InboundCall(call) = event {
                call.reject();
            }
            return;
        }
        match event {
            SessionEvent::InboundCall(call) => self.on_inbound_call(call),
            SessionEvent::StreamReceived(stream) => self.on_stream_received(stream),
            SessionEvent::ConnectionClosed(id) => self.on_connection_closed(id),
            SessionEvent::SignalingFailed(e) => {
                tracing::warn!(error = %e, "Signaling error");
                self.warn(&SessionError::Signaling(e));
            }
            SessionEvent::TrackEnded(track) => self.on_track_ended(track).await,
            SessionEvent::Action(action) => {
                if let Err(e) = self.dispatch(action).await {
                    tracing::debug!(error = %e, "Action failed");
                }
            }
        }
    }

    fn on_stream_received(&mut self, stream: RemoteStream) {
        if self
            .registry
            .attach_stream(stream.origin(), stream.id())
            .is_none()
        {
            tracing::debug!(
                connection_id = %stream.origin(),
                stream_id = stream.id(),
                "Dropping stream for unknown connection"
            );
            return;
        }
        if self.remote_streams.iter().any(|s| s.id() == stream.id()) {
            tracing::debug!(stream_id = stream.id(), "Duplicate remote stream ignored");
            return;
        }
        tracing::info!(
            connection_id = %stream.origin(),
            stream_id = stream.id(),
            "Remote stream added"
        );
        self.remote_streams.push(stream);
        self.notify_streams_changed();
    }

    fn on_connection_closed(&mut self, id: ConnectionId) {
        let Some(mut connection) = self.registry.unregister(id) else {
            tracing::debug!(connection_id = %id, "Close for unknown connection");
            return;
        };
        if let Err(e) = connection.close() {
            tracing::debug!(connection_id = %id, error = %e, "Transport close failed");
        }

        let before = self.remote_streams.len();
        self.remote_streams.retain(|s| s.origin() != id);
        if self.remote_streams.len() != before {
            self.notify_streams_changed();
        }
        tracing::info!(connection_id = %id, "Connection closed");
    }

    async fn on_track_ended(&mut self, track: TrackId) {
        let current = self.state.screen_sharing
            && self
                .media
                .screen_stream()
                .and_then(LocalStream::video_track)
                .is_some_and(|t| t.id() == track);
        if !current {
            tracing::debug!(track_id = %track, "Ignoring end of inactive track");
            return;
        }
        tracing::info!("Screen capture ended; switching back to camera");
        if let Err(e) = self.stop_screen_share().await {
            tracing::debug!(error = %e, "Camera not restored");
        }
    }

    /// Connections keep the screen track until the camera is back; the
    /// switch releases the screen stream.
    async fn stop_screen_share(&mut self) -> Result<(), SessionError> {
        let acquired = self.media.acquire_camera_and_mic().await;
        self.state.screen_sharing = false;

        match acquired {
            Ok(camera) => {
                let report = TrackSwitcher::switch_to_camera(&mut self.media, &self.registry, camera);
                self.state.muted = false;
                self.state.video_off = false;
                tracing::info!(
                    replaced = report.replaced,
                    failed = report.failures.len(),
                    "Screen share stopped"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Could not reacquire camera; resuming previous camera");
                if let Some(screen) = self.media.take_screen() {
                    LocalMediaController::<D>::release(&screen);
                }
                if let Some(parked) = self.media.take_parked_camera() {
                    if let Some(video) = parked.video_track() {
                        video.set_enabled(!self.state.video_off);
                    }
                    TrackSwitcher::switch_to_camera(&mut self.media, &self.registry, parked);
                }
                let err = SessionError::Device(e);
                self.warn(&err);
                Err(err)
            }
        }
    }

    fn watch_screen_track(&self) {
        let Some(track) = self
            .media
            .screen_stream()
            .and_then(LocalStream::video_track)
            .cloned()
        else {
            return;
        };
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            if track.finished().await == TrackState::Ended {
                events.post(SessionEvent::TrackEnded(track.id()));
            }
        });
    }

    fn register_connection(&mut self, connection: Connection) -> Result<(), SessionError> {
        let id = connection.id();
        let direction = connection.direction();
        self.registry.register(connection)?;
        tracing::debug!(connection_id = %id, direction = ?direction, "Connection registered");
        Ok(())
    }

    fn notify_streams_changed(&self) {
        let streams = self
            .remote_streams
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        self.notify(SessionNotice::RemoteStreamsChanged { streams });
    }

    fn warn(&self, error: &SessionError) {
        self.notify(SessionNotice::Warning {
            message: error.user_message(),
        });
    }

    fn notify(&self, notice: SessionNotice) {
        let _ = self.notices.send(notice);
    }
}

impl<D: MediaDevices, S: SignalingService> Drop for SessionOrchestrator<D, S> {
    fn drop(&mut self) {
        self.leave();
    }
}

/// Session builder
pub struct SessionOrchestratorBuilder<D: MediaDevices, S: SignalingService> {
    devices: Arc<D>,
    signaling: Arc<S>,
    config: SessionConfig,
}

impl<D: MediaDevices, S: SignalingService> SessionOrchestratorBuilder<D, S> {
    /// Create new builder
    #[must_use]
    pub fn new(devices: Arc<D>, signaling: Arc<S>) -> Self {
        Self {
            devices,
            signaling,
            config: SessionConfig::default(),
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the display name
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.config.display_name = name.into();
        self
    }

    /// Build the session
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn build(self) -> Result<SessionOrchestrator<D, S>, SessionError> {
        SessionOrchestrator::new(self.config, self.devices, self.signaling)
    }
}
