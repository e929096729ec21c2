//! In-process collaborators
//!
//! Loopback implementations of the signaling, transport and device
//! capabilities. Sessions sharing one [`LoopbackNetwork`] can call each other
//! without any network, which is what the CLI demo and the integration tests
//! run on.
//!
//! # Example
//!
//! ```rust,no_run
//! use meshcall_core::loopback::{LoopbackNetwork, LoopbackSignaling, SyntheticDevices};
//! use meshcall_core::SessionOrchestrator;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), meshcall_core::SessionError> {
//! let network = LoopbackNetwork::new();
//! let mut alice = SessionOrchestrator::builder(
//!     Arc::new(SyntheticDevices::new()),
//!     Arc::new(LoopbackSignaling::new(network.clone()).with_peer_id("alice")),
//! )
//! .with_display_name("Alice")
//! .build()?;
//! alice.start().await?;
//! alice.call("bob")?;
//! # Ok(())
//! # }
//! ```

use crate::identity::PeerId;
use crate::media::{DeviceError, LocalStream, MediaDevices, MediaTrack};
use crate::signaling::{
    InboundCall, IncomingCall, SignalingConfig, SignalingError, SignalingEvents, SignalingService,
};
use crate::transport::{ConnectionEvents, PeerTransport, TransportError};
use crate::types::{CaptureKind, MediaKind, TrackSource};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

// ============================================================================
// Devices
// ============================================================================

/// Device capability producing synthetic tracks
///
/// Every issued track is remembered so callers can check that nothing was
/// left running.
#[derive(Default)]
pub struct SyntheticDevices {
    camera_denied: AtomicBool,
    screen_cancelled: AtomicBool,
    screen_audio: bool,
    issued: Mutex<Vec<MediaTrack>>,
}

impl SyntheticDevices {
    /// Devices that grant every request
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Include an audio track in screen captures
    #[must_use]
    pub fn with_screen_audio(mut self, enabled: bool) -> Self {
        self.screen_audio = enabled;
        self
    }

    /// Make camera/microphone requests fail with permission denied
    pub fn set_camera_denied(&self, denied: bool) {
        self.camera_denied.store(denied, Ordering::SeqCst);
    }

    /// Make screen requests fail as if the picker was dismissed
    pub fn set_screen_cancelled(&self, cancelled: bool) {
        self.screen_cancelled.store(cancelled, Ordering::SeqCst);
    }

    /// Every track issued so far
    #[must_use]
    pub fn issued_tracks(&self) -> Vec<MediaTrack> {
        self.issued.lock().clone()
    }

    /// Issued tracks that are still live
    #[must_use]
    pub fn live_track_count(&self) -> usize {
        self.issued.lock().iter().filter(|t| t.is_live()).count()
    }

    /// Most recently issued screen track
    #[must_use]
    pub fn last_screen_track(&self) -> Option<MediaTrack> {
        self.issued
            .lock()
            .iter()
            .rev()
            .find(|t| t.source() == TrackSource::Screen)
            .cloned()
    }

    fn issue(&self, source: TrackSource, label: &str) -> MediaTrack {
        let track = MediaTrack::new(source, label);
        self.issued.lock().push(track.clone());
        track
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn camera_and_mic(&self) -> Result<LocalStream, DeviceError> {
        if self.camera_denied.load(Ordering::SeqCst) {
            return Err(DeviceError::PermissionDenied(CaptureKind::CameraAndMic));
        }
        let mic = self.issue(TrackSource::Microphone, "Synthetic Microphone");
        let cam = self.issue(TrackSource::Camera, "Synthetic Camera");
        LocalStream::new(Some(mic), Some(cam))
    }

    async fn screen(&self) -> Result<LocalStream, DeviceError> {
        if self.screen_cancelled.load(Ordering::SeqCst) {
            return Err(DeviceError::Cancelled(CaptureKind::Screen));
        }
        let audio = self
            .screen_audio
            .then(|| self.issue(TrackSource::Microphone, "Synthetic Screen Audio"));
        let video = self.issue(TrackSource::Screen, "Synthetic Screen");
        LocalStream::new(audio, Some(video))
    }
}

// ============================================================================
// Network
// ============================================================================

struct Endpoint {
    owner: PeerId,
    remote: PeerId,
    state: Arc<EndState>,
}

#[derive(Default)]
struct NetworkInner {
    peers: HashMap<PeerId, SignalingEvents>,
    endpoints: Vec<Endpoint>,
}

/// Shared in-process broker
#[derive(Default)]
pub struct LoopbackNetwork {
    inner: Mutex<NetworkInner>,
    next_id: AtomicU64,
    next_transport: AtomicU64,
}

impl LoopbackNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Identifiers currently registered
    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.inner.lock().peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Deliver a broker failure to a registered peer
    pub fn inject_error(&self, peer: &PeerId, error: SignalingError) -> bool {
        let sink = self.inner.lock().peers.get(peer).cloned();
        sink.is_some_and(|events| events.error(error))
    }

    /// Make `owner`'s transport towards `remote` refuse track replacement
    pub fn set_replace_failure(&self, owner: &PeerId, remote: &PeerId, fail: bool) {
        for endpoint in self.endpoints(owner, Some(remote)) {
            endpoint.fail_replace.store(fail, Ordering::SeqCst);
        }
    }

    /// Total replacement attempts made by `owner`'s transports
    #[must_use]
    pub fn replace_calls(&self, owner: &PeerId) -> usize {
        self.endpoints(owner, None)
            .iter()
            .map(|e| e.replace_calls.load(Ordering::SeqCst))
            .sum()
    }

    /// Track `owner` currently sends to `remote` for `kind`
    #[must_use]
    pub fn outgoing_track(&self, owner: &PeerId, remote: &PeerId, kind: MediaKind) -> Option<MediaTrack> {
        self.endpoints(owner, Some(remote))
            .iter()
            .rev()
            .find_map(|e| e.senders.lock().get(&kind).cloned())
    }

    fn endpoints(&self, owner: &PeerId, remote: Option<&PeerId>) -> Vec<Arc<EndState>> {
        self.inner
            .lock()
            .endpoints
            .iter()
            .filter(|e| &e.owner == owner && remote.map_or(true, |r| &e.remote == r))
            .map(|e| e.state.clone())
            .collect()
    }

    fn assign(
        &self,
        requested: Option<&PeerId>,
        events: SignalingEvents,
    ) -> Result<PeerId, SignalingError> {
        let mut inner = self.inner.lock();
        let id = match requested {
            Some(id) if inner.peers.contains_key(id) => {
                return Err(SignalingError::TransportError(format!(
                    "identifier already taken: {}",
                    id
                )));
            }
            Some(id) => id.clone(),
            None => loop {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                let candidate = PeerId::new(format!("peer-{}", n));
                if !inner.peers.contains_key(&candidate) {
                    break candidate;
                }
            },
        };
        inner.peers.insert(id.clone(), events);
        Ok(id)
    }

    fn lookup(&self, id: &PeerId) -> Option<SignalingEvents> {
        self.inner.lock().peers.get(id).cloned()
    }

    fn remove(&self, id: &PeerId) {
        let mut inner = self.inner.lock();
        inner.peers.remove(id);
        inner.endpoints.retain(|e| &e.owner != id);
    }

    fn open_endpoint(&self, owner: &PeerId, remote: &PeerId, local: &LocalStream) -> Arc<EndState> {
        let n = self.next_transport.fetch_add(1, Ordering::SeqCst) + 1;
        let senders = local
            .tracks()
            .map(|track| (track.kind(), track.clone()))
            .collect();
        let state = Arc::new(EndState {
            id: format!("loopback-{}-{}", owner, n),
            senders: Mutex::new(senders),
            replace_calls: AtomicUsize::new(0),
            fail_replace: AtomicBool::new(false),
        });
        self.inner.lock().endpoints.push(Endpoint {
            owner: owner.clone(),
            remote: remote.clone(),
            state: state.clone(),
        });
        state
    }
}

// ============================================================================
// Transport
// ============================================================================

struct EndState {
    id: String,
    senders: Mutex<HashMap<MediaKind, MediaTrack>>,
    replace_calls: AtomicUsize,
    fail_replace: AtomicBool,
}

struct Link {
    closed: bool,
    caller: ConnectionEvents,
    caller_stream: (String, Vec<MediaKind>),
    callee: Option<ConnectionEvents>,
}

impl Link {
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.caller.closed();
        if let Some(callee) = &self.callee {
            callee.closed();
        }
    }
}

/// One end of an in-process call
///
/// Closing either end closes both.
pub struct LoopbackTransport {
    end: Arc<EndState>,
    link: Arc<Mutex<Link>>,
}

impl PeerTransport for LoopbackTransport {
    fn transport_id(&self) -> &str {
        &self.end.id
    }

    fn has_sender(&self, kind: MediaKind) -> bool {
        self.end.senders.lock().contains_key(&kind)
    }

    fn replace_outgoing_track(
        &self,
        kind: MediaKind,
        track: &MediaTrack,
    ) -> Result<(), TransportError> {
        if self.link.lock().closed {
            return Err(TransportError::Closed);
        }
        self.end.replace_calls.fetch_add(1, Ordering::SeqCst);
        if self.end.fail_replace.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected(
                "replacement refused by loopback".to_string(),
            ));
        }
        let mut senders = self.end.senders.lock();
        match senders.get_mut(&kind) {
            Some(current) => {
                *current = track.clone();
                Ok(())
            }
            None => Err(TransportError::NoSender(kind)),
        }
    }

    fn close(&self) -> Result<(), TransportError> {
        self.link.lock().close();
        Ok(())
    }
}

struct LoopbackAnswer {
    network: Arc<LoopbackNetwork>,
    link: Arc<Mutex<Link>>,
    caller: PeerId,
    callee: PeerId,
}

impl InboundCall for LoopbackAnswer {
    fn answer(
        self: Box<Self>,
        local: &LocalStream,
        events: ConnectionEvents,
    ) -> Result<Box<dyn PeerTransport>, SignalingError> {
        let mut link = self.link.lock();
        if link.closed {
            return Err(SignalingError::CallClosed);
        }
        let end = self.network.open_endpoint(&self.callee, &self.caller, local);
        let (caller_stream, caller_kinds) = link.caller_stream.clone();
        events.stream_received(caller_stream, caller_kinds);
        link.caller
            .stream_received(local.id().to_string(), local.kinds());
        link.callee = Some(events);
        drop(link);

        Ok(Box::new(LoopbackTransport {
            end,
            link: self.link.clone(),
        }))
    }

    fn reject(self: Box<Self>) {
        self.link.lock().close();
    }
}

// ============================================================================
// Signaling
// ============================================================================

/// Per-participant signaling client on a [`LoopbackNetwork`]
pub struct LoopbackSignaling {
    network: Arc<LoopbackNetwork>,
    requested: Option<PeerId>,
    fail_registration: bool,
    registered: Mutex<Option<PeerId>>,
}

impl LoopbackSignaling {
    /// Client that gets a generated identifier
    #[must_use]
    pub fn new(network: Arc<LoopbackNetwork>) -> Self {
        Self {
            network,
            requested: None,
            fail_registration: false,
            registered: Mutex::new(None),
        }
    }

    /// Ask for a specific identifier
    #[must_use]
    pub fn with_peer_id(mut self, id: impl Into<PeerId>) -> Self {
        self.requested = Some(id.into());
        self
    }

    /// Make registration fail as if the broker were unreachable
    #[must_use]
    pub fn with_registration_failure(mut self) -> Self {
        self.fail_registration = true;
        self
    }

    /// Identifier assigned to this client
    #[must_use]
    pub fn peer_id(&self) -> Option<PeerId> {
        self.registered.lock().clone()
    }
}

#[async_trait]
impl SignalingService for LoopbackSignaling {
    async fn register(
        &self,
        config: &SignalingConfig,
        events: SignalingEvents,
    ) -> Result<PeerId, SignalingError> {
        config.validate()?;
        if self.fail_registration {
            return Err(SignalingError::TransportError(format!(
                "cannot reach {}",
                config.endpoint()
            )));
        }
        let id = self.network.assign(self.requested.as_ref(), events)?;
        *self.registered.lock() = Some(id.clone());
        tracing::info!(peer_id = %id, endpoint = %config.endpoint(), "Registered with loopback broker");
        Ok(id)
    }

    fn call(
        &self,
        remote: &PeerId,
        local: &LocalStream,
        events: ConnectionEvents,
    ) -> Result<Box<dyn PeerTransport>, SignalingError> {
        let own = self.peer_id().ok_or(SignalingError::NotReady)?;
        if &own == remote {
            return Err(SignalingError::PeerUnavailable(format!(
                "{} is ourselves",
                remote
            )));
        }
        let remote_events = self
            .network
            .lookup(remote)
            .ok_or_else(|| SignalingError::PeerUnavailable(remote.to_string()))?;

        let link = Arc::new(Mutex::new(Link {
            closed: false,
            caller: events,
            caller_stream: (local.id().to_string(), local.kinds()),
            callee: None,
        }));
        let offer = LoopbackAnswer {
            network: self.network.clone(),
            link: link.clone(),
            caller: own.clone(),
            callee: remote.clone(),
        };
        if !remote_events.incoming_call(IncomingCall::new(Some(own.clone()), Box::new(offer))) {
            return Err(SignalingError::PeerUnavailable(remote.to_string()));
        }

        let end = self.network.open_endpoint(&own, remote, local);
        tracing::debug!(remote = %remote, transport = %end.id, "Loopback call offered");
        Ok(Box::new(LoopbackTransport { end, link }))
    }

    fn destroy(&self) {
        if let Some(id) = self.registered.lock().take() {
            self.network.remove(&id);
            tracing::debug!(peer_id = %id, "Left loopback broker");
        }
    }
}
