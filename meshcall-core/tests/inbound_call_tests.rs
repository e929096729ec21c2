//! Inbound calls driven by a scripted signaling peer

use meshcall_core::loopback::{LoopbackNetwork, LoopbackSignaling, SyntheticDevices};
use meshcall_core::{
    ConnectionEvents, InboundCall, IncomingCall, LocalStream, MediaKind, MediaTrack, PeerId,
    PeerTransport, SessionEvent, SessionOrchestrator, SessionPhase, SignalingError,
    TransportError,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type Session = SessionOrchestrator<SyntheticDevices, LoopbackSignaling>;

struct StubTransport {
    id: String,
}

impl PeerTransport for StubTransport {
    fn transport_id(&self) -> &str {
        &self.id
    }

    fn has_sender(&self, _kind: MediaKind) -> bool {
        true
    }

    fn replace_outgoing_track(
        &self,
        _kind: MediaKind,
        _track: &MediaTrack,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Answers by delivering a fixed list of stream ids
struct ScriptedCall {
    transport_id: String,
    streams: Vec<String>,
    rejected: Arc<AtomicBool>,
    sink: Arc<parking_lot::Mutex<Option<ConnectionEvents>>>,
}

impl ScriptedCall {
    fn new(transport_id: &str, streams: &[&str]) -> Self {
        Self {
            transport_id: transport_id.to_string(),
            streams: streams.iter().map(|s| s.to_string()).collect(),
            rejected: Arc::new(AtomicBool::new(false)),
            sink: Arc::new(parking_lot::Mutex::new(None)),
        }
    }
}

impl InboundCall for ScriptedCall {
    fn answer(
        self: Box<Self>,
        _local: &LocalStream,
        events: ConnectionEvents,
    ) -> Result<Box<dyn PeerTransport>, SignalingError> {
        for stream in &self.streams {
            events.stream_received(stream.clone(), vec![MediaKind::Audio, MediaKind::Video]);
        }
        *self.sink.lock() = Some(events);
        Ok(Box::new(StubTransport {
            id: self.transport_id.clone(),
        }))
    }

    fn reject(self: Box<Self>) {
        self.rejected.store(true, Ordering::SeqCst);
    }
}

fn session(network: &Arc<LoopbackNetwork>) -> Session {
    let devices = Arc::new(SyntheticDevices::new());
    let signaling = Arc::new(LoopbackSignaling::new(network.clone()).with_peer_id("host"));
    SessionOrchestrator::builder(devices, signaling)
        .build()
        .unwrap()
}

fn incoming(call: ScriptedCall) -> IncomingCall {
    IncomingCall::new(Some(PeerId::new("guest")), Box::new(call))
}

#[tokio::test]
async fn test_duplicate_stream_shown_once() {
    let network = LoopbackNetwork::new();
    let mut host = session(&network);
    host.start().await.unwrap();

    host.on_inbound_call(incoming(ScriptedCall::new("t1", &["s1", "s1"])));
    host.drain_pending().await;

    assert_eq!(host.snapshot().remote_streams, vec!["s1".to_string()]);
    assert_eq!(host.phase(), SessionPhase::InCall);
}

#[tokio::test]
async fn test_inbound_call_without_media_is_rejected() {
    let network = LoopbackNetwork::new();
    let mut host = session(&network);
    let call = ScriptedCall::new("t1", &["s1"]);
    let rejected = call.rejected.clone();

    host.on_inbound_call(incoming(call));

    assert!(rejected.load(Ordering::SeqCst));
    assert!(host.connections().is_empty());
}

#[tokio::test]
async fn test_queued_inbound_call_after_leave_is_rejected() {
    let network = LoopbackNetwork::new();
    let mut host = session(&network);
    host.start().await.unwrap();
    let call = ScriptedCall::new("t1", &["s1"]);
    let rejected = call.rejected.clone();

    let events = host.events();
    assert!(events.post(SessionEvent::InboundCall(incoming(call))));
    host.leave();

    assert!(rejected.load(Ordering::SeqCst));
    assert!(host.connections().is_empty());
}

#[tokio::test]
async fn test_stream_after_close_is_dropped() {
    let network = LoopbackNetwork::new();
    let mut host = session(&network);
    host.start().await.unwrap();
    let call = ScriptedCall::new("t1", &["s1"]);
    let sink = call.sink.clone();

    host.on_inbound_call(incoming(call));
    host.drain_pending().await;
    assert_eq!(host.remote_streams().len(), 1);

    let events = sink.lock().clone().unwrap();
    assert!(events.closed());
    assert!(events.stream_received("late", vec![MediaKind::Video]));
    host.drain_pending().await;

    assert!(host.remote_streams().is_empty());
    assert!(host.connections().is_empty());
    assert_eq!(host.phase(), SessionPhase::Idle);
}

#[tokio::test]
async fn test_same_transport_twice_is_refused() {
    let network = LoopbackNetwork::new();
    let mut host = session(&network);
    host.start().await.unwrap();

    host.on_inbound_call(incoming(ScriptedCall::new("shared", &["s1"])));
    host.on_inbound_call(incoming(ScriptedCall::new("shared", &["s2"])));
    host.drain_pending().await;

    assert_eq!(host.connections().len(), 1);
    assert_eq!(host.snapshot().remote_streams, vec!["s1".to_string()]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_remote_streams_are_unique_in_arrival_order(
        deliveries in prop::collection::vec(prop::collection::vec(0u8..6, 0..8), 1..4)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let shown = runtime.block_on(async {
            let network = LoopbackNetwork::new();
            let mut host = session(&network);
            host.start().await.unwrap();
            for (n, ids) in deliveries.iter().enumerate() {
                let names: Vec<String> = ids.iter().map(|i| format!("s{}", i)).collect();
                let refs: Vec<&str> = names.iter().map(String::as_str).collect();
                host.on_inbound_call(incoming(ScriptedCall::new(&format!("t{}", n), &refs)));
            }
            host.drain_pending().await;
            host.snapshot().remote_streams
        });

        let mut expected: Vec<String> = Vec::new();
        for id in deliveries.iter().flatten() {
            let name = format!("s{}", id);
            if !expected.contains(&name) {
                expected.push(name);
            }
        }
        prop_assert_eq!(shown, expected);
    }
}
