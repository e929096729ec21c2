//! Outgoing video source switching
//!
//! Screen sharing swaps the track behind each connection's existing video
//! sender instead of renegotiating. The switcher applies the swap to every
//! live connection and republishes the local stream so what is shown locally
//! matches what is sent.

use crate::call::ConnectionRegistry;
use crate::media::{DeviceError, LocalMediaController, LocalStream, MediaDevices, MediaTrack};
use crate::transport::TrackReplaceError;
use crate::types::MediaKind;

/// Outcome of a track switch across connections
#[derive(Debug, Default)]
pub struct SwitchReport {
    /// Live connections visited
    pub connections: usize,
    /// Tracks replaced successfully
    pub replaced: usize,
    /// Replacements skipped because the connection has no sender of that kind
    pub skipped: usize,
    /// Per-connection failures; the switch went ahead on the others
    pub failures: Vec<TrackReplaceError>,
}

impl SwitchReport {
    /// Whether every attempted replacement succeeded
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Camera/screen switch over every live connection
pub struct TrackSwitcher;

impl TrackSwitcher {
    /// Send `screen`'s video track instead of the camera
    ///
    /// The camera video track is disabled, not stopped, and the camera stream
    /// is parked in the controller. The published stream becomes the existing
    /// audio plus the screen track.
    ///
    /// # Errors
    ///
    /// Returns error if `screen` has no live video track; the screen stream
    /// is released and nothing else changes
    pub fn switch_to_screen<D: MediaDevices>(
        media: &mut LocalMediaController<D>,
        registry: &ConnectionRegistry,
        screen: LocalStream,
    ) -> Result<SwitchReport, DeviceError> {
        let screen_track = match screen.video_track() {
            Some(track) if track.is_live() => track.clone(),
            _ => {
                LocalMediaController::<D>::release(&screen);
                return Err(DeviceError::MissingTrack(MediaKind::Video));
            }
        };

        let report = Self::replace_on_all(registry, &[(MediaKind::Video, &screen_track)]);

        let current = media.local_stream().cloned();
        let published = match &current {
            Some(stream) => stream.with_video(screen_track),
            None => LocalStream::new(None, Some(screen_track))?,
        };
        media.set_track_enabled(MediaKind::Video, false);
        let previous = media.publish(published);

        // A previous screen stream means the camera is already parked.
        match media.set_screen(screen) {
            Some(old_screen) => {
                LocalMediaController::<D>::release(&old_screen);
            }
            None => {
                if let Some(camera) = previous {
                    if let Some(stale) = media.park_camera(camera) {
                        LocalMediaController::<D>::release(&stale);
                    }
                }
            }
        }

        tracing::info!(
            connections = report.connections,
            replaced = report.replaced,
            skipped = report.skipped,
            failed = report.failures.len(),
            "Switched outgoing video to screen"
        );
        Ok(report)
    }

    /// Send `camera`'s tracks and publish it as the local stream
    ///
    /// Both video and audio are replaced so a stale audio track can't keep
    /// flowing. The screen stream and the parked camera stream are released,
    /// except for tracks `camera` itself carries.
    pub fn switch_to_camera<D: MediaDevices>(
        media: &mut LocalMediaController<D>,
        registry: &ConnectionRegistry,
        camera: LocalStream,
    ) -> SwitchReport {
        let replacements: Vec<(MediaKind, &MediaTrack)> = camera
            .tracks()
            .filter(|track| track.is_live())
            .map(|track| (track.kind(), track))
            .collect();
        let report = Self::replace_on_all(registry, &replacements);

        let previous = media.publish(camera.clone());
        let leftovers = [previous, media.take_screen(), media.take_parked_camera()];
        for stream in leftovers.iter().flatten() {
            LocalMediaController::<D>::release_except(stream, &camera);
        }

        tracing::info!(
            connections = report.connections,
            replaced = report.replaced,
            skipped = report.skipped,
            failed = report.failures.len(),
            "Switched outgoing video to camera"
        );
        report
    }

    fn replace_on_all(
        registry: &ConnectionRegistry,
        replacements: &[(MediaKind, &MediaTrack)],
    ) -> SwitchReport {
        let mut report = SwitchReport::default();
        registry.for_each_live(|connection| {
            report.connections += 1;
            let transport = connection.transport();
            for (kind, track) in replacements {
                if !transport.has_sender(*kind) {
                    tracing::debug!(
                        connection_id = %connection.id(),
                        kind = %kind,
                        "No sender for track kind, skipping"
                    );
                    report.skipped += 1;
                    continue;
                }
                match transport.replace_outgoing_track(*kind, track) {
                    Ok(()) => report.replaced += 1,
                    Err(source) => {
                        let error = TrackReplaceError {
                            connection: connection.id(),
                            kind: *kind,
                            source,
                        };
                        tracing::warn!(error = %error, "Track replacement failed");
                        report.failures.push(error);
                    }
                }
            }
        });
        report
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::call::Connection;
    use crate::identity::PeerId;
    use crate::loopback::SyntheticDevices;
    use crate::transport::{PeerTransport, TransportError};
    use crate::types::{ConnectionId, Direction, TrackSource};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Sent {
        replacements: Vec<(MediaKind, MediaTrack)>,
    }

    struct RecordingTransport {
        id: String,
        video_sender: bool,
        fail: bool,
        sent: Arc<Mutex<Sent>>,
    }

    impl PeerTransport for RecordingTransport {
        fn transport_id(&self) -> &str {
            &self.id
        }

        fn has_sender(&self, kind: MediaKind) -> bool {
            kind == MediaKind::Audio || self.video_sender
        }

        fn replace_outgoing_track(
            &self,
            kind: MediaKind,
            track: &MediaTrack,
        ) -> Result<(), TransportError> {
            self.sent.lock().replacements.push((kind, track.clone()));
            if self.fail {
                Err(TransportError::Rejected("sender gone".to_string()))
            } else {
                Ok(())
            }
        }

        fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn add(
        registry: &mut ConnectionRegistry,
        name: &str,
        video_sender: bool,
        fail: bool,
    ) -> Arc<Mutex<Sent>> {
        let sent = Arc::new(Mutex::new(Sent::default()));
        let transport = RecordingTransport {
            id: name.to_string(),
            video_sender,
            fail,
            sent: sent.clone(),
        };
        registry
            .register(Connection::new(
                ConnectionId::new(),
                Some(PeerId::new(name)),
                Direction::Outbound,
                Box::new(transport),
            ))
            .unwrap();
        sent
    }

    async fn controller_with_camera() -> (LocalMediaController<SyntheticDevices>, LocalStream) {
        let mut media = LocalMediaController::new(Arc::new(SyntheticDevices::new()));
        let camera = media.acquire_camera_and_mic().await.unwrap();
        media.publish(camera.clone());
        (media, camera)
    }

    #[tokio::test]
    async fn test_switch_to_screen_replaces_once_per_connection() {
        let (mut media, camera) = controller_with_camera().await;
        let mut registry = ConnectionRegistry::new();
        let sends: Vec<_> = (0..3)
            .map(|i| add(&mut registry, &format!("peer-{i}"), true, false))
            .collect();

        let screen = media.acquire_screen().await.unwrap();
        let screen_track = screen.video_track().unwrap().clone();
        let report = TrackSwitcher::switch_to_screen(&mut media, &registry, screen).unwrap();

        assert_eq!(report.connections, 3);
        assert_eq!(report.replaced, 3);
        for sent in sends {
            let sent = sent.lock();
            assert_eq!(sent.replacements.len(), 1);
            assert_eq!(sent.replacements[0], (MediaKind::Video, screen_track.clone()));
        }

        let published = media.local_stream().unwrap();
        assert!(published.is_screen());
        assert_eq!(published.audio_track(), camera.audio_track());

        let camera_video = camera.video_track().unwrap();
        assert!(!camera_video.is_enabled());
        assert!(camera_video.is_live());
        assert_eq!(media.parked_camera().unwrap().id(), camera.id());
    }

    #[tokio::test]
    async fn test_failed_connection_does_not_block_others() {
        let (mut media, _camera) = controller_with_camera().await;
        let mut registry = ConnectionRegistry::new();
        let ok_a = add(&mut registry, "a", true, false);
        let broken = add(&mut registry, "b", true, true);
        let ok_c = add(&mut registry, "c", true, false);

        let screen = media.acquire_screen().await.unwrap();
        let report = TrackSwitcher::switch_to_screen(&mut media, &registry, screen).unwrap();

        assert_eq!(report.replaced, 2);
        assert_eq!(report.failures.len(), 1);
        assert!(!report.is_complete());
        assert_eq!(ok_a.lock().replacements.len(), 1);
        assert_eq!(broken.lock().replacements.len(), 1);
        assert_eq!(ok_c.lock().replacements.len(), 1);
        assert!(media.local_stream().unwrap().is_screen());
    }

    #[tokio::test]
    async fn test_connection_without_video_sender_is_skipped() {
        let (mut media, _camera) = controller_with_camera().await;
        let mut registry = ConnectionRegistry::new();
        let audio_only = add(&mut registry, "audio-only", false, false);

        let screen = media.acquire_screen().await.unwrap();
        let report = TrackSwitcher::switch_to_screen(&mut media, &registry, screen).unwrap();

        assert_eq!(report.skipped, 1);
        assert!(report.is_complete());
        assert!(audio_only.lock().replacements.is_empty());
    }

    #[tokio::test]
    async fn test_ended_screen_track_is_never_broadcast() {
        let (mut media, camera) = controller_with_camera().await;
        let mut registry = ConnectionRegistry::new();
        let sent = add(&mut registry, "peer", true, false);

        let screen = media.acquire_screen().await.unwrap();
        screen.video_track().unwrap().end();
        let err = TrackSwitcher::switch_to_screen(&mut media, &registry, screen).unwrap_err();

        assert_eq!(err, DeviceError::MissingTrack(MediaKind::Video));
        assert!(sent.lock().replacements.is_empty());
        assert_eq!(media.local_stream().unwrap().id(), camera.id());
        assert!(camera.video_track().unwrap().is_enabled());
    }

    #[tokio::test]
    async fn test_switch_to_camera_replaces_audio_and_video() {
        let (mut media, old_camera) = controller_with_camera().await;
        let mut registry = ConnectionRegistry::new();
        let sent = add(&mut registry, "peer", true, false);

        let screen = media.acquire_screen().await.unwrap();
        let screen_track = screen.video_track().unwrap().clone();
        TrackSwitcher::switch_to_screen(&mut media, &registry, screen).unwrap();

        let fresh = media.acquire_camera_and_mic().await.unwrap();
        let report = TrackSwitcher::switch_to_camera(&mut media, &registry, fresh.clone());

        assert_eq!(report.replaced, 2);
        let kinds: Vec<MediaKind> = sent.lock().replacements[1..]
            .iter()
            .map(|(kind, _)| *kind)
            .collect();
        assert_eq!(kinds, vec![MediaKind::Audio, MediaKind::Video]);

        let published = media.local_stream().unwrap();
        assert_eq!(published.id(), fresh.id());
        assert_eq!(
            published.video_track().unwrap().source(),
            TrackSource::Camera
        );
        assert!(!screen_track.is_live());
        assert!(old_camera.is_released());
        assert!(media.screen_stream().is_none());
        assert!(media.parked_camera().is_none());
        assert!(fresh.tracks().all(MediaTrack::is_live));
    }

    #[tokio::test]
    async fn test_switch_back_to_parked_camera_keeps_its_tracks() {
        let (mut media, camera) = controller_with_camera().await;
        let registry = ConnectionRegistry::new();

        let screen = media.acquire_screen().await.unwrap();
        TrackSwitcher::switch_to_screen(&mut media, &registry, screen).unwrap();

        let parked = media.take_parked_camera().unwrap();
        TrackSwitcher::switch_to_camera(&mut media, &registry, parked);

        assert!(camera.tracks().all(MediaTrack::is_live));
        assert!(media.screen_stream().is_none());
        assert_eq!(media.local_stream().unwrap().id(), camera.id());
    }
}
