use std::collections::HashMap;
use std::rc::Rc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::errors::PicallError;
use crate::events::TrackKind;
use crate::interactive::{Surface, UiHandle};
use crate::renderer::{BoxVideoTrack, FrameRenderer};
use crate::signaling::Candidate;

/// Capture kinds bound when a session opens, in binding order.
const CAPTURE_KINDS: [TrackKind; 2] = [TrackKind::Video, TrackKind::Audio];

/// Events raised by a peer connection. WebRTC libraries fire these on their
/// own threads, so they travel to the network context over a channel.
pub enum PeerEvent {
    LocalCandidate(Candidate),
    RemoteTrack(RemoteTrack),
}

/// An inbound media track. Only video tracks carry a frame source.
pub struct RemoteTrack {
    pub kind: TrackKind,
    pub video: Option<BoxVideoTrack>,
}

/// Creates peer connections for the running platform.
pub trait MediaBackend {
    fn create_peer_connection(
        &self,
    ) -> Result<(Rc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), PicallError>;
}

#[async_trait(?Send)]
pub trait PeerConnection {
    /// Bind a local capture device and add its track. `Ok(None)` when the
    /// platform has no device of that kind.
    fn bind_capture(&self, kind: TrackKind) -> Result<Option<Box<dyn LocalCapture>>, PicallError>;

    async fn apply_answer(&self, sdp: &str) -> Result<(), PicallError>;

    async fn add_remote_candidate(&self, candidate: &Candidate) -> Result<(), PicallError>;

    fn close(&self) -> Result<(), PicallError>;
}

/// A local capture device bound to a peer connection.
pub trait LocalCapture {
    fn kind(&self) -> TrackKind;

    /// Preview of what is being sent, for video captures.
    fn preview(&mut self) -> Option<BoxVideoTrack>;

    fn stop(&mut self) -> Result<(), PicallError>;
}

/// Media resources of one call: the peer connection, local captures and
/// the renderers drawing local and remote video.
pub struct MediaSession {
    peer: Rc<dyn PeerConnection>,
    captures: HashMap<TrackKind, Box<dyn LocalCapture>>,
    local_preview: Option<FrameRenderer>,
    remote_renderers: HashMap<TrackKind, FrameRenderer>,
    event_pump: Option<JoinHandle<()>>,
    ui: UiHandle,
}

impl MediaSession {
    /// Create the peer connection and bind whatever capture devices exist.
    /// Only a failure to create the peer connection is fatal.
    pub fn open(
        backend: &dyn MediaBackend,
        ui: &UiHandle,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>), PicallError> {
        let (peer, events) = backend.create_peer_connection()?;

        let mut session = Self {
            peer,
            captures: HashMap::new(),
            local_preview: None,
            remote_renderers: HashMap::new(),
            event_pump: None,
            ui: ui.clone(),
        };

        for kind in CAPTURE_KINDS {
            match session.peer.bind_capture(kind) {
                Ok(Some(mut capture)) => {
                    if kind == TrackKind::Video {
                        if let Some(track) = capture.preview() {
                            session.local_preview =
                                Some(FrameRenderer::start(Surface::Local, track, ui.clone()));
                        }
                    }
                    tracing::info!(kind = ?kind, "local capture bound");
                    session.captures.insert(kind, capture);
                }
                Ok(None) => tracing::info!(kind = ?kind, "no capture device, continuing without"),
                Err(e) => tracing::warn!(kind = ?kind, "capture bind failed, continuing without: {e}"),
            }
        }

        Ok((session, events))
    }

    pub fn peer(&self) -> Rc<dyn PeerConnection> {
        self.peer.clone()
    }

    pub fn has_capture(&self, kind: TrackKind) -> bool {
        self.captures.contains_key(&kind)
    }

    /// The task forwarding this session's peer events; aborted on close.
    pub fn set_event_pump(&mut self, pump: JoinHandle<()>) {
        if let Some(old) = self.event_pump.replace(pump) {
            old.abort();
        }
    }

    /// Start rendering an inbound track, replacing any renderer of that kind.
    pub fn attach_remote(&mut self, track: RemoteTrack) {
        let Some(video) = track.video else {
            tracing::debug!(kind = ?track.kind, "remote track without frames, nothing to render");
            return;
        };
        if let Some(previous) = self.remote_renderers.remove(&track.kind) {
            tracing::info!(kind = ?track.kind, "replacing remote renderer");
            previous.cancel();
        }
        let renderer = FrameRenderer::start(Surface::Remote, video, self.ui.clone());
        self.remote_renderers.insert(track.kind, renderer);
    }

    /// Release everything. Each release is attempted even if another failed.
    pub async fn close(mut self) {
        if let Some(pump) = self.event_pump.take() {
            pump.abort();
        }

        if let Some(preview) = self.local_preview.take() {
            preview.stop().await;
        }
        for (_, renderer) in self.remote_renderers.drain() {
            renderer.stop().await;
        }

        for (kind, mut capture) in self.captures.drain() {
            if let Err(e) = capture.stop() {
                tracing::warn!(kind = ?kind, "failed to stop capture: {e}");
            }
        }

        if let Err(e) = self.peer.close() {
            tracing::warn!("failed to close peer connection: {e}");
        }
        tracing::info!("media session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeMedia, FakeTrack, MediaCall, ShellFixture};
    use tokio::task::LocalSet;

    #[tokio::test]
    async fn open_binds_available_devices_only() {
        let screen = ShellFixture::spawn();
        let media = FakeMedia::with_devices(&[TrackKind::Audio]);

        LocalSet::new()
            .run_until(async {
                let (session, _events) = MediaSession::open(&media, &screen.ui()).unwrap();
                assert!(session.has_capture(TrackKind::Audio));
                assert!(!session.has_capture(TrackKind::Video));
                assert!(session.local_preview.is_none());
                session.close().await;
            })
            .await;

        assert_eq!(
            media.calls(),
            vec![
                MediaCall::PeerCreated,
                MediaCall::CaptureBound(TrackKind::Audio),
                MediaCall::CaptureStopped(TrackKind::Audio),
                MediaCall::PeerClosed,
            ]
        );
        screen.shutdown();
    }

    #[tokio::test]
    async fn bind_failure_is_not_fatal() {
        let screen = ShellFixture::spawn();
        let media = FakeMedia::with_devices(&[TrackKind::Video, TrackKind::Audio]);
        media.fail_bind(TrackKind::Video);

        LocalSet::new()
            .run_until(async {
                let (session, _events) = MediaSession::open(&media, &screen.ui()).unwrap();
                assert!(!session.has_capture(TrackKind::Video));
                assert!(session.has_capture(TrackKind::Audio));
                session.close().await;
            })
            .await;
        screen.shutdown();
    }

    #[tokio::test]
    async fn peer_creation_failure_fails_open() {
        let screen = ShellFixture::spawn();
        let media = FakeMedia::with_devices(&[TrackKind::Video]);
        media.fail_create();

        LocalSet::new()
            .run_until(async {
                assert!(MediaSession::open(&media, &screen.ui()).is_err());
            })
            .await;
        assert!(media.calls().is_empty());
        screen.shutdown();
    }

    #[tokio::test]
    async fn new_remote_track_replaces_renderer_of_same_kind() {
        let screen = ShellFixture::spawn();
        let media = FakeMedia::with_devices(&[]);

        LocalSet::new()
            .run_until(async {
                let (mut session, _events) = MediaSession::open(&media, &screen.ui()).unwrap();
                let (_first_tx, first) = FakeTrack::channel_logged("first", media.log());
                let (_second_tx, second) = FakeTrack::channel_logged("second", media.log());

                session.attach_remote(RemoteTrack {
                    kind: TrackKind::Video,
                    video: Some(Box::new(first)),
                });
                session.attach_remote(RemoteTrack {
                    kind: TrackKind::Video,
                    video: Some(Box::new(second)),
                });
                tokio::task::yield_now().await;
                tokio::task::yield_now().await;

                assert!(media.calls().contains(&MediaCall::TrackDropped("first".into())));
                assert!(!media.calls().contains(&MediaCall::TrackDropped("second".into())));
                session.close().await;
                assert!(media.calls().contains(&MediaCall::TrackDropped("second".into())));
            })
            .await;
        screen.shutdown();
    }

    #[tokio::test]
    async fn close_continues_past_failures() {
        let screen = ShellFixture::spawn();
        let media = FakeMedia::with_devices(&[TrackKind::Video, TrackKind::Audio]);
        media.fail_stop(TrackKind::Video);
        media.fail_close();

        LocalSet::new()
            .run_until(async {
                let (session, _events) = MediaSession::open(&media, &screen.ui()).unwrap();
                session.close().await;
            })
            .await;

        let calls = media.calls();
        assert!(calls.contains(&MediaCall::CaptureStopped(TrackKind::Audio)));
        assert!(calls.contains(&MediaCall::PeerClosed));
        assert!(calls.contains(&MediaCall::TrackDropped("preview".into())));
        screen.shutdown();
    }
}
