//! WebRTC peer connections backed by LiveKit's libwebrtc bindings.

use std::rc::Rc;

use async_trait::async_trait;
use livekit::webrtc::ice_candidate::IceCandidate;
use livekit::webrtc::peer_connection::PeerConnection;
use livekit::webrtc::peer_connection_factory::{
    ContinualGatheringPolicy, IceServer, IceTransportsType, PeerConnectionFactory,
    RtcConfiguration,
};
use livekit::webrtc::prelude::*;
use livekit::webrtc::session_description::{SdpType, SessionDescription};
use picall_core::{
    Candidate, LocalCapture, MediaBackend, PeerConnection as CorePeer, PeerEvent, PicallError,
    RemoteTrack, TrackKind,
};
use tokio::sync::mpsc;

use crate::capture::LkCapture;
use crate::feed::CaptureFeeds;
use crate::track::LkVideoTrack;

pub struct LkMediaBackend {
    factory: PeerConnectionFactory,
    ice_servers: Vec<String>,
    feeds: CaptureFeeds,
}

impl LkMediaBackend {
    pub fn new(ice_servers: Vec<String>, feeds: CaptureFeeds) -> Self {
        Self {
            factory: PeerConnectionFactory::default(),
            ice_servers,
            feeds,
        }
    }

    fn configuration(&self) -> RtcConfiguration {
        RtcConfiguration {
            ice_servers: vec![IceServer {
                urls: self.ice_servers.clone(),
                username: String::new(),
                password: String::new(),
            }],
            continual_gathering_policy: ContinualGatheringPolicy::GatherOnce,
            ice_transport_type: IceTransportsType::All,
        }
    }
}

impl MediaBackend for LkMediaBackend {
    fn create_peer_connection(
        &self,
    ) -> Result<(Rc<dyn CorePeer>, mpsc::UnboundedReceiver<PeerEvent>), PicallError> {
        let pc = self
            .factory
            .create_peer_connection(self.configuration())
            .map_err(|e| PicallError::Media(format!("create peer connection: {e}")))?;

        // Callbacks fire on libwebrtc threads; the receiver lives on the
        // network context.
        let (tx, rx) = mpsc::unbounded_channel();

        let candidates = tx.clone();
        pc.on_ice_candidate(Some(Box::new(move |ice: IceCandidate| {
            let candidate = Candidate::new(
                &ice.candidate(),
                Some(ice.sdp_mid()),
                u32::try_from(ice.sdp_mline_index()).ok(),
            );
            let _ = candidates.send(PeerEvent::LocalCandidate(candidate));
        })));

        let tracks = tx;
        pc.on_track(Some(Box::new(move |event: TrackEvent| {
            let remote = match event.track {
                MediaStreamTrack::Video(video) => RemoteTrack {
                    kind: TrackKind::Video,
                    video: Some(Box::new(LkVideoTrack::new("remote", video))),
                },
                MediaStreamTrack::Audio(_) => RemoteTrack {
                    kind: TrackKind::Audio,
                    video: None,
                },
            };
            tracing::info!(kind = ?remote.kind, "remote track received");
            let _ = tracks.send(PeerEvent::RemoteTrack(remote));
        })));

        tracing::info!("peer connection created");
        let peer = LkPeerConnection {
            pc,
            factory: self.factory.clone(),
            feeds: self.feeds.clone(),
        };
        Ok((Rc::new(peer), rx))
    }
}

pub struct LkPeerConnection {
    pc: PeerConnection,
    factory: PeerConnectionFactory,
    feeds: CaptureFeeds,
}

#[async_trait(?Send)]
impl CorePeer for LkPeerConnection {
    fn bind_capture(&self, kind: TrackKind) -> Result<Option<Box<dyn LocalCapture>>, PicallError> {
        if !self.feeds.provides(kind) {
            return Ok(None);
        }
        let capture = LkCapture::bind(&self.factory, &self.pc, &self.feeds, kind)?;
        Ok(capture.map(|c| Box::new(c) as Box<dyn LocalCapture>))
    }

    async fn apply_answer(&self, sdp: &str) -> Result<(), PicallError> {
        let desc = SessionDescription::parse(sdp, SdpType::Answer)
            .map_err(|e| PicallError::Signaling(format!("parse answer: {e:?}")))?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| PicallError::Media(format!("set remote description: {e}")))
    }

    async fn add_remote_candidate(&self, candidate: &Candidate) -> Result<(), PicallError> {
        let mid = candidate.media_id().unwrap_or_default();
        let index = candidate.sdp_mline_index.unwrap_or(0) as i32;
        let ice = IceCandidate::parse(mid, index, &candidate.candidate)
            .map_err(|e| PicallError::Signaling(format!("parse candidate: {e:?}")))?;
        self.pc
            .add_ice_candidate(ice)
            .await
            .map_err(|e| PicallError::Media(format!("add ice candidate: {e}")))
    }

    fn close(&self) -> Result<(), PicallError> {
        self.pc.on_ice_candidate(None);
        self.pc.on_track(None);
        self.pc.close();
        tracing::info!("peer connection closed");
        Ok(())
    }
}
