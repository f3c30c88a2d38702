//! Local capture sources bound to a peer connection.

use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::peer_connection::PeerConnection;
use livekit::webrtc::peer_connection_factory::PeerConnectionFactory;
use livekit::webrtc::prelude::*;
use livekit::webrtc::video_source::native::NativeVideoSource;
use picall_core::{BoxVideoTrack, LocalCapture, PicallError, TrackKind};

use crate::feed::{CaptureFeeds, FeedGuard};
use crate::track::LkVideoTrack;

const AUDIO_SAMPLE_RATE: u32 = 48_000;
const AUDIO_CHANNELS: u32 = 1;
const AUDIO_QUEUE_SIZE_MS: u32 = 100;

const VIDEO_WIDTH: u32 = 1280;
const VIDEO_HEIGHT: u32 = 720;

/// Stream id shared by every local track of a call.
const STREAM_ID: &str = "picall";

enum Source {
    Video(RtcVideoTrack),
    Audio(RtcAudioTrack),
}

pub struct LkCapture {
    source: Source,
    feed: Box<dyn FeedGuard>,
    pc: PeerConnection,
    sender: Option<RtpSender>,
}

impl LkCapture {
    /// Create a source of `kind`, start its feed, wrap it in a track and add
    /// it to `pc`. `Ok(None)` when no feed exists for `kind`.
    pub(crate) fn bind(
        factory: &PeerConnectionFactory,
        pc: &PeerConnection,
        feeds: &CaptureFeeds,
        kind: TrackKind,
    ) -> Result<Option<Self>, PicallError> {
        let (source, feed, track) = match (kind, &feeds.video, &feeds.audio) {
            (TrackKind::Video, Some(video), _) => {
                let source = NativeVideoSource::new(
                    VideoResolution {
                        width: VIDEO_WIDTH,
                        height: VIDEO_HEIGHT,
                    },
                    false,
                );
                let feed = video.start(source.clone())?;
                let track =
                    factory.create_video_track("camera", RtcVideoSource::Native(source));
                let media = MediaStreamTrack::Video(track.clone());
                (Source::Video(track), feed, media)
            }
            (TrackKind::Audio, _, Some(audio)) => {
                let source = NativeAudioSource::new(
                    AudioSourceOptions {
                        echo_cancellation: true,
                        noise_suppression: true,
                        auto_gain_control: true,
                    },
                    AUDIO_SAMPLE_RATE,
                    AUDIO_CHANNELS,
                    AUDIO_QUEUE_SIZE_MS,
                );
                let feed = audio.start(source.clone())?;
                let track =
                    factory.create_audio_track("microphone", RtcAudioSource::Native(source));
                let media = MediaStreamTrack::Audio(track.clone());
                (Source::Audio(track), feed, media)
            }
            _ => return Ok(None),
        };

        // On failure the feed guard is dropped here, which stops it.
        let sender = pc
            .add_track(track, &[STREAM_ID])
            .map_err(|e| PicallError::Media(format!("add {kind:?} track: {e}")))?;

        Ok(Some(Self {
            source,
            feed,
            pc: pc.clone(),
            sender: Some(sender),
        }))
    }
}

impl LocalCapture for LkCapture {
    fn kind(&self) -> TrackKind {
        match self.source {
            Source::Video(_) => TrackKind::Video,
            Source::Audio(_) => TrackKind::Audio,
        }
    }

    fn preview(&mut self) -> Option<BoxVideoTrack> {
        match &self.source {
            Source::Video(track) => Some(Box::new(LkVideoTrack::new("local", track.clone()))),
            Source::Audio(_) => None,
        }
    }

    fn stop(&mut self) -> Result<(), PicallError> {
        self.feed.stop();
        match &self.source {
            Source::Video(track) => track.set_enabled(false),
            Source::Audio(track) => track.set_enabled(false),
        };
        let Some(sender) = self.sender.take() else {
            return Ok(());
        };
        self.pc
            .remove_track(sender)
            .map_err(|e| PicallError::Media(format!("remove {:?} track: {e}", self.kind())))
    }
}
