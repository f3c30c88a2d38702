//! Platform code pushing captured media into local sources.
//!
//! A capture kind is only bound when a feed for it is configured, so a call
//! never publishes a track nothing writes to.

use std::rc::Rc;

use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::video_source::native::NativeVideoSource;
use picall_core::{PicallError, TrackKind};

/// Keeps a running feed alive. Dropping it also stops the feed.
pub trait FeedGuard {
    fn stop(&mut self);
}

pub trait AudioFeed {
    /// Start writing microphone samples into `source`.
    fn start(&self, source: NativeAudioSource) -> Result<Box<dyn FeedGuard>, PicallError>;
}

pub trait VideoFeed {
    /// Start writing camera frames into `source`.
    fn start(&self, source: NativeVideoSource) -> Result<Box<dyn FeedGuard>, PicallError>;
}

/// Feeds available on this platform. The default has none.
#[derive(Clone, Default)]
pub struct CaptureFeeds {
    pub video: Option<Rc<dyn VideoFeed>>,
    pub audio: Option<Rc<dyn AudioFeed>>,
}

impl CaptureFeeds {
    pub fn provides(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Video => self.video.is_some(),
            TrackKind::Audio => self.audio.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Silence;

    impl AudioFeed for Silence {
        fn start(&self, _source: NativeAudioSource) -> Result<Box<dyn FeedGuard>, PicallError> {
            Err(PicallError::Media("not started in tests".into()))
        }
    }

    #[test]
    fn no_feeds_means_no_capture() {
        let feeds = CaptureFeeds::default();
        assert!(!feeds.provides(TrackKind::Video));
        assert!(!feeds.provides(TrackKind::Audio));
    }

    #[test]
    fn only_configured_kinds_are_provided() {
        let feeds = CaptureFeeds {
            video: None,
            audio: Some(Rc::new(Silence)),
        };
        assert!(feeds.provides(TrackKind::Audio));
        assert!(!feeds.provides(TrackKind::Video));
    }
}
