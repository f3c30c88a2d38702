//! WebRTC media for picall.
//!
//! Implements the core media seams on top of LiveKit's libwebrtc bindings:
//! peer connections, local capture sources, and remote video tracks whose
//! I420 frames are converted to RGB for display.

mod capture;
mod convert;
mod feed;
mod peer;
mod track;

pub use capture::LkCapture;
pub use convert::I420Planes;
pub use feed::{AudioFeed, CaptureFeeds, FeedGuard, VideoFeed};
pub use peer::{LkMediaBackend, LkPeerConnection};
pub use track::LkVideoTrack;
