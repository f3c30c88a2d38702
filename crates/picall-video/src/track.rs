use async_trait::async_trait;
use futures_util::StreamExt;
use livekit::webrtc::prelude::RtcVideoTrack;
use livekit::webrtc::video_stream::native::NativeVideoStream;
use picall_core::{PicallError, VideoFrame, VideoTrack};

use crate::convert::I420Planes;

/// Frames of a WebRTC video track, converted to RGB.
pub struct LkVideoTrack {
    label: String,
    stream: NativeVideoStream,
}

impl LkVideoTrack {
    pub fn new(label: impl Into<String>, track: RtcVideoTrack) -> Self {
        Self {
            label: label.into(),
            stream: NativeVideoStream::new(track),
        }
    }
}

#[async_trait(?Send)]
impl VideoTrack for LkVideoTrack {
    async fn next_frame(&mut self) -> Result<Option<VideoFrame>, PicallError> {
        let Some(frame) = self.stream.next().await else {
            tracing::info!(track = %self.label, "video stream ended");
            return Ok(None);
        };

        // Native buffers are converted to I420 for plane access.
        let i420 = frame.buffer.to_i420();
        let (y, u, v) = i420.data();
        let (stride_y, stride_u, stride_v) = i420.strides();

        I420Planes {
            width: frame.buffer.width(),
            height: frame.buffer.height(),
            y,
            u,
            v,
            stride_y,
            stride_u,
            stride_v,
        }
        .to_rgb()
        .map(Some)
    }
}

impl Drop for LkVideoTrack {
    fn drop(&mut self) {
        self.stream.close();
    }
}
