//! Frame pull loop: track frames in, JPEG images out to a display surface.

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, Rgb};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bridge::CancelSignal;
use crate::errors::PicallError;
use crate::interactive::{Surface, UiHandle};

/// JPEG quality used for displayed frames.
const JPEG_QUALITY: u8 = 60;

/// A decoded frame in packed RGB24.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

/// An encoded image ready for a display surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayImage {
    pub width: u32,
    pub height: u32,
    pub jpeg: Vec<u8>,
}

impl DisplayImage {
    pub fn encode(frame: &VideoFrame) -> Result<Self, PicallError> {
        let expected = frame.width as usize * frame.height as usize * 3;
        if frame.rgb.len() != expected {
            return Err(PicallError::Media(format!(
                "frame buffer is {} bytes, expected {expected} for {}x{}",
                frame.rgb.len(),
                frame.width,
                frame.height
            )));
        }

        let img: ImageBuffer<Rgb<u8>, &[u8]> =
            ImageBuffer::from_raw(frame.width, frame.height, frame.rgb.as_slice())
                .ok_or_else(|| PicallError::Media("frame buffer size mismatch".into()))?;

        let mut jpeg = Vec::with_capacity(expected / 4);
        JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
            .encode_image(&img)
            .map_err(|e| PicallError::Media(format!("jpeg encode: {e}")))?;

        Ok(Self {
            width: frame.width,
            height: frame.height,
            jpeg,
        })
    }
}

/// Source of video frames.
#[async_trait(?Send)]
pub trait VideoTrack {
    /// `Ok(None)` once the track has ended; `Err` for any other pull failure.
    async fn next_frame(&mut self) -> Result<Option<VideoFrame>, PicallError>;
}

pub type BoxVideoTrack = Box<dyn VideoTrack + Send>;

/// Why a frame loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderExit {
    Cancelled,
    TrackEnded,
    PullFailed,
    DisplayClosed,
}

/// Handle to a running frame loop. Must be started from within a `LocalSet`.
pub struct FrameRenderer {
    surface: Surface,
    cancel_tx: watch::Sender<bool>,
    handle: JoinHandle<RenderExit>,
}

impl FrameRenderer {
    pub fn start(surface: Surface, track: BoxVideoTrack, ui: UiHandle) -> Self {
        let (cancel_tx, cancel) = CancelSignal::pair();
        let handle = tokio::task::spawn_local(frame_loop(surface, track, ui, cancel));
        Self {
            surface,
            cancel_tx,
            handle,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal cancellation without waiting; the loop exits at its next
    /// suspension point.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    /// Cancel and wait for the loop to observe it.
    pub async fn stop(self) -> RenderExit {
        self.cancel();
        match self.handle.await {
            Ok(exit) => exit,
            Err(e) => {
                tracing::warn!(surface = ?self.surface, "frame loop aborted: {e}");
                RenderExit::PullFailed
            }
        }
    }
}

async fn frame_loop(
    surface: Surface,
    mut track: BoxVideoTrack,
    ui: UiHandle,
    mut cancel: CancelSignal,
) -> RenderExit {
    tracing::info!(surface = ?surface, "frame loop started");
    let mut frames: u64 = 0;

    let exit = loop {
        let pulled = tokio::select! {
            biased;
            _ = cancel.cancelled() => break RenderExit::Cancelled,
            pulled = track.next_frame() => pulled,
        };

        let frame = match pulled {
            Ok(Some(frame)) => frame,
            Ok(None) => break RenderExit::TrackEnded,
            Err(e) => {
                tracing::warn!(surface = ?surface, "frame pull failed, stopping renderer: {e}");
                break RenderExit::PullFailed;
            }
        };

        let image = match DisplayImage::encode(&frame) {
            Ok(image) => image,
            Err(e) => {
                tracing::debug!(surface = ?surface, "skipping frame: {e}");
                continue;
            }
        };

        if cancel.is_cancelled() {
            break RenderExit::Cancelled;
        }
        frames += 1;
        if frames == 1 {
            tracing::info!(surface = ?surface, width = image.width, height = image.height, "first video frame");
        }
        if ui.show_frame(surface, image).await.is_err() {
            break RenderExit::DisplayClosed;
        }
    };

    tracing::info!(surface = ?surface, frames, exit = ?exit, "frame loop exited");
    exit
}
