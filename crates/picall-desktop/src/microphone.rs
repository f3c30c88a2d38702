use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use livekit::webrtc::audio_frame::AudioFrame;
use livekit::webrtc::audio_source::native::NativeAudioSource;
use picall_core::PicallError;
use picall_video::{AudioFeed, FeedGuard};

/// Rate and layout libwebrtc expects from the audio source.
const SOURCE_SAMPLE_RATE: u32 = 48_000;
const SOURCE_CHANNELS: u32 = 1;

/// Default input device of the default cpal host.
pub struct Microphone;

impl Microphone {
    /// `None` when the host has no input device.
    pub fn detect() -> Option<Self> {
        cpal::default_host().default_input_device().map(|_| Microphone)
    }
}

impl AudioFeed for Microphone {
    fn start(&self, source: NativeAudioSource) -> Result<Box<dyn FeedGuard>, PicallError> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| PicallError::Media("no input audio device available".into()))?;
        let default_cfg = device
            .default_input_config()
            .map_err(|e| PicallError::Media(format!("default input config: {e}")))?;

        let device_rate = default_cfg.sample_rate().0;
        let device_channels = default_cfg.channels();
        tracing::info!(
            device = ?device.name(),
            rate = device_rate,
            channels = device_channels,
            "starting microphone capture"
        );

        let config = cpal::StreamConfig {
            channels: device_channels,
            sample_rate: cpal::SampleRate(device_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let running = Arc::new(AtomicBool::new(true));
        let running_flag = running.clone();

        // capture_frame is async and the cpal callback is not.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| PicallError::Media(format!("microphone runtime: {e}")))?;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if !running_flag.load(Ordering::Relaxed) {
                        return;
                    }
                    let pcm = downmix(data, device_channels as usize, device_rate);
                    if pcm.is_empty() {
                        return;
                    }
                    let frame = AudioFrame {
                        samples_per_channel: pcm.len() as u32,
                        data: pcm.into(),
                        sample_rate: SOURCE_SAMPLE_RATE,
                        num_channels: SOURCE_CHANNELS,
                    };
                    let _ = rt.block_on(source.capture_frame(&frame));
                },
                |err| tracing::error!("microphone stream error: {err}"),
                None,
            )
            .map_err(|e| PicallError::Media(format!("build input stream: {e}")))?;
        stream
            .play()
            .map_err(|e| PicallError::Media(format!("play input stream: {e}")))?;

        Ok(Box::new(MicrophoneFeed {
            stream: Some(stream),
            running,
        }))
    }
}

struct MicrophoneFeed {
    stream: Option<cpal::Stream>,
    running: Arc<AtomicBool>,
}

impl FeedGuard for MicrophoneFeed {
    fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if self.stream.take().is_some() {
            tracing::info!("microphone capture stopped");
        }
    }
}

impl Drop for MicrophoneFeed {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Interleaved f32 device samples to 48 kHz mono i16, by channel averaging
/// and nearest-sample rate conversion.
fn downmix(data: &[f32], channels: usize, device_rate: u32) -> Vec<i16> {
    if channels == 0 || device_rate == 0 {
        return Vec::new();
    }
    let device_frames = data.len() / channels;
    if device_frames == 0 {
        return Vec::new();
    }
    let out_frames = if device_rate == SOURCE_SAMPLE_RATE {
        device_frames
    } else {
        ((device_frames as u64 * SOURCE_SAMPLE_RATE as u64 / device_rate as u64) as usize).max(1)
    };

    (0..out_frames)
        .map(|i| {
            let src = (i as u64 * device_frames as u64 / out_frames as u64) as usize;
            let frame = &data[src.min(device_frames - 1) * channels..][..channels];
            let mono = frame.iter().sum::<f32>() / channels as f32;
            (mono * 32767.0).clamp(-32768.0, 32767.0) as i16
        })
        .collect()
}
