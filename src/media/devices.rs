//! Device Platform - Microphone Capture via cpal
//!
//! Wraps the platform's audio/video acquisition primitives behind the
//! [`DevicePlatform`] trait. The built-in [`CpalPlatform`] provides real
//! microphone capture; camera and screen capture depend on windowing-system
//! integration the surrounding application has to supply.

use super::acquirer::TrackKind;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample rate (48kHz is the Opus standard)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (mono for voice)
pub const CHANNELS: u16 = 1;

/// Frame size in samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Capacity of the capture ring buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Permission to access the device was denied")]
    PermissionDenied,

    #[error("Capture picker was dismissed by the user")]
    UserCancelled,

    #[error("Capture is not available on this platform: {0}")]
    UnsupportedPlatform(String),
}

// ============================================================================
// DEVICE PLATFORM TRAIT
// ============================================================================

/// A running local capture stream.
///
/// Dropping the stream releases the underlying device handle. `set_enabled`
/// mutes the signal without tearing the stream down, so no renegotiation is
/// needed for mute toggles.
pub trait DeviceStream: Send {
    fn kind(&self) -> TrackKind;

    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;

    /// Whether the underlying device is still delivering. A dead stream
    /// stays owned until the session reacts to the loss.
    fn is_alive(&self) -> bool {
        true
    }
}

/// Platform layer exposing camera/microphone/display-capture primitives.
///
/// Acquisition may block on hardware or a permission prompt, so every method
/// is async and is never awaited on a session's control loop while signaling
/// for established participants is pending.
#[async_trait::async_trait]
pub trait DevicePlatform: Send + Sync {
    async fn open_microphone(&self) -> Result<Box<dyn DeviceStream>, MediaError>;

    async fn open_camera(&self) -> Result<Box<dyn DeviceStream>, MediaError>;

    async fn open_screen(&self) -> Result<Box<dyn DeviceStream>, MediaError>;
}

// ============================================================================
// CPAL PLATFORM
// ============================================================================

/// Default platform backed by cpal for microphone capture.
///
/// Camera and screen capture are not provided by cpal; those methods return
/// [`MediaError::UnsupportedPlatform`] and have to be supplied by a platform
/// integration implementing [`DevicePlatform`].
#[derive(Debug, Default)]
pub struct CpalPlatform;

impl CpalPlatform {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl DevicePlatform for CpalPlatform {
    async fn open_microphone(&self) -> Result<Box<dyn DeviceStream>, MediaError> {
        // cpal device enumeration can block, keep it off the async workers
        let mic = tokio::task::spawn_blocking(CpalMicrophone::open)
            .await
            .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))??;
        Ok(Box::new(mic))
    }

    async fn open_camera(&self) -> Result<Box<dyn DeviceStream>, MediaError> {
        Err(MediaError::UnsupportedPlatform(
            "camera capture requires a platform integration".to_string(),
        ))
    }

    async fn open_screen(&self) -> Result<Box<dyn DeviceStream>, MediaError> {
        Err(MediaError::UnsupportedPlatform(
            "display capture requires a platform integration".to_string(),
        ))
    }
}

// ============================================================================
// MICROPHONE CAPTURE
// ============================================================================

/// Running microphone capture stream.
///
/// Captured PCM is resampled to 48kHz and written into a ring buffer that a
/// media pipeline drains frame by frame via [`CpalMicrophone::read_frame`].
///
/// Note: cpal's `Stream` is not `Send`, so we assert it manually; the stream
/// is only ever dropped, never driven, from other threads.
pub struct CpalMicrophone {
    _stream: Stream,
    enabled: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,
}

unsafe impl Send for CpalMicrophone {}

impl CpalMicrophone {
    /// Opens the default input device and starts capturing.
    pub fn open() -> Result<Self, MediaError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| MediaError::DeviceUnavailable("no input device found".to_string()))?;

        let config = find_best_input_config(&device)?;

        tracing::info!(
            "Starting microphone capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let enabled = Arc::new(AtomicBool::new(true));
        let failed = Arc::new(AtomicBool::new(false));
        let capture_buffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));

        let enabled_clone = Arc::clone(&enabled);
        let failed_clone = Arc::clone(&failed);
        let buffer_clone = Arc::clone(&capture_buffer);
        let source_sample_rate = config.sample_rate.0;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Muted means the track exists but carries silence
                    if !enabled_clone.load(Ordering::Relaxed) {
                        return;
                    }

                    let samples = resample_linear(data, source_sample_rate, SAMPLE_RATE);

                    let mut buffer = buffer_clone.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
                },
                move |err| {
                    // e.g. the device was unplugged; the session ends the
                    // call once it notices
                    tracing::error!("Microphone capture error: {}", err);
                    failed_clone.store(true, Ordering::Relaxed);
                },
                None,
            )
            .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;

        stream
            .play()
            .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            enabled,
            failed,
            capture_buffer,
        })
    }

    /// Reads one 20ms frame of captured audio, if enough samples are buffered.
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.capture_buffer.lock();
        if buffer.occupied_len() >= FRAME_SIZE {
            let mut frame = Vec::with_capacity(FRAME_SIZE);
            for _ in 0..FRAME_SIZE {
                if let Some(sample) = buffer.try_pop() {
                    frame.push(sample);
                }
            }
            Some(frame)
        } else {
            None
        }
    }
}

impl DeviceStream for CpalMicrophone {
    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        tracing::debug!("Microphone enabled: {}", enabled);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn is_alive(&self) -> bool {
        !self.failed.load(Ordering::Relaxed)
    }
}

// ============================================================================
// CONFIG SELECTION
// ============================================================================

/// Finds the best input configuration for a device.
fn find_best_input_config(device: &Device) -> Result<StreamConfig, MediaError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Picks a configuration from the supported list.
///
/// Priority: exact 48kHz F32, then any F32 rate, then whatever the device
/// offers first.
fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
) -> Result<StreamConfig, MediaError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    for config in &configs {
        if config.min_sample_rate() <= target_rate
            && config.max_sample_rate() >= target_rate
            && config.sample_format() == SampleFormat::F32
        {
            return Ok(config.with_sample_rate(target_rate).into());
        }
    }

    for config in &configs {
        if config.sample_format() == SampleFormat::F32 {
            let rate = if config.min_sample_rate() <= target_rate
                && config.max_sample_rate() >= target_rate
            {
                target_rate
            } else {
                config.max_sample_rate()
            };
            return Ok(config.with_sample_rate(rate).into());
        }
    }

    if let Some(config) = configs.first() {
        return Ok(config.with_max_sample_rate().into());
    }

    Err(MediaError::DeviceUnavailable(
        "no suitable audio configuration found".to_string(),
    ))
}

/// Linear resampling between sample rates. Identity when rates match.
fn resample_linear(data: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate {
        return data.to_vec();
    }

    let ratio = to_rate as f32 / from_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}
