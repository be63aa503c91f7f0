//! Media Acquirer - Owns Local Streams and Enabled Flags
//!
//! One acquirer per call session. Holds the camera, microphone and
//! screen-capture streams for the lifetime of the call and enforces the
//! resource rules: streams are only released when the session terminates or
//! the corresponding feature is explicitly turned off, and mute / video-off
//! only flip the track's enabled flag.

use super::devices::{DevicePlatform, DeviceStream, MediaError};
use std::sync::Arc;

// ============================================================================
// TRACK TYPES
// ============================================================================

/// Kind of a call: audio-only or audio + camera video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Audio,
    Video,
}

/// A single local media component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
    Screen,
}

impl TrackKind {
    pub const ALL: [TrackKind; 3] = [TrackKind::Audio, TrackKind::Video, TrackKind::Screen];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
            TrackKind::Screen => "screen",
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of local track kinds currently sent to peers.
///
/// Derived from which streams are acquired, not from their enabled flags;
/// a muted microphone still counts as a sent track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackSet {
    pub audio: bool,
    pub video: bool,
    pub screen: bool,
}

impl TrackSet {
    pub fn contains(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.audio,
            TrackKind::Video => self.video,
            TrackKind::Screen => self.screen,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.audio && !self.video && !self.screen
    }

    pub fn kinds(&self) -> impl Iterator<Item = TrackKind> + '_ {
        TrackKind::ALL.into_iter().filter(|k| self.contains(*k))
    }
}

impl std::fmt::Display for TrackSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for kind in self.kinds() {
            if !first {
                f.write_str("+")?;
            }
            f.write_str(kind.as_str())?;
            first = false;
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

// ============================================================================
// MEDIA ACQUIRER
// ============================================================================

/// Acquires and owns the local streams of one call session.
pub struct MediaAcquirer {
    platform: Arc<dyn DevicePlatform>,
    microphone: Option<Box<dyn DeviceStream>>,
    camera: Option<Box<dyn DeviceStream>>,
    screen: Option<Box<dyn DeviceStream>>,
    audio_enabled: bool,
    video_enabled: bool,
}

impl MediaAcquirer {
    pub fn new(platform: Arc<dyn DevicePlatform>) -> Self {
        Self {
            platform,
            microphone: None,
            camera: None,
            screen: None,
            audio_enabled: true,
            video_enabled: true,
        }
    }

    /// Access to the underlying platform, for acquisitions that have to run
    /// off the session's control loop.
    pub fn platform(&self) -> Arc<dyn DevicePlatform> {
        Arc::clone(&self.platform)
    }

    /// Acquires microphone (always) and camera (video calls).
    ///
    /// Idempotent: already-acquired streams are kept as-is and not requested
    /// again. If the camera of a video call fails after the microphone was
    /// freshly acquired, the microphone is released again so a failed start
    /// leaves no device handles behind.
    pub async fn acquire(&mut self, kind: CallKind) -> Result<(), MediaError> {
        let mic_was_acquired = self.microphone.is_some();

        if self.microphone.is_none() {
            let stream = self.platform.open_microphone().await?;
            stream.set_enabled(self.audio_enabled);
            self.microphone = Some(stream);
            tracing::info!("Microphone acquired");
        }

        if kind == CallKind::Video && self.camera.is_none() {
            match self.platform.open_camera().await {
                Ok(stream) => {
                    stream.set_enabled(self.video_enabled);
                    self.camera = Some(stream);
                    tracing::info!("Camera acquired");
                }
                Err(e) => {
                    if !mic_was_acquired {
                        self.release(TrackKind::Audio);
                    }
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Acquires the display-capture stream. Idempotent.
    pub async fn acquire_screen(&mut self) -> Result<(), MediaError> {
        if self.screen.is_some() {
            return Ok(());
        }
        let stream = self.platform.open_screen().await?;
        self.adopt_screen(stream);
        Ok(())
    }

    /// Takes ownership of an already-acquired screen stream.
    ///
    /// Used when the acquisition ran as a detached task so the control loop
    /// was not stalled by the platform picker.
    pub fn adopt_screen(&mut self, stream: Box<dyn DeviceStream>) {
        if self.screen.is_some() {
            tracing::warn!("Screen stream already present, dropping duplicate");
            return;
        }
        self.screen = Some(stream);
        tracing::info!("Screen capture acquired");
    }

    /// Flips a track's enabled flag and returns the resulting state.
    ///
    /// Pure flag toggle: the stream keeps running, only the carried signal
    /// changes, so no renegotiation is required.
    pub fn toggle(&mut self, kind: TrackKind) -> bool {
        let enabled = !self.is_enabled(kind);
        self.set_track_enabled(kind, enabled);
        enabled
    }

    /// Sets a track's enabled flag without tearing down the stream.
    pub fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool) {
        match kind {
            TrackKind::Audio => {
                self.audio_enabled = enabled;
                if let Some(stream) = &self.microphone {
                    stream.set_enabled(enabled);
                }
            }
            TrackKind::Video => {
                self.video_enabled = enabled;
                if let Some(stream) = &self.camera {
                    stream.set_enabled(enabled);
                }
            }
            // Screen capture is either running or released, never muted
            TrackKind::Screen => {}
        }
        tracing::debug!("Track {} enabled: {}", kind, enabled);
    }

    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.audio_enabled && self.microphone.is_some(),
            TrackKind::Video => self.video_enabled && self.camera.is_some(),
            TrackKind::Screen => self.screen.is_some(),
        }
    }

    /// Stops and frees the device handle behind one track kind.
    pub fn release(&mut self, kind: TrackKind) {
        let released = match kind {
            TrackKind::Audio => self.microphone.take().is_some(),
            TrackKind::Video => self.camera.take().is_some(),
            TrackKind::Screen => self.screen.take().is_some(),
        };
        if released {
            tracing::info!("Released {} stream", kind);
        }
    }

    /// Frees all device handles. Runs on every session exit path.
    pub fn release_all(&mut self) {
        for kind in TrackKind::ALL {
            self.release(kind);
        }
    }

    /// The first acquired stream whose device stopped delivering, if any.
    pub fn failed_track(&self) -> Option<TrackKind> {
        [
            (TrackKind::Audio, &self.microphone),
            (TrackKind::Video, &self.camera),
            (TrackKind::Screen, &self.screen),
        ]
        .into_iter()
        .find(|(_, stream)| {
            stream
                .as_ref()
                .map(|s| !s.is_alive())
                .unwrap_or(false)
        })
        .map(|(kind, _)| kind)
    }

    /// The set of acquired track kinds, independent of enabled flags.
    pub fn active_tracks(&self) -> TrackSet {
        TrackSet {
            audio: self.microphone.is_some(),
            video: self.camera.is_some(),
            screen: self.screen.is_some(),
        }
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }
}

impl std::fmt::Debug for MediaAcquirer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaAcquirer")
            .field("tracks", &self.active_tracks())
            .field("audio_enabled", &self.audio_enabled)
            .field("video_enabled", &self.video_enabled)
            .finish()
    }
}
