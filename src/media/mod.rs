//! Media Module - Local Device Acquisition
//!
//! This module manages the local side of a call:
//! - Acquiring and releasing microphone, camera and screen-capture streams
//! - Per-track enabled flags (mute / video-off without stream teardown)
//! - A platform trait so device access can be swapped out per target

mod acquirer;
mod devices;

pub use acquirer::{CallKind, MediaAcquirer, TrackKind, TrackSet};
pub use devices::{CpalPlatform, DevicePlatform, DeviceStream, MediaError, FRAME_SIZE, SAMPLE_RATE};
