//! Huddle - Multi-Party Call Session Engine
//!
//! A call session manager with signaling-driven peer-connection lifecycle:
//! - Local media acquisition (microphone, camera, screen capture)
//! - One negotiated peer connection per remote participant
//! - Live audio/video/screen-share toggling without dropping the call
//! - Typed event channel for asynchronous state changes
//!
//! The session runs as a single control loop per call. Commands from the
//! consumer and inbound signaling messages are serialized through one queue,
//! so per-participant negotiation state is never mutated concurrently.
//! Multiple sessions may run side by side; they share no state.

pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;

pub use media::{
    CallKind, CpalPlatform, DevicePlatform, DeviceStream, MediaAcquirer, MediaError, TrackKind,
    TrackSet,
};
pub use peer::{PeerConnector, PeerError, PeerEvent, PeerHandle, RemoteStream, RtcConnector};
pub use session::{
    CallConfig, CallEvent, CallHandle, CallSession, CallState, EndReason, SessionError,
    SessionErrorKind,
};
pub use signaling::{SignalingError, SignalingMessage, SignalingTransport, WsSignaling};

/// Identifier of a remote call participant.
///
/// Assigned by the surrounding application (e.g. the signaling server's peer
/// id); the engine treats it as an opaque key.
pub type ParticipantId = String;

/// Initializes logging for binaries embedding the engine.
///
/// Respects `RUST_LOG`; defaults to debug output for the engine and warnings
/// from the webrtc stack.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("huddle=debug".parse().unwrap())
                .add_directive("webrtc=warn".parse().unwrap()),
        )
        .init();
}
