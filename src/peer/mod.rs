//! Peer Module - Point-to-Point Connection Primitive
//!
//! Abstraction over the underlying media connection to one remote
//! participant:
//! - [`PeerConnector`] creates connection handles
//! - [`PeerHandle`] drives offer/answer exchange and the local track set
//! - [`PeerEvent`] feeds backend notifications into the session loop
//!
//! The default implementation is [`RtcConnector`] over webrtc-rs; tests and
//! alternative stacks plug in their own connector.

mod rtc;

pub use rtc::{default_ice_servers, RtcConnector};

use crate::media::{TrackKind, TrackSet};
use crate::ParticipantId;
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum PeerError {
    #[error("Participant '{0}' already has a connection")]
    DuplicateParticipant(ParticipantId),

    #[error("Answer from '{0}' without an outstanding offer")]
    UnexpectedAnswer(ParticipantId),

    #[error("Negotiation with '{0}' timed out")]
    NegotiationTimeout(ParticipantId),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Peer backend error: {0}")]
    Backend(String),
}

// ============================================================================
// BACKEND EVENTS
// ============================================================================

/// Opaque handle to one remote media stream.
///
/// The connection backend decides the concrete payload; a consumer that
/// knows its backend downcasts to it (`TrackRemote` for the webrtc-rs
/// backend) to read and render the media. The session layer never looks
/// inside, it only passes the handle along with the stream notification.
#[derive(Clone)]
pub struct RemoteStream {
    inner: Arc<dyn Any + Send + Sync>,
}

impl RemoteStream {
    pub fn new<T: Any + Send + Sync>(inner: Arc<T>) -> Self {
        Self { inner }
    }

    /// The backend's concrete stream object, if `T` matches.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.inner).downcast().ok()
    }
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RemoteStream")
    }
}

/// Asynchronous notifications from a connection backend.
///
/// Delivered on the channel passed to [`PeerConnector::connect`]; the session
/// funnels them into its control loop.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A remote media track started arriving.
    RemoteTrack {
        participant: ParticipantId,
        kind: TrackKind,
        stream: RemoteStream,
    },

    /// The backend produced a local ICE candidate to signal to the peer.
    LocalCandidate {
        participant: ParticipantId,
        candidate: String,
    },

    /// The connection was closed or failed on the transport level.
    Closed { participant: ParticipantId },
}

// ============================================================================
// CONNECTION TRAITS
// ============================================================================

/// Factory for per-participant connection handles.
#[async_trait::async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        participant: &ParticipantId,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerHandle>, PeerError>;
}

/// The negotiated connection to one remote participant.
///
/// Local media streams are shared read-only across all handles that attach
/// them; a handle never enables, disables or releases the underlying device.
#[async_trait::async_trait]
pub trait PeerHandle: Send + Sync {
    /// Reconciles the attached local tracks with `tracks`.
    async fn set_local_tracks(&self, tracks: TrackSet) -> Result<(), PeerError>;

    /// Creates an offer and installs it as the local description.
    async fn create_offer(&self) -> Result<String, PeerError>;

    /// Applies a remote offer and returns the local answer.
    ///
    /// May be called while an offer of our own is outstanding (crossed
    /// offers); implementations must discard their own offer first.
    async fn accept_offer(&self, sdp: String) -> Result<String, PeerError>;

    /// Applies the remote answer to a previously created offer.
    async fn accept_answer(&self, sdp: String) -> Result<(), PeerError>;

    /// Applies a remote ICE candidate.
    async fn add_candidate(&self, candidate: String) -> Result<(), PeerError>;

    /// Tears the connection down. Infallible; errors are logged.
    async fn close(&self);
}
