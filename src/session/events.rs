//! Call Events and States
//!
//! Typed notifications delivered to the consumer. Internal state transitions
//! are decoupled from presentation: subscribers get a broadcast receiver and
//! never hand callbacks into the engine.

use crate::media::{MediaError, TrackKind};
use crate::peer::{PeerError, RemoteStream};
use crate::ParticipantId;
use tokio::sync::broadcast;

// ============================================================================
// CALL STATE
// ============================================================================

/// Lifecycle of a call session. `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Created, not started.
    Idle,
    /// Media acquired, participants contacted, no link stable yet.
    Connecting,
    /// At least one peer link reached stable; survives participant churn.
    Active,
    /// Terminated; all resources released.
    Ended,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Local `end_call`.
    Hangup,
    /// The last remote participant left.
    AllParticipantsLeft,
    /// Microphone or camera was lost mid-call.
    MediaFailure,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Errors surfaced through the event channel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionErrorKind {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Peer(#[from] PeerError),
}

/// Asynchronous notifications emitted by a call session.
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),

    /// A remote track started arriving. Emitted at most once per
    /// (participant, kind) pair for the lifetime of that link. The stream
    /// handle is the consumer's way to read and render the media.
    StreamAdded {
        participant: ParticipantId,
        kind: TrackKind,
        stream: RemoteStream,
    },

    /// A participant's link was torn down.
    StreamRemoved { participant: ParticipantId },

    /// The session terminated. Emitted exactly once.
    CallEnded { reason: EndReason },

    /// A recoverable error, scoped to one participant when known.
    Error {
        error: SessionErrorKind,
        participant: Option<ParticipantId>,
    },
}

// ============================================================================
// EVENT DISPATCHER
// ============================================================================

/// Fan-out of call events to any number of subscribers.
///
/// Sending never blocks the control loop; subscribers that fall behind see
/// a lagged error on their receiver, not backpressure on the session.
#[derive(Clone)]
pub struct EventDispatcher {
    tx: broadcast::Sender<CallEvent>,
}

impl EventDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: CallEvent) {
        tracing::debug!("Event: {:?}", event);
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}
