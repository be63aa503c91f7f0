//! Signaling Message Contract
//!
//! The wire format exchanged between two call endpoints. The variant set and
//! field names are part of the protocol and must stay stable across versions
//! of the communicating endpoints.
//!
//! `participant` names the remote peer from the sender's point of view: the
//! target when sending, the originator when receiving. The transport is
//! responsible for routing and for per-participant delivery order.

use crate::ParticipantId;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single negotiation message for one (session, participant) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// SDP offer starting or renegotiating a peer connection.
    Offer {
        session: Uuid,
        participant: ParticipantId,
        sdp: String,
        timestamp: i64,
    },

    /// SDP answer completing an offer/answer exchange.
    Answer {
        session: Uuid,
        participant: ParticipantId,
        sdp: String,
        timestamp: i64,
    },

    /// ICE candidate, JSON-encoded as produced by the peer backend.
    IceCandidate {
        session: Uuid,
        participant: ParticipantId,
        candidate: String,
        timestamp: i64,
    },

    /// The sender is leaving the call.
    Bye {
        session: Uuid,
        participant: ParticipantId,
        timestamp: i64,
    },
}

impl SignalingMessage {
    pub fn offer(session: Uuid, participant: ParticipantId, sdp: String) -> Self {
        Self::Offer {
            session,
            participant,
            sdp,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn answer(session: Uuid, participant: ParticipantId, sdp: String) -> Self {
        Self::Answer {
            session,
            participant,
            sdp,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn ice_candidate(session: Uuid, participant: ParticipantId, candidate: String) -> Self {
        Self::IceCandidate {
            session,
            participant,
            candidate,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn bye(session: Uuid, participant: ParticipantId) -> Self {
        Self::Bye {
            session,
            participant,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Session the message belongs to.
    pub fn session(&self) -> Uuid {
        match self {
            Self::Offer { session, .. }
            | Self::Answer { session, .. }
            | Self::IceCandidate { session, .. }
            | Self::Bye { session, .. } => *session,
        }
    }

    /// Remote participant the message is to or from.
    pub fn participant(&self) -> &ParticipantId {
        match self {
            Self::Offer { participant, .. }
            | Self::Answer { participant, .. }
            | Self::IceCandidate { participant, .. }
            | Self::Bye { participant, .. } => participant,
        }
    }
}
