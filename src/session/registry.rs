//! Peer Connection Registry
//!
//! Owns one [`PeerLink`] per remote participant and mediates creation,
//! renegotiation and teardown. Enforces the negotiation lock: a link must be
//! stable before the next renegotiation offer goes out, and renegotiation
//! requests arriving in flight are coalesced into a single offer carrying the
//! latest track set.

use crate::media::{TrackKind, TrackSet};
use crate::peer::{PeerConnector, PeerError, PeerEvent, PeerHandle, RemoteStream};
use crate::session::events::{CallEvent, EventDispatcher};
use crate::signaling::{SignalingMessage, SignalingTransport};
use crate::ParticipantId;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

// ============================================================================
// PEER LINK
// ============================================================================

/// Offer/answer progress of one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

/// The negotiated connection state for one remote participant.
struct PeerLink {
    handle: Arc<dyn PeerHandle>,
    negotiation: NegotiationState,
    /// Renegotiation requested while an exchange was in flight.
    pending_renegotiation: bool,
    /// Candidates arriving before the remote description queue here.
    remote_desc_set: bool,
    queued_candidates: Vec<String>,
    /// Track set carried by the last offer we sent.
    offered_tracks: TrackSet,
    /// Dedupe for stream-added: one notification per (participant, kind).
    announced: HashSet<TrackKind>,
    /// Set while an offer of ours is unanswered, for timeout sweeps.
    offer_sent_at: Option<Instant>,
}

impl PeerLink {
    fn new(handle: Arc<dyn PeerHandle>, tracks: TrackSet) -> Self {
        Self {
            handle,
            negotiation: NegotiationState::Stable,
            pending_renegotiation: false,
            remote_desc_set: false,
            queued_candidates: Vec::new(),
            offered_tracks: tracks,
            announced: HashSet::new(),
            offer_sent_at: None,
        }
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// One connection object per remote participant, keyed by participant id.
pub struct PeerRegistry {
    session_id: Uuid,
    links: BTreeMap<ParticipantId, PeerLink>,
    connector: Arc<dyn PeerConnector>,
    transport: Arc<dyn SignalingTransport>,
    events: EventDispatcher,
    peer_events: mpsc::Sender<PeerEvent>,
}

impl PeerRegistry {
    pub fn new(
        session_id: Uuid,
        connector: Arc<dyn PeerConnector>,
        transport: Arc<dyn SignalingTransport>,
        events: EventDispatcher,
        peer_events: mpsc::Sender<PeerEvent>,
    ) -> Self {
        Self {
            session_id,
            links: BTreeMap::new(),
            connector,
            transport,
            events,
            peer_events,
        }
    }

    /// Creates a link, attaches the current local tracks and sends the
    /// initial offer.
    pub async fn add_participant(
        &mut self,
        id: &ParticipantId,
        tracks: TrackSet,
    ) -> Result<(), PeerError> {
        if self.links.contains_key(id) {
            return Err(PeerError::DuplicateParticipant(id.clone()));
        }

        let handle = self
            .connector
            .connect(id, self.peer_events.clone())
            .await?;
        if let Err(e) = handle.set_local_tracks(tracks).await {
            handle.close().await;
            return Err(e);
        }
        let sdp = match handle.create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                handle.close().await;
                return Err(e);
            }
        };

        let mut link = PeerLink::new(handle, tracks);
        link.negotiation = NegotiationState::HaveLocalOffer;
        link.offer_sent_at = Some(Instant::now());
        self.links.insert(id.clone(), link);

        tracing::info!("Added participant '{}', offering {}", id, tracks);
        if let Err(e) = self
            .send(SignalingMessage::offer(self.session_id, id.clone(), sdp))
            .await
        {
            // A failed contact must not leave a half-created link behind
            if let Some(link) = self.links.remove(id) {
                link.handle.close().await;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Applies a remote offer, creating the link if this is the first
    /// contact, and sends back an answer.
    pub async fn handle_offer(
        &mut self,
        id: &ParticipantId,
        sdp: String,
        tracks: TrackSet,
    ) -> Result<(), PeerError> {
        if !self.links.contains_key(id) {
            let handle = self
                .connector
                .connect(id, self.peer_events.clone())
                .await?;
            handle.set_local_tracks(tracks).await?;
            self.links.insert(id.clone(), PeerLink::new(handle, tracks));
            tracing::info!("Participant '{}' joined via offer", id);
        }

        let handle = {
            let Some(link) = self.links.get_mut(id) else {
                return Ok(());
            };
            if link.negotiation == NegotiationState::HaveLocalOffer {
                // Glare: our offer crossed theirs. Yield, answer their offer,
                // and re-offer our track set once the link is stable again.
                tracing::warn!("Offer glare with '{}', answering first", id);
                link.pending_renegotiation = true;
            }
            link.negotiation = NegotiationState::HaveRemoteOffer;
            Arc::clone(&link.handle)
        };

        let answer_sdp = handle.accept_offer(sdp).await?;

        if let Some(link) = self.links.get_mut(id) {
            link.remote_desc_set = true;
            link.negotiation = NegotiationState::Stable;
            link.offer_sent_at = None;
        }

        self.flush_candidates(id).await?;
        self.send(SignalingMessage::answer(
            self.session_id,
            id.clone(),
            answer_sdp,
        ))
        .await?;
        self.finish_stable(id, tracks).await
    }

    /// Applies a remote answer to an outstanding offer.
    ///
    /// Answers without a matching offer are logged and dropped; the peer is
    /// renegotiating against stale state and will be re-offered if needed.
    pub async fn handle_answer(
        &mut self,
        id: &ParticipantId,
        sdp: String,
        tracks: TrackSet,
    ) -> Result<(), PeerError> {
        let handle = {
            let Some(link) = self.links.get_mut(id) else {
                tracing::warn!("Answer from unknown participant '{}', dropping", id);
                return Ok(());
            };
            if link.negotiation != NegotiationState::HaveLocalOffer {
                tracing::warn!("{}", PeerError::UnexpectedAnswer(id.clone()));
                return Ok(());
            }
            Arc::clone(&link.handle)
        };

        handle.accept_answer(sdp).await?;

        if let Some(link) = self.links.get_mut(id) {
            link.remote_desc_set = true;
            link.negotiation = NegotiationState::Stable;
            link.offer_sent_at = None;
        }

        self.flush_candidates(id).await?;
        self.finish_stable(id, tracks).await
    }

    /// Applies a remote candidate, or queues it until the remote description
    /// is in place.
    pub async fn handle_candidate(
        &mut self,
        id: &ParticipantId,
        candidate: String,
    ) -> Result<(), PeerError> {
        let handle = {
            let Some(link) = self.links.get_mut(id) else {
                tracing::warn!("Candidate for unknown participant '{}', dropping", id);
                return Ok(());
            };
            if !link.remote_desc_set {
                link.queued_candidates.push(candidate);
                return Ok(());
            }
            Arc::clone(&link.handle)
        };

        handle.add_candidate(candidate).await
    }

    /// Sends a fresh offer if the link is stable, otherwise marks the link
    /// for renegotiation once the in-flight exchange completes.
    ///
    /// Returns whether an offer actually went out.
    pub async fn renegotiate(
        &mut self,
        id: &ParticipantId,
        tracks: TrackSet,
    ) -> Result<bool, PeerError> {
        let handle = {
            let Some(link) = self.links.get_mut(id) else {
                return Ok(false);
            };
            if link.negotiation != NegotiationState::Stable {
                link.pending_renegotiation = true;
                return Ok(false);
            }
            if link.offered_tracks == tracks {
                // Coalesced requests cancelled out, nothing to renegotiate
                return Ok(false);
            }
            Arc::clone(&link.handle)
        };

        handle.set_local_tracks(tracks).await?;
        let sdp = handle.create_offer().await?;

        if let Some(link) = self.links.get_mut(id) {
            link.negotiation = NegotiationState::HaveLocalOffer;
            link.offer_sent_at = Some(Instant::now());
            link.offered_tracks = tracks;
            link.pending_renegotiation = false;
        }

        tracing::info!("Renegotiating with '{}', offering {}", id, tracks);
        self.send(SignalingMessage::offer(self.session_id, id.clone(), sdp))
            .await?;
        Ok(true)
    }

    /// Renegotiates every link after a local track-set change. Failures are
    /// recovered per participant: the failing link is torn down, the rest of
    /// the call continues.
    pub async fn renegotiate_all(&mut self, tracks: TrackSet) -> usize {
        let ids: Vec<ParticipantId> = self.links.keys().cloned().collect();
        let mut offers_sent = 0;
        for id in ids {
            match self.renegotiate(&id, tracks).await {
                Ok(true) => offers_sent += 1,
                Ok(false) => {}
                Err(e) => self.fail_participant(&id, e).await,
            }
        }
        offers_sent
    }

    /// Tears down a link, emitting `StreamRemoved`.
    pub async fn remove_participant(&mut self, id: &ParticipantId) -> bool {
        match self.links.remove(id) {
            Some(link) => {
                link.handle.close().await;
                self.events.emit(CallEvent::StreamRemoved {
                    participant: id.clone(),
                });
                tracing::info!("Removed participant '{}'", id);
                true
            }
            None => false,
        }
    }

    /// Tears down every link (session end).
    pub async fn remove_all(&mut self) {
        let ids: Vec<ParticipantId> = self.links.keys().cloned().collect();
        for id in ids {
            self.remove_participant(&id).await;
        }
    }

    /// Local recovery for a per-participant error: surface it and drop the
    /// link, leaving the rest of the session untouched.
    pub async fn fail_participant(&mut self, id: &ParticipantId, error: PeerError) {
        tracing::warn!("Participant '{}' failed: {}", id, error);
        self.events.emit(CallEvent::Error {
            error: error.into(),
            participant: Some(id.clone()),
        });
        self.remove_participant(id).await;
    }

    /// Emits `StreamAdded` for a newly arriving remote track, once per
    /// (participant, kind) for the lifetime of the link. The backend's
    /// stream handle travels along for the consumer to render.
    pub fn on_remote_track(&mut self, id: &ParticipantId, kind: TrackKind, stream: RemoteStream) {
        let Some(link) = self.links.get_mut(id) else {
            return;
        };
        if link.announced.insert(kind) {
            self.events.emit(CallEvent::StreamAdded {
                participant: id.clone(),
                kind,
                stream,
            });
        }
    }

    /// Tears down links whose offer has been unanswered for longer than
    /// `timeout`. Returns the affected participants.
    pub async fn sweep_timeouts(&mut self, timeout: Duration) -> Vec<ParticipantId> {
        let expired: Vec<ParticipantId> = self
            .links
            .iter()
            .filter(|(_, link)| {
                link.negotiation == NegotiationState::HaveLocalOffer
                    && link
                        .offer_sent_at
                        .map(|sent| sent.elapsed() >= timeout)
                        .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            self.fail_participant(id, PeerError::NegotiationTimeout(id.clone()))
                .await;
        }
        expired
    }

    pub fn any_stable(&self) -> bool {
        self.links
            .values()
            .any(|l| l.negotiation == NegotiationState::Stable)
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn participants(&self) -> Vec<ParticipantId> {
        self.links.keys().cloned().collect()
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Consumes a pending renegotiation once a link reaches stable. The
    /// offer carries the track set current *now*, so coalesced requests
    /// collapse into one exchange.
    async fn finish_stable(&mut self, id: &ParticipantId, tracks: TrackSet) -> Result<(), PeerError> {
        let pending = self
            .links
            .get(id)
            .map(|l| l.pending_renegotiation)
            .unwrap_or(false);
        if pending {
            self.renegotiate(id, tracks).await?;
        }
        Ok(())
    }

    /// Applies candidates queued before the remote description was set.
    async fn flush_candidates(&mut self, id: &ParticipantId) -> Result<(), PeerError> {
        let (handle, queued) = {
            let Some(link) = self.links.get_mut(id) else {
                return Ok(());
            };
            (Arc::clone(&link.handle), std::mem::take(&mut link.queued_candidates))
        };
        for candidate in queued {
            handle.add_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn send(&self, msg: SignalingMessage) -> Result<(), PeerError> {
        self.transport
            .send(msg)
            .await
            .map_err(|e| PeerError::Backend(format!("signaling: {e}")))
    }
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("session_id", &self.session_id)
            .field("participants", &self.participants())
            .finish()
    }
}
