//! WebRTC Connection Backend
//!
//! Default [`PeerConnector`] over webrtc-rs. One `RTCPeerConnection` per
//! remote participant; local tracks are created once per kind and shared
//! across all connections of the session.

use super::{PeerConnector, PeerError, PeerEvent, PeerHandle, RemoteStream};
use crate::media::{TrackKind, TrackSet, SAMPLE_RATE};
use crate::ParticipantId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Default STUN server configuration.
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        ..Default::default()
    }]
}

// ============================================================================
// CONNECTOR
// ============================================================================

type SharedLocalTracks = Arc<Mutex<HashMap<TrackKind, Arc<TrackLocalStaticRTP>>>>;

/// Creates webrtc-rs peer connections sharing one local track per kind.
pub struct RtcConnector {
    ice_servers: Vec<RTCIceServer>,
    local_tracks: SharedLocalTracks,
}

impl RtcConnector {
    pub fn new() -> Self {
        Self::with_ice_servers(default_ice_servers())
    }

    pub fn with_ice_servers(ice_servers: Vec<RTCIceServer>) -> Self {
        Self {
            ice_servers,
            local_tracks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Adds TURN server credentials on top of the defaults.
    pub fn add_turn_server(&mut self, url: String, username: String, credential: String) {
        self.ice_servers.push(RTCIceServer {
            urls: vec![url],
            username,
            credential,
            ..Default::default()
        });
    }

    async fn build_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(backend_err)?;

        // Interceptors for RTCP, NACK etc.
        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(backend_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(backend_err)?);
        Ok(pc)
    }
}

impl Default for RtcConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        participant: &ParticipantId,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerHandle>, PeerError> {
        let pc = self.build_peer_connection().await?;

        register_handlers(&pc, participant.clone(), events);

        Ok(Arc::new(RtcPeer {
            participant: participant.clone(),
            pc,
            local_tracks: Arc::clone(&self.local_tracks),
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

/// Registers backend event handlers forwarding into the session loop.
fn register_handlers(
    pc: &Arc<RTCPeerConnection>,
    participant: ParticipantId,
    events: mpsc::Sender<PeerEvent>,
) {
    // Connection state: surface transport-level teardown
    let events_clone = events.clone();
    let participant_clone = participant.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state for '{}': {:?}", participant_clone, s);

        let closed = matches!(
            s,
            RTCPeerConnectionState::Disconnected
                | RTCPeerConnectionState::Failed
                | RTCPeerConnectionState::Closed
        );

        let events = events_clone.clone();
        let participant = participant_clone.clone();
        Box::pin(async move {
            if closed {
                let _ = events.send(PeerEvent::Closed { participant }).await;
            }
        })
    }));

    // ICE candidates: hand back for signaling to the remote side
    let events_clone = events.clone();
    let participant_clone = participant.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let events = events_clone.clone();
        let participant = participant_clone.clone();
        Box::pin(async move {
            if let Some(c) = candidate {
                if let Ok(json) = c.to_json() {
                    if let Ok(candidate_str) = serde_json::to_string(&json) {
                        let _ = events
                            .send(PeerEvent::LocalCandidate {
                                participant,
                                candidate: candidate_str,
                            })
                            .await;
                    }
                }
            }
        })
    }));

    // Remote tracks. Screen shares arrive as video tracks; the wire does
    // not distinguish them, so they are reported as video.
    pc.on_track(Box::new(move |track, _, _| {
        let events = events.clone();
        let participant = participant.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            tracing::info!("Received {} track from '{}'", kind, participant);
            let _ = events
                .send(PeerEvent::RemoteTrack {
                    participant,
                    kind,
                    stream: RemoteStream::new(track),
                })
                .await;
        })
    }));
}

// ============================================================================
// PEER HANDLE
// ============================================================================

struct RtcPeer {
    participant: ParticipantId,
    pc: Arc<RTCPeerConnection>,
    local_tracks: SharedLocalTracks,
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
}

impl RtcPeer {
    /// Returns the session-wide shared local track for a kind, creating it
    /// on first use.
    fn shared_track(&self, kind: TrackKind) -> Arc<TrackLocalStaticRTP> {
        let mut tracks = self.local_tracks.lock();
        Arc::clone(tracks.entry(kind).or_insert_with(|| {
            let (mime, clock_rate, channels) = match kind {
                TrackKind::Audio => (MIME_TYPE_OPUS, SAMPLE_RATE, 1),
                TrackKind::Video | TrackKind::Screen => (MIME_TYPE_VP8, 90000, 0),
            };
            Arc::new(TrackLocalStaticRTP::new(
                RTCRtpCodecCapability {
                    mime_type: mime.to_string(),
                    clock_rate,
                    channels,
                    ..Default::default()
                },
                kind.as_str().to_string(),
                match kind {
                    TrackKind::Screen => "screen".to_string(),
                    _ => "camera".to_string(),
                },
            ))
        }))
    }
}

#[async_trait::async_trait]
impl PeerHandle for RtcPeer {
    async fn set_local_tracks(&self, tracks: TrackSet) -> Result<(), PeerError> {
        for kind in TrackKind::ALL {
            let wanted = tracks.contains(kind);
            let attached = self.senders.lock().contains_key(&kind);

            if wanted && !attached {
                let track = self.shared_track(kind);
                let sender = self
                    .pc
                    .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(backend_err)?;
                self.senders.lock().insert(kind, sender);
                tracing::debug!("Attached {} track for '{}'", kind, self.participant);
            } else if !wanted && attached {
                let sender = self.senders.lock().remove(&kind);
                if let Some(sender) = sender {
                    self.pc.remove_track(&sender).await.map_err(backend_err)?;
                    tracing::debug!("Detached {} track for '{}'", kind, self.participant);
                }
            }
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(backend_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(backend_err)?;
        Ok(offer.sdp)
    }

    async fn accept_offer(&self, sdp: String) -> Result<String, PeerError> {
        let offer =
            RTCSessionDescription::offer(sdp).map_err(|e| PeerError::InvalidSdp(e.to_string()))?;

        // Crossed offers: an unanswered offer of ours has to be rolled back
        // before the remote one can be applied, the W3C state machine does
        // not allow a remote offer in have-local-offer.
        if self.pc.signaling_state() == RTCSignalingState::HaveLocalOffer {
            tracing::debug!("Rolling back local offer for '{}'", self.participant);
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            self.pc
                .set_local_description(rollback)
                .await
                .map_err(backend_err)?;
        }

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(backend_err)?;

        let answer = self.pc.create_answer(None).await.map_err(backend_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(backend_err)?;
        Ok(answer.sdp)
    }

    async fn accept_answer(&self, sdp: String) -> Result<(), PeerError> {
        let answer =
            RTCSessionDescription::answer(sdp).map_err(|e| PeerError::InvalidSdp(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(backend_err)
    }

    async fn add_candidate(&self, candidate: String) -> Result<(), PeerError> {
        let candidate: RTCIceCandidateInit =
            serde_json::from_str(&candidate).map_err(|e| PeerError::Backend(e.to_string()))?;
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(backend_err)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Error closing connection to '{}': {}", self.participant, e);
        }
    }
}

fn backend_err(e: webrtc::Error) -> PeerError {
    PeerError::Backend(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_only() -> TrackSet {
        TrackSet {
            audio: true,
            video: false,
            screen: false,
        }
    }

    async fn handle_for(id: &str, events: mpsc::Sender<PeerEvent>) -> Arc<dyn PeerHandle> {
        // No ICE servers: offer/answer exchange needs no network
        RtcConnector::with_ice_servers(vec![])
            .connect(&id.to_string(), events)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_crossed_offers_roll_back_and_answer() {
        let (tx, _rx) = mpsc::channel(16);
        let a = handle_for("a", tx.clone()).await;
        let b = handle_for("b", tx).await;
        a.set_local_tracks(audio_only()).await.unwrap();
        b.set_local_tracks(audio_only()).await.unwrap();

        // Both sides offer at the same time
        let offer_a = a.create_offer().await.unwrap();
        let _offer_b = b.create_offer().await.unwrap();

        // The yielding side discards its own offer and answers instead of
        // failing on the invalid state transition
        let answer_b = b.accept_offer(offer_a).await.unwrap();
        a.accept_answer(answer_b).await.unwrap();

        a.close().await;
        b.close().await;
    }
}
