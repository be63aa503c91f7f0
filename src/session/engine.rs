//! Call Session - State Machine and Control Loop
//!
//! One [`CallSession`] per call. All state transitions, local operations and
//! inbound signaling alike, are serialized through a single command loop, so
//! per-participant negotiation state and local media are never mutated
//! concurrently. Sessions are independent of each other and share nothing.

use crate::media::{
    CallKind, DevicePlatform, DeviceStream, MediaAcquirer, MediaError, TrackKind,
};
use crate::peer::{PeerConnector, PeerError, PeerEvent};
use crate::session::events::{CallEvent, CallState, EndReason, EventDispatcher};
use crate::session::registry::PeerRegistry;
use crate::signaling::{SignalingMessage, SignalingTransport};
use crate::ParticipantId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(&'static str),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error("Session already terminated")]
    Terminated,
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Tunables of one call session.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// How long an offer may stay unanswered before the link is torn down.
    pub negotiation_timeout: Duration,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Granularity of the duration counter and timeout sweep.
    pub tick_interval: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(15),
            event_capacity: 100,
            tick_interval: Duration::from_secs(1),
        }
    }
}

// ============================================================================
// COMMANDS
// ============================================================================

enum Command {
    Start {
        kind: CallKind,
        participants: Vec<ParticipantId>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    ToggleAudio {
        reply: oneshot::Sender<bool>,
    },
    ToggleVideo {
        reply: oneshot::Sender<bool>,
    },
    StartScreenShare {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    StopScreenShare {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    EndCall {
        reply: oneshot::Sender<()>,
    },
    Signal(SignalingMessage),
}

/// Completions of work that ran off the control loop.
enum Internal {
    ScreenAcquired(Result<Box<dyn DeviceStream>, MediaError>),
}

// ============================================================================
// QUERY SNAPSHOT
// ============================================================================

/// Synchronous query surface, updated by the control loop.
#[derive(Debug, Clone)]
struct CallSnapshot {
    state: CallState,
    started_at: Option<DateTime<Utc>>,
    duration_secs: u64,
    audio_enabled: bool,
    video_enabled: bool,
    screen_sharing: bool,
    participants: Vec<ParticipantId>,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            started_at: None,
            duration_secs: 0,
            audio_enabled: false,
            video_enabled: false,
            screen_sharing: false,
            participants: Vec::new(),
        }
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// The per-call actor. Constructed via [`CallSession::spawn`], driven on its
/// own task, controlled through the returned [`CallHandle`].
pub struct CallSession {
    id: Uuid,
    config: CallConfig,
    state: CallState,
    duration_secs: u64,
    started_at: Option<DateTime<Utc>>,
    acquirer: MediaAcquirer,
    registry: PeerRegistry,
    transport: Arc<dyn SignalingTransport>,
    events: EventDispatcher,
    snapshot: Arc<RwLock<CallSnapshot>>,
    internal_tx: mpsc::Sender<Internal>,
    pending_screen: Option<oneshot::Sender<Result<(), SessionError>>>,
}

impl CallSession {
    /// Spawns a new session's control loop and returns its handle.
    pub fn spawn(
        config: CallConfig,
        platform: Arc<dyn DevicePlatform>,
        connector: Arc<dyn PeerConnector>,
        transport: Arc<dyn SignalingTransport>,
    ) -> CallHandle {
        let id = Uuid::new_v4();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (peer_tx, peer_rx) = mpsc::channel(64);
        let (internal_tx, internal_rx) = mpsc::channel(8);
        let events = EventDispatcher::new(config.event_capacity);
        let snapshot = Arc::new(RwLock::new(CallSnapshot::default()));

        let session = CallSession {
            id,
            state: CallState::Idle,
            duration_secs: 0,
            started_at: None,
            acquirer: MediaAcquirer::new(platform),
            registry: PeerRegistry::new(
                id,
                connector,
                Arc::clone(&transport),
                events.clone(),
                peer_tx,
            ),
            transport,
            events: events.clone(),
            snapshot: Arc::clone(&snapshot),
            internal_tx,
            pending_screen: None,
            config,
        };

        tokio::spawn(session.run(cmd_rx, peer_rx, internal_rx));

        CallHandle {
            id,
            cmd_tx,
            events,
            snapshot,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut peer_rx: mpsc::Receiver<PeerEvent>,
        mut internal_rx: mpsc::Receiver<Internal>,
    ) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    // All handles dropped; make sure devices are freed
                    None => {
                        self.end(EndReason::Hangup).await;
                        break;
                    }
                },
                Some(event) = peer_rx.recv() => self.handle_peer_event(event).await,
                Some(op) = internal_rx.recv() => self.handle_internal(op).await,
                _ = tick.tick() => self.on_tick().await,
            }
        }
        tracing::debug!("Session {} control loop stopped", self.id);
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start {
                kind,
                participants,
                reply,
            } => {
                let result = self.do_start(kind, participants).await;
                let _ = reply.send(result);
            }
            Command::ToggleAudio { reply } => {
                let enabled = self.acquirer.toggle(TrackKind::Audio);
                self.sync_snapshot();
                let _ = reply.send(enabled);
            }
            Command::ToggleVideo { reply } => {
                let enabled = self.acquirer.toggle(TrackKind::Video);
                self.sync_snapshot();
                let _ = reply.send(enabled);
            }
            Command::StartScreenShare { reply } => self.do_start_screen_share(reply),
            Command::StopScreenShare { reply } => {
                let result = self.do_stop_screen_share().await;
                let _ = reply.send(result);
            }
            Command::EndCall { reply } => {
                self.end(EndReason::Hangup).await;
                let _ = reply.send(());
            }
            Command::Signal(msg) => self.handle_signal(msg).await,
        }
    }

    async fn do_start(
        &mut self,
        kind: CallKind,
        participants: Vec<ParticipantId>,
    ) -> Result<(), SessionError> {
        if self.state != CallState::Idle {
            return Err(SessionError::InvalidArguments("session already started"));
        }
        if participants.is_empty() {
            return Err(SessionError::InvalidArguments("participant list is empty"));
        }

        // A failure here aborts before Connecting; nothing to clean up
        self.acquirer.acquire(kind).await?;

        tracing::info!(
            "Session {} starting ({:?}) with {} participant(s)",
            self.id,
            kind,
            participants.len()
        );
        self.started_at = Some(Utc::now());
        self.set_state(CallState::Connecting);

        let tracks = self.acquirer.active_tracks();
        let mut last_error = None;
        for id in &participants {
            if let Err(e) = self.registry.add_participant(id, tracks).await {
                tracing::warn!("Could not contact participant '{}': {}", id, e);
                self.events.emit(CallEvent::Error {
                    error: e.clone().into(),
                    participant: Some(id.clone()),
                });
                last_error = Some(e);
            }
        }

        if self.registry.is_empty() {
            // Every contact attempt failed; there is no call to wait for
            self.end(EndReason::AllParticipantsLeft).await;
            return Err(match last_error {
                Some(e) => SessionError::Peer(e),
                None => SessionError::Terminated,
            });
        }

        self.sync_snapshot();
        Ok(())
    }

    fn do_start_screen_share(&mut self, reply: oneshot::Sender<Result<(), SessionError>>) {
        if self.state != CallState::Active && self.state != CallState::Connecting {
            let _ = reply.send(Err(SessionError::InvalidArguments("no call in progress")));
            return;
        }
        if self.acquirer.is_screen_sharing() {
            let _ = reply.send(Ok(()));
            return;
        }
        if self.pending_screen.is_some() {
            let _ = reply.send(Err(SessionError::InvalidArguments(
                "screen acquisition already in progress",
            )));
            return;
        }

        // The platform picker can block on user interaction; run it off the
        // loop and re-enter through the internal channel
        self.pending_screen = Some(reply);
        let platform = self.acquirer.platform();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = platform.open_screen().await;
            let _ = internal_tx.send(Internal::ScreenAcquired(result)).await;
        });
    }

    async fn do_stop_screen_share(&mut self) -> Result<(), SessionError> {
        if !self.acquirer.is_screen_sharing() {
            return Ok(());
        }
        self.acquirer.release(TrackKind::Screen);
        let tracks = self.acquirer.active_tracks();
        let offers = self.registry.renegotiate_all(tracks).await;
        tracing::info!("Screen share stopped, {} renegotiation offer(s) sent", offers);
        self.sync_snapshot();
        Ok(())
    }

    async fn handle_internal(&mut self, op: Internal) {
        match op {
            Internal::ScreenAcquired(result) => {
                let reply = self.pending_screen.take();

                if self.state == CallState::Ended {
                    // Session cancellation wins; drop the stream if we got one
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(SessionError::Terminated));
                    }
                    return;
                }

                let outcome = match result {
                    Ok(stream) => {
                        self.acquirer.adopt_screen(stream);
                        let tracks = self.acquirer.active_tracks();
                        let offers = self.registry.renegotiate_all(tracks).await;
                        tracing::info!(
                            "Screen share started, {} renegotiation offer(s) sent",
                            offers
                        );
                        Ok(())
                    }
                    Err(e) => {
                        // Not fatal to the call; the session stays as it was
                        tracing::warn!("Screen acquisition failed: {}", e);
                        self.events.emit(CallEvent::Error {
                            error: e.clone().into(),
                            participant: None,
                        });
                        Err(SessionError::Media(e))
                    }
                };

                self.sync_snapshot();
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
        }
    }

    // ========================================================================
    // SIGNALING AND PEER EVENTS
    // ========================================================================

    async fn handle_signal(&mut self, msg: SignalingMessage) {
        if self.state != CallState::Connecting && self.state != CallState::Active {
            tracing::debug!("Ignoring signaling message in state {:?}", self.state);
            return;
        }
        if msg.session() != self.id {
            tracing::warn!(
                "Dropping signaling message for foreign session {}",
                msg.session()
            );
            return;
        }

        let tracks = self.acquirer.active_tracks();
        match msg {
            SignalingMessage::Offer {
                participant, sdp, ..
            } => {
                if let Err(e) = self.registry.handle_offer(&participant, sdp, tracks).await {
                    self.registry.fail_participant(&participant, e).await;
                }
            }
            SignalingMessage::Answer {
                participant, sdp, ..
            } => {
                if let Err(e) = self.registry.handle_answer(&participant, sdp, tracks).await {
                    self.registry.fail_participant(&participant, e).await;
                }
            }
            SignalingMessage::IceCandidate {
                participant,
                candidate,
                ..
            } => {
                if let Err(e) = self.registry.handle_candidate(&participant, candidate).await {
                    self.registry.fail_participant(&participant, e).await;
                }
            }
            SignalingMessage::Bye { participant, .. } => {
                tracing::info!("Participant '{}' left the call", participant);
                self.registry.remove_participant(&participant).await;
            }
        }

        self.after_links_changed().await;
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        if self.state == CallState::Ended {
            return;
        }
        match event {
            PeerEvent::RemoteTrack {
                participant,
                kind,
                stream,
            } => {
                self.registry.on_remote_track(&participant, kind, stream);
            }
            PeerEvent::LocalCandidate {
                participant,
                candidate,
            } => {
                let msg = SignalingMessage::ice_candidate(self.id, participant, candidate);
                if let Err(e) = self.transport.send(msg).await {
                    tracing::warn!("Failed to signal local candidate: {}", e);
                }
            }
            PeerEvent::Closed { participant } => {
                tracing::info!("Connection to '{}' closed by transport", participant);
                self.registry.remove_participant(&participant).await;
                self.after_links_changed().await;
            }
        }
        self.sync_snapshot();
    }

    /// Re-evaluates the state machine after links came or went.
    async fn after_links_changed(&mut self) {
        if self.state == CallState::Connecting && self.registry.any_stable() {
            self.set_state(CallState::Active);
        }
        if (self.state == CallState::Connecting || self.state == CallState::Active)
            && self.registry.is_empty()
        {
            self.end(EndReason::AllParticipantsLeft).await;
        }
        self.sync_snapshot();
    }

    async fn on_tick(&mut self) {
        if self.state == CallState::Active {
            self.duration_secs += 1;
            self.sync_snapshot();
        }
        if self.state == CallState::Connecting || self.state == CallState::Active {
            if let Some(kind) = self.acquirer.failed_track() {
                self.on_device_lost(kind).await;
            }
            let expired = self
                .registry
                .sweep_timeouts(self.config.negotiation_timeout)
                .await;
            if !expired.is_empty() {
                self.after_links_changed().await;
            }
        }
    }

    /// Reacts to a capture device dying mid-call. Losing the screen just
    /// stops the share; losing microphone or camera ends the call.
    async fn on_device_lost(&mut self, kind: TrackKind) {
        let error = MediaError::DeviceUnavailable(format!("{kind} capture stopped"));
        tracing::warn!("Device lost mid-call: {}", error);
        self.events.emit(CallEvent::Error {
            error: error.into(),
            participant: None,
        });

        if kind == TrackKind::Screen {
            let _ = self.do_stop_screen_share().await;
        } else {
            self.end(EndReason::MediaFailure).await;
        }
    }

    // ========================================================================
    // TERMINATION
    // ========================================================================

    /// Transitions to `Ended`. Idempotent; emits `CallEnded` exactly once.
    async fn end(&mut self, reason: EndReason) {
        if self.state == CallState::Ended {
            return;
        }
        tracing::info!("Session {} ending: {:?}", self.id, reason);

        for id in self.registry.participants() {
            let msg = SignalingMessage::bye(self.id, id);
            if let Err(e) = self.transport.send(msg).await {
                tracing::warn!("Failed to send bye: {}", e);
            }
        }
        self.registry.remove_all().await;
        self.acquirer.release_all();

        // Any in-flight screen acquisition is obsolete now
        if let Some(reply) = self.pending_screen.take() {
            let _ = reply.send(Err(SessionError::Terminated));
        }

        self.set_state(CallState::Ended);
        self.events.emit(CallEvent::CallEnded { reason });
    }

    // ========================================================================
    // STATE BOOKKEEPING
    // ========================================================================

    fn set_state(&mut self, state: CallState) {
        if self.state == state {
            return;
        }
        tracing::info!("Session {} state: {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
        self.events.emit(CallEvent::StateChanged(state));
        self.sync_snapshot();
    }

    fn sync_snapshot(&self) {
        *self.snapshot.write() = CallSnapshot {
            state: self.state,
            started_at: self.started_at,
            duration_secs: self.duration_secs,
            audio_enabled: self.acquirer.is_enabled(TrackKind::Audio),
            video_enabled: self.acquirer.is_enabled(TrackKind::Video),
            screen_sharing: self.acquirer.is_screen_sharing(),
            participants: self.registry.participants(),
        };
    }
}

// ============================================================================
// CALL HANDLE
// ============================================================================

/// Consumer-facing handle to a running call session.
///
/// Operations are forwarded to the session's control loop; queries read a
/// snapshot the loop keeps current and never block on it.
#[derive(Clone)]
pub struct CallHandle {
    id: Uuid,
    cmd_tx: mpsc::Sender<Command>,
    events: EventDispatcher,
    snapshot: Arc<RwLock<CallSnapshot>>,
}

impl CallHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns an event receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Starts the call: acquires media and contacts each participant.
    pub async fn start(
        &self,
        kind: CallKind,
        participants: Vec<ParticipantId>,
    ) -> Result<(), SessionError> {
        self.request(|reply| Command::Start {
            kind,
            participants,
            reply,
        })
        .await?
    }

    /// Flips the microphone's enabled flag; returns the resulting state.
    /// Signaling-silent: no renegotiation happens.
    pub async fn toggle_audio(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::ToggleAudio { reply }).await
    }

    /// Flips the camera's enabled flag; returns the resulting state.
    pub async fn toggle_video(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::ToggleVideo { reply }).await
    }

    /// Acquires the screen stream and renegotiates every link. On failure
    /// the call continues unchanged.
    pub async fn start_screen_share(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::StartScreenShare { reply })
            .await?
    }

    /// Releases the screen stream and renegotiates every link. No-op if not
    /// sharing.
    pub async fn stop_screen_share(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::StopScreenShare { reply })
            .await?
    }

    /// Ends the call. Idempotent.
    pub async fn end_call(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::EndCall { reply }).await
    }

    /// Feeds one inbound signaling message into the session.
    pub async fn deliver_signal(&self, msg: SignalingMessage) -> Result<(), SessionError> {
        self.cmd_tx
            .send(Command::Signal(msg))
            .await
            .map_err(|_| SessionError::Terminated)
    }

    /// Spawns a task pumping an inbound message stream (e.g. from
    /// [`crate::signaling::WsSignaling::connect`]) into this session.
    pub fn pump_signals(&self, mut inbound: mpsc::Receiver<SignalingMessage>) {
        let handle = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                if handle.deliver_signal(msg).await.is_err() {
                    break;
                }
            }
        });
    }

    // Synchronous query surface

    pub fn state(&self) -> CallState {
        self.snapshot.read().state
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot.read().started_at
    }

    /// Seconds spent in `Active`; frozen once the session ends.
    pub fn duration_secs(&self) -> u64 {
        self.snapshot.read().duration_secs
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.snapshot.read().audio_enabled
    }

    pub fn is_video_enabled(&self) -> bool {
        self.snapshot.read().video_enabled
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.snapshot.read().screen_sharing
    }

    pub fn participants(&self) -> Vec<ParticipantId> {
        self.snapshot.read().participants.clone()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| SessionError::Terminated)?;
        rx.await.map_err(|_| SessionError::Terminated)
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot.read();
        f.debug_struct("CallHandle")
            .field("id", &self.id)
            .field("state", &snapshot.state)
            .field("participants", &snapshot.participants)
            .finish()
    }
}
