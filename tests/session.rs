//! End-to-end session scenarios driven through fake platform, connector and
//! transport implementations.

use huddle::{
    CallConfig, CallEvent, CallKind, CallSession, CallState, DevicePlatform, DeviceStream,
    EndReason, MediaError, ParticipantId, PeerConnector, PeerError, PeerEvent, PeerHandle,
    RemoteStream, SessionError, SignalingError, SignalingMessage, SignalingTransport, TrackKind,
    TrackSet,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

// ============================================================================
// FAKES
// ============================================================================

struct FakeStream {
    kind: TrackKind,
    enabled: std::sync::atomic::AtomicBool,
    live: Arc<AtomicIsize>,
    dead: Arc<Mutex<HashSet<TrackKind>>>,
}

impl DeviceStream for FakeStream {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn is_alive(&self) -> bool {
        !self.dead.lock().contains(&self.kind)
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Fake device layer counting live streams so release completeness can be
/// asserted.
struct FakePlatform {
    live: Arc<AtomicIsize>,
    dead: Arc<Mutex<HashSet<TrackKind>>>,
    fail_microphone: bool,
    fail_screen: Option<MediaError>,
}

impl FakePlatform {
    fn new() -> Self {
        Self {
            live: Arc::new(AtomicIsize::new(0)),
            dead: Arc::new(Mutex::new(HashSet::new())),
            fail_microphone: false,
            fail_screen: None,
        }
    }

    fn live_streams(&self) -> isize {
        self.live.load(Ordering::Relaxed)
    }

    /// Simulates losing the device behind an already-acquired stream.
    fn kill(&self, kind: TrackKind) {
        self.dead.lock().insert(kind);
    }

    fn stream(&self, kind: TrackKind) -> Box<dyn DeviceStream> {
        self.live.fetch_add(1, Ordering::Relaxed);
        Box::new(FakeStream {
            kind,
            enabled: std::sync::atomic::AtomicBool::new(true),
            live: Arc::clone(&self.live),
            dead: Arc::clone(&self.dead),
        })
    }
}

#[async_trait::async_trait]
impl DevicePlatform for FakePlatform {
    async fn open_microphone(&self) -> Result<Box<dyn DeviceStream>, MediaError> {
        if self.fail_microphone {
            return Err(MediaError::DeviceUnavailable("no microphone".to_string()));
        }
        Ok(self.stream(TrackKind::Audio))
    }

    async fn open_camera(&self) -> Result<Box<dyn DeviceStream>, MediaError> {
        Ok(self.stream(TrackKind::Video))
    }

    async fn open_screen(&self) -> Result<Box<dyn DeviceStream>, MediaError> {
        match &self.fail_screen {
            Some(e) => Err(e.clone()),
            None => Ok(self.stream(TrackKind::Screen)),
        }
    }
}

struct FakeHandle {
    tracks: Mutex<TrackSet>,
}

#[async_trait::async_trait]
impl PeerHandle for FakeHandle {
    async fn set_local_tracks(&self, tracks: TrackSet) -> Result<(), PeerError> {
        *self.tracks.lock() = tracks;
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, PeerError> {
        Ok("offer".to_string())
    }

    async fn accept_offer(&self, _sdp: String) -> Result<String, PeerError> {
        Ok("answer".to_string())
    }

    async fn accept_answer(&self, _sdp: String) -> Result<(), PeerError> {
        Ok(())
    }

    async fn add_candidate(&self, _candidate: String) -> Result<(), PeerError> {
        Ok(())
    }

    async fn close(&self) {}
}

#[derive(Default)]
struct FakeConnector {
    handles: Mutex<HashMap<ParticipantId, Arc<FakeHandle>>>,
    events: Mutex<HashMap<ParticipantId, mpsc::Sender<PeerEvent>>>,
}

impl FakeConnector {
    fn offered_tracks(&self, id: &str) -> TrackSet {
        *self.handles.lock()[id].tracks.lock()
    }

    fn events_for(&self, id: &str) -> mpsc::Sender<PeerEvent> {
        self.events.lock()[id].clone()
    }
}

#[async_trait::async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        participant: &ParticipantId,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerHandle>, PeerError> {
        let handle = Arc::new(FakeHandle {
            tracks: Mutex::new(TrackSet::default()),
        });
        self.handles
            .lock()
            .insert(participant.clone(), Arc::clone(&handle));
        self.events.lock().insert(participant.clone(), events);
        Ok(handle)
    }
}

#[derive(Default)]
struct FakeTransport {
    sent: Mutex<Vec<SignalingMessage>>,
}

impl FakeTransport {
    fn count<F: Fn(&SignalingMessage) -> bool>(&self, pred: F) -> usize {
        self.sent.lock().iter().filter(|m| pred(m)).count()
    }

    fn offers_to(&self, id: &str) -> usize {
        self.count(|m| matches!(m, SignalingMessage::Offer { participant, .. } if participant == id))
    }
}

#[async_trait::async_trait]
impl SignalingTransport for FakeTransport {
    async fn send(&self, msg: SignalingMessage) -> Result<(), SignalingError> {
        self.sent.lock().push(msg);
        Ok(())
    }
}

// ============================================================================
// HARNESS
// ============================================================================

struct Harness {
    handle: huddle::CallHandle,
    events: broadcast::Receiver<CallEvent>,
    platform: Arc<FakePlatform>,
    connector: Arc<FakeConnector>,
    transport: Arc<FakeTransport>,
}

fn spawn_session(platform: FakePlatform) -> Harness {
    let platform = Arc::new(platform);
    let connector = Arc::new(FakeConnector::default());
    let transport = Arc::new(FakeTransport::default());
    let config = CallConfig {
        tick_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let handle = CallSession::spawn(
        config,
        Arc::clone(&platform) as Arc<dyn DevicePlatform>,
        Arc::clone(&connector) as Arc<dyn PeerConnector>,
        Arc::clone(&transport) as Arc<dyn SignalingTransport>,
    );
    let events = handle.subscribe();
    Harness {
        handle,
        events,
        platform,
        connector,
        transport,
    }
}

impl Harness {
    async fn answer_from(&self, id: &str) {
        let msg = SignalingMessage::answer(self.handle.id(), id.to_string(), "sdp".to_string());
        self.handle.deliver_signal(msg).await.unwrap();
    }

    async fn bye_from(&self, id: &str) {
        let msg = SignalingMessage::bye(self.handle.id(), id.to_string());
        self.handle.deliver_signal(msg).await.unwrap();
    }

    /// Injects a remote track arrival as the connection backend would.
    async fn remote_track(&self, id: &str, kind: TrackKind, payload: &str) {
        self.connector
            .events_for(id)
            .send(PeerEvent::RemoteTrack {
                participant: id.to_string(),
                kind,
                stream: RemoteStream::new(Arc::new(payload.to_string())),
            })
            .await
            .unwrap();
    }

    /// Waits until an event matching the predicate arrives.
    async fn wait_for<F: Fn(&CallEvent) -> bool>(&mut self, pred: F) -> CallEvent {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = self.events.recv().await.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn start_active_call(&mut self, participants: &[&str]) {
        let ids = participants.iter().map(|s| s.to_string()).collect();
        self.handle.start(CallKind::Video, ids).await.unwrap();
        for id in participants {
            self.answer_from(id).await;
        }
        self.wait_for(|e| matches!(e, CallEvent::StateChanged(CallState::Active)))
            .await;
    }
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[tokio::test]
async fn test_start_connects_then_activates() {
    let mut h = spawn_session(FakePlatform::new());

    h.handle
        .start(CallKind::Video, vec!["p1".to_string(), "p2".to_string()])
        .await
        .unwrap();
    assert_eq!(h.handle.state(), CallState::Connecting);
    assert_eq!(h.transport.offers_to("p1"), 1);
    assert_eq!(h.transport.offers_to("p2"), 1);

    h.answer_from("p1").await;
    h.wait_for(|e| matches!(e, CallEvent::StateChanged(CallState::Active)))
        .await;
    assert_eq!(h.handle.state(), CallState::Active);
    assert_eq!(
        h.handle.participants(),
        vec!["p1".to_string(), "p2".to_string()]
    );

    // Duration resumes incrementing while active
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(h.handle.duration_secs() > 0);
}

#[tokio::test]
async fn test_start_rejects_empty_participant_list() {
    let h = spawn_session(FakePlatform::new());

    let err = h.handle.start(CallKind::Audio, vec![]).await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidArguments(_)));
    assert_eq!(h.handle.state(), CallState::Idle);
    assert_eq!(h.platform.live_streams(), 0);
}

#[tokio::test]
async fn test_start_aborts_before_connecting_on_media_failure() {
    let h = spawn_session(FakePlatform {
        fail_microphone: true,
        ..FakePlatform::new()
    });

    let err = h
        .handle
        .start(CallKind::Audio, vec!["p1".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Media(MediaError::DeviceUnavailable(_))
    ));
    assert_eq!(h.handle.state(), CallState::Idle);
    assert_eq!(h.transport.offers_to("p1"), 0);
    assert_eq!(h.platform.live_streams(), 0);
}

#[tokio::test]
async fn test_mute_toggles_are_signaling_silent() {
    let mut h = spawn_session(FakePlatform::new());
    h.start_active_call(&["p1"]).await;
    let sent_before = h.transport.sent.lock().len();

    assert!(!h.handle.toggle_audio().await.unwrap());
    assert!(!h.handle.is_audio_enabled());
    assert!(!h.handle.toggle_video().await.unwrap());
    assert!(h.handle.toggle_audio().await.unwrap());

    assert_eq!(h.transport.sent.lock().len(), sent_before);
    // The tracks themselves stay attached
    assert!(h.connector.offered_tracks("p1").audio);
    assert!(h.connector.offered_tracks("p1").video);
}

#[tokio::test]
async fn test_screen_share_renegotiates_each_link_once() {
    let mut h = spawn_session(FakePlatform::new());
    h.start_active_call(&["p1", "p2"]).await;
    assert_eq!(h.transport.offers_to("p1"), 1);

    h.handle.start_screen_share().await.unwrap();

    assert!(h.handle.is_screen_sharing());
    assert_eq!(h.transport.offers_to("p1"), 2);
    assert_eq!(h.transport.offers_to("p2"), 2);
    assert!(h.connector.offered_tracks("p1").screen);

    h.handle.stop_screen_share().await.unwrap();
    assert!(!h.handle.is_screen_sharing());
    assert_eq!(h.transport.offers_to("p1"), 3);
    assert!(!h.connector.offered_tracks("p1").screen);
}

#[tokio::test]
async fn test_cancelled_screen_share_leaves_call_untouched() {
    let mut h = spawn_session(FakePlatform {
        fail_screen: Some(MediaError::UserCancelled),
        ..FakePlatform::new()
    });
    h.start_active_call(&["p1"]).await;
    let sent_before = h.transport.sent.lock().len();

    let err = h.handle.start_screen_share().await.unwrap_err();
    assert!(matches!(err, SessionError::Media(MediaError::UserCancelled)));

    let event = h
        .wait_for(|e| matches!(e, CallEvent::Error { .. }))
        .await;
    match event {
        CallEvent::Error { error, participant } => {
            assert!(error.to_string().contains("dismissed"));
            assert_eq!(participant, None);
        }
        _ => unreachable!(),
    }

    assert_eq!(h.handle.state(), CallState::Active);
    assert!(!h.handle.is_screen_sharing());
    assert_eq!(h.transport.sent.lock().len(), sent_before);
}

#[tokio::test]
async fn test_stream_added_carries_the_remote_stream() {
    let mut h = spawn_session(FakePlatform::new());
    h.start_active_call(&["p1"]).await;

    h.remote_track("p1", TrackKind::Audio, "p1-mic").await;

    let event = h
        .wait_for(|e| matches!(e, CallEvent::StreamAdded { .. }))
        .await;
    match event {
        CallEvent::StreamAdded {
            participant,
            kind,
            stream,
        } => {
            assert_eq!(participant, "p1");
            assert_eq!(kind, TrackKind::Audio);
            // The backend payload reaches the subscriber intact
            let payload = stream.downcast::<String>().expect("backend payload");
            assert_eq!(payload.as_str(), "p1-mic");
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_microphone_loss_ends_call_with_media_failure() {
    let mut h = spawn_session(FakePlatform::new());
    h.start_active_call(&["p1", "p2"]).await;

    h.platform.kill(TrackKind::Audio);

    let event = h
        .wait_for(|e| matches!(e, CallEvent::CallEnded { .. }))
        .await;
    assert!(matches!(
        event,
        CallEvent::CallEnded {
            reason: EndReason::MediaFailure
        }
    ));
    assert_eq!(h.handle.state(), CallState::Ended);
    assert_eq!(h.platform.live_streams(), 0);
    assert_eq!(
        h.transport
            .count(|m| matches!(m, SignalingMessage::Bye { .. })),
        2
    );
}

#[tokio::test]
async fn test_screen_loss_stops_share_but_keeps_call() {
    let mut h = spawn_session(FakePlatform::new());
    h.start_active_call(&["p1"]).await;
    h.handle.start_screen_share().await.unwrap();
    assert!(h.handle.is_screen_sharing());

    h.platform.kill(TrackKind::Screen);

    h.wait_for(|e| matches!(e, CallEvent::Error { .. })).await;
    tokio::time::timeout(Duration::from_secs(2), async {
        while h.handle.is_screen_sharing() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("screen share never stopped");

    assert_eq!(h.handle.state(), CallState::Active);
    assert!(!h.connector.offered_tracks("p1").screen);
}

#[tokio::test]
async fn test_participant_leaving_keeps_session_active() {
    let mut h = spawn_session(FakePlatform::new());
    h.start_active_call(&["p1", "p2"]).await;

    h.bye_from("p2").await;
    h.wait_for(|e| matches!(e, CallEvent::StreamRemoved { participant } if participant == "p2"))
        .await;

    assert_eq!(h.handle.state(), CallState::Active);
    assert_eq!(h.handle.participants(), vec!["p1".to_string()]);
}

#[tokio::test]
async fn test_last_participant_leaving_ends_session() {
    let mut h = spawn_session(FakePlatform::new());
    h.start_active_call(&["p1"]).await;

    h.bye_from("p1").await;
    let event = h
        .wait_for(|e| matches!(e, CallEvent::CallEnded { .. }))
        .await;
    assert!(matches!(
        event,
        CallEvent::CallEnded {
            reason: EndReason::AllParticipantsLeft
        }
    ));
    assert_eq!(h.handle.state(), CallState::Ended);
    assert_eq!(h.platform.live_streams(), 0);
}

#[tokio::test]
async fn test_end_call_is_idempotent_and_releases_media() {
    let mut h = spawn_session(FakePlatform::new());
    h.start_active_call(&["p1", "p2"]).await;
    assert!(h.platform.live_streams() > 0);

    h.handle.end_call().await.unwrap();
    h.handle.end_call().await.unwrap();

    assert_eq!(h.handle.state(), CallState::Ended);
    assert_eq!(h.platform.live_streams(), 0);
    assert_eq!(
        h.transport
            .count(|m| matches!(m, SignalingMessage::Bye { .. })),
        2
    );

    // Exactly one CallEnded despite the second end_call
    let mut ended = 0;
    while let Ok(event) = h.events.try_recv() {
        if matches!(event, CallEvent::CallEnded { .. }) {
            ended += 1;
        }
    }
    assert_eq!(ended, 1);

    // Duration is frozen after the end
    let frozen = h.handle.duration_secs();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.handle.duration_secs(), frozen);
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let mut a = spawn_session(FakePlatform::new());
    let mut b = spawn_session(FakePlatform::new());

    a.start_active_call(&["p1"]).await;
    b.start_active_call(&["p9"]).await;

    a.handle.end_call().await.unwrap();
    assert_eq!(a.handle.state(), CallState::Ended);
    assert_eq!(b.handle.state(), CallState::Active);
    assert_eq!(b.handle.participants(), vec!["p9".to_string()]);
}

#[tokio::test]
async fn test_messages_for_foreign_sessions_are_ignored() {
    let mut h = spawn_session(FakePlatform::new());
    h.start_active_call(&["p1"]).await;

    // Bye carrying a different session id must not end this call
    let foreign = SignalingMessage::bye(uuid::Uuid::new_v4(), "p1".to_string());
    h.handle.deliver_signal(foreign).await.unwrap();

    // Round-trip through the loop so the message was processed
    h.handle.toggle_audio().await.unwrap();
    assert_eq!(h.handle.state(), CallState::Active);
    assert_eq!(h.handle.participants(), vec!["p1".to_string()]);
}
