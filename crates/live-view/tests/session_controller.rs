//! Controller transitions driven through fake signaling, transport and surface.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use live_view::{
    AttemptEvent, AttemptId, AttemptSink, CloseReason, ConnectionStatus, IceCandidate,
    InboundMessage, InteractionBus, LiveSession, MediaStream, OutboundMessage, PeerTransport,
    PlaybackReporter, PlaybackState, PlaybackSurface, SessionConfig, SessionError, SessionHandle, SessionResult,
    SessionSnapshot, SignalingChannel, SignalingConnector, StatusBadge, TransportFactory, TransportState,
};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

#[derive(Default)]
struct ChannelLog {
    open: AtomicBool,
    sent: Mutex<Vec<OutboundMessage>>,
    closes: AtomicUsize,
}

struct FakeChannel {
    log: Arc<ChannelLog>,
}

impl SignalingChannel for FakeChannel {
    fn send(&self, message: OutboundMessage) {
        if self.is_open() {
            self.log.sent.lock().push(message);
        }
    }

    fn is_open(&self) -> bool {
        self.log.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.log.open.swap(false, Ordering::SeqCst) {
            self.log.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
struct FakeRelay {
    opened: Mutex<Vec<(AttemptSink, Arc<ChannelLog>)>>,
}

impl FakeRelay {
    fn count(&self) -> usize {
        self.opened.lock().len()
    }

    fn sink(&self, index: usize) -> AttemptSink {
        self.opened.lock()[index].0.clone()
    }

    fn log(&self, index: usize) -> Arc<ChannelLog> {
        self.opened.lock()[index].1.clone()
    }

    /// Simulates the relay accepting the websocket of attempt `index`.
    fn accept(&self, index: usize) -> AttemptId {
        let (sink, log) = self.opened.lock()[index].clone();
        log.open.store(true, Ordering::SeqCst);
        sink.emit(AttemptEvent::ChannelOpened);
        sink.attempt().clone()
    }

    fn sent_kinds(&self, index: usize) -> Vec<&'static str> {
        self.log(index).sent.lock().iter().map(|m| m.kind()).collect()
    }
}

impl SignalingConnector for FakeRelay {
    fn open(&self, _agent: &str, sink: AttemptSink) -> Box<dyn SignalingChannel> {
        let log = Arc::new(ChannelLog::default());
        self.opened.lock().push((sink, log.clone()));
        Box::new(FakeChannel { log })
    }
}

#[derive(Default)]
struct TransportLog {
    calls: Mutex<Vec<String>>,
    closes: AtomicUsize,
}

impl TransportLog {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

struct FakeTransport {
    log: Arc<TransportLog>,
    reject_answer: bool,
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> SessionResult<String> {
        self.log.calls.lock().push("create_offer".into());
        Ok("v=0 offer".into())
    }

    async fn set_local_description(&self, sdp: &str) -> SessionResult<()> {
        self.log.calls.lock().push(format!("set_local:{sdp}"));
        Ok(())
    }

    async fn apply_answer(&self, sdp: &str) -> SessionResult<()> {
        self.log.calls.lock().push(format!("answer:{sdp}"));
        if self.reject_answer {
            return Err(SessionError::Negotiation("malformed answer".into()));
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> SessionResult<()> {
        self.log
            .calls
            .lock()
            .push(format!("candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeTransports {
    created: Mutex<Vec<Arc<TransportLog>>>,
    fail_create: AtomicBool,
    reject_answers: AtomicBool,
}

impl FakeTransports {
    fn count(&self) -> usize {
        self.created.lock().len()
    }

    fn log(&self, index: usize) -> Arc<TransportLog> {
        self.created.lock()[index].clone()
    }
}

#[async_trait]
impl TransportFactory for FakeTransports {
    async fn create(
        &self,
        _agent: &str,
        _sink: AttemptSink,
    ) -> SessionResult<Box<dyn PeerTransport>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SessionError::Transport("no media engine".into()));
        }
        let log = Arc::new(TransportLog::default());
        self.created.lock().push(log.clone());
        Ok(Box::new(FakeTransport {
            log,
            reject_answer: self.reject_answers.load(Ordering::SeqCst),
        }))
    }
}

/// Counts play starts that were dropped before they resolved.
struct AbandonedPlay(Arc<AtomicUsize>);

impl Drop for AbandonedPlay {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeSurface {
    calls: Mutex<Vec<&'static str>>,
    refusals: Mutex<VecDeque<bool>>,
    reporter: Mutex<Option<PlaybackReporter>>,
    never_resolve: AtomicBool,
    abandoned: Arc<AtomicUsize>,
}

impl FakeSurface {
    fn refuse_next(&self) {
        self.refusals.lock().push_back(true);
    }

    fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| **c == call).count()
    }

    fn reporter(&self) -> PlaybackReporter {
        self.reporter.lock().clone().expect("stream attached")
    }
}

#[async_trait]
impl PlaybackSurface for FakeSurface {
    fn attach(&self, _stream: MediaStream, reporter: PlaybackReporter) {
        self.calls.lock().push("attach");
        *self.reporter.lock() = Some(reporter);
    }

    fn clear(&self) {
        self.calls.lock().push("clear");
    }

    async fn play(&self) -> SessionResult<()> {
        self.calls.lock().push("play");
        if self.never_resolve.load(Ordering::SeqCst) {
            let _guard = AbandonedPlay(self.abandoned.clone());
            std::future::pending::<()>().await;
        }
        if self.refusals.lock().pop_front().unwrap_or(false) {
            return Err(SessionError::Playback("NotAllowedError".into()));
        }
        Ok(())
    }
}

struct Harness {
    handle: SessionHandle,
    relay: Arc<FakeRelay>,
    transports: Arc<FakeTransports>,
    surface: Arc<FakeSurface>,
    bus: InteractionBus,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

fn harness_with(config: SessionConfig) -> Harness {
    init_tracing();
    let relay = Arc::new(FakeRelay::default());
    let transports = Arc::new(FakeTransports::default());
    let surface = Arc::new(FakeSurface::default());
    let bus = InteractionBus::new();
    let handle = LiveSession::new("PC-01", config, surface.clone())
        .with_interactions(bus.clone())
        .with_signaling(relay.clone())
        .with_transport(transports.clone())
        .spawn();
    Harness {
        handle,
        relay,
        transports,
        surface,
        bus,
    }
}

fn harness() -> Harness {
    harness_with(
        SessionConfig::default()
            .with_auto_connect(false)
            .with_track_timeout(None),
    )
}

fn answer(attempt: &AttemptId) -> AttemptEvent {
    AttemptEvent::Inbound(InboundMessage::Answer {
        sdp: "v=0 answer".into(),
        attempt_id: attempt.clone(),
    })
}

fn remote_candidate(attempt: &AttemptId, text: &str) -> AttemptEvent {
    AttemptEvent::Inbound(InboundMessage::Candidate {
        candidate: Some(IceCandidate {
            candidate: text.into(),
            ..Default::default()
        }),
        attempt_id: attempt.clone(),
    })
}

/// Waits for the outcome of a play start, which the controller does not await.
async fn playback_settles(h: &Harness, expected: PlaybackState) -> SessionSnapshot {
    let mut state = h.handle.subscribe();
    let snapshot = tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|snapshot| snapshot.playback == expected),
    )
    .await
    .expect("playback settled")
    .expect("session alive")
    .clone();
    snapshot
}

/// Drives attempt `index` from channel open to an attached track.
async fn connect(h: &Harness, index: usize) -> AttemptId {
    let attempt = h.relay.accept(index);
    let sink = h.relay.sink(index);
    sink.emit(answer(&attempt));
    sink.emit(AttemptEvent::TrackAvailable(MediaStream::detached("camera")));
    h.handle.snapshot().await;
    attempt
}

#[tokio::test(start_paused = true)]
async fn connects_then_retries_at_base_delay_after_transport_failure() {
    let h = harness();
    h.handle.enable();

    let snapshot = h.handle.snapshot().await;
    assert!(snapshot.enabled);
    assert_eq!(snapshot.status, ConnectionStatus::Connecting);
    assert!(snapshot.loading());

    let attempt = h.relay.accept(0);
    h.handle.snapshot().await;
    assert_eq!(h.relay.sent_kinds(0), vec!["identify", "offer"]);
    assert_eq!(
        h.relay.log(0).sent.lock()[0],
        OutboundMessage::identify(&attempt)
    );
    assert_eq!(
        h.transports.log(0).calls(),
        vec!["create_offer", "set_local:v=0 offer"]
    );

    let sink = h.relay.sink(0);
    sink.emit(answer(&attempt));
    sink.emit(AttemptEvent::TrackAvailable(MediaStream::detached("camera")));
    let snapshot = playback_settles(&h, PlaybackState::Active).await;
    assert_eq!(snapshot.status, ConnectionStatus::Connected);
    assert_eq!(snapshot.badge(), StatusBadge::Live);

    sink.emit(AttemptEvent::TransportState(TransportState::Failed));
    let snapshot = h.handle.snapshot().await;
    assert_eq!(snapshot.status, ConnectionStatus::Failed);
    assert_eq!(snapshot.last_error.as_deref(), Some("peer connection failed"));
    assert_eq!(snapshot.retry_count, 1);
    assert_eq!(snapshot.next_retry, Some(Duration::from_millis(1_000)));
    assert_eq!(snapshot.badge(), StatusBadge::Reconnecting);
    assert_eq!(snapshot.playback, PlaybackState::Inactive);
    assert_eq!(h.transports.log(0).closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.relay.log(0).closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.surface.count("clear"), 1);
    assert!(!sink.is_attached());

    tokio::time::sleep(Duration::from_millis(999)).await;
    assert_eq!(h.transports.count(), 1);
    tokio::time::sleep(Duration::from_millis(2)).await;
    let snapshot = h.handle.snapshot().await;
    assert_eq!(h.transports.count(), 2);
    assert_eq!(h.relay.count(), 2);
    assert_eq!(snapshot.status, ConnectionStatus::Connecting);
    assert_eq!(snapshot.last_error, None);
    assert_eq!(snapshot.next_retry, None);

    let second = connect(&h, 1).await;
    assert_ne!(second, attempt);
    let snapshot = h.handle.snapshot().await;
    assert_eq!(snapshot.status, ConnectionStatus::Connected);
    assert_eq!(snapshot.retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn retry_delay_grows_across_consecutive_failures() {
    let h = harness();
    h.handle.enable();
    h.handle.snapshot().await;

    let mut delays = Vec::new();
    for index in 0..4 {
        h.relay.sink(index).emit(AttemptEvent::ChannelClosed(CloseReason::Abnormal(
            "relay unreachable".into(),
        )));
        let snapshot = h.handle.snapshot().await;
        let delay = snapshot.next_retry.expect("retry armed");
        delays.push(delay.as_millis());
        tokio::time::sleep(delay + Duration::from_millis(1)).await;
        h.handle.snapshot().await;
    }
    assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000]);
}

#[tokio::test]
async fn stray_answer_for_previous_attempt_is_ignored() {
    let h = harness();
    h.handle.enable();
    h.handle.snapshot().await;
    let current = h.relay.accept(0);
    let stale = AttemptId::from("previous-attempt");

    let sink = h.relay.sink(0);
    sink.emit(answer(&stale));
    sink.emit(remote_candidate(&stale, "candidate:stale"));
    let snapshot = h.handle.snapshot().await;

    assert_eq!(snapshot.status, ConnectionStatus::Connecting);
    assert_eq!(snapshot.last_error, None);
    assert_eq!(
        h.transports.log(0).calls(),
        vec!["create_offer", "set_local:v=0 offer"]
    );

    sink.emit(answer(&current));
    sink.emit(answer(&current));
    h.handle.snapshot().await;
    let answers = h
        .transports
        .log(0)
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("answer:"))
        .count();
    assert_eq!(answers, 1);
}

#[tokio::test]
async fn events_from_a_replaced_attempt_are_dropped() {
    let h = harness();
    h.handle.enable();
    h.handle.snapshot().await;
    let old_sink = h.relay.sink(0);

    h.handle.restart();
    let snapshot = h.handle.snapshot().await;
    assert_eq!(h.relay.count(), 2);
    assert_eq!(h.transports.log(0).closes.load(Ordering::SeqCst), 1);
    assert!(!old_sink.is_attached());
    assert!(!old_sink.emit(AttemptEvent::TransportState(TransportState::Failed)));
    assert_eq!(snapshot.status, ConnectionStatus::Connecting);
    assert!(snapshot.enabled);
}

#[tokio::test(start_paused = true)]
async fn disable_while_retry_is_armed_cancels_it() {
    let h = harness();
    h.handle.enable();
    h.handle.snapshot().await;
    h.relay
        .sink(0)
        .emit(AttemptEvent::ChannelClosed(CloseReason::Abnormal("reset".into())));
    let snapshot = h.handle.snapshot().await;
    assert_eq!(snapshot.status, ConnectionStatus::Failed);
    assert!(snapshot.next_retry.is_some());

    h.handle.disable();
    let snapshot = h.handle.snapshot().await;
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert_eq!(snapshot.retry_count, 0);
    assert_eq!(snapshot.last_error, None);
    assert_eq!(snapshot.next_retry, None);
    assert_eq!(snapshot.badge(), StatusBadge::StreamingOff);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.transports.count(), 1);
    assert_eq!(h.handle.snapshot().await.status, ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn disable_mid_connecting_tears_down_without_reconnect() {
    let h = harness();
    h.handle.enable();
    h.handle.snapshot().await;
    h.relay.accept(0);

    h.handle.disable();
    let snapshot = h.handle.snapshot().await;
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert_eq!(snapshot.retry_count, 0);
    assert_eq!(h.transports.log(0).closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.relay.log(0).closes.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(h.transports.count(), 1);
    assert_eq!(h.relay.count(), 1);
}

#[tokio::test]
async fn teardown_twice_releases_once() {
    let h = harness();
    h.handle.enable();
    h.handle.snapshot().await;
    let attempt = h.relay.accept(0);
    h.relay
        .sink(0)
        .emit(AttemptEvent::Inbound(InboundMessage::Error { message: None }));
    let snapshot = h.handle.snapshot().await;
    assert_eq!(snapshot.last_error.as_deref(), Some("Connection error"));

    h.handle.disable();
    h.handle.disable();
    h.handle.snapshot().await;
    h.handle.shutdown().await;

    assert_eq!(h.transports.log(0).closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.relay.log(0).closes.load(Ordering::SeqCst), 1);
    assert!(!h.relay.sink(0).emit(answer(&attempt)));
    assert_eq!(h.handle.snapshot().await.status, ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn relay_error_message_becomes_last_error() {
    let h = harness();
    h.handle.enable();
    h.handle.snapshot().await;
    h.relay.accept(0);
    h.relay
        .sink(0)
        .emit(AttemptEvent::Inbound(InboundMessage::Error {
            message: Some("agent PC-01 is not streaming".into()),
        }));

    let snapshot = h.handle.snapshot().await;
    assert_eq!(snapshot.status, ConnectionStatus::Failed);
    assert_eq!(
        snapshot.last_error.as_deref(),
        Some("agent PC-01 is not streaming")
    );
    assert_eq!(snapshot.retry_count, 1);
}

#[tokio::test]
async fn early_candidates_are_applied_after_answer_in_order() {
    let h = harness();
    h.handle.enable();
    h.handle.snapshot().await;
    let attempt = h.relay.accept(0);
    let sink = h.relay.sink(0);

    sink.emit(remote_candidate(&attempt, "candidate:1"));
    sink.emit(remote_candidate(&attempt, "candidate:2"));
    h.handle.snapshot().await;
    assert_eq!(h.transports.log(0).calls().len(), 2);

    sink.emit(answer(&attempt));
    sink.emit(remote_candidate(&attempt, "candidate:3"));
    h.handle.snapshot().await;
    assert_eq!(
        h.transports.log(0).calls()[2..],
        [
            "answer:v=0 answer",
            "candidate:candidate:1",
            "candidate:candidate:2",
            "candidate:candidate:3",
        ]
    );
}

#[tokio::test]
async fn local_candidates_are_forwarded_with_attempt_id() {
    let h = harness();
    h.handle.enable();
    h.handle.snapshot().await;
    let attempt = h.relay.accept(0);
    let candidate = IceCandidate {
        candidate: "candidate:9 1 udp 1 192.168.1.4 5000 typ host".into(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    };
    h.relay
        .sink(0)
        .emit(AttemptEvent::LocalCandidate(candidate.clone()));
    h.handle.snapshot().await;

    let sent = h.relay.log(0).sent.lock().clone();
    assert_eq!(sent.last(), Some(&OutboundMessage::candidate(candidate, &attempt)));
}

#[tokio::test]
async fn rejected_answer_fails_the_attempt() {
    let h = harness();
    h.transports.reject_answers.store(true, Ordering::SeqCst);
    h.handle.enable();
    h.handle.snapshot().await;
    let attempt = h.relay.accept(0);
    h.relay.sink(0).emit(answer(&attempt));

    let snapshot = h.handle.snapshot().await;
    assert_eq!(snapshot.status, ConnectionStatus::Failed);
    assert_eq!(snapshot.last_error.as_deref(), Some("malformed answer"));
    assert_eq!(h.transports.log(0).closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transport_construction_failure_schedules_retry() {
    let h = harness();
    h.transports.fail_create.store(true, Ordering::SeqCst);
    h.handle.enable();

    let snapshot = h.handle.snapshot().await;
    assert_eq!(snapshot.status, ConnectionStatus::Failed);
    assert_eq!(snapshot.last_error.as_deref(), Some("no media engine"));
    assert_eq!(snapshot.next_retry, Some(Duration::from_millis(1_000)));
    assert_eq!(h.relay.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_track_fails_after_watchdog() {
    let h = harness_with(
        SessionConfig::default()
            .with_auto_connect(false)
            .with_track_timeout(Some(Duration::from_secs(4))),
    );
    h.handle.enable();
    h.handle.snapshot().await;
    let attempt = h.relay.accept(0);
    h.relay.sink(0).emit(answer(&attempt));
    h.handle.snapshot().await;

    tokio::time::sleep(Duration::from_millis(3_999)).await;
    assert_eq!(h.handle.snapshot().await.status, ConnectionStatus::Connecting);
    tokio::time::sleep(Duration::from_millis(2)).await;
    let snapshot = h.handle.snapshot().await;
    assert_eq!(snapshot.status, ConnectionStatus::Failed);
    assert_eq!(snapshot.last_error.as_deref(), Some("no video track received"));
}

#[tokio::test(start_paused = true)]
async fn track_disarms_watchdog() {
    let h = harness_with(
        SessionConfig::default()
            .with_auto_connect(false)
            .with_track_timeout(Some(Duration::from_secs(4))),
    );
    h.handle.enable();
    h.handle.snapshot().await;
    connect(&h, 0).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    let snapshot = h.handle.snapshot().await;
    assert_eq!(snapshot.status, ConnectionStatus::Connected);
    assert_eq!(snapshot.last_error, None);
}

#[tokio::test]
async fn clean_close_before_answer_stops_without_retry() {
    let h = harness();
    h.handle.enable();
    h.handle.snapshot().await;
    h.relay.accept(0);
    h.relay
        .sink(0)
        .emit(AttemptEvent::ChannelClosed(CloseReason::Clean));

    let snapshot = h.handle.snapshot().await;
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert_eq!(snapshot.next_retry, None);
    assert_eq!(h.transports.log(0).closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn clean_close_after_negotiation_keeps_media() {
    let h = harness();
    h.handle.enable();
    h.handle.snapshot().await;
    connect(&h, 0).await;
    h.relay
        .sink(0)
        .emit(AttemptEvent::ChannelClosed(CloseReason::Clean));

    let snapshot = h.handle.snapshot().await;
    assert_eq!(snapshot.status, ConnectionStatus::Connected);
    assert_eq!(h.transports.log(0).closes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn refused_autoplay_waits_for_a_single_interaction() {
    let h = harness();
    h.surface.refuse_next();
    h.handle.enable();
    h.handle.snapshot().await;
    connect(&h, 0).await;

    let snapshot = playback_settles(&h, PlaybackState::AwaitingInteraction).await;
    assert_eq!(snapshot.status, ConnectionStatus::Connected);
    assert!(snapshot.awaiting_interaction());
    assert_eq!(snapshot.badge(), StatusBadge::Ready);
    assert_eq!(h.bus.listener_count(), 1);

    let mut state = h.handle.subscribe();
    assert_eq!(h.bus.interact(), 1);
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| s.is_playing()))
        .await
        .expect("playback started")
        .expect("session alive");

    assert_eq!(h.bus.interact(), 0);
    h.handle.snapshot().await;
    assert_eq!(h.surface.count("play"), 2);
    assert_eq!(h.handle.snapshot().await.badge(), StatusBadge::Live);
}

#[tokio::test]
async fn manual_play_starts_refused_playback() {
    let h = harness();
    h.surface.refuse_next();
    h.handle.enable();
    h.handle.snapshot().await;
    connect(&h, 0).await;
    playback_settles(&h, PlaybackState::AwaitingInteraction).await;

    h.handle.manual_play();
    playback_settles(&h, PlaybackState::Active).await;
    assert_eq!(h.bus.interact(), 0);

    h.handle.manual_play();
    h.handle.snapshot().await;
    assert_eq!(h.surface.count("play"), 2);
}

#[tokio::test]
async fn toggle_flips_enabled_and_forgets_interaction() {
    let h = harness();
    h.handle.toggle();
    let snapshot = h.handle.snapshot().await;
    assert!(snapshot.enabled);
    connect(&h, 0).await;
    playback_settles(&h, PlaybackState::Active).await;

    h.handle.toggle();
    let snapshot = h.handle.snapshot().await;
    assert!(!snapshot.enabled);
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);

    // with the interaction forgotten, a refusal asks for a gesture again
    h.surface.refuse_next();
    h.handle.toggle();
    h.handle.snapshot().await;
    connect(&h, 1).await;
    playback_settles(&h, PlaybackState::AwaitingInteraction).await;
}

#[tokio::test]
async fn auto_connect_starts_first_attempt() {
    let h = harness_with(SessionConfig::default().with_track_timeout(None));
    let snapshot = h.handle.snapshot().await;
    assert!(snapshot.enabled);
    assert_eq!(snapshot.status, ConnectionStatus::Connecting);
    assert_eq!(h.transports.count(), 1);
    h.handle.shutdown().await;
    assert_eq!(h.transports.log(0).closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disable_is_not_held_up_by_a_pending_play_start() {
    let h = harness();
    h.surface.never_resolve.store(true, Ordering::SeqCst);
    h.handle.enable();
    h.handle.snapshot().await;
    connect(&h, 0).await;
    assert_eq!(h.handle.snapshot().await.status, ConnectionStatus::Connected);
    tokio::task::yield_now().await;
    assert_eq!(h.surface.count("play"), 1);

    h.handle.disable();
    let snapshot = tokio::time::timeout(Duration::from_secs(2), h.handle.snapshot())
        .await
        .expect("controller still responsive");
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert!(!snapshot.enabled);
    assert_eq!(snapshot.playback, PlaybackState::Inactive);
    assert_eq!(h.transports.log(0).closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.surface.count("clear"), 1);

    for _ in 0..3 {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.surface.abandoned.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transport_failure_is_handled_while_play_is_pending() {
    let h = harness();
    h.surface.never_resolve.store(true, Ordering::SeqCst);
    h.handle.enable();
    h.handle.snapshot().await;
    connect(&h, 0).await;

    h.relay
        .sink(0)
        .emit(AttemptEvent::TransportState(TransportState::Failed));
    let snapshot = tokio::time::timeout(Duration::from_secs(2), h.handle.snapshot())
        .await
        .expect("controller still responsive");
    assert_eq!(snapshot.status, ConnectionStatus::Failed);
    assert_eq!(snapshot.retry_count, 1);
}

#[tokio::test]
async fn playback_error_marks_card_without_failing_attempt() {
    let h = harness();
    h.handle.enable();
    h.handle.snapshot().await;
    connect(&h, 0).await;
    playback_settles(&h, PlaybackState::Active).await;

    h.surface.reporter().failed("decoder error");
    let snapshot = playback_settles(&h, PlaybackState::Inactive).await;
    assert_eq!(snapshot.status, ConnectionStatus::Connected);
    assert_eq!(snapshot.last_error.as_deref(), Some("Video playback error"));
    assert_eq!(snapshot.badge(), StatusBadge::Ready);
    assert_eq!(snapshot.next_retry, None);
    assert_eq!(h.transports.log(0).closes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn ended_track_stops_playback_and_stale_reports_are_ignored() {
    let h = harness();
    h.handle.enable();
    h.handle.snapshot().await;
    connect(&h, 0).await;
    playback_settles(&h, PlaybackState::Active).await;
    let first = h.surface.reporter();

    first.ended();
    let snapshot = playback_settles(&h, PlaybackState::Inactive).await;
    assert_eq!(snapshot.status, ConnectionStatus::Connected);
    assert_eq!(snapshot.last_error, None);
    assert_eq!(snapshot.badge(), StatusBadge::Ready);

    h.handle.restart();
    h.handle.snapshot().await;
    connect(&h, 1).await;
    playback_settles(&h, PlaybackState::Active).await;

    // reporter of the torn down attempt no longer reaches the card
    first.failed("decoder error");
    let snapshot = h.handle.snapshot().await;
    assert_eq!(snapshot.playback, PlaybackState::Active);
    assert_eq!(snapshot.last_error, None);
}

#[tokio::test]
async fn enable_after_clean_close_starts_a_new_attempt() {
    let h = harness();
    h.handle.enable();
    h.handle.snapshot().await;
    h.relay.accept(0);
    h.relay
        .sink(0)
        .emit(AttemptEvent::ChannelClosed(CloseReason::Clean));
    let snapshot = h.handle.snapshot().await;
    assert!(snapshot.enabled);
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);

    h.handle.enable();
    let snapshot = h.handle.snapshot().await;
    assert_eq!(snapshot.status, ConnectionStatus::Connecting);
    assert_eq!(h.relay.count(), 2);

    // enabling again while connecting changes nothing
    h.handle.enable();
    h.handle.snapshot().await;
    assert_eq!(h.relay.count(), 2);
}

#[tokio::test]
async fn ice_failure_fails_the_attempt() {
    let h = harness();
    h.handle.enable();
    h.handle.snapshot().await;
    h.relay.accept(0);
    h.relay.sink(0).emit(AttemptEvent::IceFailed);

    let snapshot = h.handle.snapshot().await;
    assert_eq!(snapshot.status, ConnectionStatus::Failed);
    assert_eq!(snapshot.last_error.as_deref(), Some("ICE connection failed"));
    assert_eq!(snapshot.next_retry, Some(Duration::from_millis(1_000)));
}
