//! Session controller.
//!
//! A single actor task owns every piece of session state. Callers, signaling
//! channels, peer transports, the playback gate and the reconnect timer only
//! post envelopes into its inbox; the actor dispatches them one
//! at a time, so no two transitions ever interleave. Nothing the actor awaits
//! depends on the surface: play starts report back as envelopes.

use std::ops::ControlFlow;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::events::{AttemptEvent, AttemptSink, CloseReason, MediaStream, TransportState};
use crate::negotiator::{PeerTransport, TransportFactory, WebRtcTransportFactory};
use crate::playback::{GateEvent, InteractionBus, PlaybackGate, PlaybackStop, PlaybackSurface};
use crate::protocol::{AttemptId, IceCandidate, InboundMessage, OutboundMessage};
use crate::reconnect::ReconnectScheduler;
use crate::signaling::{RelayConnector, SignalingChannel, SignalingConnector};
use crate::status::{ConnectionStatus, SessionSnapshot};

const RELAY_ERROR_FALLBACK: &str = "Connection error";
const NO_TRACK_REASON: &str = "no video track received";
const ICE_FAILED_REASON: &str = "ICE connection failed";
const PLAYBACK_ERROR: &str = "Video playback error";

pub(crate) enum Envelope {
    Command(Command),
    Attempt {
        attempt: AttemptId,
        event: AttemptEvent,
    },
    Playback(GateEvent),
    RetryDue {
        ticket: u64,
    },
}

pub(crate) enum Command {
    SetEnabled(bool),
    Toggle,
    Restart,
    ManualPlay,
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

impl Command {
    fn kind(&self) -> &'static str {
        match self {
            Command::SetEnabled(true) => "enable",
            Command::SetEnabled(false) => "disable",
            Command::Toggle => "toggle",
            Command::Restart => "restart",
            Command::ManualPlay => "manual_play",
            Command::Snapshot(_) => "snapshot",
            Command::Shutdown(_) => "shutdown",
        }
    }
}

/// Builder for one live view of a named agent.
pub struct LiveSession {
    agent: String,
    config: SessionConfig,
    surface: Arc<dyn PlaybackSurface>,
    interactions: InteractionBus,
    connector: Arc<dyn SignalingConnector>,
    transports: Arc<dyn TransportFactory>,
}

impl LiveSession {
    /// A session wired to the relay and a WebRTC peer transport as configured.
    pub fn new(
        agent: impl Into<String>,
        config: SessionConfig,
        surface: Arc<dyn PlaybackSurface>,
    ) -> Self {
        let connector = Arc::new(RelayConnector::new(config.relay_url.clone()));
        let transports = Arc::new(WebRtcTransportFactory::new(config.ice_servers.clone()));
        Self {
            agent: agent.into(),
            config,
            surface,
            interactions: InteractionBus::new(),
            connector,
            transports,
        }
    }

    /// Shares the console-wide interaction bus.
    pub fn with_interactions(mut self, interactions: InteractionBus) -> Self {
        self.interactions = interactions;
        self
    }

    pub fn with_signaling(mut self, connector: Arc<dyn SignalingConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_transport(mut self, transports: Arc<dyn TransportFactory>) -> Self {
        self.transports = transports;
        self
    }

    /// Starts the controller task. Must be called within a tokio runtime.
    pub fn spawn(self) -> SessionHandle {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (published, state) = watch::channel(SessionSnapshot::new(self.agent.clone()));

        let playback_inbox = inbox.clone();
        let gate = PlaybackGate::new(self.surface, self.interactions, move |event| {
            let _ = playback_inbox.send(Envelope::Playback(event));
        });
        let scheduler =
            ReconnectScheduler::new(self.config.reconnect_base, self.config.reconnect_cap);

        let actor = SessionActor {
            agent: self.agent.clone(),
            config: self.config,
            inbox: inbox.clone(),
            connector: self.connector,
            transports: self.transports,
            gate,
            scheduler,
            enabled: false,
            status: ConnectionStatus::Disconnected,
            last_error: None,
            attempt: None,
            published,
        };
        let task = tokio::spawn(actor.run(inbox_rx));

        SessionHandle {
            agent: self.agent,
            inbox,
            state,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }
}

/// Cloneable caller surface of a running session.
///
/// The controller stops on [`SessionHandle::shutdown`] or once every handle
/// and subscriber is gone.
#[derive(Clone)]
pub struct SessionHandle {
    agent: String,
    inbox: mpsc::UnboundedSender<Envelope>,
    state: watch::Receiver<SessionSnapshot>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionHandle {
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// State after every command and event posted before this call.
    pub async fn snapshot(&self) -> SessionSnapshot {
        let (tx, rx) = oneshot::channel();
        self.post(Command::Snapshot(tx));
        match rx.await {
            Ok(snapshot) => snapshot,
            Err(_) => self.current(),
        }
    }

    /// Last published state, without waiting for the controller.
    pub fn current(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    pub fn enable(&self) {
        self.set_enabled(true);
    }

    pub fn disable(&self) {
        self.set_enabled(false);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.post(Command::SetEnabled(enabled));
    }

    /// Flips the enabled flag and forgets any recorded interaction.
    pub fn toggle(&self) {
        self.post(Command::Toggle);
    }

    pub fn restart(&self) {
        self.post(Command::Restart);
    }

    pub fn manual_play(&self) {
        self.post(Command::ManualPlay);
    }

    /// Tears everything down and waits for the controller to stop.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        self.post(Command::Shutdown(tx));
        let _ = rx.await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn post(&self, command: Command) {
        let kind = command.kind();
        if self.inbox.send(Envelope::Command(command)).is_err() {
            tracing::debug!(
                target = "live_view::session",
                agent = %self.agent,
                command = kind,
                "session already stopped"
            );
        }
    }
}

/// Everything owned by one connection attempt; released as a unit.
struct Attempt {
    id: AttemptId,
    sink: AttemptSink,
    channel: Box<dyn SignalingChannel>,
    transport: Box<dyn PeerTransport>,
    answer_applied: bool,
    pending_candidates: Vec<IceCandidate>,
    media_attached: bool,
    watchdog: Option<JoinHandle<()>>,
}

struct SessionActor {
    agent: String,
    config: SessionConfig,
    inbox: mpsc::UnboundedSender<Envelope>,
    connector: Arc<dyn SignalingConnector>,
    transports: Arc<dyn TransportFactory>,
    gate: PlaybackGate,
    scheduler: ReconnectScheduler,
    enabled: bool,
    status: ConnectionStatus,
    last_error: Option<String>,
    attempt: Option<Attempt>,
    published: watch::Sender<SessionSnapshot>,
}

impl SessionActor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
        tracing::debug!(target = "live_view::session", agent = %self.agent, "session started");
        if self.config.auto_connect {
            self.set_enabled(true).await;
            self.publish();
        }

        loop {
            let next = tokio::select! {
                envelope = inbox.recv() => envelope,
                _ = self.published.closed() => None,
            };
            let Some(envelope) = next else {
                self.stop().await;
                break;
            };
            if self.dispatch(envelope).await.is_break() {
                break;
            }
        }
        tracing::debug!(target = "live_view::session", agent = %self.agent, "session stopped");
    }

    async fn dispatch(&mut self, envelope: Envelope) -> ControlFlow<()> {
        match envelope {
            Envelope::Command(Command::Snapshot(reply)) => {
                let _ = reply.send(self.snapshot());
                return ControlFlow::Continue(());
            }
            Envelope::Command(Command::Shutdown(ack)) => {
                self.stop().await;
                let _ = ack.send(());
                return ControlFlow::Break(());
            }
            Envelope::Command(command) => self.handle_command(command).await,
            Envelope::Attempt { attempt, event } => {
                let current = self.attempt.as_ref().map(|current| &current.id);
                if current == Some(&attempt) {
                    self.handle_attempt_event(event).await;
                } else {
                    tracing::trace!(
                        target = "live_view::session",
                        agent = %self.agent,
                        attempt = %attempt,
                        kind = event.kind(),
                        "discarding event from stale attempt"
                    );
                }
            }
            Envelope::Playback(event) => self.on_playback(event),
            Envelope::RetryDue { ticket } => self.handle_retry(ticket).await,
        }
        self.publish();
        ControlFlow::Continue(())
    }

    async fn handle_command(&mut self, command: Command) {
        tracing::debug!(
            target = "live_view::session",
            agent = %self.agent,
            command = command.kind(),
            "command"
        );
        match command {
            Command::SetEnabled(enabled) => self.set_enabled(enabled).await,
            Command::Toggle => {
                self.gate.forget_interaction();
                self.set_enabled(!self.enabled).await;
            }
            Command::Restart => {
                self.set_enabled(false).await;
                self.set_enabled(true).await;
            }
            Command::ManualPlay => self.gate.manual_play(),
            Command::Snapshot(_) | Command::Shutdown(_) => {}
        }
    }

    async fn set_enabled(&mut self, enabled: bool) {
        if enabled {
            // a relay that closed cleanly leaves the session enabled but idle
            let idle = self.attempt.is_none() && self.status == ConnectionStatus::Disconnected;
            if self.enabled && !idle {
                return;
            }
            self.enabled = true;
            self.scheduler.cancel();
            self.start_attempt().await;
        } else {
            self.enabled = false;
            self.scheduler.cancel();
            self.teardown().await;
            self.status = ConnectionStatus::Disconnected;
            self.scheduler.reset();
            self.last_error = None;
            self.gate.forget_interaction();
        }
    }

    async fn handle_retry(&mut self, ticket: u64) {
        if !self.scheduler.take_fired(ticket) {
            return;
        }
        if self.enabled && self.attempt.is_none() && self.status == ConnectionStatus::Failed {
            tracing::info!(
                target = "live_view::session",
                agent = %self.agent,
                retry = self.scheduler.retry_count(),
                "reconnecting"
            );
            self.start_attempt().await;
        }
    }

    async fn start_attempt(&mut self) {
        self.teardown().await;

        let id = AttemptId::generate();
        let sink = AttemptSink::new(id.clone(), self.inbox.clone());
        self.last_error = None;
        self.status = ConnectionStatus::Connecting;
        self.publish();
        tracing::info!(
            target = "live_view::session",
            agent = %self.agent,
            attempt = %id,
            "starting connection attempt"
        );

        let transport = match self.transports.create(&self.agent, sink.clone()).await {
            Ok(transport) => transport,
            Err(err) => {
                sink.detach();
                self.fail_attempt(err).await;
                return;
            }
        };
        let channel = self.connector.open(&self.agent, sink.clone());
        self.attempt = Some(Attempt {
            id,
            sink,
            channel,
            transport,
            answer_applied: false,
            pending_candidates: Vec::new(),
            media_attached: false,
            watchdog: None,
        });
    }

    async fn handle_attempt_event(&mut self, event: AttemptEvent) {
        match event {
            AttemptEvent::ChannelOpened => self.on_channel_open().await,
            AttemptEvent::ChannelClosed(CloseReason::Clean) => self.on_clean_close().await,
            AttemptEvent::ChannelClosed(CloseReason::Abnormal(reason)) => {
                self.fail_attempt(SessionError::Channel(reason)).await;
            }
            AttemptEvent::Inbound(message) => self.on_inbound(message).await,
            AttemptEvent::LocalCandidate(candidate) => {
                if let Some(attempt) = &self.attempt {
                    attempt
                        .channel
                        .send(OutboundMessage::candidate(candidate, &attempt.id));
                }
            }
            AttemptEvent::TrackAvailable(stream) => self.on_track(stream),
            AttemptEvent::TransportState(state) => self.on_transport_state(state).await,
            AttemptEvent::IceFailed => {
                self.fail_attempt(SessionError::Transport(ICE_FAILED_REASON.into()))
                    .await;
            }
            AttemptEvent::TrackTimeout => {
                let missing = self
                    .attempt
                    .as_ref()
                    .is_some_and(|attempt| !attempt.media_attached);
                if missing {
                    self.fail_attempt(SessionError::Transport(NO_TRACK_REASON.into()))
                        .await;
                }
            }
        }
    }

    async fn on_channel_open(&mut self) {
        let Some(attempt) = &self.attempt else {
            return;
        };
        attempt.channel.send(OutboundMessage::identify(&attempt.id));
        let offer = match attempt.transport.create_offer().await {
            Ok(sdp) => attempt
                .transport
                .set_local_description(&sdp)
                .await
                .map(|()| sdp),
            Err(err) => Err(err),
        };
        match offer {
            Ok(sdp) => {
                tracing::debug!(
                    target = "live_view::session",
                    agent = %self.agent,
                    attempt = %attempt.id,
                    "sending offer"
                );
                attempt.channel.send(OutboundMessage::offer(sdp, &attempt.id));
            }
            Err(err) => self.fail_attempt(err).await,
        }
    }

    async fn on_clean_close(&mut self) {
        let answered = self
            .attempt
            .as_ref()
            .is_some_and(|attempt| attempt.answer_applied);
        if answered {
            // media flows without the relay once negotiated
            tracing::info!(
                target = "live_view::session",
                agent = %self.agent,
                "relay closed the channel after negotiation"
            );
            return;
        }
        tracing::info!(
            target = "live_view::session",
            agent = %self.agent,
            "relay closed the channel before answering"
        );
        self.teardown().await;
        self.status = ConnectionStatus::Disconnected;
    }

    async fn on_inbound(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::Answer { sdp, attempt_id } => self.on_answer(sdp, attempt_id).await,
            InboundMessage::Candidate {
                candidate,
                attempt_id,
            } => self.on_remote_candidate(candidate, attempt_id).await,
            InboundMessage::Error { message } => {
                let reason = message.unwrap_or_else(|| RELAY_ERROR_FALLBACK.to_string());
                self.fail_attempt(SessionError::Channel(reason)).await;
            }
            InboundMessage::Ack { message }
            | InboundMessage::Ready { message }
            | InboundMessage::ViewerConnected { message } => {
                tracing::info!(
                    target = "live_view::session",
                    agent = %self.agent,
                    notice = message.as_deref().unwrap_or_default(),
                    "relay notice"
                );
            }
            InboundMessage::Unknown => {
                tracing::debug!(
                    target = "live_view::session",
                    agent = %self.agent,
                    "ignoring unknown relay message"
                );
            }
        }
    }

    async fn on_answer(&mut self, sdp: String, attempt_id: AttemptId) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        if attempt.id != attempt_id {
            tracing::debug!(
                target = "live_view::session",
                agent = %self.agent,
                expected = %attempt.id,
                received = %attempt_id,
                "answer for a different attempt"
            );
            return;
        }
        if attempt.answer_applied {
            tracing::debug!(
                target = "live_view::session",
                agent = %self.agent,
                "answer already applied"
            );
            return;
        }

        if let Err(err) = attempt.transport.apply_answer(&sdp).await {
            self.fail_attempt(err).await;
            return;
        }
        attempt.answer_applied = true;
        tracing::info!(
            target = "live_view::session",
            agent = %self.agent,
            attempt = %attempt.id,
            queued = attempt.pending_candidates.len(),
            "answer applied"
        );
        for candidate in std::mem::take(&mut attempt.pending_candidates) {
            add_remote_candidate(&self.agent, attempt.transport.as_ref(), candidate).await;
        }
        if let (Some(timeout), false) = (self.config.track_timeout, attempt.media_attached) {
            let sink = attempt.sink.clone();
            attempt.watchdog = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                sink.emit(AttemptEvent::TrackTimeout);
            }));
        }
    }

    async fn on_remote_candidate(&mut self, candidate: Option<IceCandidate>, attempt_id: AttemptId) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        if attempt.id != attempt_id {
            tracing::debug!(
                target = "live_view::session",
                agent = %self.agent,
                received = %attempt_id,
                "candidate for a different attempt"
            );
            return;
        }
        let Some(candidate) = candidate else {
            return;
        };
        if attempt.answer_applied {
            add_remote_candidate(&self.agent, attempt.transport.as_ref(), candidate).await;
        } else {
            attempt.pending_candidates.push(candidate);
        }
    }

    fn on_track(&mut self, stream: MediaStream) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        if attempt.media_attached {
            return;
        }
        attempt.media_attached = true;
        if let Some(watchdog) = attempt.watchdog.take() {
            watchdog.abort();
        }
        tracing::info!(
            target = "live_view::session",
            agent = %self.agent,
            attempt = %attempt.id,
            stream = %stream.id(),
            "video track received"
        );
        self.gate.attach(stream);
        self.mark_connected();
        self.publish();
        self.gate.autoplay();
    }

    fn on_playback(&mut self, event: GateEvent) {
        // a stopped track leaves the attempt up; only the card shows it
        if let Some(PlaybackStop::Error(reason)) = self.gate.handle(event) {
            tracing::warn!(
                target = "live_view::session",
                agent = %self.agent,
                error = %reason,
                "video playback error"
            );
            self.last_error = Some(PLAYBACK_ERROR.to_string());
        }
    }

    async fn on_transport_state(&mut self, state: TransportState) {
        match state {
            TransportState::Connected => self.mark_connected(),
            TransportState::Disconnected | TransportState::Failed => {
                let reason = match state {
                    TransportState::Disconnected => "peer connection disconnected",
                    _ => "peer connection failed",
                };
                self.fail_attempt(SessionError::Transport(reason.into())).await;
            }
            TransportState::Connecting | TransportState::Closed => {
                tracing::debug!(
                    target = "live_view::session",
                    agent = %self.agent,
                    state = ?state,
                    "transport state"
                );
            }
        }
    }

    fn mark_connected(&mut self) {
        if self.status != ConnectionStatus::Connected {
            tracing::info!(target = "live_view::session", agent = %self.agent, "connected");
        }
        self.status = ConnectionStatus::Connected;
        self.scheduler.reset();
    }

    async fn fail_attempt(&mut self, err: SessionError) {
        tracing::warn!(
            target = "live_view::session",
            agent = %self.agent,
            error = %err,
            "connection attempt failed"
        );
        self.teardown().await;
        self.status = ConnectionStatus::Failed;
        self.last_error = Some(err.reason().to_string());
        if self.enabled {
            let inbox = self.inbox.clone();
            let delay = self.scheduler.schedule(move |ticket| {
                let _ = inbox.send(Envelope::RetryDue { ticket });
            });
            tracing::info!(
                target = "live_view::session",
                agent = %self.agent,
                delay_ms = delay.as_millis() as u64,
                retry = self.scheduler.retry_count(),
                "reconnect scheduled"
            );
        }
    }

    /// Releases the current attempt, if any. Callbacks are detached first so
    /// nothing of the attempt reaches the inbox afterwards.
    async fn teardown(&mut self) {
        let Some(attempt) = self.attempt.take() else {
            return;
        };
        attempt.sink.detach();
        if let Some(watchdog) = attempt.watchdog {
            watchdog.abort();
        }
        attempt.channel.close();
        attempt.transport.close().await;
        self.gate.reset_media();
        tracing::debug!(
            target = "live_view::session",
            agent = %self.agent,
            attempt = %attempt.id,
            "attempt torn down"
        );
    }

    async fn stop(&mut self) {
        self.enabled = false;
        self.scheduler.cancel();
        self.teardown().await;
        self.gate.shutdown();
        self.status = ConnectionStatus::Disconnected;
        self.publish();
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            agent: self.agent.clone(),
            enabled: self.enabled,
            status: self.status,
            playback: self.gate.state(),
            last_error: self.last_error.clone(),
            retry_count: self.scheduler.retry_count(),
            next_retry: self.scheduler.pending_delay(),
        }
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.published.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}

async fn add_remote_candidate(agent: &str, transport: &dyn PeerTransport, candidate: IceCandidate) {
    if let Err(err) = transport.add_remote_candidate(candidate).await {
        tracing::warn!(
            target = "live_view::session",
            agent = %agent,
            error = %err,
            "failed to add remote candidate"
        );
    }
}
