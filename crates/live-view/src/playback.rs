//! Playback gate: automatic start when the platform allows it, otherwise a
//! one-shot wait for the first user interaction on the dashboard.
//!
//! The gate never waits on the surface itself. Play starts and interaction
//! listeners run as tasks that report back through the owner's `notify`
//! callback as [`GateEvent`]s, each stamped with a ticket so that reports
//! from replaced or cancelled tasks are ignored.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::error::SessionResult;
use crate::events::MediaStream;

const INTERACTION_BUFFER: usize = 16;

type Notify = Arc<dyn Fn(GateEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Inactive,
    /// Media is attached but automatic start was refused and no interaction
    /// has been recorded yet.
    AwaitingInteraction,
    Active,
}

/// Where decoded media is rendered.
#[async_trait]
pub trait PlaybackSurface: Send + Sync {
    /// `reporter` is only valid for this attachment.
    fn attach(&self, stream: MediaStream, reporter: PlaybackReporter);
    fn clear(&self);
    /// Starts playback of the attached stream. A refusal is reported as
    /// [`SessionError::Playback`](crate::SessionError::Playback). May stay
    /// pending until the first frame is rendered.
    async fn play(&self) -> SessionResult<()>;
}

/// Why playback stopped while media was still attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackStop {
    /// The source track ended.
    Ended,
    /// The surface could not render the stream.
    Error(String),
}

/// Reports from the gate's background tasks and from the surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateEvent {
    Interaction { ticket: u64 },
    PlayFinished { ticket: u64, result: SessionResult<()> },
    Stopped { attachment: u64, stop: PlaybackStop },
}

/// Handed to the surface with each attachment.
#[derive(Clone)]
pub struct PlaybackReporter {
    attachment: u64,
    notify: Notify,
}

impl PlaybackReporter {
    /// A reporter not bound to any gate; reports land in the returned receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<GateEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reporter = Self {
            attachment: 0,
            notify: Arc::new(move |event| {
                let _ = tx.send(event);
            }),
        };
        (reporter, rx)
    }

    pub fn ended(&self) {
        self.report(PlaybackStop::Ended);
    }

    pub fn failed(&self, reason: impl Into<String>) {
        self.report(PlaybackStop::Error(reason.into()));
    }

    fn report(&self, stop: PlaybackStop) {
        (self.notify)(GateEvent::Stopped {
            attachment: self.attachment,
            stop,
        });
    }
}

impl fmt::Debug for PlaybackReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackReporter")
            .field("attachment", &self.attachment)
            .finish()
    }
}

/// Document-wide interaction notifications shared by every session of a console.
#[derive(Debug, Clone)]
pub struct InteractionBus {
    tx: broadcast::Sender<()>,
}

impl InteractionBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(INTERACTION_BUFFER);
        Self { tx }
    }

    /// Reports a user interaction; returns how many listeners were armed.
    pub fn interact(&self) -> usize {
        self.tx.send(()).unwrap_or(0)
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }
}

impl Default for InteractionBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A ticketed background task. Dropping it aborts the task.
struct GateTask {
    ticket: u64,
    task: JoinHandle<()>,
}

impl Drop for GateTask {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlayKind {
    Autoplay,
    Retry,
}

struct PendingPlay {
    kind: PlayKind,
    task: GateTask,
}

pub struct PlaybackGate {
    surface: Arc<dyn PlaybackSurface>,
    bus: InteractionBus,
    notify: Notify,
    state: PlaybackState,
    interacted: bool,
    media: bool,
    attachment: u64,
    listener: Option<GateTask>,
    play: Option<PendingPlay>,
    next_ticket: u64,
}

impl PlaybackGate {
    /// Every [`GateEvent`] is passed to `notify`; hand it back through
    /// [`PlaybackGate::handle`].
    pub fn new(
        surface: Arc<dyn PlaybackSurface>,
        bus: InteractionBus,
        notify: impl Fn(GateEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            surface,
            bus,
            notify: Arc::new(notify),
            state: PlaybackState::Inactive,
            interacted: false,
            media: false,
            attachment: 0,
            listener: None,
            play: None,
            next_ticket: 0,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn has_interacted(&self) -> bool {
        self.interacted
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    /// A play start is in flight.
    pub fn is_starting(&self) -> bool {
        self.play.is_some()
    }

    pub fn attach(&mut self, stream: MediaStream) {
        tracing::debug!(target = "live_view::playback", stream = %stream.id(), "attaching stream");
        self.listener = None;
        self.play = None;
        self.attachment += 1;
        let reporter = PlaybackReporter {
            attachment: self.attachment,
            notify: Arc::clone(&self.notify),
        };
        self.surface.attach(stream, reporter);
        self.media = true;
        self.state = PlaybackState::Inactive;
    }

    /// The single automatic start attempt after media is attached.
    pub fn autoplay(&mut self) {
        if self.media {
            self.start_play(PlayKind::Autoplay);
        }
    }

    /// Explicit play request; a no-op while already playing.
    pub fn manual_play(&mut self) {
        if self.state == PlaybackState::Active {
            return;
        }
        self.listener = None;
        self.interacted = true;
        if self.media {
            self.start_play(PlayKind::Retry);
        }
    }

    /// Applies a report from one of the gate's tasks or from the surface.
    /// Returns the stop reason when a stop for the current attachment was
    /// accepted.
    pub fn handle(&mut self, event: GateEvent) -> Option<PlaybackStop> {
        match event {
            GateEvent::Interaction { ticket } => {
                self.interaction(ticket);
                None
            }
            GateEvent::PlayFinished { ticket, result } => {
                self.play_finished(ticket, result);
                None
            }
            GateEvent::Stopped { attachment, stop } => {
                self.stopped(attachment, &stop).then_some(stop)
            }
        }
    }

    /// Detaches media from the surface at the end of an attempt.
    pub fn reset_media(&mut self) {
        self.listener = None;
        self.play = None;
        if self.media {
            self.surface.clear();
        }
        self.media = false;
        self.state = PlaybackState::Inactive;
    }

    pub fn forget_interaction(&mut self) {
        self.interacted = false;
    }

    pub fn shutdown(&mut self) {
        self.reset_media();
    }

    fn interaction(&mut self, ticket: u64) {
        match &self.listener {
            Some(listener) if listener.ticket == ticket => {}
            _ => {
                tracing::trace!(target = "live_view::playback", ticket, "stale interaction");
                return;
            }
        }
        tracing::debug!(target = "live_view::playback", "user interaction detected");
        self.listener = None;
        self.interacted = true;
        if self.media {
            self.start_play(PlayKind::Retry);
        }
    }

    fn play_finished(&mut self, ticket: u64, result: SessionResult<()>) {
        let kind = match &self.play {
            Some(pending) if pending.task.ticket == ticket => pending.kind,
            _ => {
                tracing::trace!(target = "live_view::playback", ticket, "stale play result");
                return;
            }
        };
        self.play = None;
        match result {
            Ok(()) => {
                tracing::info!(target = "live_view::playback", "playback started");
                self.listener = None;
                self.interacted = true;
                self.state = PlaybackState::Active;
            }
            Err(err) if kind == PlayKind::Autoplay && !self.interacted => {
                tracing::info!(
                    target = "live_view::playback",
                    error = %err,
                    "autoplay blocked; waiting for interaction"
                );
                self.state = PlaybackState::AwaitingInteraction;
                self.arm();
            }
            Err(err) if kind == PlayKind::Autoplay => {
                tracing::info!(
                    target = "live_view::playback",
                    error = %err,
                    "playback refused after prior interaction"
                );
                self.state = PlaybackState::Inactive;
            }
            Err(err) => {
                tracing::warn!(target = "live_view::playback", error = %err, "playback failed");
                self.state = PlaybackState::Inactive;
            }
        }
    }

    fn stopped(&mut self, attachment: u64, stop: &PlaybackStop) -> bool {
        if !self.media || attachment != self.attachment {
            tracing::trace!(target = "live_view::playback", attachment, "stale playback stop");
            return false;
        }
        match stop {
            PlaybackStop::Ended => {
                tracing::info!(target = "live_view::playback", "media track ended");
            }
            PlaybackStop::Error(reason) => {
                tracing::warn!(target = "live_view::playback", error = %reason, "playback error");
            }
        }
        self.listener = None;
        self.play = None;
        self.state = PlaybackState::Inactive;
        true
    }

    fn start_play(&mut self, kind: PlayKind) {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let surface = Arc::clone(&self.surface);
        let notify = Arc::clone(&self.notify);
        let task = tokio::spawn(async move {
            let result = surface.play().await;
            notify(GateEvent::PlayFinished { ticket, result });
        });
        // replacing a pending start aborts it
        self.play = Some(PendingPlay {
            kind,
            task: GateTask { ticket, task },
        });
    }

    fn arm(&mut self) {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let mut rx = self.bus.subscribe();
        let notify = Arc::clone(&self.notify);
        let task = tokio::spawn(async move {
            match rx.recv().await {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    notify(GateEvent::Interaction { ticket })
                }
                Err(broadcast::error::RecvError::Closed) => {}
            }
        });
        self.listener = Some(GateTask { ticket, task });
    }
}
