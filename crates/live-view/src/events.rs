//! Attempt-scoped events flowing from the signaling channel and the peer
//! transport back into the session controller.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

use crate::protocol::{AttemptId, IceCandidate, InboundMessage};
use crate::session::Envelope;

/// Why the relay channel closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Normal or going-away close initiated by the relay.
    Clean,
    /// Open failure, transport error or a non-normal close code.
    Abnormal(String),
}

/// Peer transport state as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Inbound media handed to the playback surface.
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    track: Option<Arc<TrackRemote>>,
}

impl MediaStream {
    pub fn from_track(track: Arc<TrackRemote>) -> Self {
        Self {
            id: track.stream_id(),
            track: Some(track),
        }
    }

    /// A stream with no RTP source behind it, for loopback surfaces.
    pub fn detached(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            track: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn track(&self) -> Option<&Arc<TrackRemote>> {
        self.track.as_ref()
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("has_track", &self.track.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum AttemptEvent {
    ChannelOpened,
    ChannelClosed(CloseReason),
    Inbound(InboundMessage),
    LocalCandidate(IceCandidate),
    TrackAvailable(MediaStream),
    TransportState(TransportState),
    /// ICE checks failed for every candidate pair.
    IceFailed,
    TrackTimeout,
}

impl AttemptEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AttemptEvent::ChannelOpened => "channel_opened",
            AttemptEvent::ChannelClosed(_) => "channel_closed",
            AttemptEvent::Inbound(_) => "inbound",
            AttemptEvent::LocalCandidate(_) => "local_candidate",
            AttemptEvent::TrackAvailable(_) => "track_available",
            AttemptEvent::TransportState(_) => "transport_state",
            AttemptEvent::IceFailed => "ice_failed",
            AttemptEvent::TrackTimeout => "track_timeout",
        }
    }
}

/// Handle a per-attempt subsystem uses to report back to the controller.
///
/// Every clone shares one attachment flag; once the attempt is torn down the
/// sink swallows whatever its callbacks still try to deliver.
#[derive(Clone)]
pub struct AttemptSink {
    attempt: AttemptId,
    attached: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl AttemptSink {
    pub(crate) fn new(attempt: AttemptId, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            attempt,
            attached: Arc::new(AtomicBool::new(true)),
            tx,
        }
    }

    /// A sink detached from any controller; events land in the returned receiver.
    pub fn channel(attempt: AttemptId) -> (Self, AttemptEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(attempt, tx), AttemptEvents { rx })
    }

    pub fn attempt(&self) -> &AttemptId {
        &self.attempt
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Delivers an event; returns false once the attempt has been torn down.
    pub fn emit(&self, event: AttemptEvent) -> bool {
        if !self.is_attached() {
            tracing::trace!(
                target = "live_view::events",
                attempt = %self.attempt,
                kind = event.kind(),
                "dropping event from detached attempt"
            );
            return false;
        }
        self.tx
            .send(Envelope::Attempt {
                attempt: self.attempt.clone(),
                event,
            })
            .is_ok()
    }

    pub(crate) fn detach(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for AttemptSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttemptSink")
            .field("attempt", &self.attempt)
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Receiver side of [`AttemptSink::channel`].
pub struct AttemptEvents {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl AttemptEvents {
    pub async fn recv(&mut self) -> Option<AttemptEvent> {
        while let Some(envelope) = self.rx.recv().await {
            if let Envelope::Attempt { event, .. } = envelope {
                return Some(event);
            }
        }
        None
    }
}
