use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use live_view::{MediaStream, PlaybackReporter, PlaybackSurface, SessionError, SessionResult};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Emulates a browser autoplay policy shared by every card of the console:
/// until the operator has interacted once, automatic starts are refused.
#[derive(Debug, Clone)]
pub struct AutoplayPolicy {
    strict: bool,
    gesture_seen: Arc<AtomicBool>,
}

impl AutoplayPolicy {
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            gesture_seen: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn record_gesture(&self) {
        self.gesture_seen.store(true, Ordering::SeqCst);
    }

    fn allows_playback(&self) -> bool {
        !self.strict || self.gesture_seen.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct RtpStats {
    packets: AtomicU64,
    bytes: AtomicU64,
}

struct Attached {
    stream: MediaStream,
    reporter: PlaybackReporter,
}

/// A surface with no pixels: it drains the inbound RTP stream and counts it.
pub struct HeadlessSurface {
    agent: String,
    policy: AutoplayPolicy,
    attached: Mutex<Option<Attached>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<RtpStats>,
}

impl HeadlessSurface {
    pub fn new(agent: impl Into<String>, policy: AutoplayPolicy) -> Self {
        Self {
            agent: agent.into(),
            policy,
            attached: Mutex::new(None),
            reader: Mutex::new(None),
            stats: Arc::new(RtpStats::default()),
        }
    }

    pub fn packets(&self) -> u64 {
        self.stats.packets.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.stats.bytes.load(Ordering::Relaxed)
    }

    fn stop_reader(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

#[async_trait]
impl PlaybackSurface for HeadlessSurface {
    fn attach(&self, stream: MediaStream, reporter: PlaybackReporter) {
        self.stop_reader();
        debug!(agent = %self.agent, stream = %stream.id(), "stream attached");
        *self.attached.lock() = Some(Attached { stream, reporter });
    }

    fn clear(&self) {
        self.stop_reader();
        if self.attached.lock().take().is_some() {
            info!(
                agent = %self.agent,
                packets = self.packets(),
                bytes = self.bytes(),
                "stream cleared"
            );
        }
    }

    async fn play(&self) -> SessionResult<()> {
        if !self.policy.allows_playback() {
            return Err(SessionError::Playback(
                "play() requires a user gesture".into(),
            ));
        }
        let (track, reporter) = {
            let attached = self.attached.lock();
            match attached.as_ref() {
                Some(attached) => (attached.stream.track().cloned(), attached.reporter.clone()),
                None => return Err(SessionError::Playback("no stream attached".into())),
            }
        };
        let Some(track) = track else {
            return Ok(());
        };

        let mut reader = self.reader.lock();
        if reader.is_some() {
            return Ok(());
        }
        let stats = Arc::clone(&self.stats);
        let agent = self.agent.clone();
        *reader = Some(tokio::spawn(async move {
            loop {
                match track.read_rtp().await {
                    Ok((packet, _)) => {
                        stats.packets.fetch_add(1, Ordering::Relaxed);
                        stats
                            .bytes
                            .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
                    }
                    Err(err) => {
                        // remote track is gone
                        debug!(agent = %agent, error = %err, "rtp reader stopped");
                        reporter.ended();
                        break;
                    }
                }
            }
        }));
        Ok(())
    }
}
