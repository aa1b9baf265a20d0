//! Relay channel: one websocket per attempt, addressed by the agent name.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::config::signaling_url;
use crate::events::{AttemptEvent, AttemptSink, CloseReason};
use crate::protocol::{parse_inbound, AttemptId, OutboundMessage};

/// Outbound half of a relay channel owned by a single attempt.
pub trait SignalingChannel: Send + Sync {
    /// Queues a message; a no-op unless the channel is open.
    fn send(&self, message: OutboundMessage);
    fn is_open(&self) -> bool;
    /// Caller-requested close. Produces no close notification and is safe to repeat.
    fn close(&self);
}

/// Opens relay channels. Opening never blocks: the outcome arrives on the
/// sink as [`AttemptEvent::ChannelOpened`] or [`AttemptEvent::ChannelClosed`].
pub trait SignalingConnector: Send + Sync {
    fn open(&self, agent: &str, sink: AttemptSink) -> Box<dyn SignalingChannel>;
}

#[derive(Debug, Clone)]
pub struct RelayConnector {
    relay_url: String,
}

impl RelayConnector {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
        }
    }
}

impl SignalingConnector for RelayConnector {
    fn open(&self, agent: &str, sink: AttemptSink) -> Box<dyn SignalingChannel> {
        match signaling_url(&self.relay_url, agent) {
            Ok(url) => Box::new(RelayChannel::connect(url, agent, sink)),
            Err(err) => {
                tracing::warn!(
                    target = "live_view::signaling",
                    agent = %agent,
                    error = %err,
                    "cannot derive relay channel url"
                );
                sink.emit(AttemptEvent::ChannelClosed(CloseReason::Abnormal(
                    err.to_string(),
                )));
                Box::new(ClosedChannel)
            }
        }
    }
}

struct ClosedChannel;

impl SignalingChannel for ClosedChannel {
    fn send(&self, _message: OutboundMessage) {}

    fn is_open(&self) -> bool {
        false
    }

    fn close(&self) {}
}

pub struct RelayChannel {
    agent: String,
    attempt: AttemptId,
    open: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<Message>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl RelayChannel {
    pub fn connect(url: Url, agent: &str, sink: AttemptSink) -> Self {
        let open = Arc::new(AtomicBool::new(false));
        let (outbound, outbound_rx) = mpsc::unbounded_channel::<Message>();
        let attempt = sink.attempt().clone();
        tracing::debug!(
            target = "live_view::signaling",
            agent = %agent,
            attempt = %attempt,
            url = %url,
            "opening relay channel"
        );
        let driver = tokio::spawn(drive(
            url,
            agent.to_string(),
            sink,
            Arc::clone(&open),
            outbound_rx,
        ));
        Self {
            agent: agent.to_string(),
            attempt,
            open,
            outbound,
            driver: Mutex::new(Some(driver)),
        }
    }
}

impl SignalingChannel for RelayChannel {
    fn send(&self, message: OutboundMessage) {
        if !self.is_open() {
            tracing::debug!(
                target = "live_view::signaling",
                agent = %self.agent,
                attempt = %self.attempt,
                kind = message.kind(),
                "relay channel not open; dropping message"
            );
            return;
        }
        match message.to_json() {
            Ok(text) => {
                if self.outbound.send(Message::Text(text)).is_err() {
                    tracing::debug!(
                        target = "live_view::signaling",
                        agent = %self.agent,
                        kind = message.kind(),
                        "relay writer gone"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(
                    target = "live_view::signaling",
                    agent = %self.agent,
                    error = %err,
                    "failed to encode outbound message"
                );
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "Cleanup".into(),
            };
            let _ = self.outbound.send(Message::Close(Some(frame)));
        }
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
            tracing::debug!(
                target = "live_view::signaling",
                agent = %self.agent,
                attempt = %self.attempt,
                "relay channel closed"
            );
        }
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn drive(
    url: Url,
    agent: String,
    sink: AttemptSink,
    open: Arc<AtomicBool>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
) {
    let (ws_stream, _) = match connect_async(url.as_str()).await {
        Ok(connected) => connected,
        Err(err) => {
            tracing::warn!(
                target = "live_view::signaling",
                agent = %agent,
                error = %err,
                "relay connect failed"
            );
            sink.emit(AttemptEvent::ChannelClosed(CloseReason::Abnormal(format!(
                "websocket connect failed: {err}"
            ))));
            return;
        }
    };
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let writer_agent = agent.clone();
    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(err) = ws_write.send(message).await {
                tracing::debug!(
                    target = "live_view::signaling",
                    agent = %writer_agent,
                    error = %err,
                    "relay write failed"
                );
                break;
            }
            if closing {
                break;
            }
        }
    });

    open.store(true, Ordering::SeqCst);
    tracing::info!(target = "live_view::signaling", agent = %agent, "relay channel open");
    sink.emit(AttemptEvent::ChannelOpened);

    let reason = loop {
        match ws_read.next().await {
            Some(Ok(Message::Text(text))) => forward_inbound(&agent, &sink, &text),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                Ok(text) => forward_inbound(&agent, &sink, &text),
                Err(err) => tracing::warn!(
                    target = "live_view::signaling",
                    agent = %agent,
                    error = %err,
                    "ignoring non-utf8 relay frame"
                ),
            },
            Some(Ok(Message::Close(frame))) => break close_reason(frame),
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                tracing::warn!(
                    target = "live_view::signaling",
                    agent = %agent,
                    error = %err,
                    "relay websocket error"
                );
                break CloseReason::Abnormal(format!("websocket error: {err}"));
            }
            None => break CloseReason::Abnormal("relay stream ended".into()),
        }
    };

    open.store(false, Ordering::SeqCst);
    tracing::info!(
        target = "live_view::signaling",
        agent = %agent,
        reason = ?reason,
        "relay channel closed by peer"
    );
    sink.emit(AttemptEvent::ChannelClosed(reason));
}

fn forward_inbound(agent: &str, sink: &AttemptSink, text: &str) {
    match parse_inbound(text) {
        Ok(message) => {
            tracing::debug!(
                target = "live_view::signaling",
                agent = %agent,
                kind = message.kind(),
                "relay message"
            );
            sink.emit(AttemptEvent::Inbound(message));
        }
        Err(err) => {
            tracing::warn!(
                target = "live_view::signaling",
                agent = %agent,
                error = %err,
                "ignoring malformed relay message"
            );
        }
    }
}

fn close_reason(frame: Option<CloseFrame<'_>>) -> CloseReason {
    match frame {
        Some(frame) if matches!(frame.code, CloseCode::Normal | CloseCode::Away) => {
            CloseReason::Clean
        }
        Some(frame) => CloseReason::Abnormal(format!(
            "closed with code {}: {}",
            u16::from(frame.code),
            frame.reason
        )),
        None => CloseReason::Abnormal("closed without status".into()),
    }
}
