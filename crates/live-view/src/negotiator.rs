//! Peer transport negotiation: one receive-only video peer connection per attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use crate::error::{to_negotiation_error, to_transport_error, SessionError, SessionResult};
use crate::events::{AttemptEvent, AttemptSink, MediaStream, TransportState};
use crate::protocol::IceCandidate;

/// The peer transport of a single attempt.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Produces the local offer; persist it with `set_local_description` before sending.
    async fn create_offer(&self) -> SessionResult<String>;
    async fn set_local_description(&self, sdp: &str) -> SessionResult<()>;
    /// Fails unless an offer is outstanding and `sdp` parses as an answer.
    async fn apply_answer(&self, sdp: &str) -> SessionResult<()>;
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> SessionResult<()>;
    /// Detaches every callback, then closes. Safe to call twice.
    async fn close(&self);
}

/// Builds the peer transport for a new attempt, wiring its callbacks to `sink`.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, agent: &str, sink: AttemptSink)
        -> SessionResult<Box<dyn PeerTransport>>;
}

#[derive(Debug, Clone)]
pub struct WebRtcTransportFactory {
    ice_servers: Vec<String>,
}

impl WebRtcTransportFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

fn build_api() -> SessionResult<API> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_transport_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_transport_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        agent: &str,
        sink: AttemptSink,
    ) -> SessionResult<Box<dyn PeerTransport>> {
        let api = build_api()?;
        let config = RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(to_transport_error)?,
        );

        let init = RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        };
        if let Err(err) = pc.add_transceiver_from_kind(RTPCodecType::Video, Some(init)).await {
            let _ = pc.close().await;
            return Err(to_negotiation_error(err));
        }

        let negotiator = WebRtcNegotiator {
            agent: agent.to_string(),
            pc,
            closed: AtomicBool::new(false),
        };
        negotiator.attach(sink);
        tracing::debug!(
            target = "live_view::negotiator",
            agent = %agent,
            ice_servers = self.ice_servers.len(),
            "peer transport created"
        );
        Ok(Box::new(negotiator))
    }
}

pub struct WebRtcNegotiator {
    agent: String,
    pc: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

impl WebRtcNegotiator {
    fn attach(&self, sink: AttemptSink) {
        let agent = self.agent.clone();
        let candidate_sink = sink.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let sink = candidate_sink.clone();
                let agent = agent.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        tracing::debug!(
                            target = "live_view::negotiator",
                            agent = %agent,
                            "ice gathering complete"
                        );
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            sink.emit(AttemptEvent::LocalCandidate(IceCandidate::from(init)));
                        }
                        Err(err) => tracing::warn!(
                            target = "live_view::negotiator",
                            agent = %agent,
                            error = %err,
                            "failed to serialize local candidate"
                        ),
                    }
                })
            }));

        let agent = self.agent.clone();
        let track_sink = sink.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = track_sink.clone();
                let agent = agent.clone();
                Box::pin(async move {
                    tracing::info!(
                        target = "live_view::negotiator",
                        agent = %agent,
                        kind = ?track.kind(),
                        stream = %track.stream_id(),
                        "inbound track"
                    );
                    if track.kind() != RTPCodecType::Video {
                        return;
                    }
                    sink.emit(AttemptEvent::TrackAvailable(MediaStream::from_track(track)));
                })
            },
        ));

        let agent = self.agent.clone();
        let state_sink = sink.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let sink = state_sink.clone();
                let agent = agent.clone();
                Box::pin(async move {
                    tracing::debug!(
                        target = "live_view::negotiator",
                        agent = %agent,
                        state = ?state,
                        "peer connection state changed"
                    );
                    if let Some(mapped) = map_connection_state(state) {
                        sink.emit(AttemptEvent::TransportState(mapped));
                    }
                })
            }));

        let agent = self.agent.clone();
        let ice_sink = sink;
        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let sink = ice_sink.clone();
                let agent = agent.clone();
                Box::pin(async move {
                    tracing::trace!(
                        target = "live_view::negotiator",
                        agent = %agent,
                        state = ?state,
                        "ice state"
                    );
                    if ice_failed(state) {
                        sink.emit(AttemptEvent::IceFailed);
                    }
                })
            }));

        let agent = self.agent.clone();
        self.pc
            .on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
                let agent = agent.clone();
                Box::pin(async move {
                    tracing::trace!(
                        target = "live_view::negotiator",
                        agent = %agent,
                        state = ?state,
                        "signaling state"
                    );
                })
            }));
    }

    fn detach(&self) {
        self.pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc.on_track(Box::new(|_, _, _| Box::pin(async {})));
        self.pc
            .on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc
            .on_ice_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc
            .on_signaling_state_change(Box::new(|_| Box::pin(async {})));
    }
}

#[async_trait]
impl PeerTransport for WebRtcNegotiator {
    async fn create_offer(&self) -> SessionResult<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(to_negotiation_error)?;
        Ok(offer.sdp)
    }

    async fn set_local_description(&self, sdp: &str) -> SessionResult<()> {
        let desc = RTCSessionDescription::offer(sdp.to_string()).map_err(to_negotiation_error)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(to_negotiation_error)
    }

    async fn apply_answer(&self, sdp: &str) -> SessionResult<()> {
        let state = self.pc.signaling_state();
        if state != RTCSignalingState::HaveLocalOffer {
            return Err(SessionError::Negotiation(format!(
                "not expecting an answer in signaling state {state:?}"
            )));
        }
        let desc = RTCSessionDescription::answer(sdp.to_string()).map_err(to_negotiation_error)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(to_negotiation_error)
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> SessionResult<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit::from(candidate))
            .await
            .map_err(to_negotiation_error)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.detach();
        if let Err(err) = self.pc.close().await {
            tracing::debug!(
                target = "live_view::negotiator",
                agent = %self.agent,
                error = %err,
                "error closing peer connection"
            );
        }
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => {
            Some(TransportState::Connecting)
        }
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn ice_failed(state: RTCIceConnectionState) -> bool {
    state == RTCIceConnectionState::Failed
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}
