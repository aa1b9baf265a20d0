//! Viewer-side live session manager: turns a named fleet agent into a live
//! video stream over a signaling relay and a receive-only peer transport.

pub mod config;
pub mod error;
pub mod events;
pub mod negotiator;
pub mod playback;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod signaling;
pub mod status;

pub use config::SessionConfig;
pub use error::{SessionError, SessionResult};
pub use events::{AttemptEvent, AttemptSink, CloseReason, MediaStream, TransportState};
pub use negotiator::{PeerTransport, TransportFactory, WebRtcTransportFactory};
pub use playback::{
    GateEvent, InteractionBus, PlaybackReporter, PlaybackState, PlaybackStop, PlaybackSurface,
};
pub use protocol::{AttemptId, IceCandidate, InboundMessage, OutboundMessage};
pub use session::{LiveSession, SessionHandle};
pub use signaling::{RelayConnector, SignalingChannel, SignalingConnector};
pub use status::{ConnectionStatus, SessionSnapshot, StatusBadge};
