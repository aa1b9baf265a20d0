//! Relay wire schema.
//!
//! Every signaling message exchanged with the relay is a single JSON object.
//! The viewer identifies itself with a `role` record (no `type` tag) and then
//! exchanges `type`-tagged offer/answer/candidate messages, each scoped by the
//! attempt identifier that produced it.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SessionError, SessionResult};

/// Random token scoping every signaling message of one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(String);

impl AttemptId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AttemptId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AttemptId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Viewer,
    Agent,
}

/// Network candidate in the browser `RTCIceCandidateInit` JSON shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Identify {
        role: PeerRole,
        attempt_id: AttemptId,
    },
    Signal(OutboundSignal),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundSignal {
    Offer {
        sdp: String,
        attempt_id: AttemptId,
    },
    Candidate {
        candidate: IceCandidate,
        attempt_id: AttemptId,
    },
}

impl OutboundMessage {
    pub fn identify(attempt_id: &AttemptId) -> Self {
        OutboundMessage::Identify {
            role: PeerRole::Viewer,
            attempt_id: attempt_id.clone(),
        }
    }

    pub fn offer(sdp: String, attempt_id: &AttemptId) -> Self {
        OutboundMessage::Signal(OutboundSignal::Offer {
            sdp,
            attempt_id: attempt_id.clone(),
        })
    }

    pub fn candidate(candidate: IceCandidate, attempt_id: &AttemptId) -> Self {
        OutboundMessage::Signal(OutboundSignal::Candidate {
            candidate,
            attempt_id: attempt_id.clone(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Identify { .. } => "identify",
            OutboundMessage::Signal(OutboundSignal::Offer { .. }) => "offer",
            OutboundMessage::Signal(OutboundSignal::Candidate { .. }) => "candidate",
        }
    }

    pub fn to_json(&self) -> SessionResult<String> {
        serde_json::to_string(self)
            .map_err(|err| SessionError::Protocol(format!("encode {}: {err}", self.kind())))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Answer {
        sdp: String,
        #[serde(alias = "viewer_id")]
        attempt_id: AttemptId,
    },
    Candidate {
        #[serde(default)]
        candidate: Option<IceCandidate>,
        #[serde(alias = "viewer_id")]
        attempt_id: AttemptId,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    Ack {
        #[serde(default)]
        message: Option<String>,
    },
    Ready {
        #[serde(default)]
        message: Option<String>,
    },
    ViewerConnected {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Answer { .. } => "answer",
            InboundMessage::Candidate { .. } => "candidate",
            InboundMessage::Error { .. } => "error",
            InboundMessage::Ack { .. } => "ack",
            InboundMessage::Ready { .. } => "ready",
            InboundMessage::ViewerConnected { .. } => "viewer_connected",
            InboundMessage::Unknown => "unknown",
        }
    }

    /// Attempt the message is scoped to, for attempt-scoped kinds.
    pub fn attempt_id(&self) -> Option<&AttemptId> {
        match self {
            InboundMessage::Answer { attempt_id, .. }
            | InboundMessage::Candidate { attempt_id, .. } => Some(attempt_id),
            _ => None,
        }
    }
}

pub fn parse_inbound(text: &str) -> SessionResult<InboundMessage> {
    serde_json::from_str(text).map_err(|err| SessionError::Protocol(err.to_string()))
}
