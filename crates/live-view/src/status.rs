//! Observable session state and the badge a dashboard card derives from it.

use std::fmt;
use std::time::Duration;

use crate::playback::PlaybackState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State published by the session controller after every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub agent: String,
    pub enabled: bool,
    pub status: ConnectionStatus,
    pub playback: PlaybackState,
    pub last_error: Option<String>,
    pub retry_count: u32,
    /// Delay of the armed reconnect timer, if one is armed.
    pub next_retry: Option<Duration>,
}

impl SessionSnapshot {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            enabled: false,
            status: ConnectionStatus::Disconnected,
            playback: PlaybackState::Inactive,
            last_error: None,
            retry_count: 0,
            next_retry: None,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playback == PlaybackState::Active
    }

    /// Whether the card should offer a play button.
    pub fn awaiting_interaction(&self) -> bool {
        self.playback == PlaybackState::AwaitingInteraction
    }

    /// Video requested but no media yet.
    pub fn loading(&self) -> bool {
        self.enabled && self.status == ConnectionStatus::Connecting
    }

    pub fn badge(&self) -> StatusBadge {
        if !self.enabled {
            return StatusBadge::StreamingOff;
        }
        match self.status {
            ConnectionStatus::Connected if self.is_playing() => StatusBadge::Live,
            ConnectionStatus::Connected => StatusBadge::Ready,
            ConnectionStatus::Connecting => StatusBadge::Connecting,
            _ if self.next_retry.is_some() => StatusBadge::Reconnecting,
            _ => StatusBadge::Offline,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusBadge {
    StreamingOff,
    Live,
    Ready,
    Connecting,
    Reconnecting,
    Offline,
}

impl StatusBadge {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusBadge::StreamingOff => "STREAMING OFF",
            StatusBadge::Live => "LIVE",
            StatusBadge::Ready => "READY",
            StatusBadge::Connecting => "CONNECTING",
            StatusBadge::Reconnecting => "RECONNECTING",
            StatusBadge::Offline => "OFFLINE",
        }
    }
}

impl fmt::Display for StatusBadge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
