use thiserror::Error;

/// Failures raised while driving a live session.
///
/// `Channel`, `Negotiation` and `Transport` end the current attempt and may
/// trigger a reconnect. `Playback` only gates the surface on a user gesture,
/// and `Protocol` is logged where the payload is parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("signaling channel error: {0}")]
    Channel(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("peer transport error: {0}")]
    Transport(String),
    #[error("playback refused: {0}")]
    Playback(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SessionError {
    /// Whether this error ends the attempt it was raised in.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Channel(_) | SessionError::Negotiation(_) | SessionError::Transport(_)
        )
    }

    /// The bare failure text, as shown on the dashboard card.
    pub fn reason(&self) -> &str {
        match self {
            SessionError::Channel(reason)
            | SessionError::Negotiation(reason)
            | SessionError::Transport(reason)
            | SessionError::Playback(reason)
            | SessionError::Protocol(reason)
            | SessionError::Config(reason) => reason,
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

pub(crate) fn to_negotiation_error<E: std::fmt::Display>(err: E) -> SessionError {
    SessionError::Negotiation(err.to_string())
}

pub(crate) fn to_transport_error<E: std::fmt::Display>(err: E) -> SessionError {
    SessionError::Transport(err.to_string())
}
