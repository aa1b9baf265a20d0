use std::env;
use std::time::Duration;

use url::Url;

use crate::error::{SessionError, SessionResult};

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8000";
pub const DEFAULT_STUN_SERVERS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];
pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_millis(1_000);
pub const DEFAULT_RECONNECT_CAP: Duration = Duration::from_secs(30);
pub const DEFAULT_TRACK_TIMEOUT: Duration = Duration::from_secs(4);

/// Live session configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Relay base address; `http(s)` is rewritten to `ws(s)`
    pub relay_url: String,
    /// STUN helpers handed to every peer transport
    pub ice_servers: Vec<String>,
    /// First reconnect delay
    pub reconnect_base: Duration,
    /// Upper bound for any reconnect delay
    pub reconnect_cap: Duration,
    /// How long to wait for inbound video after the answer is applied
    pub track_timeout: Option<Duration>,
    /// Enable the session as soon as it is spawned
    pub auto_connect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            reconnect_base: DEFAULT_RECONNECT_BASE,
            reconnect_cap: DEFAULT_RECONNECT_CAP,
            track_timeout: Some(DEFAULT_TRACK_TIMEOUT),
            auto_connect: true,
        }
    }
}

impl SessionConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let relay_url = env::var("FLEET_RELAY_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(defaults.relay_url);
        let ice_servers = env::var("FLEET_STUN_SERVERS")
            .ok()
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|servers| !servers.is_empty())
            .unwrap_or(defaults.ice_servers);
        let reconnect_base = env_millis("FLEET_RECONNECT_BASE_MS")
            .filter(|delay| !delay.is_zero())
            .unwrap_or(defaults.reconnect_base);
        let reconnect_cap = env_millis("FLEET_RECONNECT_CAP_MS")
            .unwrap_or(defaults.reconnect_cap)
            .max(reconnect_base);
        // zero disables the watchdog
        let track_timeout = match env_millis("FLEET_TRACK_TIMEOUT_MS") {
            Some(timeout) if timeout.is_zero() => None,
            Some(timeout) => Some(timeout),
            None => defaults.track_timeout,
        };
        let auto_connect = env::var("FLEET_AUTO_CONNECT")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(defaults.auto_connect);

        Self {
            relay_url,
            ice_servers,
            reconnect_base,
            reconnect_cap,
            track_timeout,
            auto_connect,
        }
    }

    pub fn with_relay_url(mut self, relay_url: impl Into<String>) -> Self {
        self.relay_url = relay_url.into();
        self
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.reconnect_base = base;
        self.reconnect_cap = cap.max(base);
        self
    }

    pub fn with_track_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.track_timeout = timeout;
        self
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }
}

fn env_millis(var: &str) -> Option<Duration> {
    env::var(var)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Derives the per-agent relay channel address: `<relay>/ws/webrtc/<agent>`.
pub fn signaling_url(relay_url: &str, agent: &str) -> SessionResult<Url> {
    let base = Url::parse(relay_url)
        .map_err(|err| SessionError::Config(format!("invalid relay url {relay_url}: {err}")))?;
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SessionError::Config(format!(
                "unsupported relay scheme {other}"
            )))
        }
    };
    if agent.trim().is_empty() {
        return Err(SessionError::Config("agent name must not be empty".into()));
    }

    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|_| SessionError::Config("invalid websocket scheme".into()))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| SessionError::Config("relay url cannot carry a path".into()))?;
        segments.pop_if_empty();
        segments.push("ws");
        segments.push("webrtc");
        segments.push(agent);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}
