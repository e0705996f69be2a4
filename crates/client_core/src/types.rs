use std::fmt;

use chrono::{DateTime, Utc};
use shared::domain::{KeyboardEvent, TrackingCommand};
use url::Url;

/// Where the supervised backend listens. Lives exactly as long as the
/// backend session that created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub host: String,
    pub http_port: u16,
    /// Only set when the backend advertises a WebSocket port distinct from
    /// `http_port`; `None` means the WebSocket shares the HTTP port.
    pub ws_port: Option<u16>,
    pub launched_at: DateTime<Utc>,
}

impl ServerEndpoint {
    pub fn new(host: impl Into<String>, http_port: u16) -> Self {
        Self {
            host: host.into(),
            http_port,
            ws_port: None,
            launched_at: Utc::now(),
        }
    }

    pub fn http_base(&self) -> String {
        format!("http://{}:{}", self.host, self.http_port)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("{}{path}", self.http_base())
    }

    pub fn websocket_port(&self) -> u16 {
        self.ws_port.unwrap_or(self.http_port)
    }

    pub fn websocket_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&format!("ws://{}:{}/", self.host, self.websocket_port()))
    }

    /// Records the port advertised by a status probe, keeping `ws_port`
    /// unset when it would equal `http_port`.
    pub(crate) fn set_advertised_ws_port(&mut self, port: Option<u16>) {
        self.ws_port = port.filter(|port| *port != self.http_port);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    WebSocketActive,
    HttpPollingActive,
    Unavailable,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::WebSocketActive => "websocket",
            Self::HttpPollingActive => "http-polling",
            Self::Unavailable => "unavailable",
        };
        f.write_str(label)
    }
}

/// Local belief of whether the backend is tracking, updated only from
/// confirmed responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackingState {
    pub enabled: bool,
    pub last_confirmed_at: Option<DateTime<Utc>>,
}

impl TrackingState {
    pub(crate) fn confirm(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.last_confirmed_at = Some(Utc::now());
    }
}

/// What this session knows about the backend's WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WebSocketAvailability {
    #[default]
    Unknown,
    Offered,
    NotOffered,
    /// A handshake or live link failed; stays this way until the session ends.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub command: TrackingCommand,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    SessionStarted(ServerEndpoint),
    SessionStopped,
    ConnectionChanged(ConnectionState),
    TrackingChanged(TrackingState),
    EventRecorded(KeyboardEvent),
    EventsReplaced { count: usize },
    CommandCompleted(CommandOutcome),
    KeyboardAvailability(bool),
    /// User-visible status text for degraded or transient conditions.
    Status(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSnapshot {
    pub endpoint: Option<ServerEndpoint>,
    pub reserved_port: Option<u16>,
    pub connection: ConnectionState,
    pub tracking: TrackingState,
    pub events: Vec<KeyboardEvent>,
    pub websocket: WebSocketAvailability,
    pub keyboard_available: Option<bool>,
    pub handshake_confirmed: bool,
}

impl ControllerSnapshot {
    pub fn session_active(&self) -> bool {
        self.endpoint.is_some()
    }
}
