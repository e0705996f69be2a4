use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{KeyEventKind, KeyboardEvent, TrackingCommand},
    error::ProtocolError,
};

pub const STATUS_PATH: &str = "/api/keyboard/status";
pub const EVENTS_PATH: &str = "/api/keyboard/events";

/// Frame sent by the backend over the WebSocket, discriminated by its `type`
/// field.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Status(StatusUpdate),
    InitEvents { events: Vec<KeyboardEvent> },
    CommandResponse(CommandResponse),
    /// A `press` or `release` frame; the kind lives on the event itself.
    KeyEvent(KeyboardEvent),
    Unknown { tag: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub is_tracking: bool,
    #[serde(default)]
    pub keyboard_available: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandResponse {
    pub command: TrackingCommand,
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Deserialize)]
struct InitEventsPayload {
    events: Vec<KeyboardEvent>,
}

impl InboundMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;
        let tag = value
            .as_object()
            .ok_or(ProtocolError::NotAnObject)?
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_owned();

        let decoded = match tag.as_str() {
            "status" => serde_json::from_value(value).map(Self::Status),
            "init_events" => serde_json::from_value::<InitEventsPayload>(value)
                .map(|payload| Self::InitEvents {
                    events: payload.events,
                }),
            "command_response" => serde_json::from_value(value).map(Self::CommandResponse),
            "press" | "release" => serde_json::from_value(value).map(Self::KeyEvent),
            _ => return Ok(Self::Unknown { tag }),
        };
        decoded.map_err(|source| ProtocolError::invalid_payload(tag, source))
    }

    pub fn tag(&self) -> &str {
        match self {
            Self::Status(_) => "status",
            Self::InitEvents { .. } => "init_events",
            Self::CommandResponse(_) => "command_response",
            Self::KeyEvent(event) => match event.kind {
                KeyEventKind::Press => "press",
                KeyEventKind::Release => "release",
            },
            Self::Unknown { tag } => tag.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundCommand {
    pub command: TrackingCommand,
}

impl OutboundCommand {
    pub fn new(command: TrackingCommand) -> Self {
        Self { command }
    }
}

/// Body of `GET /api/keyboard/status`.
///
/// The backend has shipped both `webSocket*` and `websocket*` spellings, so
/// both are accepted. Everything except the WebSocket fields is informational.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(default, alias = "websocketAvailable")]
    pub web_socket_available: bool,
    #[serde(default, alias = "websocketPort")]
    pub web_socket_port: Option<u16>,
    #[serde(default)]
    pub is_tracking: Option<bool>,
    #[serde(default)]
    pub keyboard_available: Option<bool>,
    #[serde(default)]
    pub events_count: Option<u64>,
}

/// Body of `POST /api/keyboard/start` and `POST /api/keyboard/stop`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CommandReply {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
}

/// Body of `GET /api/keyboard/events`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsResponse {
    pub events: Vec<KeyboardEvent>,
    #[serde(default)]
    pub is_tracking: Option<bool>,
}
