use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyEventKind {
    Press,
    Release,
}

/// A single key transition as reported by the backend.
///
/// On the wire the kind travels in the `type` field and the timestamp is
/// fractional seconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyboardEvent {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: KeyEventKind,
    #[serde(rename = "timestamp")]
    pub timestamp_seconds: f64,
}

impl KeyboardEvent {
    pub fn new(key: impl Into<String>, kind: KeyEventKind, timestamp_seconds: f64) -> Self {
        Self {
            key: key.into(),
            kind,
            timestamp_seconds,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingCommand {
    StartTracking,
    StopTracking,
}

impl TrackingCommand {
    /// Tracking state the backend ends up in once this command is confirmed.
    pub fn target_enabled(self) -> bool {
        matches!(self, Self::StartTracking)
    }

    pub fn for_toggle(currently_enabled: bool) -> Self {
        if currently_enabled {
            Self::StopTracking
        } else {
            Self::StartTracking
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartTracking => "start_tracking",
            Self::StopTracking => "stop_tracking",
        }
    }

    /// HTTP route that performs the same transition as this command.
    pub fn http_path(self) -> &'static str {
        match self {
            Self::StartTracking => "/api/keyboard/start",
            Self::StopTracking => "/api/keyboard/stop",
        }
    }
}

impl fmt::Display for TrackingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
