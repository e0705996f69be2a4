use std::time::Duration;

use reqwest::{Client, StatusCode};
use shared::protocol::{StatusResponse, STATUS_PATH};
use thiserror::Error;
use tracing::{debug, warn};

/// Soft failure of a status probe. The caller continues in HTTP-only mode.
#[derive(Debug, Error)]
pub enum ProbeFailure {
    #[error("status probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("status endpoint answered {0}")]
    Status(StatusCode),
    #[error("status body is malformed: {0}")]
    Malformed(String),
    #[error("status request failed: {0}")]
    Request(String),
}

/// Backend capabilities learned from `GET /api/keyboard/status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub web_socket_available: bool,
    /// Advertised port, or the HTTP port when none was advertised.
    pub web_socket_port: u16,
    pub is_tracking: Option<bool>,
    pub keyboard_available: Option<bool>,
    pub events_count: Option<u64>,
}

impl ProbeReport {
    pub(crate) fn from_response(response: StatusResponse, http_port: u16) -> Self {
        Self {
            web_socket_available: response.web_socket_available,
            web_socket_port: response.web_socket_port.unwrap_or(http_port),
            is_tracking: response.is_tracking,
            keyboard_available: response.keyboard_available,
            events_count: response.events_count,
        }
    }

    /// What a failed probe amounts to: no WebSocket.
    pub(crate) fn http_only(http_port: u16) -> Self {
        Self {
            web_socket_available: false,
            web_socket_port: http_port,
            is_tracking: None,
            keyboard_available: None,
            events_count: None,
        }
    }
}

#[derive(Clone)]
pub struct StatusProber {
    http: Client,
    timeout: Duration,
}

impl StatusProber {
    pub fn new(http: Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }

    pub async fn probe(&self, host: &str, http_port: u16) -> Result<ProbeReport, ProbeFailure> {
        let url = format!("http://{host}:{http_port}{STATUS_PATH}");
        let res = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| self.classify(err))?;

        if res.status() != StatusCode::OK {
            warn!(%url, status = %res.status(), "probe: unexpected status code");
            return Err(ProbeFailure::Status(res.status()));
        }

        let body = res.bytes().await.map_err(|err| self.classify(err))?;
        let response: StatusResponse = serde_json::from_slice(&body)
            .map_err(|err| ProbeFailure::Malformed(err.to_string()))?;
        let report = ProbeReport::from_response(response, http_port);
        debug!(
            %url,
            web_socket_available = report.web_socket_available,
            web_socket_port = report.web_socket_port,
            "probe: backend status received"
        );
        Ok(report)
    }

    fn classify(&self, err: reqwest::Error) -> ProbeFailure {
        if err.is_timeout() {
            ProbeFailure::Timeout(self.timeout)
        } else {
            ProbeFailure::Request(err.to_string())
        }
    }
}
