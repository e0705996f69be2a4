use thiserror::Error;

/// Reasons an inbound WebSocket frame could not be turned into an
/// [`InboundMessage`](crate::protocol::InboundMessage).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has no string `type` tag")]
    MissingType,
    #[error("invalid `{tag}` payload: {source}")]
    InvalidPayload {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ProtocolError {
    pub fn invalid_payload(tag: impl Into<String>, source: serde_json::Error) -> Self {
        Self::InvalidPayload {
            tag: tag.into(),
            source,
        }
    }
}
