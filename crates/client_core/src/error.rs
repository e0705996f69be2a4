use thiserror::Error;

use crate::{probe::ProbeFailure, transport::TransportError};

pub type Result<T, E = ControllerError> = std::result::Result<T, E>;

/// Failures surfaced by [`KeyboardController`](crate::KeyboardController)
/// operations.
///
/// Only `Allocation`, `Launch` and `Precondition` abort the operation that
/// produced them; the rest describe a degraded or unconfirmed outcome and
/// leave the session running.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("failed to allocate a local port: {0}")]
    Allocation(#[source] std::io::Error),
    #[error("failed to launch backend: {0}")]
    Launch(#[source] anyhow::Error),
    #[error("{0}")]
    Precondition(&'static str),
    #[error("status probe failed: {0}")]
    Probe(#[from] ProbeFailure),
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("tracking command failed: {0}")]
    Command(String),
    #[error("event poll failed: {0}")]
    Poll(String),
}

impl ControllerError {
    /// Whether the error aborted the operation, as opposed to degrading it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Allocation(_) | Self::Launch(_) | Self::Precondition(_)
        )
    }
}

pub(crate) const NO_ACTIVE_SESSION: &str = "no backend session is active";
pub(crate) const SESSION_ALREADY_ACTIVE: &str = "a backend session is already active";
pub(crate) const NEGOTIATION_IN_PROGRESS: &str = "transport negotiation is in progress";
pub(crate) const COMMAND_IN_FLIGHT: &str = "a tracking command is still awaiting confirmation";
