//! Client-side controller for a keyboard-tracking backend.
//!
//! [`KeyboardController`] launches the backend on a free local port, probes
//! its capabilities, talks to it over a WebSocket when one is offered and
//! falls back to HTTP polling otherwise.

pub mod config;
mod controller;
pub mod error;
pub mod event_log;
mod negotiator;
mod poller;
pub mod ports;
pub mod probe;
pub mod supervisor;
mod tracking;
pub mod transport;
pub mod types;

pub use config::{load_settings, load_settings_from, ControllerSettings};
pub use controller::KeyboardController;
pub use error::{ControllerError, Result};
pub use event_log::EventLog;
pub use ports::allocate_port;
pub use probe::{ProbeFailure, ProbeReport, StatusProber};
pub use supervisor::{BackendLauncher, BackendProcess, LaunchSpec, ProcessLauncher};
pub use transport::{TransportError, TransportSignal, WsSubscription};
pub use types::{
    CommandOutcome, ConnectionState, ControllerEvent, ControllerSnapshot, ServerEndpoint,
    TrackingState, WebSocketAvailability,
};
