use std::sync::Arc;

use reqwest::Client;
use shared::domain::TrackingCommand;
use tokio::{
    sync::{broadcast, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::ControllerSettings,
    error::{ControllerError, Result, NO_ACTIVE_SESSION, SESSION_ALREADY_ACTIVE},
    event_log::EventLog,
    ports::allocate_port,
    probe::{ProbeReport, StatusProber},
    supervisor::{BackendLauncher, BackendProcess, LaunchSpec, ProcessLauncher},
    transport::WsLink,
    types::{
        CommandOutcome, ConnectionState, ControllerEvent, ControllerSnapshot, ServerEndpoint,
        TrackingState, WebSocketAvailability,
    },
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Supervises one backend session at a time and keeps the client's view of
/// it (connection, tracking state, event log) in a single context.
///
/// Every mutation goes through `inner`; spawned I/O tasks hand their results
/// back through it and are discarded once their session or link generation
/// is gone.
pub struct KeyboardController {
    pub(crate) http: Client,
    pub(crate) settings: ControllerSettings,
    pub(crate) prober: StatusProber,
    launcher: Arc<dyn BackendLauncher>,
    pub(crate) inner: Mutex<SessionContext>,
    events: broadcast::Sender<ControllerEvent>,
}

#[derive(Default)]
pub(crate) struct SessionContext {
    pub(crate) session: Option<ActiveSession>,
    pub(crate) reserved_port: Option<u16>,
    pub(crate) connection: ConnectionState,
    pub(crate) tracking: TrackingState,
    pub(crate) log: EventLog,
}

pub(crate) struct ActiveSession {
    pub(crate) id: Uuid,
    pub(crate) endpoint: ServerEndpoint,
    process: Box<dyn BackendProcess>,
    pub(crate) probe: Option<ProbeReport>,
    pub(crate) websocket: WebSocketAvailability,
    pub(crate) keyboard_available: Option<bool>,
    pub(crate) handshake_confirmed: bool,
    /// Bumped whenever a negotiation starts or a link is torn down; results
    /// tagged with an older value are stale.
    pub(crate) link_generation: u64,
    pub(crate) link: Option<ActiveLink>,
    pub(crate) poller: Option<JoinHandle<()>>,
    pub(crate) pending: Option<PendingCommand>,
}

pub(crate) struct ActiveLink {
    pub(crate) link: WsLink,
    pub(crate) dispatcher: JoinHandle<()>,
}

impl ActiveLink {
    pub(crate) fn cancel(self) {
        self.dispatcher.abort();
        self.link.cancel();
    }
}

pub(crate) struct PendingCommand {
    pub(crate) command: TrackingCommand,
    pub(crate) reply: oneshot::Sender<CommandOutcome>,
}

impl ActiveSession {
    fn new(endpoint: ServerEndpoint, process: Box<dyn BackendProcess>) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint,
            process,
            probe: None,
            websocket: WebSocketAvailability::Unknown,
            keyboard_available: None,
            handshake_confirmed: false,
            link_generation: 0,
            link: None,
            poller: None,
            pending: None,
        }
    }

    /// Cancels the socket, the poller and any unconfirmed command.
    pub(crate) fn shutdown_transport(&mut self) {
        self.link_generation += 1;
        self.handshake_confirmed = false;
        if let Some(active) = self.link.take() {
            active.cancel();
        }
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        self.pending = None;
    }
}

impl SessionContext {
    pub(crate) fn is_current(&self, session_id: Uuid, generation: u64) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.id == session_id && session.link_generation == generation)
    }

    pub(crate) fn owns_session(&self, session_id: Uuid) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.id == session_id)
    }

    /// Resting state when neither transport is in use.
    pub(crate) fn idle_state(&self) -> ConnectionState {
        match self.session.as_ref().map(|session| session.websocket) {
            Some(WebSocketAvailability::NotOffered) => ConnectionState::Unavailable,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl KeyboardController {
    pub fn new(settings: ControllerSettings) -> Arc<Self> {
        Self::new_with_launcher(settings, Arc::new(ProcessLauncher))
    }

    pub fn new_with_launcher(
        settings: ControllerSettings,
        launcher: Arc<dyn BackendLauncher>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let http = Client::new();
        Arc::new(Self {
            prober: StatusProber::new(http.clone(), settings.probe_timeout),
            http,
            settings,
            launcher,
            inner: Mutex::new(SessionContext::default()),
            events,
        })
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn event_stream(&self) -> BroadcastStream<ControllerEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    pub async fn snapshot(&self) -> ControllerSnapshot {
        let ctx = self.inner.lock().await;
        let session = ctx.session.as_ref();
        ControllerSnapshot {
            endpoint: session.map(|session| session.endpoint.clone()),
            reserved_port: ctx.reserved_port,
            connection: ctx.connection,
            tracking: ctx.tracking,
            events: ctx.log.events().to_vec(),
            websocket: session
                .map(|session| session.websocket)
                .unwrap_or_default(),
            keyboard_available: session.and_then(|session| session.keyboard_available),
            handshake_confirmed: session.is_some_and(|session| session.handshake_confirmed),
        }
    }

    /// Picks a fresh port for the next session. Only valid between sessions.
    pub async fn refresh_port(&self) -> Result<u16> {
        let mut ctx = self.inner.lock().await;
        if ctx.session.is_some() {
            return Err(ControllerError::Precondition(SESSION_ALREADY_ACTIVE));
        }
        let port = allocate_port()?;
        ctx.reserved_port = Some(port);
        info!(port, "controller: reserved port for next session");
        Ok(port)
    }

    pub async fn start_session(&self) -> Result<ServerEndpoint> {
        let mut guard = self.inner.lock().await;
        let ctx = &mut *guard;
        if ctx.session.is_some() {
            return Err(ControllerError::Precondition(SESSION_ALREADY_ACTIVE));
        }

        let port = match ctx.reserved_port.take() {
            Some(port) => port,
            None => allocate_port()?,
        };
        let process = self
            .launcher
            .launch(LaunchSpec::from_settings(&self.settings, port))
            .await
            .map_err(ControllerError::Launch)?;

        let endpoint = ServerEndpoint::new(self.settings.host.clone(), port);
        let session = ActiveSession::new(endpoint.clone(), process);
        info!(
            session_id = %session.id,
            port,
            pid = session.process.id(),
            "controller: backend session started"
        );
        ctx.session = Some(session);
        ctx.tracking = TrackingState::default();
        ctx.log.clear();
        self.set_connection(ctx, ConnectionState::Disconnected);
        self.emit(ControllerEvent::SessionStarted(endpoint.clone()));
        Ok(endpoint)
    }

    /// Tears down the transport, forgets the session and asks the backend to
    /// exit. Termination is best-effort. A no-op without a session.
    pub async fn stop_session(&self) {
        let (session_id, mut process) = {
            let mut guard = self.inner.lock().await;
            let ctx = &mut *guard;
            let Some(mut session) = ctx.session.take() else {
                return;
            };
            session.shutdown_transport();
            ctx.log.clear();
            ctx.tracking = TrackingState::default();
            self.emit(ControllerEvent::TrackingChanged(ctx.tracking));
            self.emit(ControllerEvent::EventsReplaced { count: 0 });
            self.set_connection(ctx, ConnectionState::Disconnected);
            (session.id, session.process)
        };

        if let Err(error) = process.terminate().await {
            warn!(%session_id, %error, "controller: backend did not shut down cleanly");
        }
        info!(%session_id, "controller: backend session stopped");
        self.emit(ControllerEvent::SessionStopped);
    }

    /// Re-runs the status probe for the active session and caches the result.
    ///
    /// A failed probe is cached as "no WebSocket" and returned as a soft
    /// [`ControllerError::Probe`].
    pub async fn probe(&self) -> Result<ProbeReport> {
        let (session_id, host, http_port) = {
            let ctx = self.inner.lock().await;
            let session = ctx
                .session
                .as_ref()
                .ok_or(ControllerError::Precondition(NO_ACTIVE_SESSION))?;
            (
                session.id,
                session.endpoint.host.clone(),
                session.endpoint.http_port,
            )
        };
        self.run_probe(session_id, &host, http_port)
            .await
            .map_err(ControllerError::from)
    }

    pub(crate) async fn run_probe(
        &self,
        session_id: Uuid,
        host: &str,
        http_port: u16,
    ) -> std::result::Result<ProbeReport, crate::probe::ProbeFailure> {
        let outcome = self.prober.probe(host, http_port).await;

        let mut guard = self.inner.lock().await;
        let ctx = &mut *guard;
        let Some(session) = ctx
            .session
            .as_mut()
            .filter(|session| session.id == session_id)
        else {
            debug!(%session_id, "probe: discarding result for a session that has ended");
            return outcome;
        };

        let report = match &outcome {
            Ok(report) => report.clone(),
            Err(failure) => {
                warn!(%failure, "probe: continuing in HTTP-only mode");
                self.emit(ControllerEvent::Status(format!(
                    "Status check failed ({failure}); using HTTP only"
                )));
                ProbeReport::http_only(http_port)
            }
        };
        session.endpoint.set_advertised_ws_port(
            report
                .web_socket_available
                .then_some(report.web_socket_port),
        );
        if let Some(available) = report.keyboard_available {
            session.keyboard_available = Some(available);
            self.emit(ControllerEvent::KeyboardAvailability(available));
        }
        session.probe = Some(report);
        outcome
    }

    pub(crate) fn set_connection(&self, ctx: &mut SessionContext, next: ConnectionState) {
        if ctx.connection == next {
            return;
        }
        debug!(from = %ctx.connection, to = %next, "controller: connection state changed");
        ctx.connection = next;
        self.emit(ControllerEvent::ConnectionChanged(next));
    }

    pub(crate) fn confirm_tracking(&self, ctx: &mut SessionContext, enabled: bool) {
        ctx.tracking.confirm(enabled);
        self.emit(ControllerEvent::TrackingChanged(ctx.tracking));
    }

    pub(crate) fn emit(&self, event: ControllerEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
