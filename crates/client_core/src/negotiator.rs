//! Transport negotiation: decides between the WebSocket and HTTP polling,
//! owns the live link, and applies inbound messages to the session context.

use std::sync::Arc;

use shared::protocol::InboundMessage;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    controller::{ActiveLink, KeyboardController, SessionContext},
    error::{ControllerError, Result, NO_ACTIVE_SESSION},
    probe::ProbeReport,
    transport::{HandshakePolicy, HeartbeatPolicy, TransportError, TransportSignal, WsSubscription},
    types::{CommandOutcome, ConnectionState, ControllerEvent, WebSocketAvailability},
};

impl KeyboardController {
    /// Brings up the best available transport for the active session.
    ///
    /// Transport failures never surface as errors here: they degrade the
    /// session to HTTP polling (or idle) and the resulting state is returned.
    /// Calls made while already connecting or connected are no-ops.
    pub async fn connect(self: &Arc<Self>) -> Result<ConnectionState> {
        let (session_id, attempt, mut endpoint, cached_probe) = {
            let mut guard = self.inner.lock().await;
            let ctx = &mut *guard;
            let Some(session) = ctx.session.as_mut() else {
                return Err(ControllerError::Precondition(NO_ACTIVE_SESSION));
            };
            if matches!(
                ctx.connection,
                ConnectionState::Connecting | ConnectionState::WebSocketActive
            ) {
                debug!(state = %ctx.connection, "negotiator: connect ignored");
                return Ok(ctx.connection);
            }
            if session.websocket == WebSocketAvailability::Failed {
                debug!("negotiator: websocket previously failed; staying on HTTP");
                self.settle_degraded(ctx);
                return Ok(ctx.connection);
            }

            session.link_generation += 1;
            let snapshot = (
                session.id,
                session.link_generation,
                session.endpoint.clone(),
                session.probe.clone(),
            );
            self.stop_poller(ctx);
            self.set_connection(ctx, ConnectionState::Connecting);
            snapshot
        };

        let report = match cached_probe {
            Some(report) => report,
            None => self
                .run_probe(session_id, &endpoint.host, endpoint.http_port)
                .await
                .unwrap_or_else(|_| ProbeReport::http_only(endpoint.http_port)),
        };

        if !report.web_socket_available {
            let mut guard = self.inner.lock().await;
            let ctx = &mut *guard;
            if !ctx.is_current(session_id, attempt) {
                return Ok(ctx.connection);
            }
            if let Some(session) = ctx.session.as_mut() {
                session.websocket = WebSocketAvailability::NotOffered;
            }
            info!("negotiator: backend offers no websocket; using HTTP only");
            self.settle_degraded(ctx);
            return Ok(ctx.connection);
        }

        endpoint.set_advertised_ws_port(Some(report.web_socket_port));
        let opened = match endpoint.websocket_url() {
            Ok(url) => {
                WsSubscription::open(
                    &url,
                    HandshakePolicy::from_settings(&self.settings),
                    HeartbeatPolicy::from_settings(&self.settings),
                )
                .await
            }
            Err(err) => Err(TransportError::Handshake {
                url: format!("ws://{}:{}/", endpoint.host, endpoint.websocket_port()),
                attempts: 0,
                reason: err.to_string(),
            }),
        };

        let mut guard = self.inner.lock().await;
        let ctx = &mut *guard;
        if !ctx.is_current(session_id, attempt) {
            debug!("negotiator: discarding handshake result for a superseded attempt");
            return Ok(ctx.connection);
        }

        match opened {
            Ok(subscription) => {
                let (link, signals) = subscription.split();
                let dispatcher = self.spawn_dispatcher(session_id, attempt, signals);
                if let Some(session) = ctx.session.as_mut() {
                    session.websocket = WebSocketAvailability::Offered;
                    session.endpoint.ws_port = endpoint.ws_port;
                    session.link = Some(ActiveLink { link, dispatcher });
                }
                self.set_connection(ctx, ConnectionState::WebSocketActive);
            }
            Err(err) => self.fall_back(ctx, err),
        }
        Ok(ctx.connection)
    }

    /// Cancels the live socket or poller and leaves the session idle.
    /// Idempotent; tracking state is left as last confirmed.
    pub async fn disconnect(&self) {
        let mut guard = self.inner.lock().await;
        let ctx = &mut *guard;
        if let Some(session) = ctx.session.as_mut() {
            session.shutdown_transport();
        }
        self.set_connection(ctx, ConnectionState::Disconnected);
    }

    fn spawn_dispatcher(
        self: &Arc<Self>,
        session_id: Uuid,
        generation: u64,
        mut signals: mpsc::Receiver<TransportSignal>,
    ) -> JoinHandle<()> {
        let controller = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                let terminal = signal.is_terminal();
                controller.handle_signal(session_id, generation, signal).await;
                if terminal {
                    break;
                }
            }
        })
    }

    async fn handle_signal(self: &Arc<Self>, session_id: Uuid, generation: u64, signal: TransportSignal) {
        let mut guard = self.inner.lock().await;
        let ctx = &mut *guard;
        if !ctx.is_current(session_id, generation) {
            debug!(?signal, "negotiator: dropping signal from a stale link");
            return;
        }
        match signal {
            TransportSignal::Message(message) => self.apply_inbound(ctx, message),
            TransportSignal::Error(err) => self.fall_back(ctx, err),
            TransportSignal::Closed { reason } => {
                let err = match reason {
                    Some(reason) => TransportError::Link(format!("closed by backend: {reason}")),
                    None => TransportError::Closed,
                };
                self.fall_back(ctx, err)
            }
        }
    }

    pub(crate) fn apply_inbound(&self, ctx: &mut SessionContext, message: InboundMessage) {
        match message {
            InboundMessage::Status(status) => {
                if let Some(session) = ctx.session.as_mut() {
                    session.handshake_confirmed = true;
                    if let Some(available) = status.keyboard_available {
                        session.keyboard_available = Some(available);
                        self.emit(ControllerEvent::KeyboardAvailability(available));
                    }
                }
                info!(
                    is_tracking = status.is_tracking,
                    "negotiator: backend status received"
                );
                self.confirm_tracking(ctx, status.is_tracking);
            }
            InboundMessage::InitEvents { events } => {
                let count = events.len();
                ctx.log.replace(events);
                self.emit(ControllerEvent::EventsReplaced { count });
            }
            InboundMessage::CommandResponse(response) => {
                if response.success {
                    let enabled = response.command.target_enabled();
                    if enabled {
                        ctx.log.clear();
                        self.emit(ControllerEvent::EventsReplaced { count: 0 });
                    }
                    self.confirm_tracking(ctx, enabled);
                } else {
                    warn!(
                        command = %response.command,
                        message = %response.message,
                        "negotiator: backend rejected tracking command"
                    );
                }

                let outcome = CommandOutcome {
                    command: response.command,
                    success: response.success,
                    message: response.message,
                };
                if let Some(session) = ctx.session.as_mut() {
                    let matches_pending = session
                        .pending
                        .as_ref()
                        .is_some_and(|pending| pending.command == outcome.command);
                    if matches_pending {
                        if let Some(pending) = session.pending.take() {
                            let _ = pending.reply.send(outcome.clone());
                        }
                    }
                }
                self.emit(ControllerEvent::CommandCompleted(outcome));
            }
            InboundMessage::KeyEvent(event) => {
                ctx.log.append(event.clone());
                self.emit(ControllerEvent::EventRecorded(event));
            }
            InboundMessage::Unknown { tag } => {
                warn!(%tag, "negotiator: dropping message with unrecognized type");
            }
        }
    }

    /// Gives up on the WebSocket for the rest of the session and moves to
    /// polling or idle depending on tracking state.
    pub(crate) fn fall_back(self: &Arc<Self>, ctx: &mut SessionContext, cause: TransportError) {
        let Some(session) = ctx.session.as_mut() else {
            return;
        };
        session.shutdown_transport();
        session.websocket = WebSocketAvailability::Failed;
        let err = ControllerError::Transport(cause);
        warn!(error = %err, "negotiator: websocket unavailable for the rest of the session");
        self.emit(ControllerEvent::Status(format!(
            "{err}; falling back to HTTP"
        )));
        self.settle_degraded(ctx);
    }

    /// Resting state without a WebSocket: polling while tracking, idle
    /// otherwise.
    pub(crate) fn settle_degraded(self: &Arc<Self>, ctx: &mut SessionContext) {
        let next = if ctx.tracking.enabled {
            ConnectionState::HttpPollingActive
        } else {
            ctx.idle_state()
        };
        self.set_connection(ctx, next);
        self.sync_poller(ctx);
    }
}
