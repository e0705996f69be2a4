use std::sync::Arc;

use reqwest::StatusCode;
use shared::{
    domain::TrackingCommand,
    protocol::{CommandReply, OutboundCommand},
};
use tokio::{sync::oneshot, time};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    controller::{KeyboardController, PendingCommand},
    error::{ControllerError, Result, COMMAND_IN_FLIGHT, NEGOTIATION_IN_PROGRESS, NO_ACTIVE_SESSION},
    types::{CommandOutcome, ConnectionState, ControllerEvent},
};

enum Route {
    WebSocket(oneshot::Receiver<CommandOutcome>),
    Http(String),
}

impl KeyboardController {
    /// Asks the backend to start tracking if it is stopped, or to stop it if
    /// it is running.
    ///
    /// Over the WebSocket, tracking state changes only once the matching
    /// `command_response` arrives, and a rejected command comes back as an
    /// outcome with `success == false`. Over HTTP, any 200 reply is the
    /// confirmation and the backend's `success` flag and message are passed
    /// through. Transport problems are `ControllerError::Command` and change
    /// nothing.
    pub async fn toggle(self: &Arc<Self>) -> Result<CommandOutcome> {
        let (session_id, command, route) = {
            let mut guard = self.inner.lock().await;
            let ctx = &mut *guard;
            let Some(session) = ctx.session.as_mut() else {
                return Err(ControllerError::Precondition(NO_ACTIVE_SESSION));
            };
            if session.pending.is_some() {
                return Err(ControllerError::Precondition(COMMAND_IN_FLIGHT));
            }

            let command = TrackingCommand::for_toggle(ctx.tracking.enabled);
            let route = match ctx.connection {
                ConnectionState::Connecting => {
                    return Err(ControllerError::Precondition(NEGOTIATION_IN_PROGRESS))
                }
                ConnectionState::WebSocketActive => {
                    let Some(active) = session.link.as_ref() else {
                        return Err(ControllerError::Command(
                            "websocket link is not available".into(),
                        ));
                    };
                    active
                        .link
                        .send(OutboundCommand::new(command))
                        .map_err(|err| ControllerError::Command(err.to_string()))?;
                    let (reply, confirmation) = oneshot::channel();
                    session.pending = Some(PendingCommand { command, reply });
                    Route::WebSocket(confirmation)
                }
                _ => Route::Http(session.endpoint.http_url(command.http_path())),
            };
            debug!(%command, "tracking: dispatching command");
            (session.id, command, route)
        };

        match route {
            Route::WebSocket(confirmation) => {
                self.await_confirmation(session_id, command, confirmation)
                    .await
            }
            Route::Http(url) => self.toggle_over_http(session_id, command, &url).await,
        }
    }

    async fn await_confirmation(
        &self,
        session_id: Uuid,
        command: TrackingCommand,
        confirmation: oneshot::Receiver<CommandOutcome>,
    ) -> Result<CommandOutcome> {
        match time::timeout(self.settings.command_timeout, confirmation).await {
            Ok(Ok(outcome)) => {
                info!(
                    %command,
                    success = outcome.success,
                    message = %outcome.message,
                    "tracking: command confirmed over websocket"
                );
                Ok(outcome)
            }
            Ok(Err(_)) => {
                let err = ControllerError::Command(format!(
                    "{command} was not confirmed: websocket link closed"
                ));
                self.emit(ControllerEvent::Status(err.to_string()));
                Err(err)
            }
            Err(_) => {
                let mut ctx = self.inner.lock().await;
                if let Some(session) = ctx
                    .session
                    .as_mut()
                    .filter(|session| session.id == session_id)
                {
                    let still_waiting = session
                        .pending
                        .as_ref()
                        .is_some_and(|pending| pending.command == command);
                    if still_waiting {
                        session.pending = None;
                    }
                }
                let err = ControllerError::Command(format!(
                    "{command} was not confirmed within {:?}",
                    self.settings.command_timeout
                ));
                warn!(%command, "tracking: confirmation timed out");
                self.emit(ControllerEvent::Status(err.to_string()));
                Err(err)
            }
        }
    }

    async fn toggle_over_http(
        self: &Arc<Self>,
        session_id: Uuid,
        command: TrackingCommand,
        url: &str,
    ) -> Result<CommandOutcome> {
        let reply = self.post_command(url).await;

        let mut guard = self.inner.lock().await;
        let ctx = &mut *guard;
        if !ctx.owns_session(session_id) {
            return Err(ControllerError::Command(format!(
                "{command} response arrived after the backend session ended"
            )));
        }
        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                warn!(%command, %url, error = %err, "tracking: command request failed");
                self.emit(ControllerEvent::Status(err.to_string()));
                return Err(err);
            }
        };

        // A 200 confirms the target state even when the backend reports it
        // was already there (`success: false`, "already running").
        let outcome = CommandOutcome {
            command,
            success: reply.success.unwrap_or(true),
            message: reply.message.unwrap_or_default(),
        };
        if !outcome.success {
            debug!(%command, message = %outcome.message, "tracking: backend was already in the requested state");
        }

        let enabled = command.target_enabled();
        self.confirm_tracking(ctx, enabled);
        if enabled {
            ctx.log.clear();
            self.emit(ControllerEvent::EventsReplaced { count: 0 });
        }
        if !matches!(
            ctx.connection,
            ConnectionState::WebSocketActive | ConnectionState::Connecting
        ) {
            self.settle_degraded(ctx);
        }
        info!(%command, message = %outcome.message, "tracking: command confirmed over HTTP");
        self.emit(ControllerEvent::CommandCompleted(outcome.clone()));
        Ok(outcome)
    }

    async fn post_command(&self, url: &str) -> Result<CommandReply> {
        let res = self
            .http
            .post(url)
            .timeout(self.settings.request_timeout)
            .send()
            .await
            .map_err(|err| ControllerError::Command(format!("request to {url} failed: {err}")))?;
        if res.status() != StatusCode::OK {
            return Err(ControllerError::Command(format!(
                "{url} answered {}",
                res.status()
            )));
        }
        let body = res
            .bytes()
            .await
            .map_err(|err| ControllerError::Command(format!("reading reply from {url}: {err}")))?;
        Ok(serde_json::from_slice(&body).unwrap_or_else(|err| {
            debug!(%url, error = %err, "tracking: reply body is not the expected JSON");
            CommandReply::default()
        }))
    }
}
