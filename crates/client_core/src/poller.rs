use std::{sync::Arc, time::Duration};

use reqwest::{Client, StatusCode};
use shared::{
    domain::KeyboardEvent,
    protocol::{EventsResponse, EVENTS_PATH},
};
use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    controller::{KeyboardController, SessionContext},
    error::{ControllerError, Result},
    types::{ConnectionState, ControllerEvent},
};

impl KeyboardController {
    /// Starts or stops the HTTP poller so that it runs exactly while the
    /// session is in `HttpPollingActive` with tracking enabled.
    pub(crate) fn sync_poller(self: &Arc<Self>, ctx: &mut SessionContext) {
        let should_poll =
            ctx.connection == ConnectionState::HttpPollingActive && ctx.tracking.enabled;
        let Some(session) = ctx.session.as_mut() else {
            return;
        };
        match (should_poll, session.poller.is_some()) {
            (true, false) => {
                let url = session.endpoint.http_url(EVENTS_PATH);
                info!(%url, interval_ms = self.settings.poll_interval.as_millis() as u64, "poller: started");
                session.poller = Some(self.spawn_poller(session.id, url));
            }
            (false, true) => self.stop_poller(ctx),
            _ => {}
        }
    }

    pub(crate) fn stop_poller(&self, ctx: &mut SessionContext) {
        if let Some(poller) = ctx.session.as_mut().and_then(|session| session.poller.take()) {
            poller.abort();
            info!("poller: stopped");
        }
    }

    fn spawn_poller(self: &Arc<Self>, session_id: Uuid, url: String) -> JoinHandle<()> {
        let controller = Arc::downgrade(self);
        let http = self.http.clone();
        let period = self.settings.poll_interval;
        let timeout = self.settings.request_timeout;

        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let result = fetch_events(&http, &url, timeout).await;
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                match result {
                    Ok(events) => controller.apply_polled_events(session_id, events).await,
                    Err(err) => warn!(%url, error = %err, "poller: poll failed; retrying next interval"),
                }
            }
        })
    }

    pub(crate) async fn apply_polled_events(&self, session_id: Uuid, events: Vec<KeyboardEvent>) {
        let mut ctx = self.inner.lock().await;
        let polling = ctx.connection == ConnectionState::HttpPollingActive && ctx.tracking.enabled;
        if !ctx.owns_session(session_id) || !polling {
            debug!(%session_id, "poller: discarding stale poll result");
            return;
        }
        let count = events.len();
        ctx.log.replace(events);
        self.emit(ControllerEvent::EventsReplaced { count });
    }
}

async fn fetch_events(http: &Client, url: &str, timeout: Duration) -> Result<Vec<KeyboardEvent>> {
    let res = http
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|err| ControllerError::Poll(err.to_string()))?;
    if res.status() != StatusCode::OK {
        return Err(ControllerError::Poll(format!("events endpoint answered {}", res.status())));
    }
    let body: EventsResponse = res
        .json()
        .await
        .map_err(|err| ControllerError::Poll(format!("malformed events body: {err}")))?;
    Ok(body.events)
}
