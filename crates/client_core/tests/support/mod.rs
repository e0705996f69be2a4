#![allow(dead_code)]

use std::{
    future::Future,
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use client_core::{BackendLauncher, BackendProcess, ControllerSettings, KeyboardController, LaunchSpec};
use serde_json::{json, Value};
use shared::{
    domain::KeyboardEvent,
    protocol::{EVENTS_PATH, STATUS_PATH},
};
use tokio::{
    net::TcpListener,
    sync::{broadcast, watch},
    task::JoinHandle,
};

#[derive(Debug, Clone, Copy)]
pub struct BackendOptions {
    /// Whether the status endpoint advertises a WebSocket.
    pub websocket: bool,
    /// Whether a WebSocket route actually exists.
    pub serve_websocket: bool,
    /// Serve the WebSocket on its own listener and advertise that port.
    pub separate_ws_port: bool,
    pub status_fails: bool,
    /// Whether socket commands get a `command_response`.
    pub answer_commands: bool,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            websocket: true,
            serve_websocket: true,
            separate_ws_port: false,
            status_fails: false,
            answer_commands: true,
        }
    }
}

/// In-process stand-in for the keyboard backend.
pub struct FakeBackend {
    options: BackendOptions,
    advertise_websocket: AtomicBool,
    tracking: Mutex<bool>,
    events: Mutex<Vec<KeyboardEvent>>,
    ws_port: Mutex<Option<u16>>,
    live: broadcast::Sender<KeyboardEvent>,
    kill: watch::Sender<u64>,
    pub ws_connections: AtomicUsize,
    pub event_polls: AtomicUsize,
    pub start_requests: AtomicUsize,
    pub socket_commands: AtomicUsize,
}

impl FakeBackend {
    pub fn new(options: BackendOptions) -> Arc<Self> {
        let (live, _) = broadcast::channel(64);
        let (kill, _) = watch::channel(0);
        Arc::new(Self {
            advertise_websocket: AtomicBool::new(options.websocket),
            options,
            tracking: Mutex::new(false),
            events: Mutex::new(Vec::new()),
            ws_port: Mutex::new(None),
            live,
            kill,
            ws_connections: AtomicUsize::new(0),
            event_polls: AtomicUsize::new(0),
            start_requests: AtomicUsize::new(0),
            socket_commands: AtomicUsize::new(0),
        })
    }

    pub fn is_tracking(&self) -> bool {
        *self.tracking.lock().expect("tracking")
    }

    pub fn events(&self) -> Vec<KeyboardEvent> {
        self.events.lock().expect("events").clone()
    }

    pub fn ws_port(&self) -> Option<u16> {
        *self.ws_port.lock().expect("ws port")
    }

    /// Records a key event the way the backend does: only while tracking,
    /// and pushed to every connected socket.
    pub fn record(&self, event: KeyboardEvent) {
        if !self.is_tracking() {
            return;
        }
        self.events.lock().expect("events").push(event.clone());
        let _ = self.live.send(event);
    }

    pub fn set_events(&self, events: Vec<KeyboardEvent>) {
        *self.events.lock().expect("events") = events;
    }

    /// Drops every open socket without a close frame.
    pub fn drop_websockets(&self) {
        self.kill.send_modify(|generation| *generation += 1);
    }

    /// Changes tracking state; false when it was already in that state.
    pub fn set_tracking(&self, enabled: bool) -> bool {
        let mut tracking = self.tracking.lock().expect("tracking");
        if *tracking == enabled {
            return false;
        }
        *tracking = enabled;
        if enabled {
            self.events.lock().expect("events").clear();
        }
        true
    }

    pub fn stop_advertising_websocket(&self) {
        self.advertise_websocket.store(false, Ordering::SeqCst);
    }

    fn handle_command(&self, text: &str) -> Value {
        self.socket_commands.fetch_add(1, Ordering::SeqCst);
        let command = serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|value| value.get("command").and_then(Value::as_str).map(str::to_owned))
            .unwrap_or_default();
        let (success, message) = match command.as_str() {
            "start_tracking" => {
                let changed = self.set_tracking(true);
                (changed, start_message(changed))
            }
            "stop_tracking" => {
                let changed = self.set_tracking(false);
                (changed, stop_message(changed))
            }
            _ => (false, "Unknown command"),
        };
        json!({
            "type": "command_response",
            "command": command,
            "success": success,
            "message": message,
        })
    }
}

async fn status(State(backend): State<Arc<FakeBackend>>) -> Response {
    if backend.options.status_fails {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    Json(json!({
        "websocketAvailable": backend.advertise_websocket.load(Ordering::SeqCst),
        "websocketPort": backend.ws_port(),
        "isTracking": backend.is_tracking(),
        "keyboardAvailable": true,
        "eventsCount": backend.events().len(),
    }))
    .into_response()
}

fn start_message(changed: bool) -> &'static str {
    if changed {
        "Keyboard tracking started"
    } else {
        "Keyboard tracking already running"
    }
}

fn stop_message(changed: bool) -> &'static str {
    if changed {
        "Keyboard tracking stopped"
    } else {
        "Keyboard tracking not running"
    }
}

async fn start(State(backend): State<Arc<FakeBackend>>) -> Json<Value> {
    backend.start_requests.fetch_add(1, Ordering::SeqCst);
    let changed = backend.set_tracking(true);
    Json(json!({ "success": changed, "message": start_message(changed) }))
}

async fn stop(State(backend): State<Arc<FakeBackend>>) -> Json<Value> {
    let changed = backend.set_tracking(false);
    Json(json!({ "success": changed, "message": stop_message(changed) }))
}

async fn events(State(backend): State<Arc<FakeBackend>>) -> Json<Value> {
    backend.event_polls.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "events": backend.events(),
        "isTracking": backend.is_tracking(),
    }))
}

async fn upgrade(ws: WebSocketUpgrade, State(backend): State<Arc<FakeBackend>>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, backend))
}

async fn serve_socket(mut socket: WebSocket, backend: Arc<FakeBackend>) {
    backend.ws_connections.fetch_add(1, Ordering::SeqCst);
    let mut live = backend.live.subscribe();
    let mut kill = backend.kill.subscribe();

    let hello = json!({
        "type": "status",
        "isTracking": backend.is_tracking(),
        "keyboardAvailable": true,
    });
    if socket.send(Message::Text(hello.to_string())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            _ = kill.changed() => return,
            Ok(event) = live.recv() => {
                let Ok(text) = serde_json::to_string(&event) else {
                    continue;
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            frame = socket.recv() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let reply = backend.handle_command(&text);
                    if !backend.options.answer_commands {
                        continue;
                    }
                    if socket.send(Message::Text(reply.to_string())).await.is_err() {
                        return;
                    }
                }
                Some(Ok(_)) => {}
                _ => return,
            },
        }
    }
}

fn websocket_routes(backend: Arc<FakeBackend>) -> Router {
    Router::new().route("/", get(upgrade)).with_state(backend)
}

fn http_routes(backend: Arc<FakeBackend>) -> Router {
    let mut app = Router::new()
        .route(STATUS_PATH, get(status))
        .route("/api/keyboard/start", post(start))
        .route("/api/keyboard/stop", post(stop))
        .route(EVENTS_PATH, get(events));
    if backend.options.serve_websocket && !backend.options.separate_ws_port {
        app = app.route("/", get(upgrade));
    }
    app.with_state(backend)
}

/// Starts a [`FakeBackend`] on the port the controller allocated.
pub struct FakeLauncher {
    pub backend: Arc<FakeBackend>,
}

struct FakeProcess {
    servers: Vec<JoinHandle<()>>,
}

#[async_trait]
impl BackendProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn terminate(&mut self) -> anyhow::Result<()> {
        for server in self.servers.drain(..) {
            server.abort();
        }
        Ok(())
    }
}

#[async_trait]
impl BackendLauncher for FakeLauncher {
    async fn launch(&self, spec: LaunchSpec) -> anyhow::Result<Box<dyn BackendProcess>> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, spec.port))
            .await
            .with_context(|| format!("binding fake backend to port {}", spec.port))?;
        let mut servers = Vec::new();

        let ws_port = if self.backend.options.separate_ws_port {
            let ws_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
            let port = ws_listener.local_addr()?.port();
            let app = websocket_routes(self.backend.clone());
            servers.push(tokio::spawn(async move {
                let _ = axum::serve(ws_listener, app).await;
            }));
            port
        } else {
            spec.port
        };
        *self.backend.ws_port.lock().expect("ws port") = Some(ws_port);

        let app = http_routes(self.backend.clone());
        servers.push(tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        }));
        Ok(Box::new(FakeProcess { servers }))
    }
}

pub fn test_settings() -> ControllerSettings {
    ControllerSettings {
        probe_timeout: Duration::from_secs(1),
        connect_timeout: Duration::from_secs(1),
        connect_attempts: 2,
        reconnect_backoff: Duration::from_millis(10),
        reconnect_backoff_max: Duration::from_millis(20),
        poll_interval: Duration::from_millis(50),
        request_timeout: Duration::from_secs(1),
        command_timeout: Duration::from_secs(2),
        startup_grace: Duration::ZERO,
        ..ControllerSettings::default()
    }
}

pub fn controller_with(options: BackendOptions) -> (Arc<KeyboardController>, Arc<FakeBackend>) {
    controller_with_settings(options, test_settings())
}

pub fn controller_with_settings(
    options: BackendOptions,
    settings: ControllerSettings,
) -> (Arc<KeyboardController>, Arc<FakeBackend>) {
    let backend = FakeBackend::new(options);
    let launcher = Arc::new(FakeLauncher {
        backend: backend.clone(),
    });
    (
        KeyboardController::new_with_launcher(settings, launcher),
        backend,
    )
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}
