//! WebSocket link to the backend.
//!
//! [`WsSubscription::open`] performs the handshake (bounded by a connect
//! timeout and retried with backoff) and then hands the socket to a pump task.
//! The pump forwards outbound commands, sends heartbeats, decodes inbound
//! frames and reports everything as a single stream of [`TransportSignal`]s.
//! Dropping or cancelling the [`WsLink`] closes the socket.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use shared::protocol::{InboundMessage, OutboundCommand};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ControllerSettings;

const OUTBOUND_CAPACITY: usize = 8;
const SIGNAL_CAPACITY: usize = 256;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("websocket handshake to {url} failed after {attempts} attempt(s): {reason}")]
    Handshake {
        url: String,
        attempts: u32,
        reason: String,
    },
    #[error("websocket link failed: {0}")]
    Link(String),
    #[error("websocket heartbeat lost after {0:?} of silence")]
    HeartbeatLost(Duration),
    #[error("websocket link is closed")]
    Closed,
    #[error("failed to encode outbound command: {0}")]
    Encode(String),
}

/// One event from a live subscription: a decoded message, a failure, or the
/// peer closing the socket. `Error` and `Closed` are always the last signal.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    Message(InboundMessage),
    Error(TransportError),
    Closed { reason: Option<String> },
}

impl TransportSignal {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Message(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakePolicy {
    pub connect_timeout: Duration,
    pub attempts: u32,
    pub backoff: Duration,
    pub backoff_max: Duration,
}

impl HandshakePolicy {
    pub fn from_settings(settings: &ControllerSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout,
            attempts: settings.connect_attempts,
            backoff: settings.reconnect_backoff,
            backoff_max: settings.reconnect_backoff_max,
        }
    }

    pub fn next_backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.backoff_max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl HeartbeatPolicy {
    pub fn from_settings(settings: &ControllerSettings) -> Self {
        Self {
            interval: settings.heartbeat_interval,
            timeout: settings.heartbeat_timeout,
        }
    }
}

/// Sending half of an open subscription.
pub struct WsLink {
    outbound: mpsc::Sender<OutboundCommand>,
    shutdown: Option<oneshot::Sender<()>>,
    pump: JoinHandle<()>,
}

impl WsLink {
    pub fn send(&self, command: OutboundCommand) -> Result<(), TransportError> {
        if self.pump.is_finished() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .try_send(command)
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => {
                    TransportError::Link("outbound queue is full".into())
                }
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
            })
    }

    /// Closes the socket. No further signals are delivered afterwards.
    pub fn cancel(mut self) {
        self.request_shutdown();
    }

    fn request_shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl Drop for WsLink {
    fn drop(&mut self) {
        self.request_shutdown();
    }
}

pub struct WsSubscription {
    link: WsLink,
    signals: mpsc::Receiver<TransportSignal>,
}

impl WsSubscription {
    pub async fn open(
        url: &Url,
        handshake: HandshakePolicy,
        heartbeat: HeartbeatPolicy,
    ) -> Result<Self, TransportError> {
        let attempts = handshake.attempts.max(1);
        let mut backoff = handshake.backoff;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match time::timeout(handshake.connect_timeout, connect_async(url.as_str())).await {
                Ok(Ok((socket, _response))) => {
                    info!(%url, attempt, "transport: websocket handshake complete");
                    return Ok(Self::spawn(socket, heartbeat));
                }
                Ok(Err(err)) => last_error = err.to_string(),
                Err(_) => {
                    last_error = format!("timed out after {:?}", handshake.connect_timeout)
                }
            }
            warn!(
                %url,
                attempt,
                max_attempts = attempts,
                error = %last_error,
                "transport: websocket handshake attempt failed"
            );
            if attempt < attempts {
                time::sleep(backoff).await;
                backoff = handshake.next_backoff(backoff);
            }
        }

        Err(TransportError::Handshake {
            url: url.to_string(),
            attempts,
            reason: last_error,
        })
    }

    fn spawn(socket: Socket, heartbeat: HeartbeatPolicy) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let pump = tokio::spawn(pump(socket, outbound_rx, shutdown_rx, signal_tx, heartbeat));
        Self {
            link: WsLink {
                outbound: outbound_tx,
                shutdown: Some(shutdown_tx),
                pump,
            },
            signals: signal_rx,
        }
    }

    pub fn send(&self, command: OutboundCommand) -> Result<(), TransportError> {
        self.link.send(command)
    }

    pub async fn next(&mut self) -> Option<TransportSignal> {
        self.signals.recv().await
    }

    pub fn split(self) -> (WsLink, mpsc::Receiver<TransportSignal>) {
        (self.link, self.signals)
    }
}

async fn pump(
    mut socket: Socket,
    mut outbound: mpsc::Receiver<OutboundCommand>,
    mut shutdown: oneshot::Receiver<()>,
    signals: mpsc::Sender<TransportSignal>,
    heartbeat: HeartbeatPolicy,
) {
    let mut ticker = time::interval_at(Instant::now() + heartbeat.interval, heartbeat.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    let terminal = loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!("transport: closing websocket on request");
                let _ = socket.close(None).await;
                return;
            }
            Some(command) = outbound.recv() => {
                let text = match serde_json::to_string(&command) {
                    Ok(text) => text,
                    Err(err) => break TransportSignal::Error(TransportError::Encode(err.to_string())),
                };
                debug!(command = %command.command, "transport: sending command");
                if let Err(err) = socket.send(Message::Text(text)).await {
                    break TransportSignal::Error(TransportError::Link(err.to_string()));
                }
            }
            _ = ticker.tick() => {
                let silence = last_seen.elapsed();
                if silence > heartbeat.timeout {
                    break TransportSignal::Error(TransportError::HeartbeatLost(silence));
                }
                if let Err(err) = socket.send(Message::Ping(Vec::new())).await {
                    break TransportSignal::Error(TransportError::Link(err.to_string()));
                }
            }
            frame = socket.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    last_seen = Instant::now();
                    match InboundMessage::decode(&text) {
                        Ok(message) => {
                            if signals.send(TransportSignal::Message(message)).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => warn!(error = %err, "transport: dropping malformed frame"),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|frame| frame.reason.to_string())
                        .filter(|reason| !reason.is_empty());
                    break TransportSignal::Closed { reason };
                }
                Some(Ok(_)) => last_seen = Instant::now(),
                Some(Err(err)) => break TransportSignal::Error(TransportError::Link(err.to_string())),
                None => break TransportSignal::Closed { reason: None },
            },
        }
    };

    debug!(signal = ?terminal, "transport: websocket pump finished");
    let _ = signals.send(terminal).await;
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::{
        extract::ws::{Message as ServerMessage, WebSocket, WebSocketUpgrade},
        response::IntoResponse,
        routing::get,
        Router,
    };
    use shared::domain::TrackingCommand;
    use tokio::net::TcpListener;

    use super::*;

    fn fast_policies() -> (HandshakePolicy, HeartbeatPolicy) {
        (
            HandshakePolicy {
                connect_timeout: Duration::from_millis(500),
                attempts: 2,
                backoff: Duration::from_millis(10),
                backoff_max: Duration::from_millis(20),
            },
            HeartbeatPolicy {
                interval: Duration::from_secs(5),
                timeout: Duration::from_secs(15),
            },
        )
    }

    async fn spawn_ws_server<F, Fut>(handler: F) -> SocketAddr
    where
        F: Fn(WebSocket) -> Fut + Clone + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = Router::new().route(
            "/",
            get(move |ws: WebSocketUpgrade| {
                let handler = handler.clone();
                async move { ws.on_upgrade(handler).into_response() }
            }),
        );
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }

    fn ws_url(addr: SocketAddr) -> Url {
        Url::parse(&format!("ws://{addr}/")).expect("url")
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = HandshakePolicy {
            connect_timeout: Duration::from_secs(5),
            attempts: 3,
            backoff: Duration::from_millis(250),
            backoff_max: Duration::from_secs(2),
        };
        assert_eq!(
            policy.next_backoff(Duration::from_millis(250)),
            Duration::from_millis(500)
        );
        assert_eq!(
            policy.next_backoff(Duration::from_millis(1500)),
            Duration::from_secs(2)
        );
    }

    #[tokio::test]
    async fn delivers_decoded_messages_and_forwards_commands() {
        let addr = spawn_ws_server(|mut socket: WebSocket| async move {
            let _ = socket
                .send(ServerMessage::Text(
                    r#"{"type":"status","isTracking":false}"#.to_string(),
                ))
                .await;
            while let Some(Ok(frame)) = socket.recv().await {
                if let ServerMessage::Text(text) = frame {
                    if text.contains("start_tracking") {
                        let _ = socket
                            .send(ServerMessage::Text(
                                r#"{"type":"command_response","command":"start_tracking","success":true,"message":"ok"}"#
                                    .to_string(),
                            ))
                            .await;
                    }
                }
            }
        })
        .await;
        let (handshake, heartbeat) = fast_policies();

        let mut subscription = WsSubscription::open(&ws_url(addr), handshake, heartbeat)
            .await
            .expect("open");
        let first = subscription.next().await.expect("status signal");
        assert!(matches!(
            first,
            TransportSignal::Message(InboundMessage::Status(_))
        ));

        subscription
            .send(OutboundCommand::new(TrackingCommand::StartTracking))
            .expect("send");
        match subscription.next().await.expect("response signal") {
            TransportSignal::Message(InboundMessage::CommandResponse(response)) => {
                assert!(response.success);
                assert_eq!(response.message, "ok");
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_without_ending_the_stream() {
        let addr = spawn_ws_server(|mut socket: WebSocket| async move {
            let _ = socket.send(ServerMessage::Text("not json".to_string())).await;
            let _ = socket
                .send(ServerMessage::Text(r#"{"type":"mystery"}"#.to_string()))
                .await;
            let _ = socket
                .send(ServerMessage::Text(
                    r#"{"type":"release","key":"b","timestamp":2.5}"#.to_string(),
                ))
                .await;
            while socket.recv().await.is_some() {}
        })
        .await;
        let (handshake, heartbeat) = fast_policies();

        let mut subscription = WsSubscription::open(&ws_url(addr), handshake, heartbeat)
            .await
            .expect("open");
        assert_eq!(
            subscription.next().await,
            Some(TransportSignal::Message(InboundMessage::Unknown {
                tag: "mystery".to_string()
            }))
        );
        assert!(matches!(
            subscription.next().await,
            Some(TransportSignal::Message(InboundMessage::KeyEvent(_)))
        ));
    }

    #[tokio::test]
    async fn peer_going_away_ends_with_a_terminal_signal() {
        let addr = spawn_ws_server(|socket: WebSocket| async move {
            drop(socket);
        })
        .await;
        let (handshake, heartbeat) = fast_policies();

        let mut subscription = WsSubscription::open(&ws_url(addr), handshake, heartbeat)
            .await
            .expect("open");
        let signal = time::timeout(Duration::from_secs(5), subscription.next())
            .await
            .expect("signal in time")
            .expect("terminal signal");
        assert!(signal.is_terminal());
    }

    #[tokio::test]
    async fn silent_peer_trips_the_heartbeat() {
        let addr = spawn_ws_server(|socket: WebSocket| async move {
            // Never read, so pings go unanswered.
            time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        })
        .await;
        let (handshake, _) = fast_policies();
        let heartbeat = HeartbeatPolicy {
            interval: Duration::from_millis(50),
            timeout: Duration::from_millis(150),
        };

        let mut subscription = WsSubscription::open(&ws_url(addr), handshake, heartbeat)
            .await
            .expect("open");
        let signal = time::timeout(Duration::from_secs(5), subscription.next())
            .await
            .expect("signal in time");
        assert!(matches!(
            signal,
            Some(TransportSignal::Error(TransportError::HeartbeatLost(_)))
        ));
    }

    #[tokio::test]
    async fn handshake_gives_up_after_bounded_attempts() {
        let port = crate::ports::allocate_port().expect("port");
        let url = Url::parse(&format!("ws://127.0.0.1:{port}/")).expect("url");
        let (handshake, heartbeat) = fast_policies();

        let err = WsSubscription::open(&url, handshake, heartbeat)
            .await
            .err()
            .expect("nothing listens on the port");
        match err {
            TransportError::Handshake { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_link_stops_delivering_signals() {
        let addr = spawn_ws_server(|mut socket: WebSocket| async move {
            while socket.recv().await.is_some() {}
        })
        .await;
        let (handshake, heartbeat) = fast_policies();

        let subscription = WsSubscription::open(&ws_url(addr), handshake, heartbeat)
            .await
            .expect("open");
        let (link, mut signals) = subscription.split();
        link.cancel();

        let next = time::timeout(Duration::from_secs(5), signals.recv())
            .await
            .expect("channel closes in time");
        assert_eq!(next, None);
    }
}
