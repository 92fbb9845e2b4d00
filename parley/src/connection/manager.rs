//! WebSocket connection manager.
//!
//! A [`ConnectionManager`] runs a supervisor task that owns the socket.
//! Each successful connection sends `register` as its first frame, then
//! pumps frames in both directions until the socket ends. The supervisor
//! then applies the reconnect policy:
//!
//! - server Close frame: one retry after `forced_reconnect_delay`, then the
//!   normal policy;
//! - any other failure: retry after the fixed `reconnect_delay`;
//! - after `max_reconnect_attempts` consecutive failures it emits
//!   [`ConnectionEvent::ReconnectFailed`] and stops.
//!
//! The attempt counter resets on every successful connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use parley_proto::codec;
use parley_proto::event::{ClientEvent, RegisterPayload};

use super::{ConnectionConfig, ConnectionEvent, DisconnectReason, Link, LinkError};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// State shared between the manager handle and its supervisor task.
#[derive(Debug, Default)]
struct Shared {
    connected: AtomicBool,
    /// Frame queue of the live connection, if any.
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl Shared {
    fn attach(&self, tx: mpsc::UnboundedSender<String>) {
        *self.outgoing.lock() = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
    }

    fn detach(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.outgoing.lock().take();
    }
}

/// Owns the chat server connection for one session.
pub struct ConnectionManager {
    config: ConnectionConfig,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    supervisor: Option<tokio::task::JoinHandle<()>>,
}

impl ConnectionManager {
    /// Creates a manager and the receiver for its events.
    ///
    /// Nothing connects until [`connect`](Self::connect) is called.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            config,
            shared: Arc::new(Shared::default()),
            events: tx,
            supervisor: None,
        };
        (manager, rx)
    }

    /// Starts the supervisor if it is not already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&mut self) {
        if let Some(handle) = &self.supervisor
            && !handle.is_finished()
        {
            return;
        }
        if let Some(stale) = self.supervisor.take() {
            stale.abort();
        }
        tracing::info!(url = %self.config.url, user_id = %self.config.user_id, "starting connection supervisor");
        self.supervisor = Some(tokio::spawn(supervise(
            self.config.clone(),
            Arc::clone(&self.shared),
            self.events.clone(),
        )));
    }

    /// Stops the supervisor and drops the socket.
    pub fn disconnect(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
            let was_connected = self.shared.connected.load(Ordering::SeqCst);
            self.shared.detach();
            if was_connected {
                let _ = self.events.send(ConnectionEvent::Disconnected {
                    reason: DisconnectReason::Local,
                });
            }
            tracing::info!("connection closed locally");
        }
    }

    /// The server URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.config.url
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
    }
}

impl Link for ConnectionManager {
    fn send(&self, event: &ClientEvent) -> Result<(), LinkError> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(LinkError::NotConnected);
        }
        let frame = codec::encode_client(event)?;
        let outgoing = self.shared.outgoing.lock();
        match outgoing.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| LinkError::NotConnected),
            None => Err(LinkError::NotConnected),
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn open(&mut self) {
        self.connect();
    }

    fn close(&mut self) {
        self.disconnect();
    }
}

/// Connect / pump / reconnect loop. Runs until the budget is exhausted,
/// the event receiver is dropped, or the task is aborted.
async fn supervise(
    config: ConnectionConfig,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let mut attempt: u32 = 0;
    let mut connected_before = false;
    let mut delay: Option<Duration> = None;

    loop {
        if let Some(delay) = delay.take() {
            tokio::time::sleep(delay).await;
        }

        let reason = match open(&config).await {
            Ok(ws) => {
                attempt = 0;
                let (tx, rx) = mpsc::unbounded_channel();
                shared.attach(tx);
                tracing::info!(url = %config.url, reconnected = connected_before, "connected");
                if events
                    .send(ConnectionEvent::Connected {
                        reconnected: connected_before,
                    })
                    .is_err()
                {
                    shared.detach();
                    return;
                }
                connected_before = true;

                let reason = pump(ws, rx, &events).await;
                shared.detach();
                reason
            }
            Err(reason) => reason,
        };

        if reason == DisconnectReason::Local {
            return;
        }
        tracing::warn!(url = %config.url, reason = %reason, "disconnected");
        let forced = reason == DisconnectReason::Forced;
        if events.send(ConnectionEvent::Disconnected { reason }).is_err() {
            return;
        }

        attempt += 1;
        if attempt > config.max_reconnect_attempts {
            tracing::error!(
                attempts = config.max_reconnect_attempts,
                "reconnect budget exhausted, giving up"
            );
            let _ = events.send(ConnectionEvent::ReconnectFailed {
                attempts: config.max_reconnect_attempts,
            });
            return;
        }
        let _ = events.send(ConnectionEvent::Reconnecting {
            attempt,
            max_attempts: config.max_reconnect_attempts,
        });
        delay = Some(if forced && attempt == 1 {
            config.forced_reconnect_delay
        } else {
            config.reconnect_delay
        });
    }
}

/// Opens the socket and sends `register` as the first frame.
async fn open(config: &ConnectionConfig) -> Result<WsStream, DisconnectReason> {
    let (mut ws, _response) =
        tokio::time::timeout(config.connect_timeout, connect_async(config.url.as_str()))
            .await
            .map_err(|_| {
                tracing::warn!(url = %config.url, "connect timed out");
                DisconnectReason::Transport("connect timed out".into())
            })?
            .map_err(|e| {
                tracing::warn!(url = %config.url, error = %e, "connect failed");
                DisconnectReason::Transport(e.to_string())
            })?;

    let register = ClientEvent::Register(RegisterPayload {
        user_id: config.user_id.clone(),
    });
    let frame = codec::encode_client(&register)
        .map_err(|e| DisconnectReason::Transport(e.to_string()))?;
    ws.send(Message::Text(frame.into())).await.map_err(|e| {
        tracing::warn!(error = %e, "failed to send register");
        DisconnectReason::Transport(e.to_string())
    })?;
    tracing::debug!(user_id = %config.user_id, "register sent");
    Ok(ws)
}

/// Moves frames between the socket and the session until the socket ends.
///
/// Malformed inbound frames are logged and skipped.
async fn pump(
    ws: WsStream,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
) -> DisconnectReason {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            frame = outgoing.recv() => {
                let Some(frame) = frame else {
                    return DisconnectReason::Local;
                };
                if let Err(e) = sink.send(Message::Text(frame.into())).await {
                    return DisconnectReason::Transport(e.to_string());
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => match codec::decode_server(text.as_str()) {
                    Ok(event) => {
                        tracing::trace!(event = event.name(), "inbound event");
                        if events.send(ConnectionEvent::Event(event)).is_err() {
                            return DisconnectReason::Local;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed frame, skipping");
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(?frame, "server closed the connection");
                    return DisconnectReason::Forced;
                }
                Some(Ok(Message::Binary(data))) => {
                    tracing::debug!(len = data.len(), "ignoring binary frame");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return DisconnectReason::Transport(e.to_string()),
                None => return DisconnectReason::Transport("stream ended".into()),
            },
        }
    }
}
