//! Relay server core: shared state, WebSocket handler, user registry, and
//! event routing.
//!
//! The relay accepts WebSocket connections, registers users by the id in
//! their first `register` frame, echoes every chat message back to its author
//! and relays it to the recipient (direct) or to every other connected user
//! (group and general). Direct messages and receipts for users that are
//! offline are queued in an [`OfflineQueue`] and delivered on registration.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parley_proto::codec;
use parley_proto::event::{ChatPayload, ClientEvent, ErrorPayload, ServerEvent};
use parley_proto::ids::{Timestamp, UserId};
use tokio::sync::{RwLock, mpsc};

use crate::api;
use crate::store::{History, OfflineQueue, UserDirectory, UserRecord};

/// Default maximum allowed frame size in bytes.
const DEFAULT_MAX_FRAME_SIZE: usize = codec::MAX_FRAME_SIZE;

/// One registered socket.
struct Connection {
    /// Distinguishes a re-registered socket from the one it replaced.
    id: u64,
    sender: mpsc::UnboundedSender<Message>,
}

/// Shared relay state: user registry, offline queue, history and directory.
pub struct RelayState {
    connections: RwLock<HashMap<String, Connection>>,
    next_connection: AtomicU64,
    /// Store-and-forward queue for offline users.
    pub queue: OfflineQueue,
    /// Messages persisted through the HTTP API.
    pub history: History,
    /// User directory served by the HTTP API.
    pub users: UserDirectory,
    max_frame_size: usize,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a relay state with an empty registry and directory.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DEFAULT_MAX_FRAME_SIZE, OfflineQueue::new(), Vec::new())
    }

    /// Creates a relay state whose directory is seeded with `users`.
    #[must_use]
    pub fn with_users(users: Vec<UserRecord>) -> Self {
        Self::with_config(DEFAULT_MAX_FRAME_SIZE, OfflineQueue::new(), users)
    }

    /// Creates a relay state with a custom frame size limit and queue.
    #[must_use]
    pub fn with_config(max_frame_size: usize, queue: OfflineQueue, users: Vec<UserRecord>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            queue,
            history: History::new(),
            users: UserDirectory::new(users),
            max_frame_size,
        }
    }

    /// Registers a socket for `user_id`, replacing any previous one.
    ///
    /// Returns the connection id to pass to [`unregister`](Self::unregister).
    pub async fn register(&self, user_id: &str, sender: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let mut conns = self.connections.write().await;
        if conns
            .insert(user_id.to_string(), Connection { id, sender })
            .is_some()
        {
            tracing::info!(user_id = %user_id, "replaced existing connection (re-register)");
        }
        id
    }

    /// Removes `user_id` if it is still bound to `connection`.
    ///
    /// A socket that was replaced by a newer registration leaves the newer
    /// one in place.
    pub async fn unregister(&self, user_id: &str, connection: u64) -> bool {
        let mut conns = self.connections.write().await;
        if conns.get(user_id).is_some_and(|c| c.id == connection) {
            conns.remove(user_id);
            true
        } else {
            false
        }
    }

    /// Whether `user` currently has a registered socket.
    pub async fn is_registered(&self, user: &UserId) -> bool {
        self.connections.read().await.contains_key(user.as_str())
    }

    /// Ids of all registered users.
    pub async fn connected_users(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    async fn get_sender(&self, user_id: &str) -> Option<mpsc::UnboundedSender<Message>> {
        let conns = self.connections.read().await;
        conns.get(user_id).map(|c| c.sender.clone())
    }

    /// Send a WebSocket Close frame to all connected users.
    ///
    /// Clients see this as a server-forced disconnect.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (user_id, conn) in conns.iter() {
            tracing::info!(user_id = %user_id, "sending close frame");
            let _ = conn.sender.send(Message::Close(None));
        }
    }
}

/// Handles an upgraded WebSocket connection for a single user.
///
/// The connection lifecycle:
/// 1. Wait for a `register` frame.
/// 2. Register the user and add it to the directory.
/// 3. Drain any queued frames for the user.
/// 4. Enter the frame loop, routing events.
/// 5. On disconnect, unregister unless a newer socket took over.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(user_id) = wait_for_register(&mut ws_receiver).await else {
        tracing::warn!("connection closed before registration");
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let connection = state.register(&user_id, tx).await;
    state.users.ensure(&user_id).await;
    tracing::info!(user_id = %user_id, connection, "user registered");

    let queued = state.queue.drain(&user_id).await;
    if !queued.is_empty() {
        tracing::info!(user_id = %user_id, count = queued.len(), "draining queued frames");
        for stored in queued {
            if let Err(e) = ws_sender.send(Message::Text(stored.frame.into())).await {
                tracing::warn!(user_id = %user_id, error = %e, "failed to deliver queued frame, stopping drain");
                break;
            }
        }
    }

    let writer_user = user_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(user_id = %writer_user, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_user = user_id.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_text_frame(&reader_user, text.as_str(), &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(user_id = %reader_user, "received close frame");
                    break;
                }
                Message::Binary(_) => {
                    tracing::warn!(user_id = %reader_user, "ignoring binary frame");
                }
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    if state.unregister(&user_id, connection).await {
        tracing::info!(user_id = %user_id, "user disconnected and unregistered");
    } else {
        tracing::debug!(user_id = %user_id, connection, "stale socket closed");
    }
}

/// Waits for the first text frame, expecting `register`.
async fn wait_for_register(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<String> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                return match codec::decode::<ClientEvent>(text.as_str()) {
                    Ok(ClientEvent::Register(register)) if !register.user_id.as_str().is_empty() => {
                        Some(register.user_id.as_str().to_string())
                    }
                    Ok(other) => {
                        tracing::warn!(event = ?other, "expected register as first frame");
                        None
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to decode registration frame");
                        None
                    }
                };
            }
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

/// Handles a text frame from a registered user.
async fn handle_text_frame(user_id: &str, text: &str, state: &Arc<RelayState>) {
    if text.len() > state.max_frame_size {
        tracing::warn!(user_id = %user_id, size = text.len(), max = state.max_frame_size, "frame exceeds size limit");
        reply_error(state, user_id, format!("frame too large: {} bytes", text.len())).await;
        return;
    }

    let event = match codec::decode::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "failed to decode frame");
            reply_error(state, user_id, format!("malformed event: {e}")).await;
            return;
        }
    };

    match event {
        ClientEvent::PrivateMessage(payload) => {
            let payload = stamp(user_id, payload);
            let Some(recipient) = payload.recipient_id.clone() else {
                reply_error(state, user_id, "private_message without recipient_id".into()).await;
                return;
            };
            tracing::debug!(from = %user_id, to = %recipient, correlation_id = %payload.correlation_id, "routing private message");
            send_event(state, user_id, &ServerEvent::PrivateMessage(payload.clone())).await;
            if recipient.as_str() != user_id {
                deliver_or_queue(state, recipient.as_str(), &ServerEvent::PrivateMessage(payload))
                    .await;
            }
        }
        ClientEvent::GroupMessage(payload) => {
            let payload = stamp(user_id, payload);
            if payload.room.as_ref().and_then(|r| r.parse()).is_none() {
                reply_error(state, user_id, "group_message without a numeric room".into()).await;
                return;
            }
            fan_out(state, user_id, &ServerEvent::GroupMessage(payload)).await;
        }
        ClientEvent::GeneralMessage(payload) => {
            let payload = stamp(user_id, payload);
            fan_out(state, user_id, &ServerEvent::GeneralMessage(payload)).await;
        }
        ClientEvent::MessageReceived(receipt) => {
            let author = receipt.sender_id.clone();
            deliver_or_queue(state, author.as_str(), &ServerEvent::MessageReceived(receipt)).await;
        }
        ClientEvent::GroupMessageReceived(receipt) => {
            let author = receipt.sender_id.clone();
            deliver_or_queue(state, author.as_str(), &ServerEvent::GroupMessageReceived(receipt))
                .await;
        }
        ClientEvent::Register(register) => {
            tracing::warn!(
                user_id = %user_id,
                new_id = %register.user_id,
                "received register from already-registered user"
            );
        }
    }
}

/// Forces the author to the registered id and fills a missing timestamp.
fn stamp(user_id: &str, mut payload: ChatPayload) -> ChatPayload {
    payload.sender_id = UserId::new(user_id);
    payload.timestamp.get_or_insert_with(Timestamp::now);
    payload
}

/// Echoes `event` to its author and relays it to every other connected user.
async fn fan_out(state: &Arc<RelayState>, author: &str, event: &ServerEvent) {
    let Ok(frame) = codec::encode(event) else {
        tracing::error!(event = event.name(), "failed to encode event for fan-out");
        return;
    };
    let conns = state.connections.read().await;
    let mut relayed = 0usize;
    for (user, conn) in conns.iter() {
        if conn.sender.send(Message::Text(frame.clone().into())).is_ok() && user != author {
            relayed += 1;
        }
    }
    drop(conns);
    tracing::debug!(from = %author, event = event.name(), relayed, "fan-out");
}

/// Sends `event` to `user`, queuing it if the user is offline.
async fn deliver_or_queue(state: &Arc<RelayState>, user: &str, event: &ServerEvent) {
    let frame = match codec::encode(event) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode event for delivery");
            return;
        }
    };
    if let Some(sender) = state.get_sender(user).await
        && sender.send(Message::Text(frame.clone().into())).is_ok()
    {
        return;
    }
    let count = state.queue.enqueue(user, frame).await;
    tracing::info!(to = %user, event = event.name(), count, "recipient offline, frame queued");
}

/// Sends an event to a registered user, dropping it if they are offline.
async fn send_event(state: &Arc<RelayState>, user: &str, event: &ServerEvent) {
    if let Some(sender) = state.get_sender(user).await
        && let Ok(frame) = codec::encode(event)
    {
        let _ = sender.send(Message::Text(frame.into()));
    }
}

async fn reply_error(state: &Arc<RelayState>, user: &str, reason: String) {
    send_event(state, user, &ServerEvent::Error(ErrorPayload { reason })).await;
}

/// Starts the relay server on the given address and returns the bound address
/// and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// Serves the WebSocket endpoint at `/ws` and the HTTP API under `/chat`.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .merge(api::routes())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> impl axum::response::IntoResponse {
    ws.max_message_size(state.max_frame_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}
