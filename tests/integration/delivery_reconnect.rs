// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items
)]

//! End-to-end delivery across connection loss.
//!
//! A session talks to an in-process relay through a TCP proxy. Killing the
//! proxy severs the WebSocket without the relay closing it, which is how a
//! network drop looks to the client. Restarting the proxy on the same port
//! lets the connection manager's reconnect loop succeed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parley::chat::model::{ConversationId, DeliveryState};
use parley::chat::store::InMemoryStore;
use parley::connection::{ConnectionConfig, ConnectionManager};
use parley::directory::HttpDirectory;
use parley::notify::SilentNotifier;
use parley::session::{self, ConnectionStatus, SessionCommand, SessionConfig, SessionEvent, SessionHandle};
use parley_proto::ids::UserId;
use parley_relay::relay::{RelayState, start_server_with_state};
use parley_relay::store::UserRecord;
use tokio::sync::mpsc;

// =============================================================================
// TCP Proxy helper
// =============================================================================

/// Forwards a client-facing port to the relay. `kill()` aborts every proxied
/// connection, tearing down both directions at once.
struct TcpProxy {
    port: u16,
    accept_handle: tokio::task::JoinHandle<()>,
    conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl TcpProxy {
    async fn new(proxy_port: u16, backend_addr: &str) -> Self {
        let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{proxy_port}"))
            .await
            .unwrap_or_else(|e| panic!("proxy: failed to bind to port {proxy_port}: {e}"));
        let port = listener.local_addr().unwrap().port();
        let backend = backend_addr.to_string();
        let conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let conn_handles_clone = Arc::clone(&conn_handles);

        let accept_handle = tokio::spawn(async move {
            while let Ok((mut client_stream, _)) = listener.accept().await {
                let backend = backend.clone();
                let conn_handle = tokio::spawn(async move {
                    let Ok(mut backend_stream) = tokio::net::TcpStream::connect(&backend).await
                    else {
                        return;
                    };
                    let _ = tokio::io::copy_bidirectional(&mut client_stream, &mut backend_stream)
                        .await;
                });
                conn_handles_clone.lock().push(conn_handle);
            }
        });

        Self {
            port,
            accept_handle,
            conn_handles,
        }
    }

    fn kill(self) -> u16 {
        self.accept_handle.abort();
        for h in self.conn_handles.lock().iter() {
            h.abort();
        }
        self.port
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn start_relay() -> (String, Arc<RelayState>) {
    let state = Arc::new(RelayState::with_users(vec![
        UserRecord::new("1", "Ana Torres", "agente"),
        UserRecord::new("2", "Bruno Díaz", "agente"),
    ]));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start relay");
    (addr.to_string(), state)
}

fn start_session(ws_addr: &str, api_addr: &str, user: &str, max_attempts: u32) -> SessionHandle {
    let connection = ConnectionConfig {
        connect_timeout: Duration::from_secs(2),
        reconnect_delay: Duration::from_millis(100),
        forced_reconnect_delay: Duration::from_millis(20),
        max_reconnect_attempts: max_attempts,
        ..ConnectionConfig::new(format!("ws://{ws_addr}/ws"), UserId::new(user))
    };
    let session = SessionConfig {
        tick_interval: Duration::from_millis(50),
        seed_directory: false,
        ..SessionConfig::new(UserId::new(user))
    };
    let directory =
        HttpDirectory::new(&format!("http://{api_addr}"), Duration::from_secs(5)).unwrap();
    let (link, events) = ConnectionManager::new(connection);
    session::spawn(
        session,
        link,
        events,
        Arc::new(InMemoryStore::new()),
        directory,
        SilentNotifier,
    )
}

async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    what: &str,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
            .expect("session ended");
        if pred(&event) {
            return event;
        }
    }
}

const fn is_connected(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::Connection(ConnectionStatus::Connected { .. }))
}

// =============================================================================
// Tests
// =============================================================================

/// Send while disconnected: the message is shown as pending, goes out after
/// the reconnection, is echoed, and ends delivered. The recipient sees it
/// exactly once.
#[tokio::test]
async fn message_sent_while_disconnected_is_delivered_after_reconnect() {
    let (relay_addr, _state) = start_relay().await;
    let proxy = TcpProxy::new(0, &relay_addr).await;
    let proxy_addr = format!("127.0.0.1:{}", proxy.port);

    let mut alice = start_session(&proxy_addr, &relay_addr, "1", 50);
    let mut bruno = start_session(&relay_addr, &relay_addr, "2", 5);
    wait_for(&mut alice.events, "alice connected", is_connected).await;
    wait_for(&mut bruno.events, "bruno connected", is_connected).await;

    let port = proxy.kill();
    wait_for(&mut alice.events, "alice disconnected", |e| {
        matches!(e, SessionEvent::Connection(ConnectionStatus::Disconnected { .. }))
    })
    .await;

    alice
        .commands
        .send(SessionCommand::Send {
            to: ConversationId::Direct(UserId::new("2")),
            body: "¿sigues ahí?".into(),
            attachment: None,
        })
        .await
        .unwrap();
    let SessionEvent::MessageAppended { message, .. } =
        wait_for(&mut alice.events, "pending message", |e| {
            matches!(e, SessionEvent::MessageAppended { .. })
        })
        .await
    else {
        unreachable!()
    };
    assert_eq!(message.delivery, DeliveryState::Pending);

    let _proxy = TcpProxy::new(port, &relay_addr).await;
    let reconnected = wait_for(&mut alice.events, "alice reconnected", is_connected).await;
    assert_eq!(
        reconnected,
        SessionEvent::Connection(ConnectionStatus::Connected { reconnected: true })
    );

    let delivered = wait_for(&mut alice.events, "delivery", |e| {
        matches!(e, SessionEvent::DeliveryChanged { .. })
    })
    .await;
    assert_eq!(
        delivered,
        SessionEvent::DeliveryChanged {
            conversation: ConversationId::Direct(UserId::new("2")),
            correlation_id: message.correlation_id.clone(),
            delivery: DeliveryState::Delivered,
        }
    );

    let SessionEvent::MessageAppended {
        conversation,
        message: received,
    } = wait_for(&mut bruno.events, "bruno receives", |e| {
        matches!(e, SessionEvent::MessageAppended { .. })
    })
    .await
    else {
        unreachable!()
    };
    assert_eq!(conversation, ConversationId::Direct(UserId::new("1")));
    assert_eq!(received.correlation_id, message.correlation_id);

    // No second copy arrives.
    let extra = tokio::time::timeout(Duration::from_millis(300), async {
        wait_for(&mut bruno.events, "duplicate", |e| {
            matches!(e, SessionEvent::MessageAppended { .. })
        })
        .await
    })
    .await;
    assert!(extra.is_err(), "recipient saw the message twice");

    alice.shutdown().await;
    bruno.shutdown().await;
}

/// A server-initiated close is followed by a quick reconnection.
#[tokio::test]
async fn forced_close_reconnects() {
    let (relay_addr, state) = start_relay().await;
    let mut alice = start_session(&relay_addr, &relay_addr, "1", 3);
    wait_for(&mut alice.events, "connected", is_connected).await;

    state.close_all_connections().await;

    wait_for(&mut alice.events, "forced disconnect", |e| {
        matches!(
            e,
            SessionEvent::Connection(ConnectionStatus::Disconnected { reason }) if reason.contains("server")
        )
    })
    .await;
    wait_for(&mut alice.events, "reconnected", |e| {
        matches!(
            e,
            SessionEvent::Connection(ConnectionStatus::Connected { reconnected: true })
        )
    })
    .await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while !state.is_registered(&UserId::new("1")).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("relay never saw the re-registration");
    alice.shutdown().await;
}

/// With the server gone for good the session reports a fatal error once the
/// reconnection budget is spent.
#[tokio::test]
async fn exhausted_reconnection_budget_is_fatal() {
    let (relay_addr, _state) = start_relay().await;
    let proxy = TcpProxy::new(0, &relay_addr).await;
    let proxy_addr = format!("127.0.0.1:{}", proxy.port);

    let mut alice = start_session(&proxy_addr, &relay_addr, "1", 3);
    wait_for(&mut alice.events, "connected", is_connected).await;
    proxy.kill();

    let mut attempts = Vec::new();
    let fatal = loop {
        let event = wait_for(&mut alice.events, "reconnect progress", |e| {
            matches!(
                e,
                SessionEvent::Connection(ConnectionStatus::Reconnecting { .. }) | SessionEvent::Fatal(_)
            )
        })
        .await;
        match event {
            SessionEvent::Connection(ConnectionStatus::Reconnecting { attempt, max_attempts }) => {
                assert_eq!(max_attempts, 3);
                attempts.push(attempt);
            }
            other => break other,
        }
    };
    assert_eq!(attempts, [1, 2, 3]);
    assert!(matches!(fatal, SessionEvent::Fatal(text) if text.contains("3 reconnection attempts")));
    alice.shutdown().await;
}
