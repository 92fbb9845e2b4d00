// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::match_same_arms,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items
)]

//! Message routing between live sessions through the in-process relay.
//!
//! Every test starts a relay on an ephemeral port and one session per user,
//! each with its own connection manager and HTTP directory client.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::SinkExt;
use parley::chat::model::{ConversationId, DeliveryState};
use parley::chat::store::InMemoryStore;
use parley::connection::{ConnectionConfig, ConnectionManager};
use parley::directory::HttpDirectory;
use parley::notify::{Notification, Notifier, NotifyError, SilentNotifier};
use parley::session::{
    self, ConnectionStatus, ConversationSummary, SessionCommand, SessionConfig, SessionEvent,
    SessionHandle,
};
use parley_proto::ids::{RoomId, UserId};
use parley_relay::relay::{RelayState, start_server_with_state};
use parley_relay::store::UserRecord;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

// =============================================================================
// Helpers
// =============================================================================

/// Shows nothing and always fails to play the sound.
#[derive(Clone, Default)]
struct MuteSpeaker {
    shown: Arc<AtomicUsize>,
}

impl Notifier for MuteSpeaker {
    fn show(&self, _notification: &Notification) -> Result<(), NotifyError> {
        self.shown.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn play_sound(&self) -> Result<(), NotifyError> {
        Err(NotifyError::Sound("no audio device".into()))
    }
}

async fn start_relay() -> (String, Arc<RelayState>) {
    let state = Arc::new(RelayState::with_users(vec![
        UserRecord::new("1", "Ana Torres", "agente"),
        UserRecord::new("2", "Bruno Díaz", "agente"),
        UserRecord::new("3", "Carla Méndez", "supervisor"),
    ]));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start relay");
    (addr.to_string(), state)
}

async fn start_session<N: Notifier + 'static>(
    addr: &str,
    state: &RelayState,
    user: &str,
    notifier: N,
) -> SessionHandle {
    let connection = ConnectionConfig {
        reconnect_delay: Duration::from_millis(100),
        ..ConnectionConfig::new(format!("ws://{addr}/ws"), UserId::new(user))
    };
    let session = SessionConfig {
        tick_interval: Duration::from_millis(50),
        seed_directory: false,
        ..SessionConfig::new(UserId::new(user))
    };
    let directory = HttpDirectory::new(&format!("http://{addr}"), Duration::from_secs(5)).unwrap();
    let (link, events) = ConnectionManager::new(connection);
    let mut handle = session::spawn(
        session,
        link,
        events,
        Arc::new(InMemoryStore::new()),
        directory,
        notifier,
    );
    wait_for(&mut handle.events, "connected", |e| {
        matches!(e, SessionEvent::Connection(ConnectionStatus::Connected { .. }))
    })
    .await;
    // `Connected` fires once `register` is written; wait for the relay to
    // process it so nothing sent to this user lands in the offline queue.
    let id = UserId::new(user);
    tokio::time::timeout(Duration::from_secs(5), async {
        while !state.is_registered(&id).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("relay never saw the registration");
    handle
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

/// Collects every event that arrives within `window`.
async fn drain_for(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    window: Duration,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(window, async {
        while let Some(event) = events.recv().await {
            seen.push(event);
        }
    })
    .await;
    seen
}

async fn send(handle: &SessionHandle, to: ConversationId, body: &str) {
    handle
        .commands
        .send(SessionCommand::Send {
            to,
            body: body.into(),
            attachment: None,
        })
        .await
        .unwrap();
}

fn summary_of(summaries: &[ConversationSummary], id: &ConversationId) -> ConversationSummary {
    summaries
        .iter()
        .find(|s| s.id == *id)
        .cloned()
        .unwrap_or_else(|| panic!("no summary for {id}"))
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn direct_message_is_relayed_named_and_acknowledged() {
    let (addr, state) = start_relay().await;
    let mut ana = start_session(&addr, &state, "1", SilentNotifier).await;
    let mut bruno = start_session(&addr, &state, "2", SilentNotifier).await;

    send(&ana, ConversationId::Direct(UserId::new("2")), "hola Bruno").await;

    let SessionEvent::MessageAppended { message: sent, .. } =
        wait_for(&mut ana.events, "own message", |e| {
            matches!(e, SessionEvent::MessageAppended { .. })
        })
        .await
    else {
        unreachable!()
    };

    let SessionEvent::MessageAppended {
        conversation,
        message,
    } = wait_for(&mut bruno.events, "inbound message", |e| {
        matches!(e, SessionEvent::MessageAppended { .. })
    })
    .await
    else {
        unreachable!()
    };
    assert_eq!(conversation, ConversationId::Direct(UserId::new("1")));
    assert_eq!(message.correlation_id, sent.correlation_id);
    assert_eq!(message.sender_id, UserId::new("1"));

    // The sender name is resolved through the directory before notifying.
    let SessionEvent::Notification(notification) =
        wait_for(&mut bruno.events, "notification", |e| {
            matches!(e, SessionEvent::Notification(_))
        })
        .await
    else {
        unreachable!()
    };
    assert_eq!(notification.sender_name, "Ana Torres");
    assert_eq!(notification.preview, "hola Bruno");

    let delivered = wait_for(&mut ana.events, "delivered", |e| {
        matches!(e, SessionEvent::DeliveryChanged { .. })
    })
    .await;
    assert_eq!(
        delivered,
        SessionEvent::DeliveryChanged {
            conversation: ConversationId::Direct(UserId::new("2")),
            correlation_id: sent.correlation_id,
            delivery: DeliveryState::Delivered,
        }
    );

    ana.shutdown().await;
    bruno.shutdown().await;
}

/// A group message from another user raises the unread count by one and
/// notifies once, even though the notification sound fails.
#[tokio::test]
async fn group_message_counts_unread_once_despite_sound_failure() {
    let (addr, state) = start_relay().await;
    let mut ana = start_session(&addr, &state, "1", SilentNotifier).await;
    let speaker = MuteSpeaker::default();
    let mut carla = start_session(&addr, &state, "3", speaker.clone()).await;

    // Carla is reading her direct conversation with Bruno.
    carla
        .commands
        .send(SessionCommand::Focus(ConversationId::Direct(UserId::new("2"))))
        .await
        .unwrap();
    wait_for(&mut carla.events, "focus applied", |e| {
        matches!(e, SessionEvent::Conversations(_))
    })
    .await;

    let room = ConversationId::Group(RoomId::new(7));
    send(&ana, room.clone(), "reunión a las 10").await;

    let SessionEvent::MessageAppended { conversation, .. } =
        wait_for(&mut carla.events, "group message", |e| {
            matches!(e, SessionEvent::MessageAppended { .. })
        })
        .await
    else {
        unreachable!()
    };
    assert_eq!(conversation, room);
    assert_eq!(conversation.to_string(), "grupo_7");

    let rest = drain_for(&mut carla.events, Duration::from_millis(500)).await;
    let notifications = rest
        .iter()
        .filter(|e| matches!(e, SessionEvent::Notification(_)))
        .count();
    assert_eq!(notifications, 1);
    assert_eq!(speaker.shown.load(Ordering::SeqCst), 1);

    let latest = rest
        .iter()
        .rev()
        .find_map(|e| match e {
            SessionEvent::Conversations(list) => Some(list.clone()),
            _ => None,
        })
        .expect("no conversation summary after the message");
    let group = summary_of(&latest, &room);
    assert_eq!(group.unread, 1);
    assert_eq!(group.preview.as_deref(), Some("reunión a las 10"));

    // Ana's own copy is delivered by the echo and never counted as unread.
    wait_for(&mut ana.events, "group echo", |e| {
        matches!(e, SessionEvent::DeliveryChanged { conversation, .. } if *conversation == room)
    })
    .await;

    ana.shutdown().await;
    carla.shutdown().await;
}

#[tokio::test]
async fn broadcast_reaches_every_session() {
    let (addr, state) = start_relay().await;
    let mut ana = start_session(&addr, &state, "1", SilentNotifier).await;
    let mut bruno = start_session(&addr, &state, "2", SilentNotifier).await;
    let mut carla = start_session(&addr, &state, "3", SilentNotifier).await;

    send(&bruno, ConversationId::Broadcast, "buenos días").await;

    for (name, events) in [("ana", &mut ana.events), ("carla", &mut carla.events)] {
        let SessionEvent::MessageAppended {
            conversation,
            message,
        } = wait_for(events, name, |e| matches!(e, SessionEvent::MessageAppended { .. })).await
        else {
            unreachable!()
        };
        assert_eq!(conversation, ConversationId::Broadcast);
        assert_eq!(message.sender_id, UserId::new("2"));
    }

    wait_for(&mut bruno.events, "broadcast echo", |e| {
        matches!(
            e,
            SessionEvent::DeliveryChanged {
                conversation: ConversationId::Broadcast,
                ..
            }
        )
    })
    .await;

    ana.shutdown().await;
    bruno.shutdown().await;
    carla.shutdown().await;
}

/// A direct message that also names a room is dropped without touching any
/// conversation.
#[tokio::test]
async fn message_with_room_and_recipient_is_dropped() {
    let (addr, state) = start_relay().await;
    let mut bruno = start_session(&addr, &state, "2", SilentNotifier).await;

    let (mut raw, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("raw client connect");
    raw.send(WsMessage::Text(
        r#"{"event":"register","data":{"user_id":"9"}}"#.into(),
    ))
    .await
    .unwrap();
    raw.send(WsMessage::Text(
        r#"{"event":"private_message","data":{"correlationId":"both","sender_id":"9","recipient_id":"2","room":"7","message":"hola","timestamp":1}}"#.into(),
    ))
    .await
    .unwrap();
    // A well-formed message afterwards proves the first one was processed.
    raw.send(WsMessage::Text(
        r#"{"event":"private_message","data":{"correlationId":"ok","sender_id":"9","recipient_id":"2","message":"sigo aquí","timestamp":2}}"#.into(),
    ))
    .await
    .unwrap();

    let SessionEvent::MessageAppended { message, .. } =
        wait_for(&mut bruno.events, "well-formed message", |e| {
            matches!(e, SessionEvent::MessageAppended { .. })
        })
        .await
    else {
        unreachable!()
    };
    assert_eq!(message.correlation_id.as_str(), "ok");

    let later = drain_for(&mut bruno.events, Duration::from_millis(300)).await;
    assert!(
        !later
            .iter()
            .any(|e| matches!(e, SessionEvent::MessageAppended { .. })),
        "dropped message surfaced: {later:?}"
    );
    let summaries = later
        .iter()
        .rev()
        .find_map(|e| match e {
            SessionEvent::Conversations(list) => Some(list.clone()),
            _ => None,
        })
        .unwrap_or_default();
    assert!(
        summaries
            .iter()
            .all(|s| s.id != ConversationId::Group(RoomId::new(7)))
    );

    bruno.shutdown().await;
}

#[tokio::test]
async fn group_history_is_loaded_from_the_api() {
    let (addr, state) = start_relay().await;
    let mut ana = start_session(&addr, &state, "1", SilentNotifier).await;
    let room = ConversationId::Group(RoomId::new(4));

    send(&ana, room.clone(), "acta de la reunión").await;
    wait_for(&mut ana.events, "echo", |e| {
        matches!(e, SessionEvent::DeliveryChanged { .. })
    })
    .await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.history.group(RoomId::new(4)).await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("message never persisted");

    // Bruno joins after the fact and pulls the room's history.
    let mut bruno = start_session(&addr, &state, "2", SilentNotifier).await;
    bruno
        .commands
        .send(SessionCommand::LoadHistory(room.clone()))
        .await
        .unwrap();
    let loaded = wait_for(&mut bruno.events, "history", |e| {
        matches!(e, SessionEvent::HistoryLoaded { .. })
    })
    .await;
    assert_eq!(
        loaded,
        SessionEvent::HistoryLoaded {
            conversation: room.clone(),
            added: 1,
        }
    );

    // Loading again adds nothing.
    bruno
        .commands
        .send(SessionCommand::LoadHistory(room.clone()))
        .await
        .unwrap();
    let again = wait_for(&mut bruno.events, "history again", |e| {
        matches!(e, SessionEvent::HistoryLoaded { .. })
    })
    .await;
    assert_eq!(
        again,
        SessionEvent::HistoryLoaded {
            conversation: room,
            added: 0,
        }
    );

    ana.shutdown().await;
    bruno.shutdown().await;
}
