//! Property-based tests for inbound routing and outbound delivery.
//!
//! The router and outbox are driven directly over a [`LoopbackLink`], with
//! the server's behaviour (echoes, receipts, redelivery) simulated in the
//! test. Properties:
//! 1. An echoed message appears exactly once and ends delivered, however
//!    many times the echo arrives.
//! 2. Inbound messages keep their arrival order.
//! 3. Pending messages are replayed in order after a reconnect and are not
//!    duplicated when the first transmission also got through.
//! 4. Group events with a non-numeric room never reach a conversation.
//! 5. Unread counts grow by one per inbound message while unfocused and
//!    reset on focus.

use parley::chat::model::{ConversationId, DeliveryState, MessageBody};
use parley::chat::outbox::{Draft, Outbox, OutboxConfig};
use parley::chat::router::{Routed, Router};
use parley::chat::state::ChatState;
use parley::connection::LoopbackLink;
use parley::notify::SilentNotifier;
use parley_proto::event::{ChatPayload, ClientEvent, RawRoom, ServerEvent};
use parley_proto::ids::{CorrelationId, RoomId, Timestamp, UserId};
use proptest::prelude::*;

const LOCAL: &str = "1";

struct Client {
    router: Router<SilentNotifier>,
    outbox: Outbox,
    link: LoopbackLink,
}

impl Client {
    fn new(connected: bool) -> Self {
        Self {
            router: Router::new(ChatState::new(UserId::new(LOCAL)), SilentNotifier),
            outbox: Outbox::new(OutboxConfig::default()),
            link: LoopbackLink::new(connected),
        }
    }

    fn send(&mut self, to: ConversationId, text: &str) -> CorrelationId {
        self.outbox.send(
            self.router.state_mut(),
            &self.link,
            Draft {
                to,
                body: MessageBody::Text(text.to_string()),
                attachment: None,
            },
        )
    }

    /// Feeds one server event through the router, acknowledging the outbox
    /// the way the session does.
    fn receive(&mut self, event: ServerEvent) -> Routed {
        let routed = self.router.apply(event);
        if let Routed::Echo { correlation_id, .. } | Routed::Acknowledged { correlation_id, .. } =
            &routed
        {
            self.outbox.on_ack(self.router.state_mut(), correlation_id);
        }
        routed
    }
}

/// What the server sends back to the author of `event`.
fn echo_of(event: &ClientEvent) -> ServerEvent {
    match event.clone() {
        ClientEvent::PrivateMessage(p) => ServerEvent::PrivateMessage(p),
        ClientEvent::GroupMessage(p) => ServerEvent::GroupMessage(p),
        ClientEvent::GeneralMessage(p) => ServerEvent::GeneralMessage(p),
        other => panic!("not a chat event: {other:?}"),
    }
}

fn correlation_of(event: &ClientEvent) -> CorrelationId {
    match event {
        ClientEvent::PrivateMessage(p)
        | ClientEvent::GroupMessage(p)
        | ClientEvent::GeneralMessage(p) => p.correlation_id.clone(),
        other => panic!("not a chat event: {other:?}"),
    }
}

fn inbound(id: &str, from: &str, to: Option<&str>, room: Option<RawRoom>, ts: u64) -> ChatPayload {
    ChatPayload {
        correlation_id: CorrelationId::new(id),
        sender_id: UserId::new(from),
        recipient_id: to.map(UserId::new),
        room,
        message: format!("mensaje {id}"),
        file: None,
        file_name: None,
        timestamp: Some(Timestamp::from_millis(ts)),
    }
}

fn arb_target() -> impl Strategy<Value = ConversationId> {
    prop_oneof![
        "[2-9]{1,3}".prop_map(|u| ConversationId::Direct(UserId::new(u))),
        (0u64..50).prop_map(|r| ConversationId::Group(RoomId::new(r))),
        Just(ConversationId::Broadcast),
    ]
}

fn arb_non_numeric_room() -> impl Strategy<Value = RawRoom> {
    prop_oneof![
        "[a-z][a-z0-9_]{0,10}".prop_map(RawRoom::Text),
        (i64::MIN..0).prop_map(RawRoom::Number),
        Just(RawRoom::Text(String::new())),
    ]
}

proptest! {
    #[test]
    fn echoed_messages_appear_once_and_delivered(
        sends in prop::collection::vec((arb_target(), ".{1,40}"), 1..12),
        echo_copies in 1usize..4,
    ) {
        let mut client = Client::new(true);
        let ids: Vec<(ConversationId, CorrelationId)> = sends
            .iter()
            .map(|(to, text)| (to.clone(), client.send(to.clone(), text)))
            .collect();

        let sent = client.link.take_sent();
        prop_assert_eq!(sent.len(), ids.len());
        for _ in 0..echo_copies {
            for event in &sent {
                client.receive(echo_of(event));
            }
        }

        for (conversation, id) in &ids {
            let conv = client.router.state().conversation(conversation).expect("conversation exists");
            let copies: Vec<_> = conv.messages.iter().filter(|m| m.correlation_id == *id).collect();
            prop_assert_eq!(copies.len(), 1);
            prop_assert_eq!(copies[0].delivery, DeliveryState::Delivered);
            prop_assert_eq!(conv.unread, 0);
        }
        prop_assert!(client.outbox.is_empty());
    }

    #[test]
    fn inbound_messages_keep_arrival_order(
        timestamps in prop::collection::vec(any::<u32>(), 1..20),
        duplicate_every in 2usize..5,
    ) {
        let mut client = Client::new(true);
        let mut expected = Vec::new();
        for (i, ts) in timestamps.iter().enumerate() {
            let id = format!("in-{i}");
            let payload = inbound(&id, "7", Some(LOCAL), None, u64::from(*ts));
            client.receive(ServerEvent::PrivateMessage(payload.clone()));
            if i % duplicate_every == 0 {
                let again = client.receive(ServerEvent::PrivateMessage(payload));
                let is_duplicate = matches!(again, Routed::Duplicate { .. });
                prop_assert!(is_duplicate);
            }
            expected.push(CorrelationId::new(id));
        }

        let conv = client
            .router
            .state()
            .conversation(&ConversationId::Direct(UserId::new("7")))
            .expect("conversation exists");
        let order: Vec<CorrelationId> = conv.messages.iter().map(|m| m.correlation_id.clone()).collect();
        prop_assert_eq!(order, expected);
    }

    #[test]
    fn pending_messages_replay_in_order_without_duplicates(
        sends in prop::collection::vec((arb_target(), ".{1,20}"), 1..10),
        connected_at_send in prop::collection::vec(any::<bool>(), 10),
        silently_delivered in prop::collection::vec(any::<bool>(), 10),
    ) {
        let mut client = Client::new(false);
        let mut order = Vec::new();
        for (i, (to, text)) in sends.iter().enumerate() {
            client.link.set_connected(connected_at_send[i]);
            order.push((to.clone(), client.send(to.clone(), text)));
        }
        // The connection drops before any acknowledgment arrives.
        let first_attempts = client.link.take_sent();
        client.link.set_connected(false);
        client.outbox.on_disconnect();
        prop_assert_eq!(client.outbox.len(), sends.len());

        client.link.set_connected(true);
        let replayed = client.outbox.on_reconnect(&client.link);
        prop_assert_eq!(replayed, sends.len());
        let replay = client.link.take_sent();
        let replay_ids: Vec<CorrelationId> = replay.iter().map(correlation_of).collect();
        let expected_ids: Vec<CorrelationId> = order.iter().map(|(_, id)| id.clone()).collect();
        prop_assert_eq!(&replay_ids, &expected_ids);
        // Nothing went out ahead of an older message still waiting.
        let first_ids: Vec<CorrelationId> = first_attempts.iter().map(correlation_of).collect();
        prop_assert_eq!(&first_ids[..], &expected_ids[..first_ids.len()]);

        // Some first attempts reached the server anyway: their echoes arrive
        // alongside the replay's.
        for (i, event) in first_attempts.iter().enumerate() {
            if silently_delivered[i % silently_delivered.len()] {
                client.receive(echo_of(event));
            }
        }
        for event in &replay {
            client.receive(echo_of(event));
        }

        prop_assert!(client.outbox.is_empty());
        for (conversation, id) in &order {
            let conv = client.router.state().conversation(conversation).expect("conversation exists");
            let copies = conv.messages.iter().filter(|m| m.correlation_id == *id).count();
            prop_assert_eq!(copies, 1);
            prop_assert_eq!(conv.find(id).map(|m| m.delivery), Some(DeliveryState::Delivered));
        }
    }

    #[test]
    fn non_numeric_rooms_are_dropped(room in arb_non_numeric_room(), id in "[a-z0-9]{1,12}") {
        let mut client = Client::new(true);
        let routed = client.receive(ServerEvent::GroupMessage(inbound(&id, "5", None, Some(room), 1)));
        let dropped = matches!(routed, Routed::Dropped(_));
        prop_assert!(dropped);
        let correlation_id = CorrelationId::new(id);
        prop_assert!(
            client
                .router
                .state()
                .conversations()
                .iter()
                .all(|c| c.find(&correlation_id).is_none())
        );
        prop_assert!(client.router.state().conversations().is_empty());
    }

    #[test]
    fn unread_counts_one_per_message_and_focus_resets(
        before_focus in 0u32..15,
        while_focused in 0u32..5,
        room in 0u64..100,
    ) {
        let mut client = Client::new(true);
        let conversation = ConversationId::Group(RoomId::new(room));
        let raw_room = Some(RawRoom::from(RoomId::new(room)));
        let mut seq = 0;
        let mut deliver = |client: &mut Client| {
            seq += 1;
            client.receive(ServerEvent::GroupMessage(inbound(
                &format!("g-{seq}"),
                "8",
                None,
                raw_room.clone(),
                seq,
            )));
        };

        for _ in 0..before_focus {
            deliver(&mut client);
        }
        let unread = client.router.state().conversation(&conversation).map_or(0, |c| c.unread);
        prop_assert_eq!(unread, before_focus);

        client.router.state_mut().focus(conversation.clone());
        prop_assert_eq!(client.router.state().conversation(&conversation).map(|c| c.unread), Some(0));

        for _ in 0..while_focused {
            deliver(&mut client);
        }
        prop_assert_eq!(client.router.state().conversation(&conversation).map(|c| c.unread), Some(0));

        client.router.state_mut().unfocus();
        deliver(&mut client);
        prop_assert_eq!(client.router.state().conversation(&conversation).map(|c| c.unread), Some(1));
    }
}
