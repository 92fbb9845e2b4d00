//! Property-based tests for the wire event codec.
//!
//! Uses proptest to verify:
//! 1. Any client event survives encode → decode.
//! 2. Arbitrary text never causes a panic in `decode_server`.
//! 3. Room values parse to a `RoomId` exactly when they are non-negative integers.
//! 4. User ids are accepted as JSON numbers or strings and compare equal.

use parley_proto::codec;
use parley_proto::event::{ChatPayload, ClientEvent, RawRoom, ReceiptPayload, RegisterPayload};
use parley_proto::ids::{CorrelationId, RoomId, Timestamp, UserId};
use proptest::prelude::*;

fn arb_user_id() -> impl Strategy<Value = UserId> {
    "[0-9a-z]{1,12}".prop_map(UserId::new)
}

fn arb_correlation_id() -> impl Strategy<Value = CorrelationId> {
    "[0-9a-f-]{1,36}".prop_map(CorrelationId::new)
}

fn arb_payload() -> impl Strategy<Value = ChatPayload> {
    (
        arb_correlation_id(),
        arb_user_id(),
        prop::option::of(arb_user_id()),
        prop::option::of(any::<u32>().prop_map(|n| RawRoom::from(RoomId::new(u64::from(n))))),
        ".{0,256}",
        prop::option::of(("[A-Za-z0-9+/]{0,64}", "[a-z]{1,8}\\.[a-z]{3}")),
        any::<u64>(),
    )
        .prop_map(
            |(correlation_id, sender_id, recipient_id, room, message, file, ts)| ChatPayload {
                correlation_id,
                sender_id,
                recipient_id,
                room,
                message,
                file: file.as_ref().map(|(data, _)| data.clone()),
                file_name: file.map(|(_, name)| name),
                timestamp: Some(Timestamp::from_millis(ts)),
            },
        )
}

fn arb_client_event() -> impl Strategy<Value = ClientEvent> {
    prop_oneof![
        arb_user_id().prop_map(|user_id| ClientEvent::Register(RegisterPayload { user_id })),
        arb_payload().prop_map(ClientEvent::PrivateMessage),
        arb_payload().prop_map(ClientEvent::GroupMessage),
        arb_payload().prop_map(ClientEvent::GeneralMessage),
        (arb_correlation_id(), arb_user_id(), arb_user_id()).prop_map(
            |(message_id, recipient_id, sender_id)| {
                ClientEvent::MessageReceived(ReceiptPayload {
                    message_id,
                    recipient_id,
                    sender_id,
                })
            }
        ),
    ]
}

proptest! {
    #[test]
    fn client_events_survive_encode_decode(event in arb_client_event()) {
        let frame = codec::encode_client(&event).unwrap();
        let decoded: ClientEvent = codec::decode(&frame).unwrap();
        prop_assert_eq!(event, decoded);
    }

    #[test]
    fn decode_never_panics_on_arbitrary_text(text in ".{0,512}") {
        let _ = codec::decode_server(&text);
    }

    #[test]
    fn textual_room_parses_iff_numeric(text in "[0-9a-z]{0,8}") {
        let parsed = RawRoom::Text(text.clone()).parse();
        let expected = text.parse::<u64>().ok().map(RoomId::new);
        prop_assert_eq!(parsed, expected);
    }

    #[test]
    fn numeric_and_string_sender_ids_agree(n in 0i64..1_000_000_000) {
        let numeric = format!(
            r#"{{"event":"message_received","data":{{"message_id":"m","recipient_id":1,"sender_id":{n}}}}}"#
        );
        let textual = format!(
            r#"{{"event":"message_received","data":{{"message_id":"m","recipient_id":"1","sender_id":"{n}"}}}}"#
        );
        prop_assert_eq!(
            codec::decode_server(&numeric).unwrap(),
            codec::decode_server(&textual).unwrap()
        );
    }
}
