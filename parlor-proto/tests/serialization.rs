//! Property tests for the wire codec: every frame the client can construct
//! survives an encode/decode round trip unchanged.

use proptest::prelude::*;

use parlor_proto::codec::{decode, encode};
use parlor_proto::frame::Frame;
use parlor_proto::ids::{ClientMessageId, ServerMessageId, Timestamp, UserId};

fn user_id() -> impl Strategy<Value = UserId> {
    "[a-zA-Z0-9_-]{1,24}".prop_map(UserId::new)
}

fn timestamp() -> impl Strategy<Value = Timestamp> {
    any::<u64>().prop_map(Timestamp::from_millis)
}

fn client_message_id() -> impl Strategy<Value = ClientMessageId> {
    any::<u128>().prop_map(|raw| ClientMessageId::from_uuid(uuid::Uuid::from_u128(raw)))
}

fn frame() -> impl Strategy<Value = Frame> {
    prop_oneof![
        (
            proptest::option::of(any::<u64>().prop_map(ServerMessageId::new)),
            proptest::option::of(client_message_id()),
            user_id(),
            user_id(),
            ".{0,200}",
            proptest::option::of(timestamp()),
        )
            .prop_map(
                |(id, client_message_id, sender_id, receiver_id, content, sent_time)| {
                    Frame::Message {
                        id,
                        client_message_id,
                        sender_id,
                        receiver_id,
                        content,
                        sent_time,
                    }
                }
            ),
        timestamp().prop_map(|timestamp| Frame::Heartbeat { timestamp }),
        timestamp().prop_map(|timestamp| Frame::HeartbeatAck { timestamp }),
        (user_id(), any::<u32>()).prop_map(|(sender_id, unread_count)| Frame::UnreadCount {
            sender_id,
            unread_count
        }),
        proptest::collection::vec(user_id(), 0..8)
            .prop_map(|content| Frame::OnlineUsers { content }),
        (user_id(), timestamp()).prop_map(|(reader_id, timestamp)| Frame::ReadReceipt {
            reader_id,
            timestamp
        }),
        (".{0,100}", proptest::option::of("[A-Z_]{1,16}".prop_map(String::from))).prop_map(
            |(message, error_code)| Frame::Error {
                message,
                error_code
            }
        ),
        user_id().prop_map(|sender_id| Frame::Join { sender_id }),
        user_id().prop_map(|sender_id| Frame::MarkAsRead { sender_id }),
    ]
}

proptest! {
    #[test]
    fn encode_decode_round_trip(original in frame()) {
        let text = encode(&original).unwrap();
        let decoded = decode(&text).unwrap();
        prop_assert_eq!(original, decoded);
    }

    #[test]
    fn encoded_frame_is_a_json_object_with_type(original in frame()) {
        let text = encode(&original).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        prop_assert!(value.get("type").is_some());
        prop_assert_eq!(value["type"].as_str().unwrap(), original.kind());
    }
}
