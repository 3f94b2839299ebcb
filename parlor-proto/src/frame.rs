//! Frame envelope for the Parlor wire protocol.
//!
//! Every unit of data exchanged over the persistent connection is one
//! [`Frame`], a JSON object discriminated by its `type` field. Field names
//! are camelCase on the wire; the discriminator values are kebab-case
//! (`"unread-count"`, `"online-users"`, ...), matching the server.

use serde::{Deserialize, Serialize};

use crate::ids::{ClientMessageId, ServerMessageId, Timestamp, UserId};

/// One discrete unit of data exchanged over the persistent connection.
///
/// Inbound and outbound frames share this envelope; some variants only ever
/// travel one way (`Join` and `MarkAsRead` are outbound, `HeartbeatAck` and
/// `OnlineUsers` are inbound). Unknown `type` values fail to decode and are
/// treated as malformed by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Frame {
    /// A chat payload. Inbound this is either a peer message or the server
    /// confirmation of a message we sent (sender == local identity, with
    /// `client_message_id` correlating back to the pending entry).
    Message {
        /// Server-assigned message id, present once the server persisted it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<ServerMessageId>,
        /// Client-generated id echoed back in confirmations.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_message_id: Option<ClientMessageId>,
        /// Who sent the message.
        sender_id: UserId,
        /// Who the message is addressed to.
        receiver_id: UserId,
        /// The message body.
        content: String,
        /// When the server recorded the message.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sent_time: Option<Timestamp>,
    },
    /// Outbound application-level keepalive.
    Heartbeat {
        /// Sender's clock at emission.
        timestamp: Timestamp,
    },
    /// Server response to a heartbeat.
    HeartbeatAck {
        /// Server's clock at response.
        timestamp: Timestamp,
    },
    /// Server-pushed unread counter for one conversation.
    UnreadCount {
        /// The peer whose messages are unread.
        sender_id: UserId,
        /// Authoritative unread count from the server.
        unread_count: u32,
    },
    /// Broadcast of the full set of currently online users.
    OnlineUsers {
        /// Ids of every online user.
        content: Vec<UserId>,
    },
    /// A peer has read our messages up to a point in time.
    ReadReceipt {
        /// The peer who read them.
        reader_id: UserId,
        /// Read-up-to watermark.
        timestamp: Timestamp,
    },
    /// Server-reported error.
    Error {
        /// Human-readable description.
        message: String,
        /// Machine-readable code, when the server provides one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
    /// Outbound presence announcement sent once per successful connect.
    Join {
        /// The local identity going online.
        sender_id: UserId,
    },
    /// Outbound request to mark a peer's messages as read.
    MarkAsRead {
        /// The peer whose messages are being read.
        sender_id: UserId,
    },
}

impl Frame {
    /// The wire discriminator for this frame, as it appears in the `type`
    /// field. Useful for diagnostics without re-serializing.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::Heartbeat { .. } => "heartbeat",
            Self::HeartbeatAck { .. } => "heartbeat-ack",
            Self::UnreadCount { .. } => "unread-count",
            Self::OnlineUsers { .. } => "online-users",
            Self::ReadReceipt { .. } => "read-receipt",
            Self::Error { .. } => "error",
            Self::Join { .. } => "join",
            Self::MarkAsRead { .. } => "mark-as-read",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_frame_wire_shape() {
        let frame = Frame::Message {
            id: Some(ServerMessageId::new(9)),
            client_message_id: None,
            sender_id: UserId::new("alice"),
            receiver_id: UserId::new("bob"),
            content: "hi".into(),
            sent_time: Some(Timestamp::from_millis(1_700_000_000_000)),
        };
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["senderId"], "alice");
        assert_eq!(json["receiverId"], "bob");
        assert_eq!(json["content"], "hi");
        assert_eq!(json["id"], 9);
        assert_eq!(json["sentTime"], 1_700_000_000_000_u64);
        // Absent optionals are omitted entirely, not serialized as null.
        assert!(json.get("clientMessageId").is_none());
    }

    #[test]
    fn unread_count_frame_wire_shape() {
        let frame = Frame::UnreadCount {
            sender_id: UserId::new("bob"),
            unread_count: 3,
        };
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "unread-count");
        assert_eq!(json["senderId"], "bob");
        assert_eq!(json["unreadCount"], 3);
    }

    #[test]
    fn online_users_parses_id_array() {
        let raw = r#"{"type":"online-users","content":["a","b","c"]}"#;
        let frame: Frame = serde_json::from_str(raw).unwrap();
        match frame {
            Frame::OnlineUsers { content } => {
                assert_eq!(content.len(), 3);
                assert_eq!(content[0], UserId::new("a"));
            }
            other => panic!("expected OnlineUsers, got {other:?}"),
        }
    }

    #[test]
    fn heartbeat_ack_parses() {
        let raw = r#"{"type":"heartbeat-ack","timestamp":12345}"#;
        let frame: Frame = serde_json::from_str(raw).unwrap();
        assert_eq!(
            frame,
            Frame::HeartbeatAck {
                timestamp: Timestamp::from_millis(12345)
            }
        );
    }

    #[test]
    fn confirmation_carries_client_message_id() {
        let cid = ClientMessageId::new();
        let raw = format!(
            r#"{{"type":"message","id":7,"clientMessageId":"{cid}","senderId":"me","receiverId":"bob","content":"x"}}"#
        );
        let frame: Frame = serde_json::from_str(&raw).unwrap();
        match frame {
            Frame::Message {
                id,
                client_message_id,
                ..
            } => {
                assert_eq!(id, Some(ServerMessageId::new(7)));
                assert_eq!(client_message_id, Some(cid));
            }
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[test]
    fn error_frame_without_code() {
        let raw = r#"{"type":"error","message":"boom"}"#;
        let frame: Frame = serde_json::from_str(raw).unwrap();
        assert_eq!(
            frame,
            Frame::Error {
                message: "boom".into(),
                error_code: None,
            }
        );
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let raw = r#"{"type":"typing-indicator","senderId":"a"}"#;
        assert!(serde_json::from_str::<Frame>(raw).is_err());
    }

    #[test]
    fn kind_matches_wire_tag() {
        let frame = Frame::Join {
            sender_id: UserId::new("me"),
        };
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], frame.kind());
    }
}
