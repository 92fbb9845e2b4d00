//! Named real-time events exchanged between chat clients and the server.
//!
//! Every frame is a JSON object `{"event": "<name>", "data": {...}}`. Field
//! names follow the established server contract (`correlationId`,
//! `sender_id`, `fileName`, ...), so they are renamed explicitly rather than
//! derived from Rust naming.
//!
//! Identifiers arriving from the server may be JSON numbers or strings; both
//! are accepted. A room that is present but not numeric is kept as
//! [`RawRoom::Text`] so the router can reject the event instead of failing
//! the whole frame.

use serde::{Deserialize, Deserializer, Serialize};

use crate::ids::{CorrelationId, RoomId, Timestamp, UserId};

/// Body text the server uses for messages that only carry an attachment.
pub const ATTACHMENT_ONLY_BODY: &str = "[archivo]";

/// Room identifier exactly as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawRoom {
    /// A JSON number.
    Number(i64),
    /// A JSON string (numeric or not).
    Text(String),
}

impl RawRoom {
    /// Interprets this value as a numeric [`RoomId`].
    ///
    /// Returns `None` for negative numbers and non-numeric strings.
    #[must_use]
    pub fn parse(&self) -> Option<RoomId> {
        match self {
            Self::Number(n) => u64::try_from(*n).ok().map(RoomId::new),
            Self::Text(s) => s.parse().ok(),
        }
    }
}

impl From<RoomId> for RawRoom {
    fn from(room: RoomId) -> Self {
        Self::Number(i64::try_from(room.get()).unwrap_or(i64::MAX))
    }
}

/// `register` payload: announces the local identity on (re)connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPayload {
    /// The user registering this socket.
    #[serde(deserialize_with = "wire_id")]
    pub user_id: UserId,
}

/// Chat message payload shared by the private, group and general events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    /// Client-generated id echoed back by the server.
    #[serde(rename = "correlationId")]
    pub correlation_id: CorrelationId,
    /// Author of the message.
    #[serde(deserialize_with = "wire_id")]
    pub sender_id: UserId,
    /// Direct recipient; absent for group and broadcast messages.
    #[serde(
        default,
        deserialize_with = "wire_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub recipient_id: Option<UserId>,
    /// Group room; absent for direct and broadcast messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RawRoom>,
    /// Message text, or [`ATTACHMENT_ONLY_BODY`].
    pub message: String,
    /// Base64-encoded attachment bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Attachment file name.
    #[serde(default, rename = "fileName", skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Creation time in milliseconds since the UNIX epoch. Receivers stamp
    /// their own clock when it is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

/// `message_received` payload: delivery receipt for a direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptPayload {
    /// Correlation id of the acknowledged message.
    pub message_id: CorrelationId,
    /// The user that received the message.
    #[serde(deserialize_with = "wire_id")]
    pub recipient_id: UserId,
    /// The original author, to whom the receipt is routed.
    #[serde(deserialize_with = "wire_id")]
    pub sender_id: UserId,
}

/// `group_message_received` payload: delivery receipt for a group message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupReceiptPayload {
    /// Correlation id of the acknowledged message.
    pub message_id: CorrelationId,
    /// The room the message was posted to.
    pub room: RawRoom,
    /// The original author, to whom the receipt is routed.
    #[serde(deserialize_with = "wire_id")]
    pub sender_id: UserId,
}

/// `error` payload sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable description.
    pub reason: String,
}

/// Events a client emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Announce the local identity. Sent first on every (re)connection.
    Register(RegisterPayload),
    /// Direct message to one user.
    PrivateMessage(ChatPayload),
    /// Message to a numeric group room.
    GroupMessage(ChatPayload),
    /// Message to the broadcast channel.
    GeneralMessage(ChatPayload),
    /// Receipt for an inbound direct message.
    MessageReceived(ReceiptPayload),
    /// Receipt for an inbound group message.
    GroupMessageReceived(GroupReceiptPayload),
}

/// Events a server emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Direct message (relayed, or echoed back to its author).
    PrivateMessage(ChatPayload),
    /// Group message (relayed, or echoed back to its author).
    GroupMessage(ChatPayload),
    /// Broadcast message.
    GeneralMessage(ChatPayload),
    /// Receipt for a direct message this client sent.
    MessageReceived(ReceiptPayload),
    /// Receipt for a group message this client sent.
    GroupMessageReceived(GroupReceiptPayload),
    /// Server-side error report.
    Error(ErrorPayload),
}

impl ServerEvent {
    /// Wire name of this event, for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PrivateMessage(_) => "private_message",
            Self::GroupMessage(_) => "group_message",
            Self::GeneralMessage(_) => "general_message",
            Self::MessageReceived(_) => "message_received",
            Self::GroupMessageReceived(_) => "group_message_received",
            Self::Error(_) => "error",
        }
    }
}

/// Accepts a user id encoded as a JSON string or number.
///
/// Public so other JSON surfaces carrying user ids (directory listings)
/// can apply the same tolerance.
///
/// # Errors
///
/// Fails if the value is neither a string nor an integer.
pub fn wire_id<'de, D>(deserializer: D) -> Result<UserId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => UserId::new(s),
        Raw::Number(n) => UserId::new(n.to_string()),
    })
}

fn wire_opt_id<'de, D>(deserializer: D) -> Result<Option<UserId>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "wire_id")] UserId);

    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(id)| id))
}
