//! Client-side conversation and message model.
//!
//! These are the types the router and outbox mutate and the store persists.
//! Wire payloads are converted into them at the edge ([`Message::from_payload`],
//! [`Message::to_payload`]).

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use parley_proto::event::{ATTACHMENT_ONLY_BODY, ChatPayload, RawRoom};
use parley_proto::ids::{CorrelationId, RoomId, Timestamp, UserId};

/// String id of the broadcast conversation.
pub const BROADCAST_CONVERSATION: &str = "grupo_general";

/// Prefix of group conversation ids.
const GROUP_PREFIX: &str = "grupo_";

/// One addressable chat destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationId {
    /// Direct conversation with a peer, keyed by the peer's id.
    Direct(UserId),
    /// Group conversation keyed by room.
    Group(RoomId),
    /// The single well-known broadcast channel.
    Broadcast,
}

impl ConversationId {
    /// The kind of conversation this id addresses.
    #[must_use]
    pub const fn kind(&self) -> ConversationKind {
        match self {
            Self::Direct(_) => ConversationKind::Direct,
            Self::Group(_) => ConversationKind::Group,
            Self::Broadcast => ConversationKind::Broadcast,
        }
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(user) => write!(f, "{user}"),
            Self::Group(room) => write!(f, "{GROUP_PREFIX}{room}"),
            Self::Broadcast => f.write_str(BROADCAST_CONVERSATION),
        }
    }
}

/// Error returned when a conversation id string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid conversation id: {0:?}")]
pub struct ParseConversationError(String);

impl FromStr for ConversationId {
    type Err = ParseConversationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == BROADCAST_CONVERSATION {
            return Ok(Self::Broadcast);
        }
        if let Some(room) = s.strip_prefix(GROUP_PREFIX) {
            return room
                .parse()
                .map(Self::Group)
                .map_err(|_| ParseConversationError(s.to_string()));
        }
        if s.is_empty() {
            return Err(ParseConversationError(s.to_string()));
        }
        Ok(Self::Direct(UserId::new(s)))
    }
}

/// What kind of destination a conversation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationKind {
    /// One-to-one.
    Direct,
    /// Numeric room.
    Group,
    /// Everyone.
    Broadcast,
}

/// Delivery lifecycle of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Awaiting server acknowledgment.
    Pending,
    /// Acknowledged by the server (echo or receipt).
    Delivered,
}

/// Message text, or the marker for attachment-only messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Plain text.
    Text(String),
    /// No text, only an attachment.
    AttachmentOnly,
}

impl MessageBody {
    /// Interprets a wire body, recognising the attachment-only sentinel.
    #[must_use]
    pub fn from_wire(text: &str) -> Self {
        if text == ATTACHMENT_ONLY_BODY {
            Self::AttachmentOnly
        } else {
            Self::Text(text.to_string())
        }
    }

    /// The body as sent on the wire.
    #[must_use]
    pub fn to_wire(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::AttachmentOnly => ATTACHMENT_ONLY_BODY.to_string(),
        }
    }

    /// A short preview for notifications.
    #[must_use]
    pub fn preview(&self, max_chars: usize) -> String {
        match self {
            Self::Text(text) => text.chars().take(max_chars).collect(),
            Self::AttachmentOnly => ATTACHMENT_ONLY_BODY.to_string(),
        }
    }
}

/// A binary attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Original file name.
    pub file_name: String,
    /// Raw file contents.
    pub bytes: Vec<u8>,
}

/// A single chat message held in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Client-generated id used for echo and ack matching.
    pub correlation_id: CorrelationId,
    /// Author.
    pub sender_id: UserId,
    /// Direct recipient, if any.
    pub recipient_id: Option<UserId>,
    /// Group room, if any.
    pub room: Option<RoomId>,
    /// Text body.
    pub body: MessageBody,
    /// Optional attachment.
    pub attachment: Option<Attachment>,
    /// Creation time.
    pub timestamp: Timestamp,
    /// Delivery state. Only ever moves `Pending -> Delivered`.
    pub delivery: DeliveryState,
}

impl Message {
    /// Whether `local` authored this message.
    #[must_use]
    pub fn is_own(&self, local: &UserId) -> bool {
        self.sender_id == *local
    }

    /// Builds a message from a validated wire payload.
    ///
    /// Attachments that are not valid base64 are dropped with a warning; the
    /// message itself is kept. A payload without a timestamp is stamped with
    /// the local clock.
    #[must_use]
    pub fn from_payload(payload: &ChatPayload, room: Option<RoomId>, delivery: DeliveryState) -> Self {
        let attachment = match (&payload.file, &payload.file_name) {
            (Some(data), name) => match STANDARD.decode(data) {
                Ok(bytes) => Some(Attachment {
                    file_name: name.clone().unwrap_or_else(|| "adjunto".to_string()),
                    bytes,
                }),
                Err(e) => {
                    tracing::warn!(
                        correlation_id = %payload.correlation_id,
                        error = %e,
                        "attachment is not valid base64, dropping it"
                    );
                    None
                }
            },
            (None, _) => None,
        };

        Self {
            correlation_id: payload.correlation_id.clone(),
            sender_id: payload.sender_id.clone(),
            recipient_id: payload.recipient_id.clone(),
            room,
            body: MessageBody::from_wire(&payload.message),
            attachment,
            timestamp: payload.timestamp.unwrap_or_else(Timestamp::now),
            delivery,
        }
    }

    /// Converts this message to its wire payload.
    #[must_use]
    pub fn to_payload(&self) -> ChatPayload {
        ChatPayload {
            correlation_id: self.correlation_id.clone(),
            sender_id: self.sender_id.clone(),
            recipient_id: self.recipient_id.clone(),
            room: self.room.map(RawRoom::from),
            message: self.body.to_wire(),
            file: self.attachment.as_ref().map(|a| STANDARD.encode(&a.bytes)),
            file_name: self.attachment.as_ref().map(|a| a.file_name.clone()),
            timestamp: Some(self.timestamp),
        }
    }
}

/// A conversation and its message list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Stable id.
    pub id: ConversationId,
    /// Name shown to the user.
    pub display_name: String,
    /// Kind of destination (always consistent with `id`).
    pub kind: ConversationKind,
    /// Time of the most recent message; drives list ordering.
    pub last_message_at: Timestamp,
    /// Unread inbound messages since the conversation was last focused.
    pub unread: u32,
    /// Messages in processing order.
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Creates an empty conversation with a default display name.
    #[must_use]
    pub fn new(id: ConversationId) -> Self {
        let display_name = match &id {
            ConversationId::Direct(user) => user.to_string(),
            ConversationId::Group(room) => format!("Grupo {room}"),
            ConversationId::Broadcast => "General".to_string(),
        };
        Self {
            kind: id.kind(),
            id,
            display_name,
            last_message_at: Timestamp::default(),
            unread: 0,
            messages: Vec::new(),
        }
    }

    /// Finds a message by correlation id anywhere in the list.
    #[must_use]
    pub fn find(&self, id: &CorrelationId) -> Option<&Message> {
        self.messages.iter().find(|m| m.correlation_id == *id)
    }

    /// Mutable variant of [`find`](Self::find).
    pub fn find_mut(&mut self, id: &CorrelationId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.correlation_id == *id)
    }

    /// Appends a message and advances `last_message_at`.
    pub fn push(&mut self, message: Message) {
        self.last_message_at = self.last_message_at.max(message.timestamp);
        self.messages.push(message);
    }
}
