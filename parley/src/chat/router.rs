//! Inbound event routing.
//!
//! [`Router::apply`] is a deterministic reducer: given the current
//! [`ChatState`] and one [`ServerEvent`] it classifies the event into a
//! direct, group or broadcast conversation, reconciles echoes of our own
//! messages by correlation id, appends genuinely new messages, bumps unread
//! counters and raises notifications. Nothing here touches the network; the
//! session performs any follow-up (receipts, name lookups) from the returned
//! [`Routed`] value.

use parley_proto::event::{
    ChatPayload, ClientEvent, GroupReceiptPayload, RawRoom, ReceiptPayload, ServerEvent,
};
use parley_proto::ids::{CorrelationId, RoomId, UserId};

use super::model::{ConversationId, DeliveryState, Message};
use super::state::ChatState;
use crate::notify::{self, Notification, Notifier};

/// Default number of characters shown in a notification preview.
const DEFAULT_PREVIEW_CHARS: usize = 80;

/// Why an inbound event was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// The room field is present but not a non-negative integer.
    #[error("non-numeric room id {0:?}")]
    NonNumericRoom(String),
    /// The event carries both a direct recipient and a room.
    #[error("event carries both recipient_id and room")]
    AmbiguousTarget,
    /// The event carries neither a recipient nor a room.
    #[error("event carries neither recipient_id nor room")]
    MissingTarget,
    /// The correlation id is empty.
    #[error("missing correlation id")]
    MissingCorrelationId,
    /// A direct message that involves neither party as the local user.
    #[error("direct message between {sender} and {recipient} is not addressed to us")]
    NotAddressedToUs {
        /// Claimed sender.
        sender: UserId,
        /// Claimed recipient.
        recipient: UserId,
    },
}

/// A notification that is waiting for the sender's display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingNotification {
    /// The user whose name must be resolved.
    pub sender_id: UserId,
    /// The notification, with the raw sender id as a placeholder name.
    pub notification: Notification,
}

/// What happened to the notification for an appended message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// No notification (own message or focused conversation).
    Skipped,
    /// Notification dispatched with a cached name.
    Fired(Notification),
    /// Dispatch deferred until the sender name is looked up.
    NeedsName(PendingNotification),
}

/// Result of routing one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// A new message was appended.
    Appended {
        /// Owning conversation.
        conversation: ConversationId,
        /// The message's correlation id.
        correlation_id: CorrelationId,
        /// Receipt to send back, for inbound direct/group messages from others.
        receipt: Option<ClientEvent>,
        /// Notification outcome.
        notify: NotifyOutcome,
    },
    /// The echo of one of our pending messages; it is now delivered.
    Echo {
        /// Owning conversation.
        conversation: ConversationId,
        /// The acknowledged correlation id.
        correlation_id: CorrelationId,
    },
    /// A receipt event flipped one of our messages to delivered.
    Acknowledged {
        /// Owning conversation.
        conversation: ConversationId,
        /// The acknowledged correlation id.
        correlation_id: CorrelationId,
    },
    /// The event was already reflected in state; nothing changed.
    Duplicate {
        /// The correlation id that was already known.
        correlation_id: CorrelationId,
    },
    /// The server reported an error.
    ServerError(String),
    /// Malformed event, dropped without touching state.
    Dropped(RouteError),
}

/// Where an inbound chat payload belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Direct,
    Group(RoomId),
    Broadcast,
}

/// Applies inbound events to a [`ChatState`].
pub struct Router<N: Notifier> {
    state: ChatState,
    notifier: N,
    preview_chars: usize,
}

impl<N: Notifier> Router<N> {
    /// Creates a router over `state`, notifying through `notifier`.
    pub const fn new(state: ChatState, notifier: N) -> Self {
        Self {
            state,
            notifier,
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }

    /// Overrides the notification preview length.
    #[must_use]
    pub const fn with_preview_chars(mut self, chars: usize) -> Self {
        self.preview_chars = chars;
        self
    }

    /// Read access to the chat state.
    pub const fn state(&self) -> &ChatState {
        &self.state
    }

    /// Mutable access for the outbox and UI commands.
    pub const fn state_mut(&mut self) -> &mut ChatState {
        &mut self.state
    }

    /// Routes one inbound event.
    pub fn apply(&mut self, event: ServerEvent) -> Routed {
        let routed = match event {
            ServerEvent::PrivateMessage(payload) | ServerEvent::GroupMessage(payload) => {
                self.route_message(&payload, false)
            }
            ServerEvent::GeneralMessage(payload) => self.route_message(&payload, true),
            ServerEvent::MessageReceived(receipt) => self.route_receipt(&receipt),
            ServerEvent::GroupMessageReceived(receipt) => self.route_group_receipt(&receipt),
            ServerEvent::Error(err) => {
                tracing::warn!(reason = %err.reason, "server reported an error");
                Routed::ServerError(err.reason)
            }
        };
        if let Routed::Dropped(reason) = &routed {
            tracing::warn!(reason = %reason, "dropping malformed inbound event");
        }
        routed
    }

    /// Finishes a deferred notification once the sender name is known.
    ///
    /// A resolved name is cached for later notifications. With `None` the
    /// raw sender id is shown.
    pub fn complete_notification(
        &mut self,
        pending: PendingNotification,
        name: Option<String>,
    ) -> Notification {
        let mut notification = pending.notification;
        if let Some(name) = name {
            self.state.cache_name(pending.sender_id, name.clone());
            notification.sender_name = name;
        }
        notify::dispatch(&self.notifier, &notification);
        notification
    }

    fn route_message(&mut self, payload: &ChatPayload, general: bool) -> Routed {
        let channel = match classify(payload, general) {
            Ok(channel) => channel,
            Err(reason) => return Routed::Dropped(reason),
        };
        let local = self.state.local().clone();
        let own = payload.sender_id == local;

        let (conversation, room) = match channel {
            Channel::Broadcast => (ConversationId::Broadcast, None),
            Channel::Group(room) => (ConversationId::Group(room), Some(room)),
            Channel::Direct => {
                // Validated by `classify`.
                let Some(recipient) = payload.recipient_id.clone() else {
                    return Routed::Dropped(RouteError::MissingTarget);
                };
                let peer = if own {
                    recipient
                } else if recipient == local {
                    payload.sender_id.clone()
                } else {
                    return Routed::Dropped(RouteError::NotAddressedToUs {
                        sender: payload.sender_id.clone(),
                        recipient,
                    });
                };
                (ConversationId::Direct(peer), None)
            }
        };

        let correlation_id = payload.correlation_id.clone();
        if let Some(existing) = self
            .state
            .conversation(&conversation)
            .and_then(|c| c.find(&correlation_id))
        {
            let echo = own && existing.delivery == DeliveryState::Pending;
            if echo {
                self.state.mark_delivered(&correlation_id, Some(&conversation));
                tracing::debug!(
                    correlation_id = %correlation_id,
                    conversation = %conversation,
                    "echo matched pending message"
                );
                return Routed::Echo {
                    conversation,
                    correlation_id,
                };
            }
            tracing::debug!(correlation_id = %correlation_id, "duplicate event ignored");
            return Routed::Duplicate { correlation_id };
        }

        // Own messages we have no local copy of (another tab or device) are
        // already on the server, so they count as delivered.
        let message = Message::from_payload(payload, room, DeliveryState::Delivered);
        let preview = message.body.preview(self.preview_chars);
        self.state.append(&conversation, message);

        let receipt = if own {
            None
        } else {
            receipt_for(payload, channel, &local)
        };

        let notify = if own || self.state.is_focused(&conversation) {
            NotifyOutcome::Skipped
        } else {
            self.state.bump_unread(&conversation);
            self.notify(conversation.clone(), &payload.sender_id, preview)
        };

        Routed::Appended {
            conversation,
            correlation_id,
            receipt,
            notify,
        }
    }

    fn notify(
        &self,
        conversation: ConversationId,
        sender: &UserId,
        preview: String,
    ) -> NotifyOutcome {
        match self.state.name_of(sender) {
            Some(name) => {
                let notification = Notification {
                    conversation,
                    sender_name: name.to_string(),
                    preview,
                };
                notify::dispatch(&self.notifier, &notification);
                NotifyOutcome::Fired(notification)
            }
            None => NotifyOutcome::NeedsName(PendingNotification {
                sender_id: sender.clone(),
                notification: Notification {
                    conversation,
                    sender_name: sender.to_string(),
                    preview,
                },
            }),
        }
    }

    fn route_receipt(&mut self, receipt: &ReceiptPayload) -> Routed {
        let hint = ConversationId::Direct(receipt.recipient_id.clone());
        self.acknowledge(&receipt.message_id, &hint)
    }

    fn route_group_receipt(&mut self, receipt: &GroupReceiptPayload) -> Routed {
        let Some(room) = receipt.room.parse() else {
            return Routed::Dropped(RouteError::NonNumericRoom(raw_text(&receipt.room)));
        };
        self.acknowledge(&receipt.message_id, &ConversationId::Group(room))
    }

    fn acknowledge(&mut self, id: &CorrelationId, hint: &ConversationId) -> Routed {
        if id.is_empty() {
            return Routed::Dropped(RouteError::MissingCorrelationId);
        }
        match self.state.mark_delivered(id, Some(hint)) {
            Some(conversation) => Routed::Acknowledged {
                conversation,
                correlation_id: id.clone(),
            },
            None => Routed::Duplicate {
                correlation_id: id.clone(),
            },
        }
    }
}

/// Determines the channel from the shape of the payload.
fn classify(payload: &ChatPayload, general: bool) -> Result<Channel, RouteError> {
    if payload.correlation_id.is_empty() {
        return Err(RouteError::MissingCorrelationId);
    }
    match (&payload.recipient_id, &payload.room) {
        (Some(_), Some(_)) => Err(RouteError::AmbiguousTarget),
        _ if general => Ok(Channel::Broadcast),
        (None, Some(raw)) => raw
            .parse()
            .map(Channel::Group)
            .ok_or_else(|| RouteError::NonNumericRoom(raw_text(raw))),
        (Some(_), None) => Ok(Channel::Direct),
        (None, None) => Err(RouteError::MissingTarget),
    }
}

fn raw_text(room: &RawRoom) -> String {
    match room {
        RawRoom::Number(n) => n.to_string(),
        RawRoom::Text(s) => s.clone(),
    }
}

/// Builds the receipt an inbound message from someone else warrants.
fn receipt_for(payload: &ChatPayload, channel: Channel, local: &UserId) -> Option<ClientEvent> {
    match channel {
        Channel::Direct => Some(ClientEvent::MessageReceived(ReceiptPayload {
            message_id: payload.correlation_id.clone(),
            recipient_id: local.clone(),
            sender_id: payload.sender_id.clone(),
        })),
        Channel::Group(room) => Some(ClientEvent::GroupMessageReceived(GroupReceiptPayload {
            message_id: payload.correlation_id.clone(),
            room: room.into(),
            sender_id: payload.sender_id.clone(),
        })),
        Channel::Broadcast => None,
    }
}
