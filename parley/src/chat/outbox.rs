//! Outbound delivery tracking.
//!
//! Every outbound message gets a correlation id, is appended to its
//! conversation as `Pending` before any network I/O, and stays in the
//! pending queue until the server acknowledges it (echo or receipt).
//!
//! Retransmission:
//! - after every (re)connection the whole queue is replayed in FIFO order;
//! - a new message never overtakes an older one that is still waiting for
//!   that replay;
//! - an entry unacknowledged for `ack_timeout` is retransmitted, at most
//!   `ack_retries` times per connection. Past that it stays queued and an
//!   [`AckOverdue`] notice is raised once until the next reconnection.
//!   While the link is down nothing is reported; the replay covers it.
//!
//! Nothing is ever dropped from the queue except by acknowledgment.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parley_proto::event::ClientEvent;
use parley_proto::ids::{CorrelationId, Timestamp};

use super::model::{Attachment, ConversationId, DeliveryState, Message, MessageBody};
use super::state::ChatState;
use crate::connection::{Link, LinkError};

/// Ack timing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxConfig {
    /// How long to wait for an ack before retransmitting.
    pub ack_timeout: Duration,
    /// Retransmissions per connection before raising [`AckOverdue`].
    pub ack_retries: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(10),
            ack_retries: 3,
        }
    }
}

/// A message the user wants to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    /// Target conversation.
    pub to: ConversationId,
    /// Body.
    pub body: MessageBody,
    /// Optional attachment.
    pub attachment: Option<Attachment>,
}

/// Raised when a message exhausted its retransmissions for this connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckOverdue {
    /// The stuck message.
    pub correlation_id: CorrelationId,
    /// Its conversation.
    pub conversation: ConversationId,
}

#[derive(Debug, Clone)]
struct Entry {
    conversation: ConversationId,
    message: Message,
    /// When this entry last went out on a live connection.
    last_sent: Option<Instant>,
    /// Retransmissions on the current connection.
    retries: u32,
    overdue_reported: bool,
}

/// FIFO queue of unacknowledged outbound messages.
#[derive(Debug, Default)]
pub struct Outbox {
    config: OutboxConfig,
    queue: VecDeque<Entry>,
    /// Set between a disconnect and the replay on the next connection.
    replay_pending: bool,
}

impl Outbox {
    /// Creates an empty outbox.
    #[must_use]
    pub const fn new(config: OutboxConfig) -> Self {
        Self {
            config,
            queue: VecDeque::new(),
            replay_pending: false,
        }
    }

    /// Sends a draft.
    ///
    /// The message is appended to `state` as `Pending` first, then queued,
    /// then transmitted if the link is up and nothing older is still waiting
    /// for replay. A disconnected link is not an error: the entry waits for
    /// the next replay.
    pub fn send<L: Link + ?Sized>(
        &mut self,
        state: &mut ChatState,
        link: &L,
        draft: Draft,
    ) -> CorrelationId {
        let correlation_id = CorrelationId::generate();
        let (recipient_id, room) = match &draft.to {
            ConversationId::Direct(user) => (Some(user.clone()), None),
            ConversationId::Group(room) => (None, Some(*room)),
            ConversationId::Broadcast => (None, None),
        };
        let message = Message {
            correlation_id: correlation_id.clone(),
            sender_id: state.local().clone(),
            recipient_id,
            room,
            body: draft.body,
            attachment: draft.attachment,
            timestamp: Timestamp::now(),
            delivery: DeliveryState::Pending,
        };

        state.append(&draft.to, message.clone());
        let mut entry = Entry {
            conversation: draft.to,
            message,
            last_sent: None,
            retries: 0,
            overdue_reported: false,
        };
        // Older entries waiting for replay go out first.
        if self.awaiting_replay() {
            tracing::debug!(
                correlation_id = %entry.message.correlation_id,
                "queued behind messages awaiting replay"
            );
        } else {
            transmit(link, &mut entry, Instant::now());
        }
        self.queue.push_back(entry);
        correlation_id
    }

    /// Replays the whole queue in FIFO order on a fresh connection.
    ///
    /// Resets every retransmission budget. Returns the number of entries
    /// handed to the link.
    pub fn on_reconnect<L: Link + ?Sized>(&mut self, link: &L) -> usize {
        self.replay_pending = false;
        let now = Instant::now();
        let mut replayed = 0;
        for entry in &mut self.queue {
            entry.retries = 0;
            entry.overdue_reported = false;
            if transmit(link, entry, now) {
                replayed += 1;
            }
        }
        if replayed > 0 {
            tracing::info!(replayed, "replayed pending messages after reconnect");
        }
        replayed
    }

    /// Records that the connection went away.
    ///
    /// Until the next [`on_reconnect`](Self::on_reconnect), new messages are
    /// only queued, so they cannot reach a fresh connection ahead of the
    /// replay.
    pub const fn on_disconnect(&mut self) {
        self.replay_pending = true;
    }

    /// Handles an acknowledgment. Unknown ids are ignored.
    ///
    /// Returns `true` if a queued entry was removed.
    pub fn on_ack(&mut self, state: &mut ChatState, id: &CorrelationId) -> bool {
        let Some(index) = self
            .queue
            .iter()
            .position(|e| e.message.correlation_id == *id)
        else {
            return false;
        };
        if let Some(entry) = self.queue.remove(index) {
            state.mark_delivered(id, Some(&entry.conversation));
            tracing::debug!(correlation_id = %id, "message acknowledged");
        }
        true
    }

    /// Retransmits entries whose ack is overdue.
    ///
    /// Returns a notice for each entry that ran out of retransmissions on
    /// this connection, once.
    pub fn tick<L: Link + ?Sized>(&mut self, link: &L, now: Instant) -> Vec<AckOverdue> {
        let mut overdue = Vec::new();
        let connected = link.is_connected();
        for entry in &mut self.queue {
            let Some(last_sent) = entry.last_sent else {
                continue;
            };
            if now.saturating_duration_since(last_sent) < self.config.ack_timeout {
                continue;
            }
            if connected && entry.retries < self.config.ack_retries {
                entry.retries += 1;
                tracing::debug!(
                    correlation_id = %entry.message.correlation_id,
                    retry = entry.retries,
                    "ack timeout, retransmitting"
                );
                transmit(link, entry, now);
            } else if connected && !entry.overdue_reported {
                entry.overdue_reported = true;
                tracing::warn!(
                    correlation_id = %entry.message.correlation_id,
                    conversation = %entry.conversation,
                    "message still unacknowledged"
                );
                overdue.push(AckOverdue {
                    correlation_id: entry.message.correlation_id.clone(),
                    conversation: entry.conversation.clone(),
                });
            }
        }
        overdue
    }

    /// Re-enqueues pending messages restored from a snapshot.
    ///
    /// Ids already queued are skipped. Restored entries go out on the next
    /// replay.
    pub fn restore(&mut self, pending: Vec<(ConversationId, Message)>) -> usize {
        let mut restored = 0;
        for (conversation, message) in pending {
            if self.contains(&message.correlation_id) {
                continue;
            }
            self.queue.push_back(Entry {
                conversation,
                message,
                last_sent: None,
                retries: 0,
                overdue_reported: false,
            });
            restored += 1;
        }
        restored
    }

    /// Whether some entry has not gone out on the current connection yet.
    fn awaiting_replay(&self) -> bool {
        self.replay_pending || self.queue.iter().any(|e| e.last_sent.is_none())
    }

    /// Whether `id` is still waiting for an ack.
    #[must_use]
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.queue.iter().any(|e| e.message.correlation_id == *id)
    }

    /// Queued correlation ids, oldest first.
    #[must_use]
    pub fn pending_ids(&self) -> Vec<CorrelationId> {
        self.queue
            .iter()
            .map(|e| e.message.correlation_id.clone())
            .collect()
    }

    /// Number of unacknowledged messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is awaiting acknowledgment.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// The wire event carrying `message` to `conversation`.
#[must_use]
pub fn wire_event(conversation: &ConversationId, message: &Message) -> ClientEvent {
    let payload = message.to_payload();
    match conversation {
        ConversationId::Direct(_) => ClientEvent::PrivateMessage(payload),
        ConversationId::Group(_) => ClientEvent::GroupMessage(payload),
        ConversationId::Broadcast => ClientEvent::GeneralMessage(payload),
    }
}

/// Hands one entry to the link. Returns `true` if it went out.
fn transmit<L: Link + ?Sized>(link: &L, entry: &mut Entry, now: Instant) -> bool {
    match link.send(&wire_event(&entry.conversation, &entry.message)) {
        Ok(()) => {
            entry.last_sent = Some(now);
            true
        }
        Err(LinkError::NotConnected) => {
            entry.last_sent = None;
            tracing::debug!(
                correlation_id = %entry.message.correlation_id,
                "link down, message stays pending"
            );
            false
        }
        Err(e) => {
            entry.last_sent = None;
            tracing::warn!(
                correlation_id = %entry.message.correlation_id,
                error = %e,
                "failed to transmit message"
            );
            false
        }
    }
}
