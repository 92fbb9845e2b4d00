//! In-memory chat state: the conversation list, focus and sender name cache.
//!
//! [`ChatState`] is owned by exactly one task (the session loop) and mutated
//! only by the router and the outbox, so it carries no locks.
//!
//! # Invariants
//!
//! - The conversation list is sorted by `last_message_at`, newest first, after
//!   every mutation. Ties keep their previous relative order.
//! - A correlation id appears at most once per conversation.
//! - The focused conversation never has unread messages.

use std::collections::HashMap;

use parley_proto::ids::{CorrelationId, UserId};

use super::model::{Conversation, ConversationId, DeliveryState, Message};
use crate::directory::DirectoryEntry;

/// Conversation list plus per-session UI state.
#[derive(Debug, Clone)]
pub struct ChatState {
    local: UserId,
    conversations: Vec<Conversation>,
    focused: Option<ConversationId>,
    names: HashMap<UserId, String>,
}

impl ChatState {
    /// Creates an empty state for the given local identity.
    #[must_use]
    pub fn new(local: UserId) -> Self {
        Self {
            local,
            conversations: Vec::new(),
            focused: None,
            names: HashMap::new(),
        }
    }

    /// Restores a state from persisted conversations.
    #[must_use]
    pub fn with_conversations(local: UserId, conversations: Vec<Conversation>) -> Self {
        let mut state = Self::new(local);
        state.conversations = conversations;
        state.sort();
        state
    }

    /// The local user identity.
    #[must_use]
    pub const fn local(&self) -> &UserId {
        &self.local
    }

    /// Conversations, newest activity first.
    #[must_use]
    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    /// Looks up a conversation by id.
    #[must_use]
    pub fn conversation(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == *id)
    }

    /// The focused conversation, if any.
    #[must_use]
    pub const fn focused(&self) -> Option<&ConversationId> {
        self.focused.as_ref()
    }

    /// Whether `id` is the focused conversation.
    #[must_use]
    pub fn is_focused(&self, id: &ConversationId) -> bool {
        self.focused.as_ref() == Some(id)
    }

    /// Focuses a conversation, creating it if needed, and clears its unread count.
    pub fn focus(&mut self, id: ConversationId) {
        let conversation = self.entry(&id);
        conversation.unread = 0;
        self.focused = Some(id);
        self.sort();
    }

    /// Clears the focus (e.g. the chat window was closed).
    pub fn unfocus(&mut self) {
        self.focused = None;
    }

    /// Total unread messages across all conversations.
    #[must_use]
    pub fn unread_total(&self) -> u32 {
        self.conversations.iter().map(|c| c.unread).sum()
    }

    /// Cached display name for a user.
    #[must_use]
    pub fn name_of(&self, user: &UserId) -> Option<&str> {
        self.names.get(user).map(String::as_str)
    }

    /// Stores a resolved display name and renames the matching direct
    /// conversation, if one exists.
    pub fn cache_name(&mut self, user: UserId, name: String) {
        let id = ConversationId::Direct(user.clone());
        if let Some(conversation) = self.conversations.iter_mut().find(|c| c.id == id) {
            conversation.display_name.clone_from(&name);
        }
        self.names.insert(user, name);
    }

    /// Applies a directory result: caches names and, when `create` is set,
    /// pre-populates a direct conversation for every entry.
    pub fn apply_directory(&mut self, entries: &[DirectoryEntry], create: bool) {
        for entry in entries {
            if entry.id == self.local {
                continue;
            }
            if create {
                self.entry(&ConversationId::Direct(entry.id.clone()));
            }
            self.cache_name(entry.id.clone(), entry.nombre.clone());
        }
        self.sort();
    }

    /// Appends a message to a conversation, creating the conversation if needed.
    ///
    /// Returns `false` (and changes nothing) if the conversation already holds
    /// a message with the same correlation id.
    pub fn append(&mut self, id: &ConversationId, message: Message) -> bool {
        let conversation = self.entry(id);
        if conversation.find(&message.correlation_id).is_some() {
            return false;
        }
        conversation.push(message);
        self.sort();
        true
    }

    /// Increments the unread counter of a conversation.
    pub(crate) fn bump_unread(&mut self, id: &ConversationId) {
        self.entry(id).unread += 1;
    }

    /// Marks an own pending message delivered.
    ///
    /// Searches `hint` first, then every conversation. Returns the owning
    /// conversation if a `Pending -> Delivered` transition happened.
    pub fn mark_delivered(
        &mut self,
        id: &CorrelationId,
        hint: Option<&ConversationId>,
    ) -> Option<ConversationId> {
        let local = self.local.clone();
        let flip = |conversation: &mut Conversation| {
            let message = conversation.find_mut(id)?;
            if message.delivery == DeliveryState::Pending && message.is_own(&local) {
                message.delivery = DeliveryState::Delivered;
                Some(conversation.id.clone())
            } else {
                None
            }
        };

        if let Some(hint) = hint
            && let Some(conversation) = self.conversations.iter_mut().find(|c| c.id == *hint)
            && let Some(found) = flip(conversation)
        {
            return Some(found);
        }
        self.conversations.iter_mut().find_map(flip)
    }

    /// Merges fetched history into a conversation.
    ///
    /// Messages whose correlation id is already present are skipped. The rest
    /// are placed before the existing messages, in the order given, so live
    /// arrival order is untouched. Returns the number of messages added.
    pub fn merge_history(&mut self, id: &ConversationId, history: Vec<Message>) -> usize {
        let conversation = self.entry(id);
        let mut missing: Vec<Message> = Vec::with_capacity(history.len());
        for message in history {
            let known = conversation.find(&message.correlation_id).is_some()
                || missing.iter().any(|m| m.correlation_id == message.correlation_id);
            if !known {
                missing.push(message);
            }
        }
        let added = missing.len();
        if added > 0 {
            if let Some(newest) = missing.iter().map(|m| m.timestamp).max() {
                conversation.last_message_at = conversation.last_message_at.max(newest);
            }
            missing.append(&mut conversation.messages);
            conversation.messages = missing;
            self.sort();
        }
        added
    }

    /// Own messages still awaiting acknowledgment, oldest first.
    #[must_use]
    pub fn pending_own(&self) -> Vec<(ConversationId, Message)> {
        let mut pending = Vec::new();
        for conversation in &self.conversations {
            for message in &conversation.messages {
                if message.delivery == DeliveryState::Pending && message.is_own(&self.local) {
                    pending.push((conversation.id.clone(), message.clone()));
                }
            }
        }
        pending.sort_by_key(|(_, m): &(ConversationId, Message)| m.timestamp);
        pending
    }

    /// Returns the conversation, inserting an empty one if missing.
    fn entry(&mut self, id: &ConversationId) -> &mut Conversation {
        let index = match self.conversations.iter().position(|c| c.id == *id) {
            Some(index) => index,
            None => {
                let mut conversation = Conversation::new(id.clone());
                if let ConversationId::Direct(user) = id
                    && let Some(name) = self.names.get(user)
                {
                    conversation.display_name.clone_from(name);
                }
                self.conversations.push(conversation);
                self.conversations.len() - 1
            }
        };
        &mut self.conversations[index]
    }

    fn sort(&mut self) {
        self.conversations
            .sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
    }
}
