//! Chat session: the single task that owns chat state.
//!
//! [`spawn`] starts one tokio task that owns the [`Router`] (and through it
//! the [`ChatState`]), the [`Outbox`] and the connection [`Link`]. It
//! multiplexes four inputs with `select!`:
//!
//! ```text
//! SessionCommand ──┐
//! ConnectionEvent ─┼──► session task ──► SessionEvent
//! collaborator  ───┤        │
//! tick ────────────┘        └──► Link / Directory / store
//! ```
//!
//! Directory calls run in their own tasks and report back through an
//! internal channel, so slow HTTP never blocks message processing. Late
//! results only touch the name cache or merge history.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use parley_proto::event::{ChatPayload, RawRoom};
use parley_proto::ids::{CorrelationId, Timestamp, UserId};

use crate::chat::model::{Attachment, ConversationId, DeliveryState, Message, MessageBody};
use crate::chat::outbox::{Draft, Outbox, OutboxConfig};
use crate::chat::router::{NotifyOutcome, PendingNotification, Routed, Router};
use crate::chat::state::ChatState;
use crate::chat::store::{ConversationStore, ResilientStore};
use crate::connection::{ConnectionEvent, Link};
use crate::directory::{Directory, DirectoryEntry, DirectoryError};
use crate::notify::{Notification, Notifier};

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Local identity.
    pub local: UserId,
    /// Ack timing.
    pub outbox: OutboxConfig,
    /// How often ack timeouts and dirty state are checked.
    pub tick_interval: Duration,
    /// Characters shown in notification previews.
    pub preview_chars: usize,
    /// Fetch the full directory at startup to pre-populate conversations.
    pub seed_directory: bool,
    /// Capacity of the command channel.
    pub command_buffer: usize,
}

impl SessionConfig {
    /// Defaults for `local`.
    #[must_use]
    pub fn new(local: UserId) -> Self {
        Self {
            local,
            outbox: OutboxConfig::default(),
            tick_interval: Duration::from_secs(1),
            preview_chars: 80,
            seed_directory: true,
            command_buffer: 64,
        }
    }
}

/// Requests from the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Send a message. An empty body with an attachment is sent as
    /// attachment-only.
    Send {
        /// Target conversation.
        to: ConversationId,
        /// Text.
        body: String,
        /// Optional attachment.
        attachment: Option<Attachment>,
    },
    /// Open a conversation; clears its unread count.
    Focus(ConversationId),
    /// Close the open conversation.
    Unfocus,
    /// Search the user directory.
    SearchDirectory(String),
    /// Fetch server-side history for a conversation.
    LoadHistory(ConversationId),
    /// Persist and stop.
    Shutdown,
}

/// Connection state as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Online.
    Connected {
        /// Whether this is a reconnection.
        reconnected: bool,
    },
    /// Connection lost.
    Disconnected {
        /// Human-readable reason.
        reason: String,
    },
    /// Waiting to retry.
    Reconnecting {
        /// 1-based attempt.
        attempt: u32,
        /// Attempt budget.
        max_attempts: u32,
    },
    /// Gave up reconnecting.
    Offline,
}

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    /// Conversation id.
    pub id: ConversationId,
    /// Display name.
    pub display_name: String,
    /// Unread count.
    pub unread: u32,
    /// Time of the latest message.
    pub last_message_at: Timestamp,
    /// Preview of the latest message.
    pub preview: Option<String>,
}

/// Updates for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Connection state changed.
    Connection(ConnectionStatus),
    /// A message was added to a conversation (inbound or our own send).
    MessageAppended {
        /// Owning conversation.
        conversation: ConversationId,
        /// The message as stored.
        message: Message,
    },
    /// An own message changed delivery state.
    DeliveryChanged {
        /// Owning conversation.
        conversation: ConversationId,
        /// The message.
        correlation_id: CorrelationId,
        /// New state.
        delivery: DeliveryState,
    },
    /// A notification was raised.
    Notification(Notification),
    /// The conversation list, newest first.
    Conversations(Vec<ConversationSummary>),
    /// Directory search results.
    DirectoryResults(Vec<DirectoryEntry>),
    /// History was merged into a conversation.
    HistoryLoaded {
        /// The conversation.
        conversation: ConversationId,
        /// Messages that were not already present.
        added: usize,
    },
    /// Non-blocking problem worth showing (collaborator failure, ack overdue).
    Notice(String),
    /// Unrecoverable connection failure.
    Fatal(String),
}

/// Handle to a running session.
pub struct SessionHandle {
    /// Command input.
    pub commands: mpsc::Sender<SessionCommand>,
    /// Event output. Closes when the session ends.
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    /// The session task.
    pub task: tokio::task::JoinHandle<()>,
}

impl SessionHandle {
    /// Asks the session to stop and waits for it to persist and exit.
    pub async fn shutdown(self) {
        let _ = self.commands.send(SessionCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "session task ended abnormally");
        }
    }
}

/// Results of collaborator calls, delivered back to the session task.
enum Completion {
    Seed(Result<Vec<DirectoryEntry>, DirectoryError>),
    Search(Result<Vec<DirectoryEntry>, DirectoryError>),
    Name {
        pending: PendingNotification,
        result: Result<Vec<DirectoryEntry>, DirectoryError>,
    },
    History {
        conversation: ConversationId,
        result: Result<Vec<ChatPayload>, DirectoryError>,
    },
    Saved {
        correlation_id: CorrelationId,
        result: Result<(), DirectoryError>,
    },
}

/// Starts a session task.
///
/// `connection_events` must be the receiver paired with `link` (see
/// [`ConnectionManager::new`](crate::connection::ConnectionManager::new)).
pub fn spawn<L, S, D, N>(
    config: SessionConfig,
    link: L,
    connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    store: S,
    directory: D,
    notifier: N,
) -> SessionHandle
where
    L: Link + 'static,
    S: ConversationStore + 'static,
    D: Directory + 'static,
    N: Notifier + 'static,
{
    let (command_tx, command_rx) = mpsc::channel(config.command_buffer);
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        let (store, store_warnings) = ResilientStore::new(store, 16);
        let conversations = store.load(&config.local).await;
        let state = ChatState::with_conversations(config.local.clone(), conversations);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let mut session = Session {
            router: Router::new(state, notifier).with_preview_chars(config.preview_chars),
            outbox: Outbox::new(config.outbox),
            link,
            store,
            directory: Arc::new(directory),
            events: event_tx,
            completions: completion_tx,
            dirty: false,
            config,
        };
        session.start();
        session
            .run(command_rx, connection_events, completion_rx, store_warnings)
            .await;
    });

    SessionHandle {
        commands: command_tx,
        events: event_rx,
        task,
    }
}

struct Session<L: Link, S: ConversationStore, D: Directory, N: Notifier> {
    config: SessionConfig,
    router: Router<N>,
    outbox: Outbox,
    link: L,
    store: ResilientStore<S>,
    directory: Arc<D>,
    events: mpsc::UnboundedSender<SessionEvent>,
    completions: mpsc::UnboundedSender<Completion>,
    /// State changed since the last successful snapshot.
    dirty: bool,
}

impl<L, S, D, N> Session<L, S, D, N>
where
    L: Link + 'static,
    S: ConversationStore + 'static,
    D: Directory + 'static,
    N: Notifier + 'static,
{
    fn start(&mut self) {
        let restored = self.outbox.restore(self.router.state().pending_own());
        if restored > 0 {
            tracing::info!(restored, "re-queued pending messages from the last session");
        }
        self.emit_conversations();
        if self.config.seed_directory {
            let directory = Arc::clone(&self.directory);
            self.spawn_collaborator(async move { Completion::Seed(directory.search("").await) });
        }
        self.link.open();
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut connection: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut store_warnings: mpsc::Receiver<crate::chat::store::StoreWarning>,
    ) {
        // `interval` panics on a zero period.
        let mut tick =
            tokio::time::interval(self.config.tick_interval.max(Duration::from_millis(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = connection.recv() => self.handle_connection(event),
                Some(done) = completions.recv() => self.handle_completion(done),
                Some(warning) = store_warnings.recv() => {
                    self.emit(SessionEvent::Notice(warning.to_string()));
                }
                _ = tick.tick() => self.on_tick().await,
            }
        }

        tracing::info!(pending = self.outbox.len(), "session shutting down");
        self.link.close();
        if self.dirty {
            self.persist().await;
        }
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Send {
                to,
                body,
                attachment,
            } => self.send(to, body, attachment),
            SessionCommand::Focus(id) => {
                self.router.state_mut().focus(id);
                self.dirty = true;
                self.emit_conversations();
            }
            SessionCommand::Unfocus => self.router.state_mut().unfocus(),
            SessionCommand::SearchDirectory(query) => {
                let directory = Arc::clone(&self.directory);
                self.spawn_collaborator(async move {
                    Completion::Search(directory.search(&query).await)
                });
            }
            SessionCommand::LoadHistory(conversation) => self.load_history(conversation),
            SessionCommand::Shutdown => {}
        }
    }

    fn send(&mut self, to: ConversationId, body: String, attachment: Option<Attachment>) {
        let body = if !body.trim().is_empty() {
            MessageBody::Text(body)
        } else if attachment.is_some() {
            MessageBody::AttachmentOnly
        } else {
            self.emit(SessionEvent::Notice("nothing to send".into()));
            return;
        };

        let correlation_id = self.outbox.send(
            self.router.state_mut(),
            &self.link,
            Draft {
                to: to.clone(),
                body,
                attachment,
            },
        );
        self.dirty = true;
        let Some(message) = self.find_message(&to, &correlation_id) else {
            return;
        };
        self.emit(SessionEvent::MessageAppended {
            conversation: to.clone(),
            message: message.clone(),
        });
        self.emit_conversations();

        let payload = message.to_payload();
        let directory = Arc::clone(&self.directory);
        self.spawn_collaborator(async move {
            let result = match to {
                ConversationId::Direct(_) => directory.save_private(&payload).await,
                ConversationId::Group(_) => directory.save_group(&payload).await,
                ConversationId::Broadcast => directory.save_general(&payload).await,
            };
            Completion::Saved {
                correlation_id: payload.correlation_id,
                result,
            }
        });
    }

    fn load_history(&self, conversation: ConversationId) {
        let directory = Arc::clone(&self.directory);
        let local = self.config.local.clone();
        match conversation.clone() {
            ConversationId::Direct(peer) => self.spawn_collaborator(async move {
                Completion::History {
                    conversation,
                    result: directory.private_history(&local, &peer).await,
                }
            }),
            ConversationId::Group(room) => self.spawn_collaborator(async move {
                Completion::History {
                    conversation,
                    result: directory.group_history(room).await,
                }
            }),
            ConversationId::Broadcast => {
                self.emit(SessionEvent::Notice(
                    "the general channel has no stored history".into(),
                ));
            }
        }
    }

    fn handle_connection(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { reconnected } => {
                self.emit(SessionEvent::Connection(ConnectionStatus::Connected {
                    reconnected,
                }));
                self.outbox.on_reconnect(&self.link);
            }
            ConnectionEvent::Disconnected { reason } => {
                self.outbox.on_disconnect();
                self.emit(SessionEvent::Connection(ConnectionStatus::Disconnected {
                    reason: reason.to_string(),
                }));
            }
            ConnectionEvent::Reconnecting {
                attempt,
                max_attempts,
            } => {
                self.emit(SessionEvent::Connection(ConnectionStatus::Reconnecting {
                    attempt,
                    max_attempts,
                }));
            }
            ConnectionEvent::ReconnectFailed { attempts } => {
                self.emit(SessionEvent::Connection(ConnectionStatus::Offline));
                self.emit(SessionEvent::Fatal(format!(
                    "connection lost: gave up after {attempts} reconnection attempts; {} message(s) not sent",
                    self.outbox.len()
                )));
            }
            ConnectionEvent::Event(event) => {
                let routed = self.router.apply(event);
                self.handle_routed(routed);
            }
        }
    }

    fn handle_routed(&mut self, routed: Routed) {
        match routed {
            Routed::Appended {
                conversation,
                correlation_id,
                receipt,
                notify,
            } => {
                if let Some(receipt) = receipt
                    && let Err(e) = self.link.send(&receipt)
                {
                    tracing::debug!(error = %e, "receipt not sent");
                }
                if let Some(message) = self.find_message(&conversation, &correlation_id) {
                    self.emit(SessionEvent::MessageAppended {
                        conversation,
                        message: message.clone(),
                    });
                }
                match notify {
                    NotifyOutcome::Skipped => {}
                    NotifyOutcome::Fired(notification) => {
                        self.emit(SessionEvent::Notification(notification));
                    }
                    NotifyOutcome::NeedsName(pending) => self.lookup_name(pending),
                }
                self.dirty = true;
                self.emit_conversations();
            }
            Routed::Echo {
                conversation,
                correlation_id,
            }
            | Routed::Acknowledged {
                conversation,
                correlation_id,
            } => {
                self.outbox
                    .on_ack(self.router.state_mut(), &correlation_id);
                self.dirty = true;
                self.emit(SessionEvent::DeliveryChanged {
                    conversation,
                    correlation_id,
                    delivery: DeliveryState::Delivered,
                });
            }
            Routed::ServerError(reason) => {
                self.emit(SessionEvent::Notice(format!("server error: {reason}")));
            }
            Routed::Duplicate { .. } | Routed::Dropped(_) => {}
        }
    }

    fn lookup_name(&self, pending: PendingNotification) {
        let directory = Arc::clone(&self.directory);
        self.spawn_collaborator(async move {
            let result = directory.search(pending.sender_id.as_str()).await;
            Completion::Name { pending, result }
        });
    }

    fn handle_completion(&mut self, done: Completion) {
        match done {
            Completion::Seed(Ok(entries)) => {
                self.router.state_mut().apply_directory(&entries, true);
                self.dirty = true;
                self.emit_conversations();
            }
            Completion::Search(Ok(entries)) => {
                self.router.state_mut().apply_directory(&entries, false);
                self.emit(SessionEvent::DirectoryResults(entries));
            }
            Completion::Seed(Err(e)) | Completion::Search(Err(e)) => {
                self.emit(SessionEvent::Notice(format!("directory unavailable: {e}")));
            }
            Completion::Name { pending, result } => {
                let name = match result {
                    Ok(entries) => entries
                        .into_iter()
                        .find(|e| e.id == pending.sender_id)
                        .map(|e| e.nombre),
                    Err(e) => {
                        tracing::warn!(sender = %pending.sender_id, error = %e, "name lookup failed");
                        None
                    }
                };
                let notification = self.router.complete_notification(pending, name);
                self.dirty = true;
                self.emit(SessionEvent::Notification(notification));
                self.emit_conversations();
            }
            Completion::History {
                conversation,
                result: Ok(payloads),
            } => {
                let history: Vec<Message> = payloads
                    .iter()
                    .filter(|p| !p.correlation_id.is_empty())
                    .map(|p| {
                        let room = p.room.as_ref().and_then(RawRoom::parse);
                        Message::from_payload(p, room, DeliveryState::Delivered)
                    })
                    .collect();
                let added = self.router.state_mut().merge_history(&conversation, history);
                if added > 0 {
                    self.dirty = true;
                    self.emit_conversations();
                }
                self.emit(SessionEvent::HistoryLoaded {
                    conversation,
                    added,
                });
            }
            Completion::History {
                conversation,
                result: Err(e),
            } => {
                self.emit(SessionEvent::Notice(format!(
                    "could not load history for {conversation}: {e}"
                )));
            }
            Completion::Saved {
                correlation_id,
                result: Err(e),
            } => {
                self.emit(SessionEvent::Notice(format!(
                    "message {correlation_id} was sent but not saved to history: {e}"
                )));
            }
            Completion::Saved { result: Ok(()), .. } => {}
        }
    }

    async fn on_tick(&mut self) {
        for overdue in self.outbox.tick(&self.link, Instant::now()) {
            self.emit(SessionEvent::Notice(format!(
                "message {} to {} is still waiting for the server",
                overdue.correlation_id, overdue.conversation
            )));
        }
        if self.dirty {
            self.persist().await;
        }
    }

    async fn persist(&mut self) {
        if self
            .store
            .save(&self.config.local, self.router.state().conversations())
            .await
        {
            self.dirty = false;
        }
    }

    fn find_message(&self, conversation: &ConversationId, id: &CorrelationId) -> Option<&Message> {
        self.router
            .state()
            .conversation(conversation)
            .and_then(|c| c.find(id))
    }

    fn spawn_collaborator<F>(&self, work: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let tx = self.completions.clone();
        tokio::spawn(async move {
            let _ = tx.send(work.await);
        });
    }

    fn emit_conversations(&self) {
        let preview_chars = self.config.preview_chars;
        let summaries = self
            .router
            .state()
            .conversations()
            .iter()
            .map(|c| ConversationSummary {
                id: c.id.clone(),
                display_name: c.display_name.clone(),
                unread: c.unread,
                last_message_at: c.last_message_at,
                preview: c.messages.last().map(|m| m.body.preview(preview_chars)),
            })
            .collect();
        self.emit(SessionEvent::Conversations(summaries));
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("session event dropped, receiver gone");
        }
    }
}
