//! In-memory relay storage: offline queues, message history and the user
//! directory.
//!
//! The [`OfflineQueue`] holds per-user FIFO queues of encoded frames that
//! could not be delivered because the recipient was not connected. When a
//! user registers, its queue is drained and all stored frames are delivered.

use std::collections::{HashMap, VecDeque};

use parley_proto::event::ChatPayload;
use parley_proto::ids::RoomId;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Default maximum number of queued frames per user before FIFO eviction.
const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

/// A frame stored for later delivery to an offline user.
#[derive(Debug, Clone)]
pub struct QueuedFrame {
    /// Encoded server event.
    pub frame: String,
    /// When the frame was enqueued.
    pub queued_at: Instant,
}

/// In-memory per-user frame queue with FIFO eviction.
///
/// Each user has an independent queue capped at a configurable maximum;
/// when the cap is exceeded the oldest frame is dropped.
pub struct OfflineQueue {
    queues: RwLock<HashMap<String, VecDeque<QueuedFrame>>>,
    max_queue_size: usize,
}

impl Default for OfflineQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OfflineQueue {
    /// Creates an empty queue with the default size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_queue_size(DEFAULT_MAX_QUEUE_SIZE)
    }

    /// Creates an empty queue with a custom size limit.
    #[must_use]
    pub fn with_max_queue_size(max_queue_size: usize) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            max_queue_size,
        }
    }

    /// Enqueues a frame for `user`, returning the new queue length.
    pub async fn enqueue(&self, user: &str, frame: String) -> usize {
        let mut queues = self.queues.write().await;
        let queue = queues.entry(user.to_string()).or_default();
        queue.push_back(QueuedFrame {
            frame,
            queued_at: Instant::now(),
        });
        if queue.len() > self.max_queue_size {
            queue.pop_front();
        }
        queue.len()
    }

    /// Drains all queued frames for `user` in FIFO order.
    pub async fn drain(&self, user: &str) -> Vec<QueuedFrame> {
        let mut queues = self.queues.write().await;
        queues
            .remove(user)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default()
    }

    /// Number of frames currently queued for `user`.
    pub async fn queue_len(&self, user: &str) -> usize {
        let queues = self.queues.read().await;
        queues.get(user).map_or(0, VecDeque::len)
    }
}

/// One directory record, as served by `GET /chat/users`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// User id.
    pub id: String,
    /// Display name.
    pub nombre: String,
    /// Role label.
    pub rol: String,
}

impl UserRecord {
    /// Creates a record.
    pub fn new(id: impl Into<String>, nombre: impl Into<String>, rol: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nombre: nombre.into(),
            rol: rol.into(),
        }
    }
}

/// Known users. Registered users without a record are added with their id
/// as the display name.
#[derive(Default)]
pub struct UserDirectory {
    users: RwLock<Vec<UserRecord>>,
}

impl UserDirectory {
    /// Creates a directory seeded with `users`.
    #[must_use]
    pub fn new(users: Vec<UserRecord>) -> Self {
        Self {
            users: RwLock::new(users),
        }
    }

    /// Adds `id` if it is not known yet.
    pub async fn ensure(&self, id: &str) {
        let mut users = self.users.write().await;
        if !users.iter().any(|u| u.id == id) {
            users.push(UserRecord::new(id, id, ""));
        }
    }

    /// Users whose id or name contains `query`, case-insensitively. An empty
    /// query returns everyone.
    pub async fn search(&self, query: &str) -> Vec<UserRecord> {
        let needle = query.trim().to_lowercase();
        let users = self.users.read().await;
        users
            .iter()
            .filter(|u| {
                needle.is_empty()
                    || u.id.to_lowercase().contains(&needle)
                    || u.nombre.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect()
    }
}

/// Messages persisted through the HTTP API, in arrival order.
#[derive(Default)]
pub struct History {
    private: RwLock<Vec<ChatPayload>>,
    group: RwLock<HashMap<RoomId, Vec<ChatPayload>>>,
    general: RwLock<Vec<ChatPayload>>,
}

impl History {
    /// Creates empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a direct message.
    pub async fn push_private(&self, message: ChatPayload) {
        self.private.write().await.push(message);
    }

    /// Stores a group message.
    pub async fn push_group(&self, room: RoomId, message: ChatPayload) {
        self.group.write().await.entry(room).or_default().push(message);
    }

    /// Stores a broadcast message.
    pub async fn push_general(&self, message: ChatPayload) {
        self.general.write().await.push(message);
    }

    /// Direct messages exchanged between `a` and `b`, in either direction.
    pub async fn private_between(&self, a: &str, b: &str) -> Vec<ChatPayload> {
        let between = |m: &ChatPayload| {
            let from = m.sender_id.as_str();
            let to = m.recipient_id.as_ref().map_or("", |r| r.as_str());
            (from == a && to == b) || (from == b && to == a)
        };
        self.private
            .read()
            .await
            .iter()
            .filter(|m| between(m))
            .cloned()
            .collect()
    }

    /// Messages posted to `room`.
    pub async fn group(&self, room: RoomId) -> Vec<ChatPayload> {
        self.group
            .read()
            .await
            .get(&room)
            .cloned()
            .unwrap_or_default()
    }

    /// Broadcast messages.
    pub async fn general(&self) -> Vec<ChatPayload> {
        self.general.read().await.clone()
    }
}
