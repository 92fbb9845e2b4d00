//! Local conversation persistence and failure-resilient writing.
//!
//! [`ConversationStore`] persists the whole conversation list as one
//! snapshot. [`FileStore`] writes a postcard-encoded file atomically (temp
//! file + rename); [`InMemoryStore`] is for tests.
//!
//! [`ResilientStore`] wraps any store so that a failed write never reaches
//! the caller: the error is logged and a [`StoreWarning`] is emitted for the
//! UI. The caller keeps its dirty flag and simply tries again later.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use parley_proto::ids::UserId;

use super::model::Conversation;

/// Snapshot format version. Bumped on incompatible changes.
const SNAPSHOT_VERSION: u32 = 1;

/// Errors that can occur during snapshot storage.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A write failed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// A read failed.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// The snapshot exists but cannot be decoded.
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),
}

/// Persists conversation snapshots.
pub trait ConversationStore: Send + Sync {
    /// Loads the conversations saved for `owner`. Missing snapshot or a
    /// snapshot owned by someone else yields an empty list.
    fn load(
        &self,
        owner: &UserId,
    ) -> impl std::future::Future<Output = Result<Vec<Conversation>, StoreError>> + Send;

    /// Replaces the snapshot for `owner`.
    fn save(
        &self,
        owner: &UserId,
        conversations: &[Conversation],
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    owner: UserId,
    conversations: Vec<Conversation>,
}

/// Snapshot file on disk.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Store at an explicit path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<dir>/conversations.bin`.
    #[must_use]
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("conversations.bin"))
    }

    /// The snapshot path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConversationStore for FileStore {
    async fn load(&self, owner: &UserId) -> Result<Vec<Conversation>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::ReadFailed(e.to_string())),
        };
        let snapshot: Snapshot =
            postcard::from_bytes(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        if snapshot.owner != *owner {
            tracing::info!(
                path = %self.path.display(),
                owner = %snapshot.owner,
                "snapshot belongs to another user, starting empty"
            );
            return Ok(Vec::new());
        }
        Ok(snapshot.conversations)
    }

    async fn save(&self, owner: &UserId, conversations: &[Conversation]) -> Result<(), StoreError> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            owner: owner.clone(),
            conversations: conversations.to_vec(),
        };
        let bytes =
            postcard::to_allocvec(&snapshot).map_err(|e| StoreError::WriteFailed(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        }
        let tmp = self.path.with_extension("bin.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        tracing::debug!(path = %self.path.display(), bytes = bytes.len(), "snapshot saved");
        Ok(())
    }
}

/// In-memory store for tests. Keeps one snapshot per owner.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    snapshots: Mutex<Vec<(UserId, Vec<Conversation>)>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of saved snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    /// Whether nothing has been saved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.lock().is_empty()
    }
}

impl ConversationStore for InMemoryStore {
    async fn load(&self, owner: &UserId) -> Result<Vec<Conversation>, StoreError> {
        Ok(self
            .snapshots
            .lock()
            .iter()
            .find(|(o, _)| o == owner)
            .map(|(_, c)| c.clone())
            .unwrap_or_default())
    }

    async fn save(&self, owner: &UserId, conversations: &[Conversation]) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.lock();
        if let Some(slot) = snapshots.iter_mut().find(|(o, _)| o == owner) {
            slot.1 = conversations.to_vec();
        } else {
            snapshots.push((owner.clone(), conversations.to_vec()));
        }
        Ok(())
    }
}

impl<S: ConversationStore> ConversationStore for std::sync::Arc<S> {
    fn load(
        &self,
        owner: &UserId,
    ) -> impl std::future::Future<Output = Result<Vec<Conversation>, StoreError>> + Send {
        (**self).load(owner)
    }

    fn save(
        &self,
        owner: &UserId,
        conversations: &[Conversation],
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send {
        (**self).save(owner, conversations)
    }
}

/// Warning emitted when persistence fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreWarning {
    /// The previous session's conversations could not be loaded.
    #[error("could not load saved conversations: {0}")]
    LoadFailed(String),
    /// The latest state could not be saved.
    #[error("conversations could not be saved: {0}")]
    SaveFailed(String),
}

/// Wraps a [`ConversationStore`] so failures never reach the caller.
pub struct ResilientStore<S: ConversationStore> {
    store: S,
    warning_tx: mpsc::Sender<StoreWarning>,
}

impl<S: ConversationStore> ResilientStore<S> {
    /// Wraps `store`. Returns the wrapper and the warning receiver.
    #[must_use]
    pub fn new(store: S, warning_buffer: usize) -> (Self, mpsc::Receiver<StoreWarning>) {
        let (tx, rx) = mpsc::channel(warning_buffer);
        (
            Self {
                store,
                warning_tx: tx,
            },
            rx,
        )
    }

    /// Loads the snapshot, falling back to an empty list on failure.
    pub async fn load(&self, owner: &UserId) -> Vec<Conversation> {
        match self.store.load(owner).await {
            Ok(conversations) => conversations,
            Err(err) => {
                tracing::warn!(error = %err, "failed to load conversations, starting empty");
                let _ = self
                    .warning_tx
                    .try_send(StoreWarning::LoadFailed(err.to_string()));
                Vec::new()
            }
        }
    }

    /// Saves the snapshot. Returns `false` if the write failed.
    pub async fn save(&self, owner: &UserId, conversations: &[Conversation]) -> bool {
        match self.store.save(owner, conversations).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "failed to save conversations");
                let _ = self
                    .warning_tx
                    .try_send(StoreWarning::SaveFailed(err.to_string()));
                false
            }
        }
    }
}
