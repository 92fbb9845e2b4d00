//! HTTP collaborators: user directory, history fetch and message persistence.
//!
//! The session calls these in spawned tasks. Every failure is reported as a
//! [`DirectoryError`] and turned into a user-visible notice by the caller;
//! chat state is never rolled back because a collaborator failed.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use parley_proto::event::{ChatPayload, wire_id};
use parley_proto::ids::{RoomId, UserId};

/// Default per-request timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// One directory record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// User id (accepted as a JSON number or string).
    #[serde(deserialize_with = "wire_id")]
    pub id: UserId,
    /// Display name.
    pub nombre: String,
    /// Role label.
    #[serde(default)]
    pub rol: String,
}

/// Errors from the HTTP collaborators.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,
    /// The server answered with a non-success status.
    #[error("server returned HTTP {0}")]
    Http(u16),
    /// Connection-level failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// The response body was not what we expected.
    #[error("invalid response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for DirectoryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if let Some(status) = err.status() {
            Self::Http(status.as_u16())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Directory lookup, history and persistence endpoints.
pub trait Directory: Send + Sync {
    /// Users whose id or name matches `query`. Empty query lists everyone.
    fn search(
        &self,
        query: &str,
    ) -> impl std::future::Future<Output = Result<Vec<DirectoryEntry>, DirectoryError>> + Send;

    /// Direct-message history between two users, oldest first.
    fn private_history(
        &self,
        a: &UserId,
        b: &UserId,
    ) -> impl std::future::Future<Output = Result<Vec<ChatPayload>, DirectoryError>> + Send;

    /// Group history for a room, oldest first.
    fn group_history(
        &self,
        room: RoomId,
    ) -> impl std::future::Future<Output = Result<Vec<ChatPayload>, DirectoryError>> + Send;

    /// Persists a direct message.
    fn save_private(
        &self,
        message: &ChatPayload,
    ) -> impl std::future::Future<Output = Result<(), DirectoryError>> + Send;

    /// Persists a group message.
    fn save_group(
        &self,
        message: &ChatPayload,
    ) -> impl std::future::Future<Output = Result<(), DirectoryError>> + Send;

    /// Persists a broadcast message.
    fn save_general(
        &self,
        message: &ChatPayload,
    ) -> impl std::future::Future<Output = Result<(), DirectoryError>> + Send;
}

/// [`Directory`] over HTTP+JSON.
#[derive(Debug, Clone)]
pub struct HttpDirectory {
    client: reqwest::Client,
    base: String,
}

impl HttpDirectory {
    /// Creates a client for the API rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// [`DirectoryError::Transport`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .map_err(|e| DirectoryError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, DirectoryError> {
        let response = self
            .client
            .get(self.url(path))
            .query(query)
            .send()
            .await?
            .error_for_status()?;
        response
            .json()
            .await
            .map_err(|e| DirectoryError::Decode(e.to_string()))
    }

    async fn post(&self, path: &str, message: &ChatPayload) -> Result<(), DirectoryError> {
        self.client
            .post(self.url(path))
            .json(message)
            .send()
            .await?
            .error_for_status()?;
        tracing::debug!(path, correlation_id = %message.correlation_id, "message persisted");
        Ok(())
    }
}

impl Directory for HttpDirectory {
    async fn search(&self, query: &str) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        self.get_json("/chat/users", &[("q", query)]).await
    }

    async fn private_history(
        &self,
        a: &UserId,
        b: &UserId,
    ) -> Result<Vec<ChatPayload>, DirectoryError> {
        self.get_json(&format!("/chat/history/private/{a}/{b}"), &[])
            .await
    }

    async fn group_history(&self, room: RoomId) -> Result<Vec<ChatPayload>, DirectoryError> {
        self.get_json(&format!("/chat/history/group/{room}"), &[])
            .await
    }

    async fn save_private(&self, message: &ChatPayload) -> Result<(), DirectoryError> {
        self.post("/chat/messages/private", message).await
    }

    async fn save_group(&self, message: &ChatPayload) -> Result<(), DirectoryError> {
        self.post("/chat/messages/group", message).await
    }

    async fn save_general(&self, message: &ChatPayload) -> Result<(), DirectoryError> {
        self.post("/chat/messages/general", message).await
    }
}

impl<D: Directory> Directory for std::sync::Arc<D> {
    fn search(
        &self,
        query: &str,
    ) -> impl std::future::Future<Output = Result<Vec<DirectoryEntry>, DirectoryError>> + Send {
        (**self).search(query)
    }

    fn private_history(
        &self,
        a: &UserId,
        b: &UserId,
    ) -> impl std::future::Future<Output = Result<Vec<ChatPayload>, DirectoryError>> + Send {
        (**self).private_history(a, b)
    }

    fn group_history(
        &self,
        room: RoomId,
    ) -> impl std::future::Future<Output = Result<Vec<ChatPayload>, DirectoryError>> + Send {
        (**self).group_history(room)
    }

    fn save_private(
        &self,
        message: &ChatPayload,
    ) -> impl std::future::Future<Output = Result<(), DirectoryError>> + Send {
        (**self).save_private(message)
    }

    fn save_group(
        &self,
        message: &ChatPayload,
    ) -> impl std::future::Future<Output = Result<(), DirectoryError>> + Send {
        (**self).save_group(message)
    }

    fn save_general(
        &self,
        message: &ChatPayload,
    ) -> impl std::future::Future<Output = Result<(), DirectoryError>> + Send {
        (**self).save_general(message)
    }
}
