//! Connection layer: one long-lived WebSocket to the chat server.
//!
//! [`ConnectionManager`] owns the socket lifecycle (connect, register,
//! reconnect) and reports everything that happens as a
//! [`ConnectionEvent`]. Nothing in this layer panics or returns transport
//! errors to its owner; failures become events.
//!
//! The [`Link`] trait is the narrow seam the outbox and session transmit
//! through. [`LoopbackLink`] implements it in-process for tests.

pub mod loopback;
pub mod manager;

use std::fmt;
use std::time::Duration;

use parley_proto::codec::CodecError;
use parley_proto::event::{ClientEvent, ServerEvent};
use parley_proto::ids::UserId;

pub use loopback::LoopbackLink;
pub use manager::ConnectionManager;

/// Errors returned by [`Link::send`].
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// No live connection; the caller keeps the event for later.
    #[error("not connected")]
    NotConnected,

    /// The event could not be encoded.
    #[error("encode failed: {0}")]
    Codec(#[from] CodecError),
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server closed the socket on purpose (Close frame).
    Forced,
    /// Network or protocol failure.
    Transport(String),
    /// The local side asked to disconnect.
    Local,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forced => f.write_str("closed by server"),
            Self::Transport(reason) => write!(f, "transport error: {reason}"),
            Self::Local => f.write_str("closed locally"),
        }
    }
}

/// Everything the connection layer reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Socket is open and `register` has been sent.
    Connected {
        /// `true` for every connection after the first.
        reconnected: bool,
    },
    /// The socket went away.
    Disconnected {
        /// Why.
        reason: DisconnectReason,
    },
    /// A reconnection attempt is scheduled.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
        /// Attempt budget.
        max_attempts: u32,
    },
    /// The reconnect budget is exhausted. No further attempts are made.
    ReconnectFailed {
        /// Attempts made.
        attempts: u32,
    },
    /// A decoded event from the server.
    Event(ServerEvent),
}

/// Connection tuning and identity.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket URL of the chat server.
    pub url: String,
    /// Identity announced with `register` on every connection.
    pub user_id: UserId,
    /// Per-attempt connect timeout.
    pub connect_timeout: Duration,
    /// Fixed delay between reconnection attempts.
    pub reconnect_delay: Duration,
    /// Delay before the single immediate retry after a server-forced close.
    pub forced_reconnect_delay: Duration,
    /// Reconnection attempts before giving up.
    pub max_reconnect_attempts: u32,
}

impl ConnectionConfig {
    /// Config with default timings for `url` and `user_id`.
    pub fn new(url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            url: url.into(),
            user_id,
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(2),
            forced_reconnect_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
        }
    }
}

/// Transmit side of a connection, as seen by the outbox and session.
pub trait Link: Send {
    /// Queues an event for transmission on the current connection.
    ///
    /// # Errors
    ///
    /// [`LinkError::NotConnected`] while the connection is down.
    fn send(&self, event: &ClientEvent) -> Result<(), LinkError>;

    /// Whether a connection is currently established.
    fn is_connected(&self) -> bool;

    /// Starts connecting. Idempotent.
    fn open(&mut self) {}

    /// Stops the connection and any reconnection.
    fn close(&mut self) {}
}
