//! Parley: real-time chat client with reconnection and delivery tracking.
//!
//! The [`session`] task ties the pieces together: a [`connection`] link to
//! the chat server, the [`chat`] router and outbox, the HTTP [`directory`]
//! and the [`notify`] sink.

pub mod chat;
pub mod config;
pub mod connection;
pub mod directory;
pub mod notify;
pub mod session;
