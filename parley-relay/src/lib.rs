//! Parley relay server library.
//!
//! A development and test server for the Parley chat protocol. It accepts
//! WebSocket connections, registers users, echoes and relays chat events,
//! and serves the HTTP directory and history API.

pub mod api;
pub mod config;
pub mod relay;
pub mod store;
