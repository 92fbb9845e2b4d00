//! Shared protocol definitions for the Parley real-time chat events.

pub mod codec;
pub mod event;
pub mod ids;
