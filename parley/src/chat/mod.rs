//! Chat state and the two reducers that drive it.
//!
//! [`router`] applies inbound server events; [`outbox`] owns the pending
//! queue for outbound messages. Both mutate the same [`state::ChatState`],
//! which [`store`] persists between runs.

pub mod model;
pub mod outbox;
pub mod router;
pub mod state;
pub mod store;
