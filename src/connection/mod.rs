//! Supervised WebSocket connections.
//!
//! A [`ConnectionManager`] owns one socket to one endpoint. It reconnects with exponential
//! backoff, checks liveness with a heartbeat and reports everything that happens as
//! [`ConnectionEvent`]s plus a watchable [`ConnectionSnapshot`].

mod manager;
pub use manager::*;

mod state;
pub use state::*;
