//! WebSocket session handling.
//!
//! - `protocol`: inbound/outbound frame shapes and decoding.
//! - `connection`: per-connection `Session` state shared across tasks.
//! - `registry`: the set of open sessions.
//! - `liveness`: the heartbeat supervisor.
//! - `turn`: the per-session reply cycle.
//! - `session`: connection lifecycle, from upgrade to teardown.

pub mod connection;
pub mod liveness;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod turn;

pub use session::ws_handler;
