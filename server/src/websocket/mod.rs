//! WebSocket support for real-time sync.
//!
//! Clients connect to `/ws`, pull and push over the socket, and are told when
//! another client stores records.

mod manager;
mod protocol;

pub use manager::ConnectionManager;
pub use protocol::*;
