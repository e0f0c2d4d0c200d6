//! Request handlers for sync operations.

mod pull;
mod push;
mod websocket;

pub use pull::*;
pub use push::*;
pub use websocket::*;
