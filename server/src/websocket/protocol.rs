//! WebSocket message protocol definitions.
//!
//! Envelopes are JSON with a snake_case `type` tag. Records and send results
//! inside them use the engine's camelCase wire form.

use fieldsync_engine::{SendResult, WireRecord};
use serde::{Deserialize, Serialize};

/// Messages sent from client to server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Request records changed since a sync token.
    Pull {
        /// Sync token from previous pull (null for initial sync)
        #[serde(default)]
        since: Option<String>,
        /// Maximum number of records to return
        #[serde(default)]
        limit: Option<i64>,
        /// Request ID for correlating responses
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Send records to the server.
    Push {
        records: Vec<WireRecord>,
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Keep-alive ping.
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Response to a pull request.
    PullResponse {
        records: Vec<WireRecord>,
        /// Token to use for next pull
        sync_token: String,
        has_more: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Response to a push request: one result per pushed record.
    PushResponse {
        results: Vec<SendResult>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Records another client just stored.
    ///
    /// A hint only: clients still pull to advance their sync token.
    RecordsAvailable { records: Vec<WireRecord> },

    /// Response to ping.
    Pong,

    /// Error message.
    Error {
        message: String,
        /// Request ID from the original request (if applicable)
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            request_id,
        }
    }

    /// Create a records_available notification.
    pub fn records_available(records: Vec<WireRecord>) -> Self {
        ServerMessage::RecordsAvailable { records }
    }
}
