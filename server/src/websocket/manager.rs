//! WebSocket connection manager.
//!
//! Tracks active WebSocket connections and fans out notifications when a
//! client stores records.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::ServerMessage;

/// Sender for WebSocket messages.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier for this connection
    pub id: String,
    /// Client-chosen identifier; one client may hold several connections
    pub client_id: String,
    /// Channel to send messages to this connection
    pub sender: MessageSender,
}

/// Manages active WebSocket connections.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: DashMap<String, Connection>,
    by_client_id: DashMap<String, Vec<String>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection and return its ID.
    pub fn register(&self, client_id: String, sender: MessageSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();

        self.connections.insert(
            conn_id.clone(),
            Connection {
                id: conn_id.clone(),
                client_id: client_id.clone(),
                sender,
            },
        );
        self.by_client_id
            .entry(client_id)
            .or_default()
            .push(conn_id.clone());

        tracing::info!(conn_id = %conn_id, "WebSocket connection registered");

        conn_id
    }

    /// Unregister a connection.
    pub fn unregister(&self, conn_id: &str) {
        let Some((_, conn)) = self.connections.remove(conn_id) else {
            return;
        };

        // Guard dropped before the remove so the shard is not locked twice.
        let now_empty = match self.by_client_id.get_mut(&conn.client_id) {
            Some(mut conn_ids) => {
                conn_ids.retain(|id| id != conn_id);
                conn_ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_client_id.remove(&conn.client_id);
        }

        tracing::info!(
            conn_id = %conn_id,
            client_id = %conn.client_id,
            "WebSocket connection unregistered"
        );
    }

    /// Broadcast a message to all connections except the sender.
    ///
    /// Returns the number of connections that received the message.
    pub fn broadcast_except(&self, sender_conn_id: &str, message: ServerMessage) -> usize {
        let sent_count = self
            .connections
            .iter()
            .filter(|entry| entry.id != sender_conn_id)
            .filter(|entry| entry.sender.send(message.clone()).is_ok())
            .count();

        tracing::debug!(
            sender = %sender_conn_id,
            recipients = sent_count,
            "Broadcast message to connections"
        );

        sent_count
    }

    /// Broadcast a message to all connections.
    pub fn broadcast_all(&self, message: ServerMessage) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.sender.send(message.clone()).is_ok())
            .count()
    }

    /// Send a message to a specific connection.
    pub fn send_to(&self, conn_id: &str, message: ServerMessage) -> bool {
        self.connections
            .get(conn_id)
            .is_some_and(|conn| conn.sender.send(message).is_ok())
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get the number of distinct clients connected.
    pub fn client_count(&self) -> usize {
        self.by_client_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_unregister() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        let conn_id = manager.register("client-1".to_string(), tx);
        let second = manager.register("client-1".to_string(), tx2);
        assert_eq!(manager.connection_count(), 2);
        assert_eq!(manager.client_count(), 1);

        manager.unregister(&conn_id);
        assert_eq!(manager.connection_count(), 1);
        assert_eq!(manager.client_count(), 1);

        manager.unregister(&second);
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.client_count(), 0);

        // Unknown IDs are ignored.
        manager.unregister("missing");
    }

    #[test]
    fn test_broadcast_except() {
        let manager = ConnectionManager::new();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        let conn1 = manager.register("client-1".to_string(), tx1);
        let _conn2 = manager.register("client-2".to_string(), tx2);

        let sent = manager.broadcast_except(&conn1, ServerMessage::records_available(vec![]));
        assert_eq!(sent, 1);

        assert!(rx1.try_recv().is_err());
        let msg = rx2.try_recv().unwrap();
        assert!(matches!(msg, ServerMessage::RecordsAvailable { .. }));
    }

    #[test]
    fn test_broadcast_all_skips_closed_connections() {
        let manager = ConnectionManager::new();
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        manager.register("client-1".to_string(), tx1);
        manager.register("client-2".to_string(), tx2);

        drop(rx1);
        assert_eq!(manager.broadcast_all(ServerMessage::Pong), 1);
        assert!(matches!(rx2.try_recv().unwrap(), ServerMessage::Pong));
    }

    #[test]
    fn test_send_to() {
        let manager = ConnectionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = manager.register("client-1".to_string(), tx);

        assert!(manager.send_to(&conn, ServerMessage::Pong));
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Pong));

        assert!(!manager.send_to("missing", ServerMessage::Pong));

        drop(rx);
        assert!(!manager.send_to(&conn, ServerMessage::Pong));
    }
}
