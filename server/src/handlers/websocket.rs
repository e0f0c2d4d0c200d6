//! WebSocket handler for real-time sync.
//!
//! Handles WebSocket connections and dispatches messages to the pull and push
//! handlers. Records stored by one connection are announced to all others.

use axum::extract::ws::{Message, WebSocket};
use fieldsync_engine::{RecordCodec, RemoteRecord};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::websocket::{ClientMessage, ServerMessage};
use crate::AppState;

use super::{handle_pull, handle_push, PullQuery, PushRequest};

/// Handle an established WebSocket connection until it closes.
pub async fn handle_websocket_connection(socket: WebSocket, state: AppState, client_id: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let conn_manager = state.conn_manager.clone();
    let conn_id = conn_manager.register(client_id.clone(), tx);

    tracing::info!(
        conn_id = %conn_id,
        client_id = %client_id,
        "WebSocket client connected"
    );

    // Forward queued messages to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize WebSocket message: {}", e);
                }
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let response = process_message(text.as_str(), &state, &conn_id).await;
                conn_manager.send_to(&conn_id, response);
            }
            Ok(Message::Binary(_)) => {
                conn_manager.send_to(
                    &conn_id,
                    ServerMessage::error("Binary messages not supported", None),
                );
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    conn_manager.unregister(&conn_id);
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        client_id = %client_id,
        active_connections = conn_manager.connection_count(),
        active_clients = conn_manager.client_count(),
        "WebSocket client disconnected"
    );
}

/// Process a client message and return the reply.
async fn process_message(text: &str, state: &AppState, conn_id: &str) -> ServerMessage {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            return ServerMessage::error(format!("Invalid message format: {}", e), None);
        }
    };

    match client_msg {
        ClientMessage::Pull {
            since,
            limit,
            request_id,
        } => {
            let query = PullQuery { since, limit };
            match handle_pull(&state.pool, &state.codec, state.config.pull_limit_max, query).await
            {
                Ok(response) => ServerMessage::PullResponse {
                    records: response.records,
                    sync_token: response.sync_token,
                    has_more: response.has_more,
                    request_id,
                },
                Err(e) => ServerMessage::error(e.to_string(), request_id),
            }
        }

        ClientMessage::Push {
            records,
            request_id,
        } => {
            let request = PushRequest { records };
            match handle_push(&state.pool, &state.codec, state.config.push_batch_max, request)
                .await
            {
                Ok(response) => {
                    announce(state, Some(conn_id), response.confirmed_records());
                    ServerMessage::PushResponse {
                        results: response.results,
                        request_id,
                    }
                }
                Err(e) => ServerMessage::error(e.to_string(), request_id),
            }
        }

        ClientMessage::Ping => ServerMessage::Pong,
    }
}

/// Tell connected clients about newly stored records, skipping the
/// connection that stored them.
pub fn announce<'a>(
    state: &AppState,
    except: Option<&str>,
    stored: impl Iterator<Item = &'a RemoteRecord>,
) {
    let records: Vec<_> = stored
        .filter_map(|record| state.codec.encode(record).ok())
        .collect();
    if records.is_empty() {
        return;
    }

    let count = records.len();
    let message = ServerMessage::records_available(records);
    let sent = match except {
        Some(conn_id) => state.conn_manager.broadcast_except(conn_id, message),
        None => state.conn_manager.broadcast_all(message),
    };
    tracing::debug!(sent_to = sent, records = count, "Announced stored records");
}
