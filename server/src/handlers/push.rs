//! Push handler - stores records sent by clients.

use crate::db::{self, SaveOutcome};
use crate::error::{AppError, Result};
use fieldsync_engine::{JsonCodec, RecordCodec, RemoteRecord, SendOutcome, SendResult, WireRecord};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

/// Request body for push sync.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    /// Records to store, one per row
    pub records: Vec<WireRecord>,
}

/// Response for push sync: one result per pushed record, in request order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub results: Vec<SendResult>,
}

impl PushResponse {
    /// Records that were stored, as the server now holds them.
    pub fn confirmed_records(&self) -> impl Iterator<Item = &RemoteRecord> {
        self.results.iter().filter_map(|result| match &result.outcome {
            SendOutcome::Confirmed { record } => Some(record),
            _ => None,
        })
    }
}

/// Process a push request from a client.
///
/// Every item gets its own result. A record that fails to decode or to save
/// is reported as failed and does not affect the rest of the batch.
pub async fn handle_push(
    pool: &PgPool,
    codec: &JsonCodec,
    max_batch: usize,
    request: PushRequest,
) -> Result<PushResponse> {
    if request.records.len() > max_batch {
        return Err(AppError::BadRequest(format!(
            "push carries {} records, at most {} allowed",
            request.records.len(),
            max_batch
        )));
    }

    let mut results = Vec::with_capacity(request.records.len());
    for wire in &request.records {
        let record = match codec.decode(wire) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(key = %wire.key, error = %e, "Rejected undecodable record");
                results.push(SendResult::failed(wire.key.clone(), e.to_string()));
                continue;
            }
        };

        let key = record.key.clone();
        let result = match db::save_record(pool, record).await {
            Ok(SaveOutcome::Saved(stored)) => {
                tracing::debug!(key = %key, change_seq = stored.change_seq, "Record saved");
                SendResult::confirmed(stored.to_remote())
            }
            Ok(SaveOutcome::Conflict(current)) => {
                tracing::debug!(
                    key = %key,
                    stored_at = %current.updated_at,
                    "Stale change tag, returning current record"
                );
                SendResult::conflict(current.to_remote())
            }
            Err(e) => {
                tracing::error!(key = %key, "Failed to save record: {:?}", e);
                SendResult::failed(key, "storage failure")
            }
        };
        results.push(result);
    }

    Ok(PushResponse { results })
}
