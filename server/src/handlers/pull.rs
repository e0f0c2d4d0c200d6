//! Pull handler - serves changed records to clients.

use crate::db;
use crate::error::{AppError, Result};
use fieldsync_engine::{JsonCodec, RecordCodec, WireRecord};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

/// Query parameters for pull sync.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullQuery {
    /// Sync token from previous pull (empty for initial sync)
    pub since: Option<String>,
    /// Maximum number of records to return
    pub limit: Option<i64>,
}

/// Response for pull sync.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    /// Records changed since the sync token, oldest change first
    pub records: Vec<WireRecord>,
    /// Token to use for next pull
    pub sync_token: String,
    /// Whether there are more records to fetch
    pub has_more: bool,
}

/// Default limit for pull requests.
const DEFAULT_LIMIT: i64 = 100;

/// Parse a sync token: the change sequence number of the last record seen.
pub fn parse_sync_token(token: Option<&str>) -> Result<i64> {
    match token {
        None | Some("") => Ok(0),
        Some(token) => token
            .parse::<i64>()
            .ok()
            .filter(|seq| *seq >= 0)
            .ok_or_else(|| AppError::BadRequest(format!("invalid sync token '{}'", token))),
    }
}

/// Clamp a requested limit to `1..=max`.
pub fn effective_limit(requested: Option<i64>, max: i64) -> i64 {
    requested
        .map(|l| l.clamp(1, max))
        .unwrap_or(DEFAULT_LIMIT.min(max))
}

/// Process a pull request from a client.
pub async fn handle_pull(
    pool: &PgPool,
    codec: &JsonCodec,
    max_limit: i64,
    query: PullQuery,
) -> Result<PullResponse> {
    let since = parse_sync_token(query.since.as_deref())?;
    let limit = effective_limit(query.limit, max_limit);

    // Fetch one more than requested to check if there are more
    let stored = db::records_since(pool, since, limit + 1).await?;

    let has_more = stored.len() as i64 > limit;
    let page: Vec<_> = stored.into_iter().take(limit as usize).collect();

    let records = page
        .iter()
        .map(|stored| codec.encode(&stored.to_remote()))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let sync_token = page
        .last()
        .map_or(since, |last| last.change_seq)
        .to_string();

    tracing::debug!(
        since,
        returned = records.len(),
        has_more,
        "Served pull"
    );

    Ok(PullResponse {
        records,
        sync_token,
        has_more,
    })
}
