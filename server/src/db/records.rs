//! Database operations for the records table.
//!
//! Saves follow the change-tag protocol: a record is overwritten only by a
//! send that carries the tag it currently holds, and every successful save
//! assigns a fresh tag and the next change sequence number.

use chrono::{DateTime, Utc};
use fieldsync_engine::{ChangeTag, RemoteRecord, Timestamp, Value};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;

/// Advisory lock taken by every writer, so change sequence order matches
/// commit order and a pull never skips a record committed late.
const WRITE_LOCK_KEY: i64 = 0x6669_656c_6473;

const COLUMNS: &str = "record_key, record_type, fields, field_mod_times, overall_mod_time, \
                       change_tag, change_seq, updated_at";

/// A stored record row from the database.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub record_key: String,
    pub record_type: String,
    pub fields: BTreeMap<String, Value>,
    pub field_mod_times: BTreeMap<String, Timestamp>,
    pub overall_mod_time: i64,
    pub change_tag: String,
    pub change_seq: i64,
    /// Persistence time; never sent to clients
    pub updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        let Json(fields): Json<BTreeMap<String, Value>> = row.try_get("fields")?;
        let Json(field_mod_times): Json<BTreeMap<String, Timestamp>> =
            row.try_get("field_mod_times")?;
        Ok(StoredRecord {
            record_key: row.try_get("record_key")?,
            record_type: row.try_get("record_type")?,
            fields,
            field_mod_times,
            overall_mod_time: row.try_get("overall_mod_time")?,
            change_tag: row.try_get("change_tag")?,
            change_seq: row.try_get("change_seq")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl StoredRecord {
    /// Convert a database row to the record clients see.
    pub fn to_remote(&self) -> RemoteRecord {
        RemoteRecord {
            key: self.record_key.clone(),
            record_type: self.record_type.clone(),
            fields: self.fields.clone(),
            field_mod_time: self.field_mod_times.clone(),
            overall_mod_time: self.overall_mod_time as u64,
            change_tag: Some(ChangeTag::new(self.change_tag.clone())),
        }
    }
}

/// What a save does to the stored copy of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveDecision {
    /// No stored copy yet
    Insert,
    /// The sender saw the current version
    Overwrite,
    /// The sender's change tag is stale
    Reject,
}

/// Decide how to treat `incoming` given the stored copy.
pub fn decide(stored: Option<&RemoteRecord>, incoming: &RemoteRecord) -> SaveDecision {
    match stored {
        None => SaveDecision::Insert,
        Some(current) if current.change_tag == incoming.change_tag => SaveDecision::Overwrite,
        Some(_) => SaveDecision::Reject,
    }
}

/// The record as it will be stored: a fresh tag and an overall time derived
/// from the per-field times the client sent.
pub fn stamp(mut incoming: RemoteRecord, tag: impl Into<String>) -> RemoteRecord {
    incoming.change_tag = Some(ChangeTag::new(tag));
    incoming.recompute_overall_mod_time();
    incoming
}

/// Result of a save.
#[derive(Debug)]
pub enum SaveOutcome {
    /// Stored; the row as it now exists
    Saved(StoredRecord),
    /// Not stored; the current row
    Conflict(StoredRecord),
}

/// Save one record under the change-tag protocol.
pub async fn save_record(pool: &PgPool, incoming: RemoteRecord) -> Result<SaveOutcome, sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(WRITE_LOCK_KEY)
        .execute(&mut *tx)
        .await?;

    let stored = sqlx::query_as::<_, StoredRecord>(&format!(
        "SELECT {COLUMNS} FROM records WHERE record_key = $1 FOR UPDATE"
    ))
    .bind(&incoming.key)
    .fetch_optional(&mut *tx)
    .await?;

    let current = stored.as_ref().map(StoredRecord::to_remote);
    if let (SaveDecision::Reject, Some(stored)) = (decide(current.as_ref(), &incoming), stored) {
        tx.rollback().await?;
        return Ok(SaveOutcome::Conflict(stored));
    }

    let record = stamp(incoming, uuid::Uuid::new_v4().to_string());
    let saved = sqlx::query_as::<_, StoredRecord>(&format!(
        r#"
        INSERT INTO records (
            record_key, record_type, fields, field_mod_times,
            overall_mod_time, change_tag, change_seq, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, nextval('records_change_seq'), now())
        ON CONFLICT (record_key) DO UPDATE SET
            record_type = EXCLUDED.record_type,
            fields = EXCLUDED.fields,
            field_mod_times = EXCLUDED.field_mod_times,
            overall_mod_time = EXCLUDED.overall_mod_time,
            change_tag = EXCLUDED.change_tag,
            change_seq = EXCLUDED.change_seq,
            updated_at = EXCLUDED.updated_at
        RETURNING {COLUMNS}
        "#
    ))
    .bind(&record.key)
    .bind(&record.record_type)
    .bind(Json(&record.fields))
    .bind(Json(&record.field_mod_time))
    .bind(record.overall_mod_time as i64)
    .bind(record.change_tag.as_ref().map(ChangeTag::as_str))
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(SaveOutcome::Saved(saved))
}

/// Records changed after change sequence `since`, oldest first.
pub async fn records_since(
    pool: &PgPool,
    since: i64,
    limit: i64,
) -> Result<Vec<StoredRecord>, sqlx::Error> {
    sqlx::query_as::<_, StoredRecord>(&format!(
        "SELECT {COLUMNS} FROM records WHERE change_seq > $1 ORDER BY change_seq ASC LIMIT $2"
    ))
    .bind(since)
    .bind(limit)
    .fetch_all(pool)
    .await
}
