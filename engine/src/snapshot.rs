//! Snapshot types.
//!
//! A remote record reaches local storage in one of two roles, and the two are
//! distinct types so they cannot be stored in the same slot by mistake:
//!
//! - [`ConfirmedSnapshot`]: a record the remote has confirmed, either by
//!   accepting a send or by handing it out on fetch or conflict. Only this type
//!   can become a row's last-known remote state (the three-way merge ancestor).
//! - [`DraftSnapshot`]: a client-built record on its way to the remote. It is
//!   never an ancestor while a confirmed snapshot exists.
//!
//! [`StoreSnapshot`] is the persisted form of the whole local store.

use crate::{
    error::Result, metadata::SyncMetadata, record::Row, Error, RemoteRecord, RowKey,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A remote record the remote has confirmed.
///
/// One exception: a row that has never been uploaded is seeded with its first
/// draft (see [`ConfirmedSnapshot::is_seeded`]). The seed carries no change tag
/// and is replaced by the first record the remote hands back.
///
/// Not `Deserialize`: outside this crate a confirmed snapshot can only be
/// obtained from a row's metadata, never built from raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ConfirmedSnapshot(RemoteRecord);

impl ConfirmedSnapshot {
    /// Restore a snapshot from persisted metadata.
    pub(crate) fn from_persisted(record: RemoteRecord) -> Self {
        Self(record)
    }

    /// The record the remote returned for a successful send.
    pub(crate) fn from_confirmed_send(record: RemoteRecord) -> Self {
        Self(record)
    }

    /// A record handed out by the remote (fetch or conflict signal).
    pub(crate) fn from_remote(record: RemoteRecord) -> Self {
        Self(record)
    }

    /// Seed the baseline of a row that was never uploaded. Only valid while the
    /// row has no confirmed snapshot; see `SyncMetadata::refresh_candidate`.
    pub(crate) fn seed_from_first_draft(draft: &DraftSnapshot) -> Self {
        Self(draft.0.clone())
    }

    /// Whether this is a first-draft seed rather than a record the remote
    /// returned. The remote stamps a change tag on everything it stores.
    pub fn is_seeded(&self) -> bool {
        self.0.change_tag.is_none()
    }

    pub fn record(&self) -> &RemoteRecord {
        &self.0
    }

    pub fn into_record(self) -> RemoteRecord {
        self.0
    }
}

/// A client-built record prepared for sending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DraftSnapshot(RemoteRecord);

impl DraftSnapshot {
    pub(crate) fn new(record: RemoteRecord) -> Self {
        Self(record)
    }

    pub fn record(&self) -> &RemoteRecord {
        &self.0
    }

    pub fn into_record(self) -> RemoteRecord {
        self.0
    }
}

/// One persisted row: its data plus its sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRow {
    pub row: Row,
    pub metadata: SyncMetadata,
}

/// A point-in-time snapshot of the local store.
///
/// Uses BTreeMap so serialization order is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Rows and their metadata, by key
    pub rows: BTreeMap<RowKey, PersistedRow>,
}

impl StoreSnapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            rows: BTreeMap::new(),
        }
    }

    /// Add a row to the snapshot.
    pub fn add_row(&mut self, row: Row, metadata: SyncMetadata) {
        self.rows
            .insert(row.key.clone(), PersistedRow { row, metadata });
    }

    pub fn get_row(&self, key: &str) -> Option<&PersistedRow> {
        self.rows.get(key)
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Count rows with unconfirmed local edits.
    pub fn pending_count(&self) -> usize {
        self.rows
            .values()
            .filter(|r| r.metadata.pending_upload())
            .count()
    }

    /// Check internal consistency: map keys match row keys, and every stored
    /// ancestor belongs to its row.
    pub fn validate(&self) -> Result<()> {
        for (key, persisted) in &self.rows {
            if &persisted.row.key != key {
                return Err(Error::InvalidSnapshot(format!(
                    "row stored under '{}' has key '{}'",
                    key, persisted.row.key
                )));
            }
            if !persisted.metadata.is_consistent() {
                return Err(Error::InvalidSnapshot(format!(
                    "system fields of '{}' do not match its last known remote record",
                    key
                )));
            }
            if let Some(ancestor) = persisted.metadata.last_known_remote() {
                if &ancestor.record().key != key {
                    return Err(Error::InvalidSnapshot(format!(
                        "last known remote record for '{}' has key '{}'",
                        key,
                        ancestor.record().key
                    )));
                }
            }
        }
        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        snapshot.validate()?;
        Ok(snapshot)
    }
}

impl Default for StoreSnapshot {
    fn default() -> Self {
        Self::new()
    }
}
