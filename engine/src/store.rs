//! LocalStore - rows and their sync metadata.
//!
//! Each row lives in one map entry together with its [`SyncMetadata`]. Every
//! read-modify-write runs under that entry's guard, so a row and its metadata
//! are always updated together and work on one row is serialized while other
//! rows proceed in parallel.
//!
//! Writes go through [`RowEntry::write`], which runs the after-write trigger:
//! the row's modification time is stamped, local writes mark the row pending,
//! and a [`RowChange`] is published to subscribers.

use crate::{
    clock::{Clock, SystemClock},
    error::Result,
    merge::TieBreak,
    metadata::{Refresh, RefreshOutcome, SyncMetadata},
    record::{FieldChanges, Row},
    snapshot::StoreSnapshot,
    upload::{self, ConfirmOutcome, PreparedUpload},
    upsert::{self, UpsertOrigin, UpsertOutcome},
    Error, FieldName, RecordType, RemoteRecord, RowKey, Timestamp,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Capacity of the row change channel. Slow subscribers see `Lagged`.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Who produced a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteSource {
    /// A user edit; marks the row pending upload
    Local,
    /// Values adopted from the remote
    Remote,
}

/// Notification published after a write changed at least one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowChange {
    pub key: RowKey,
    pub changed_fields: BTreeSet<FieldName>,
    pub source: WriteSource,
}

/// A row together with its sync metadata.
#[derive(Debug, Clone)]
pub struct RowEntry {
    pub row: Row,
    pub metadata: SyncMetadata,
    published: Vec<RowChange>,
}

impl RowEntry {
    /// Empty row with default metadata.
    pub fn new(key: impl Into<RowKey>, record_type: impl Into<RecordType>) -> Self {
        Self::from_parts(Row::new(key, record_type), SyncMetadata::default())
    }

    pub fn from_parts(row: Row, metadata: SyncMetadata) -> Self {
        Self {
            row,
            metadata,
            published: Vec::new(),
        }
    }

    /// Write fields and run the after-write trigger.
    ///
    /// Returns the fields whose value actually changed. A write that changes
    /// nothing does not fire the trigger.
    pub fn write(
        &mut self,
        changes: FieldChanges,
        source: WriteSource,
        now: Timestamp,
    ) -> BTreeSet<FieldName> {
        let changed = self.row.apply_changes(changes);
        if changed.is_empty() {
            return changed;
        }

        self.metadata.touch_user_modification_time(now);
        if source == WriteSource::Local {
            self.metadata.mark_pending_upload();
        }
        self.published.push(RowChange {
            key: self.row.key.clone(),
            changed_fields: changed.clone(),
            source,
        });
        changed
    }

    fn take_published(&mut self) -> Vec<RowChange> {
        std::mem::take(&mut self.published)
    }
}

/// Local row store with per-row sync metadata.
pub struct LocalStore {
    entries: DashMap<RowKey, RowEntry>,
    clock: Arc<dyn Clock>,
    changes: broadcast::Sender<RowChange>,
}

impl LocalStore {
    /// Create an empty store stamping writes with `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            clock,
            changes,
        }
    }

    /// Current local time from the store's clock.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Subscribe to row change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RowChange> {
        self.changes.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Create an empty row with default metadata if absent, and return the
    /// row's metadata. Idempotent.
    pub fn ensure(&self, key: &str, record_type: &str) -> SyncMetadata {
        self.entries
            .entry(key.to_string())
            .or_insert_with(|| RowEntry::new(key, record_type))
            .metadata
            .clone()
    }

    /// Current row value.
    pub fn read(&self, key: &str) -> Option<Row> {
        self.entries.get(key).map(|entry| entry.row.clone())
    }

    pub fn metadata(&self, key: &str) -> Option<SyncMetadata> {
        self.entries.get(key).map(|entry| entry.metadata.clone())
    }

    /// Keys of rows with unconfirmed local edits, in key order.
    pub fn pending_keys(&self) -> Vec<RowKey> {
        let mut keys: Vec<RowKey> = self
            .entries
            .iter()
            .filter(|entry| entry.metadata.pending_upload())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Run `f` on an existing row while holding its entry.
    pub fn with_entry_mut<T>(&self, key: &str, f: impl FnOnce(&mut RowEntry) -> T) -> Result<T> {
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| Error::RowNotFound(key.to_string()))?;
        let result = f(&mut *entry);
        self.publish(entry.take_published());
        Ok(result)
    }

    /// Run `f` on a row, creating it first if absent.
    pub fn with_entry_or_insert<T>(
        &self,
        key: &str,
        record_type: &str,
        f: impl FnOnce(&mut RowEntry) -> T,
    ) -> T {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| RowEntry::new(key, record_type));
        let result = f(&mut *entry);
        self.publish(entry.take_published());
        result
    }

    /// Write fields to a row, creating it if absent.
    pub fn write(
        &self,
        key: &str,
        record_type: &str,
        changes: FieldChanges,
        source: WriteSource,
    ) -> BTreeSet<FieldName> {
        let now = self.now();
        self.with_entry_or_insert(key, record_type, |entry| entry.write(changes, source, now))
    }

    /// Record a user edit. Marks the row pending if anything changed.
    pub fn write_local(
        &self,
        key: &str,
        record_type: &str,
        changes: FieldChanges,
    ) -> BTreeSet<FieldName> {
        self.write(key, record_type, changes, WriteSource::Local)
    }

    pub fn touch_user_modification_time(&self, key: &str, at: Timestamp) -> Result<()> {
        self.with_entry_mut(key, |entry| entry.metadata.touch_user_modification_time(at))
    }

    pub fn mark_pending_upload(&self, key: &str) -> Result<()> {
        self.with_entry_mut(key, |entry| entry.metadata.mark_pending_upload())
    }

    /// Refresh a row's last-known remote state. A candidate never replaces a
    /// confirmed snapshot.
    pub fn refresh_last_known_remote(
        &self,
        key: &str,
        refresh: Refresh<'_>,
    ) -> Result<RefreshOutcome> {
        self.with_entry_mut(key, |entry| entry.metadata.refresh_last_known_remote(refresh))
    }

    /// Build the record to send for a pending row.
    pub fn prepare_upload(&self, key: &str) -> Result<PreparedUpload> {
        self.with_entry_mut(key, upload::prepare_upload)?
    }

    /// Accept the remote's confirmation of a send.
    pub fn confirm_upload(&self, key: &str, confirmed: RemoteRecord) -> Result<ConfirmOutcome> {
        self.with_entry_mut(key, |entry| upload::confirm_upload(entry, confirmed))?
    }

    /// Apply a remote record, creating the row if it is new.
    pub fn apply_upsert(
        &self,
        incoming: RemoteRecord,
        origin: UpsertOrigin,
        tie_break: TieBreak,
    ) -> Result<UpsertOutcome> {
        let now = self.now();
        let key = incoming.key.clone();
        let record_type = incoming.record_type.clone();
        self.with_entry_or_insert(&key, &record_type, |entry| {
            upsert::apply_upsert(entry, incoming, origin, tie_break, now)
        })
    }

    /// Export every row and its metadata.
    pub fn export_state(&self) -> StoreSnapshot {
        let mut snapshot = StoreSnapshot::new();
        for entry in self.entries.iter() {
            snapshot.add_row(entry.row.clone(), entry.metadata.clone());
        }
        snapshot
    }

    /// Replace the store's contents with a snapshot.
    pub fn import_state(&self, snapshot: StoreSnapshot) -> Result<()> {
        snapshot.validate()?;
        let count = snapshot.row_count();
        self.entries.clear();
        for (key, persisted) in snapshot.rows {
            self.entries
                .insert(key, RowEntry::from_parts(persisted.row, persisted.metadata));
        }
        info!(rows = count, "imported store state");
        Ok(())
    }

    fn publish(&self, changes: Vec<RowChange>) {
        for change in changes {
            debug!(
                key = %change.key,
                fields = change.changed_fields.len(),
                source = ?change.source,
                "row changed"
            );
            // No subscribers is fine.
            let _ = self.changes.send(change);
        }
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock::new()))
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("rows", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, snapshot::DraftSnapshot, DEFAULT_TIE_BREAK};
    use serde_json::json;

    fn store_at(start: Timestamp) -> (LocalStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        (LocalStore::new(clock.clone()), clock)
    }

    fn changes(pairs: &[(&str, serde_json::Value)]) -> FieldChanges {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), Some(value.clone())))
            .collect()
    }

    #[test]
    fn ensure_is_idempotent() {
        let (store, _) = store_at(100);
        let first = store.ensure("note-1", "Note");
        store.mark_pending_upload("note-1").unwrap();
        let second = store.ensure("note-1", "Note");

        assert!(!first.pending_upload());
        assert!(second.pending_upload());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn local_write_runs_trigger() {
        let (store, _) = store_at(100);
        let changed = store.write_local("note-1", "Note", changes(&[("title", json!("a"))]));

        assert!(changed.contains("title"));
        let metadata = store.metadata("note-1").unwrap();
        assert_eq!(metadata.user_modification_time(), 100);
        assert!(metadata.pending_upload());
    }

    #[test]
    fn remote_write_does_not_mark_pending() {
        let (store, _) = store_at(100);
        store.write(
            "note-1",
            "Note",
            changes(&[("title", json!("a"))]),
            WriteSource::Remote,
        );

        let metadata = store.metadata("note-1").unwrap();
        assert_eq!(metadata.user_modification_time(), 100);
        assert!(!metadata.pending_upload());
    }

    #[test]
    fn unchanged_write_skips_trigger() {
        let (store, clock) = store_at(100);
        store.write_local("note-1", "Note", changes(&[("title", json!("a"))]));
        clock.set(500);
        let changed = store.write_local("note-1", "Note", changes(&[("title", json!("a"))]));

        assert!(changed.is_empty());
        assert_eq!(
            store.metadata("note-1").unwrap().user_modification_time(),
            100
        );
    }

    #[test]
    fn missing_row_errors() {
        let (store, _) = store_at(100);
        assert_eq!(
            store.mark_pending_upload("nope"),
            Err(Error::RowNotFound("nope".into()))
        );
        assert!(store.read("nope").is_none());
    }

    #[test]
    fn pending_keys_are_sorted() {
        let (store, _) = store_at(100);
        for key in ["c", "a", "b"] {
            store.write_local(key, "Note", changes(&[("title", json!(key))]));
        }
        store.ensure("d", "Note");

        assert_eq!(store.pending_keys(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn subscribers_see_changes() {
        let (store, _) = store_at(100);
        let mut rx = store.subscribe();

        store.write_local("note-1", "Note", changes(&[("title", json!("a"))]));
        store.write_local("note-1", "Note", changes(&[("title", json!("a"))]));
        store.write_local("note-1", "Note", changes(&[("body", json!("b"))]));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.key, "note-1");
        assert_eq!(first.source, WriteSource::Local);
        assert!(first.changed_fields.contains("title"));

        let second = rx.recv().await.unwrap();
        assert!(second.changed_fields.contains("body"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn candidate_refresh_through_store_is_a_no_op_on_confirmed_rows() {
        let (store, _) = store_at(100);
        let remote = RemoteRecord::new("note-1", "Note")
            .with_field("title", json!("server"), 50)
            .with_change_tag("t1");
        store
            .apply_upsert(remote.clone(), UpsertOrigin::Fetch, DEFAULT_TIE_BREAK)
            .unwrap();

        let draft = DraftSnapshot::new(
            RemoteRecord::new("note-1", "Note").with_field("title", json!("draft"), 200),
        );
        let outcome = store
            .refresh_last_known_remote("note-1", Refresh::Candidate(&draft))
            .unwrap();

        assert_eq!(outcome, RefreshOutcome::Skipped);
        let metadata = store.metadata("note-1").unwrap();
        assert_eq!(metadata.last_known_remote().map(|s| s.record()), Some(&remote));
    }

    #[test]
    fn fetch_creates_unknown_rows() {
        let (store, _) = store_at(300);
        let remote = RemoteRecord::new("note-9", "Note")
            .with_field("title", json!("hi"), 50)
            .with_change_tag("t1");

        store
            .apply_upsert(remote, UpsertOrigin::Fetch, DEFAULT_TIE_BREAK)
            .unwrap();

        let row = store.read("note-9").unwrap();
        assert_eq!(row.record_type, "Note");
        assert_eq!(row.value("title"), Some(&json!("hi")));
        assert_eq!(
            store.metadata("note-9").unwrap().user_modification_time(),
            300
        );
    }

    #[test]
    fn export_import_roundtrip() {
        let (store, _) = store_at(100);
        store.write_local("note-1", "Note", changes(&[("title", json!("a"))]));
        store.write_local("note-2", "Note", changes(&[("title", json!("b"))]));
        let exported = store.export_state();
        let json = exported.to_json().unwrap();

        let (restored, _) = store_at(0);
        restored
            .import_state(StoreSnapshot::from_json(&json).unwrap())
            .unwrap();

        assert_eq!(restored.len(), 2);
        assert_eq!(restored.export_state(), exported);
        assert_eq!(restored.pending_keys(), vec!["note-1", "note-2"]);
    }
}
