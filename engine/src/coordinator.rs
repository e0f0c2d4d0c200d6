//! Sync coordinator: the per-row state machine and the async drivers that move
//! rows through it.
//!
//! ```text
//! Synced -> PendingUpload -> Uploading -> Confirmed
//!                 ^              |
//!                 |              v
//!                 +-------- Conflicted
//! ```
//!
//! A fetched change may arrive in any state. Pending or uploading rows go
//! through the merge path; an uploading row stays `Uploading` until its send
//! result arrives, whatever order the two events come in. A fetch that moves
//! an uploading row's ancestor supersedes the in-flight send: its late result
//! is dropped and the row settles from its metadata.
//!
//! Network calls belong to the [`Transport`]. The coordinator never holds a row
//! lock across an await. Dropping a [`SyncCoordinator::send_pending`] future
//! returns every row still marked `Uploading` to `PendingUpload`.

use crate::{
    codec::{JsonCodec, RecordCodec, WireRecord},
    config::SyncConfig,
    error::Result,
    record::FieldChanges,
    store::{LocalStore, RowEntry, WriteSource},
    upload::{self, ConfirmOutcome, PreparedUpload},
    upsert::{self, UpsertOrigin, UpsertOutcome, UpsertPath},
    Error, FieldName, RemoteRecord, RowKey,
};
use dashmap::{DashMap, DashSet};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a row is in its sync lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RowSyncState {
    /// Row equals its last-known remote record
    Synced,
    /// Local edits recorded, not yet sent
    PendingUpload,
    /// Included in a batch that is in flight
    Uploading,
    /// The remote rejected the send; merge in progress
    Conflicted,
    /// The remote accepted the send and holds the row's current state
    Confirmed,
}

/// Per-item result of a send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SendOutcome {
    /// Stored; carries the record as the remote now holds it
    Confirmed { record: RemoteRecord },
    /// Stale change tag; carries the remote's current record
    Conflict { record: RemoteRecord },
    /// Not stored, for a reason unrelated to staleness
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub key: RowKey,
    #[serde(flatten)]
    pub outcome: SendOutcome,
}

impl SendResult {
    pub fn confirmed(record: RemoteRecord) -> Self {
        Self {
            key: record.key.clone(),
            outcome: SendOutcome::Confirmed { record },
        }
    }

    pub fn conflict(record: RemoteRecord) -> Self {
        Self {
            key: record.key.clone(),
            outcome: SendOutcome::Conflict { record },
        }
    }

    pub fn failed(key: impl Into<RowKey>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            outcome: SendOutcome::Failed {
                reason: reason.into(),
            },
        }
    }
}

/// The network side of sync.
///
/// A whole-call error is a transport failure: nothing was stored and every row
/// in the batch stays pending. Per-item failures are reported in the results.
pub trait Transport: Send + Sync {
    /// Send records and return one result per record.
    fn send_batch(
        &self,
        items: Vec<RemoteRecord>,
    ) -> impl Future<Output = Result<Vec<SendResult>>> + Send;

    /// Remote changes since the last call. Finite; call again to poll.
    fn receive_batch(&self) -> BoxStream<'_, Result<WireRecord>>;
}

/// Rows handled by one send pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReport {
    pub confirmed: Vec<RowKey>,
    pub conflicted: Vec<RowKey>,
    pub failed: Vec<RowKey>,
}

impl SendReport {
    pub fn sent(&self) -> usize {
        self.confirmed.len() + self.conflicted.len() + self.failed.len()
    }
}

/// An incoming item that could not be applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchFailure {
    pub key: RowKey,
    pub reason: String,
}

/// Items handled by one fetch pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchReport {
    pub applied: Vec<UpsertOutcome>,
    pub failures: Vec<FetchFailure>,
}

impl FetchReport {
    pub fn merged(&self) -> usize {
        self.count(UpsertPath::Merge)
    }

    pub fn fast_path(&self) -> usize {
        self.count(UpsertPath::FastPath)
    }

    fn count(&self, path: UpsertPath) -> usize {
        self.applied.iter().filter(|o| o.path == path).count()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub sent: SendReport,
    pub fetched: FetchReport,
}

/// Rows of one batch that still wait for a send result.
///
/// On drop, any of them still `Uploading` goes back to `PendingUpload`.
struct InFlight<'a> {
    states: &'a DashMap<RowKey, RowSyncState>,
    keys: BTreeSet<RowKey>,
}

impl<'a> InFlight<'a> {
    fn new(states: &'a DashMap<RowKey, RowSyncState>) -> Self {
        Self {
            states,
            keys: BTreeSet::new(),
        }
    }

    fn track(&mut self, key: RowKey) {
        self.keys.insert(key);
    }

    fn release(&mut self, key: &str) -> bool {
        self.keys.remove(key)
    }

    fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        for key in &self.keys {
            if let Some(mut state) = self.states.get_mut(key) {
                if *state == RowSyncState::Uploading {
                    *state = RowSyncState::PendingUpload;
                }
            }
        }
        if !self.keys.is_empty() {
            debug!(rows = self.keys.len(), "returned unsent rows to pending");
        }
    }
}

/// Drives rows of a [`LocalStore`] through send and fetch.
pub struct SyncCoordinator<T, C = JsonCodec> {
    store: Arc<LocalStore>,
    transport: T,
    codec: C,
    config: SyncConfig,
    states: DashMap<RowKey, RowSyncState>,
    /// Uploading rows whose ancestor a fetch replaced
    superseded: DashSet<RowKey>,
}

impl<T: Transport> SyncCoordinator<T, JsonCodec> {
    pub fn new(store: Arc<LocalStore>, transport: T, config: SyncConfig) -> Self {
        Self::with_codec(store, transport, JsonCodec::new(), config)
    }
}

impl<T: Transport, C: RecordCodec> SyncCoordinator<T, C> {
    pub fn with_codec(store: Arc<LocalStore>, transport: T, codec: C, config: SyncConfig) -> Self {
        Self {
            store,
            transport,
            codec,
            config,
            states: DashMap::new(),
            superseded: DashSet::new(),
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// State of a row. Rows the coordinator has not handled yet report
    /// `PendingUpload` or `Synced` from their metadata.
    pub fn state(&self, key: &str) -> Option<RowSyncState> {
        if let Some(state) = self.tracked_state(key) {
            return Some(state);
        }
        self.store.metadata(key).map(|m| {
            if m.pending_upload() {
                RowSyncState::PendingUpload
            } else {
                RowSyncState::Synced
            }
        })
    }

    fn tracked_state(&self, key: &str) -> Option<RowSyncState> {
        self.states.get(key).map(|state| *state)
    }

    fn set_state(&self, key: &str, next: RowSyncState) {
        let previous = self.states.insert(key.to_string(), next);
        if previous != Some(next) {
            debug!(key = %key, from = ?previous, to = ?next, "row state changed");
        }
    }

    /// Record a user edit and queue the row for upload.
    ///
    /// A row edited while uploading stays `Uploading`; the edit is sent after
    /// the in-flight result arrives.
    pub fn record_local_edit(
        &self,
        key: &str,
        record_type: &str,
        changes: FieldChanges,
    ) -> BTreeSet<FieldName> {
        let now = self.store.now();
        self.store.with_entry_or_insert(key, record_type, |entry| {
            let changed = entry.write(changes, WriteSource::Local, now);
            if !changed.is_empty() && self.tracked_state(key) != Some(RowSyncState::Uploading) {
                self.set_state(key, RowSyncState::PendingUpload);
            }
            changed
        })
    }

    /// Prepare a pending row for sending and mark it `Uploading`.
    pub fn begin_upload(&self, key: &str) -> Result<PreparedUpload> {
        self.store.with_entry_mut(key, |entry| {
            if self.tracked_state(key) == Some(RowSyncState::Uploading) {
                return Err(Error::AlreadyInFlight(key.to_string()));
            }
            let prepared = upload::prepare_upload(entry)?;
            self.superseded.remove(key);
            self.set_state(key, RowSyncState::Uploading);
            Ok(prepared)
        })?
    }

    /// Return an uploading row to `PendingUpload` without a result.
    pub fn cancel_upload(&self, key: &str) -> bool {
        // Under the row lock, so a send result cannot land in between.
        self.store
            .with_entry_mut(key, |_| match self.states.get_mut(key) {
                Some(mut state) if *state == RowSyncState::Uploading => {
                    *state = RowSyncState::PendingUpload;
                    self.superseded.remove(key);
                    debug!(key = %key, "upload cancelled");
                    true
                }
                _ => false,
            })
            .unwrap_or(false)
    }

    /// State a row settles in once nothing is in flight for it.
    fn settled_state(entry: &RowEntry) -> RowSyncState {
        if entry.metadata.pending_upload() {
            RowSyncState::PendingUpload
        } else {
            RowSyncState::Synced
        }
    }

    /// Apply the result of sending one row.
    pub fn handle_send_result(&self, result: SendResult) -> Result<RowSyncState> {
        let now = self.store.now();
        let key = result.key;
        let tie_break = self.config.tie_break;

        self.store.with_entry_mut(&key, |entry| {
            if self.tracked_state(&key) != Some(RowSyncState::Uploading) {
                return Err(Error::NotInFlight(key.clone()));
            }
            if self.superseded.remove(&key).is_some() {
                debug!(key = %key, "fetch arrived first, dropping send result");
                let settled = Self::settled_state(entry);
                self.set_state(&key, settled);
                return Ok(settled);
            }

            let next = match result.outcome {
                SendOutcome::Confirmed { record } => match upload::confirm_upload(entry, record) {
                    Ok(ConfirmOutcome::Confirmed) => Ok(RowSyncState::Confirmed),
                    Ok(_) => Ok(Self::settled_state(entry)),
                    Err(e) => Err(e),
                },
                SendOutcome::Conflict { record } => {
                    self.set_state(&key, RowSyncState::Conflicted);
                    match upsert::apply_upsert(entry, record, UpsertOrigin::SendConflict, tie_break, now)
                    {
                        Ok(_) => Ok(Self::settled_state(entry)),
                        Err(e) => Err(e),
                    }
                }
                SendOutcome::Failed { reason } => {
                    warn!(key = %key, %reason, "send failed, row stays pending");
                    Ok(Self::settled_state(entry))
                }
            };

            let settled = match &next {
                Ok(state) => *state,
                Err(_) => Self::settled_state(entry),
            };
            self.set_state(&key, settled);
            next
        })?
    }

    /// Apply a fetched remote record.
    pub fn handle_fetched(&self, record: RemoteRecord) -> Result<UpsertOutcome> {
        let now = self.store.now();
        let key = record.key.clone();
        let record_type = record.record_type.clone();
        let tie_break = self.config.tie_break;

        self.store.with_entry_or_insert(&key, &record_type, |entry| {
            let outcome =
                upsert::apply_upsert(entry, record, UpsertOrigin::Fetch, tie_break, now)?;
            // An uploading row waits for its send result.
            if self.tracked_state(&key) == Some(RowSyncState::Uploading) {
                if outcome.path != UpsertPath::Unchanged {
                    self.superseded.insert(key.clone());
                }
            } else {
                self.set_state(&key, Self::settled_state(entry));
            }
            Ok(outcome)
        })
    }

    /// Send every pending row, in batches of `config.batch_size`.
    ///
    /// A transport failure aborts the pass; rows of the failed batch stay
    /// pending.
    pub async fn send_pending(&self) -> Result<SendReport> {
        let keys: Vec<RowKey> = self
            .store
            .pending_keys()
            .into_iter()
            .filter(|key| self.tracked_state(key) != Some(RowSyncState::Uploading))
            .collect();
        let mut report = SendReport::default();

        for chunk in keys.chunks(self.config.batch_size.max(1)) {
            let mut in_flight = InFlight::new(&self.states);
            let mut records = Vec::with_capacity(chunk.len());
            for key in chunk {
                match self.begin_upload(key) {
                    Ok(prepared) => {
                        in_flight.track(key.clone());
                        records.push(prepared.into_record());
                    }
                    // Settled by a concurrent fetch since the key was listed.
                    Err(e) => debug!(key = %key, error = %e, "skipping row"),
                }
            }
            if in_flight.is_empty() {
                continue;
            }

            debug!(rows = records.len(), "sending batch");
            let results = self.transport.send_batch(records).await.map_err(|e| {
                warn!(error = %e, "send batch failed");
                e
            })?;

            for result in results {
                let key = result.key.clone();
                if !in_flight.release(&key) {
                    warn!(key = %key, "result for a row that was not in this batch");
                    continue;
                }
                let bucket = match &result.outcome {
                    SendOutcome::Confirmed { .. } => &mut report.confirmed,
                    SendOutcome::Conflict { .. } => &mut report.conflicted,
                    SendOutcome::Failed { .. } => &mut report.failed,
                };
                match self.handle_send_result(result) {
                    Ok(_) => bucket.push(key),
                    Err(e) => {
                        warn!(key = %key, error = %e, "could not apply send result");
                        report.failed.push(key);
                    }
                }
            }

            for key in &in_flight.keys {
                warn!(key = %key, "no result returned for row");
                report.failed.push(key.clone());
            }
        }

        info!(
            confirmed = report.confirmed.len(),
            conflicted = report.conflicted.len(),
            failed = report.failed.len(),
            "send pass finished"
        );
        Ok(report)
    }

    /// Apply every change the transport has for us.
    ///
    /// Items that fail to decode or apply are reported and skipped. A transport
    /// error ends the pass; items already applied stay applied.
    pub async fn fetch_changes(&self) -> Result<FetchReport> {
        let mut report = FetchReport::default();
        let mut incoming = self.transport.receive_batch();

        while let Some(item) = incoming.next().await {
            let wire = item?;
            let applied = self
                .codec
                .decode(&wire)
                .and_then(|record| self.handle_fetched(record));
            match applied {
                Ok(outcome) => report.applied.push(outcome),
                Err(e) => {
                    warn!(key = %wire.key, error = %e, "skipping incoming record");
                    report.failures.push(FetchFailure {
                        key: wire.key,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            applied = report.applied.len(),
            merged = report.merged(),
            failed = report.failures.len(),
            "fetch pass finished"
        );
        Ok(report)
    }

    /// One send pass followed by one fetch pass.
    pub async fn sync_once(&self) -> Result<SyncReport> {
        let sent = self.send_pending().await?;
        let fetched = self.fetch_changes().await?;
        Ok(SyncReport { sent, fetched })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use futures::stream;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned results and records what was sent.
    #[derive(Default)]
    struct Scripted {
        replies: Mutex<VecDeque<Result<Vec<SendResult>>>>,
        sent: Mutex<Vec<RemoteRecord>>,
        incoming: Mutex<Vec<Result<WireRecord>>>,
    }

    impl Scripted {
        fn reply(self, reply: Result<Vec<SendResult>>) -> Self {
            self.replies.lock().unwrap().push_back(reply);
            self
        }
    }

    impl Transport for Scripted {
        fn send_batch(
            &self,
            items: Vec<RemoteRecord>,
        ) -> impl Future<Output = Result<Vec<SendResult>>> + Send {
            self.sent.lock().unwrap().extend(items);
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()));
            async move { reply }
        }

        fn receive_batch(&self) -> BoxStream<'_, Result<WireRecord>> {
            let items = std::mem::take(&mut *self.incoming.lock().unwrap());
            stream::iter(items).boxed()
        }
    }

    fn coordinator(transport: Scripted) -> SyncCoordinator<Scripted> {
        let store = Arc::new(LocalStore::new(Arc::new(ManualClock::new(100))));
        SyncCoordinator::new(store, transport, SyncConfig::default())
    }

    fn title(value: &str) -> FieldChanges {
        FieldChanges::from([("title".to_string(), Some(json!(value)))])
    }

    #[test]
    fn edit_marks_pending() {
        let sync = coordinator(Scripted::default());
        sync.record_local_edit("note-1", "Note", title("a"));

        assert_eq!(sync.state("note-1"), Some(RowSyncState::PendingUpload));
        assert_eq!(sync.state("missing"), None);
    }

    #[test]
    fn upload_cycle() {
        let sync = coordinator(Scripted::default());
        sync.record_local_edit("note-1", "Note", title("a"));

        let prepared = sync.begin_upload("note-1").unwrap();
        assert_eq!(sync.state("note-1"), Some(RowSyncState::Uploading));
        assert_eq!(
            sync.begin_upload("note-1"),
            Err(Error::AlreadyInFlight("note-1".into()))
        );

        let stored = prepared.into_record().with_change_tag("t1");
        let state = sync.handle_send_result(SendResult::confirmed(stored)).unwrap();

        assert_eq!(state, RowSyncState::Confirmed);
        assert!(!sync.store().metadata("note-1").unwrap().pending_upload());
    }

    #[test]
    fn result_for_idle_row_is_rejected() {
        let sync = coordinator(Scripted::default());
        sync.record_local_edit("note-1", "Note", title("a"));

        let result = sync.handle_send_result(SendResult::failed("note-1", "boom"));
        assert_eq!(result, Err(Error::NotInFlight("note-1".into())));
    }

    #[test]
    fn failed_send_stays_pending() {
        let sync = coordinator(Scripted::default());
        sync.record_local_edit("note-1", "Note", title("a"));
        sync.begin_upload("note-1").unwrap();

        let state = sync
            .handle_send_result(SendResult::failed("note-1", "quota"))
            .unwrap();

        assert_eq!(state, RowSyncState::PendingUpload);
        assert!(sync.store().metadata("note-1").unwrap().pending_upload());
    }

    #[test]
    fn cancel_returns_row_to_pending() {
        let sync = coordinator(Scripted::default());
        sync.record_local_edit("note-1", "Note", title("a"));
        sync.begin_upload("note-1").unwrap();

        assert!(sync.cancel_upload("note-1"));
        assert!(!sync.cancel_upload("note-1"));
        assert_eq!(sync.state("note-1"), Some(RowSyncState::PendingUpload));
    }

    #[test]
    fn fetch_during_upload_keeps_uploading() {
        let sync = coordinator(Scripted::default());
        let base = RemoteRecord::new("note-1", "Note")
            .with_field("title", json!("a"), 10)
            .with_change_tag("t1");
        sync.handle_fetched(base).unwrap();
        sync.record_local_edit("note-1", "Note", title("b"));
        sync.begin_upload("note-1").unwrap();

        let newer = RemoteRecord::new("note-1", "Note")
            .with_field("title", json!("c"), 50)
            .with_field("body", json!("x"), 50)
            .with_change_tag("t2");
        let outcome = sync.handle_fetched(newer).unwrap();

        assert_eq!(outcome.path, UpsertPath::Merge);
        assert_eq!(sync.state("note-1"), Some(RowSyncState::Uploading));
        let row = sync.store().read("note-1").unwrap();
        assert_eq!(row.value("title"), Some(&json!("b")));
        assert_eq!(row.value("body"), Some(&json!("x")));
    }

    #[test]
    fn cancelled_upload_forgets_superseding_fetch() {
        let sync = coordinator(Scripted::default());
        let base = RemoteRecord::new("note-1", "Note")
            .with_field("title", json!("a"), 10)
            .with_change_tag("t1");
        sync.handle_fetched(base).unwrap();
        sync.record_local_edit("note-1", "Note", title("b"));
        sync.begin_upload("note-1").unwrap();

        let newer = RemoteRecord::new("note-1", "Note")
            .with_field("title", json!("a"), 10)
            .with_field("body", json!("x"), 50)
            .with_change_tag("t2");
        sync.handle_fetched(newer).unwrap();
        assert!(sync.cancel_upload("note-1"));
        assert!(!sync.cancel_upload("missing"));

        let retry = sync.begin_upload("note-1").unwrap().into_record();
        assert_eq!(retry.change_tag, Some(crate::ChangeTag::new("t2")));
        let state = sync
            .handle_send_result(SendResult::confirmed(retry.with_change_tag("t3")))
            .unwrap();

        assert_eq!(state, RowSyncState::Confirmed);
        let metadata = sync.store().metadata("note-1").unwrap();
        assert!(!metadata.pending_upload());
        assert_eq!(metadata.change_tag(), Some(&crate::ChangeTag::new("t3")));
    }

    #[test]
    fn record_type_follows_the_remote() {
        let sync = coordinator(Scripted::default());
        sync.handle_fetched(RemoteRecord::new("note-1", "Note").with_change_tag("t1"))
            .unwrap();
        let renamed = RemoteRecord::new("note-1", "Memo")
            .with_field("title", json!("a"), 10)
            .with_change_tag("t2");
        sync.handle_fetched(renamed).unwrap();

        sync.record_local_edit("note-1", "Note", title("b"));
        let draft = sync.begin_upload("note-1").unwrap().into_record();
        assert_eq!(draft.record_type, "Memo");
        assert_eq!(sync.store().read("note-1").unwrap().record_type, "Memo");
    }

    #[tokio::test]
    async fn transport_failure_leaves_rows_pending() {
        let transport = Scripted::default().reply(Err(Error::Transport("offline".into())));
        let sync = coordinator(transport);
        sync.record_local_edit("note-1", "Note", title("a"));

        let result = sync.send_pending().await;

        assert_eq!(result, Err(Error::Transport("offline".into())));
        assert_eq!(sync.state("note-1"), Some(RowSyncState::PendingUpload));
        assert!(sync.store().metadata("note-1").unwrap().pending_upload());
    }

    #[tokio::test]
    async fn missing_results_are_reported_failed() {
        let sync = coordinator(Scripted::default().reply(Ok(Vec::new())));
        sync.record_local_edit("note-1", "Note", title("a"));

        let report = sync.send_pending().await.unwrap();

        assert_eq!(report.failed, vec!["note-1".to_string()]);
        assert_eq!(sync.state("note-1"), Some(RowSyncState::PendingUpload));
    }

    #[tokio::test]
    async fn undecodable_items_are_skipped() {
        let transport = Scripted::default();
        let good = RemoteRecord::new("note-2", "Note").with_field("title", json!("ok"), 5);
        *transport.incoming.lock().unwrap() = vec![
            Ok(WireRecord {
                key: "note-1".into(),
                body: json!("garbage"),
            }),
            JsonCodec::new().encode(&good),
        ];
        let sync = coordinator(transport);

        let report = sync.fetch_changes().await.unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].key, "note-1");
        assert_eq!(report.fast_path(), 1);
        assert_eq!(
            sync.store().read("note-2").unwrap().value("title"),
            Some(&json!("ok"))
        );
    }

    #[test]
    fn send_result_wire_format() {
        let result = SendResult::failed("note-1", "quota");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json, json!({"key": "note-1", "status": "failed", "reason": "quota"}));

        let parsed: SendResult = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, result);
    }
}
