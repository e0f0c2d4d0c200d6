//! # Fieldsync Engine
//!
//! Field-wise last-write-wins sync and conflict resolution for local-first
//! stores.
//!
//! A local row store is kept in step with an authoritative remote record store.
//! Rows are edited offline, uploaded later, and merged against concurrent
//! remote changes field by field, using the last state both sides agreed on as
//! the three-way merge baseline.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches files or the network; the remote is
//!   reached through the [`Transport`] trait
//! - **Pure merge**: [`MergeConflict::resolve`] is a function of its three
//!   inputs and nothing else
//! - **Confirmed baselines only**: an unconfirmed client record can never
//!   replace a confirmed merge ancestor ([`ConfirmedSnapshot`] vs
//!   [`DraftSnapshot`])
//! - **Per-row serialization**: a row and its [`SyncMetadata`] change together
//!   under one lock
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`RemoteRecord`] carries field values, a per-field modification time, the
//! max of those times, and an opaque [`ChangeTag`] the remote uses to detect
//! stale sends. A local [`Row`] carries only values; the row's single
//! modification time lives in its [`SyncMetadata`].
//!
//! ### Merge
//!
//! Each field is resolved on its own:
//! - same value on both sides: kept;
//! - changed on one side only: that side wins;
//! - changed on both sides: the newer per-field timestamp wins, equal
//!   timestamps go to [`DEFAULT_TIE_BREAK`].
//!
//! ### Sync
//!
//! [`SyncCoordinator`] moves rows through
//! `Synced -> PendingUpload -> Uploading -> Confirmed`, detouring through
//! `Conflicted` when the remote rejects a stale send.
//!
//! ## Quick Start
//!
//! ```rust
//! use fieldsync_engine::{
//!     FieldChanges, LocalStore, RemoteRecord, UpsertOrigin, UpsertPath, DEFAULT_TIE_BREAK,
//! };
//! use serde_json::json;
//!
//! let store = LocalStore::default();
//!
//! // A record arrives from the remote.
//! let remote = RemoteRecord::new("note-1", "Note")
//!     .with_field("title", json!("hello"), 100)
//!     .with_change_tag("t1");
//! let outcome = store
//!     .apply_upsert(remote, UpsertOrigin::Fetch, DEFAULT_TIE_BREAK)
//!     .unwrap();
//! assert_eq!(outcome.path, UpsertPath::FastPath);
//!
//! // The user edits it offline.
//! let changes = FieldChanges::from([("title".to_string(), Some(json!("hi")))]);
//! store.write_local("note-1", "Note", changes);
//! assert!(store.metadata("note-1").unwrap().pending_upload());
//!
//! // The draft for upload carries the remote's change tag.
//! let prepared = store.prepare_upload("note-1").unwrap();
//! assert_eq!(prepared.record().value("title"), Some(&json!("hi")));
//! assert_eq!(prepared.record().change_tag.as_ref().unwrap().as_str(), "t1");
//! ```
//!
//! ## Persistence
//!
//! Use [`LocalStore::export_state`] and [`LocalStore::import_state`] with
//! [`StoreSnapshot`]. Snapshots serialize to JSON with deterministic ordering.

pub mod clock;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod merge;
pub mod metadata;
pub mod record;
pub mod snapshot;
pub mod store;
pub mod upload;
pub mod upsert;
pub mod version;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{FieldDef, FieldType, JsonCodec, RecordCodec, RecordSchema, Schema, WireRecord};
pub use config::{ConfigError, SyncConfig, DEFAULT_BATCH_SIZE};
pub use coordinator::{
    FetchFailure, FetchReport, RowSyncState, SendOutcome, SendReport, SendResult, SyncCoordinator,
    SyncReport, Transport,
};
pub use error::Error;
pub use merge::{
    FieldDecision, FieldResolution, MergeConflict, MergeResolution, Side, TieBreak,
    DEFAULT_TIE_BREAK,
};
pub use metadata::{Refresh, RefreshOutcome, SyncMetadata};
pub use record::{ChangeTag, FieldChanges, RemoteRecord, RemoteRecordSystemFields, Row};
pub use snapshot::{
    ConfirmedSnapshot, DraftSnapshot, PersistedRow, StoreSnapshot, SNAPSHOT_FORMAT_VERSION,
};
pub use store::{LocalStore, RowChange, RowEntry, WriteSource};
pub use upload::{ConfirmOutcome, PreparedUpload};
pub use upsert::{UpsertOrigin, UpsertOutcome, UpsertPath};
pub use version::RowVersion;

/// Type aliases for clarity
pub type RowKey = String;
pub type FieldName = String;
pub type RecordType = String;
/// Milliseconds since the Unix epoch
pub type Timestamp = u64;
pub type Value = serde_json::Value;
