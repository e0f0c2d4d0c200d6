//! Applying a remote record to a local row.
//!
//! Two structurally separate paths:
//!
//! - **Fast path**: the row has no pending edits, or has never been confirmed
//!   by the remote. The incoming values are adopted as-is.
//! - **Merge path**: the row has pending edits and the incoming record diverges
//!   from the confirmed ancestor. Fields are resolved by [`crate::merge`] and
//!   only the fields the server won are written.
//!
//! The merged record is never stored as the ancestor. The incoming record is
//! genuine remote state and becomes the new baseline; the client-won fields
//! stay pending until a re-upload is confirmed.

use crate::{
    error::Result,
    merge::{MergeConflict, MergeResolution, TieBreak},
    record::FieldChanges,
    snapshot::ConfirmedSnapshot,
    store::{RowEntry, WriteSource},
    Error, FieldName, RemoteRecord, RowKey, RowVersion, Timestamp, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Where the incoming record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpsertOrigin {
    /// A fetched remote change
    Fetch,
    /// The remote rejected a send and returned its current record
    SendConflict,
}

/// Which path an upsert took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpsertPath {
    FastPath,
    Merge,
    /// Pending edits, but the incoming record is the ancestor itself
    Unchanged,
}

/// Result of one upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub key: RowKey,
    pub path: UpsertPath,
    /// Fields whose local value changed
    pub changed_fields: BTreeSet<FieldName>,
    /// Field resolutions, merge path only
    pub resolution: Option<MergeResolution>,
    /// Server record with client-won fields restored, merge path only.
    /// Not stored; it describes what the next upload will converge to.
    pub merged_record: Option<RemoteRecord>,
    /// Whether local edits are still waiting to be sent
    pub pending_upload: bool,
}

/// Whether an incoming record needs the full merge for this row.
pub fn needs_merge(entry: &RowEntry, incoming: &RemoteRecord) -> bool {
    let metadata = &entry.metadata;
    match metadata.last_known_remote() {
        Some(ancestor) if metadata.pending_upload() => ancestor.record() != incoming,
        _ => false,
    }
}

/// Apply `incoming` to the row.
///
/// `now` is the local time the after-write trigger stamps on the row.
pub fn apply_upsert(
    entry: &mut RowEntry,
    incoming: RemoteRecord,
    origin: UpsertOrigin,
    tie_break: TieBreak,
    now: Timestamp,
) -> Result<UpsertOutcome> {
    if incoming.key != entry.row.key {
        return Err(Error::KeyMismatch {
            expected: entry.row.key.clone(),
            actual: incoming.key,
        });
    }

    let has_pending_ancestor =
        entry.metadata.pending_upload() && entry.metadata.last_known_remote().is_some();

    if !has_pending_ancestor {
        return Ok(fast_path(entry, incoming, now));
    }
    if !needs_merge(entry, &incoming) {
        debug!(key = %entry.row.key, "incoming record equals ancestor, nothing to merge");
        return Ok(UpsertOutcome {
            key: entry.row.key.clone(),
            path: UpsertPath::Unchanged,
            changed_fields: BTreeSet::new(),
            resolution: None,
            merged_record: None,
            pending_upload: true,
        });
    }
    Ok(merge_path(entry, incoming, origin, tie_break, now))
}

fn fast_path(entry: &mut RowEntry, incoming: RemoteRecord, now: Timestamp) -> UpsertOutcome {
    entry.row.record_type.clone_from(&incoming.record_type);
    let changes = adopt_all(&entry.row.fields, &incoming.fields);
    let changed_fields = entry.write(changes, WriteSource::Remote, now);

    entry
        .metadata
        .refresh_confirmed(ConfirmedSnapshot::from_remote(incoming));
    // Local edits of a never-confirmed row were just overwritten.
    entry.metadata.clear_pending_upload();

    debug!(
        key = %entry.row.key,
        changed = changed_fields.len(),
        "applied remote record on fast path"
    );

    UpsertOutcome {
        key: entry.row.key.clone(),
        path: UpsertPath::FastPath,
        changed_fields,
        resolution: None,
        merged_record: None,
        pending_upload: false,
    }
}

fn merge_path(
    entry: &mut RowEntry,
    incoming: RemoteRecord,
    origin: UpsertOrigin,
    tie_break: TieBreak,
    now: Timestamp,
) -> UpsertOutcome {
    let ancestor = entry
        .metadata
        .last_known_remote()
        .map(|snapshot| RowVersion::from_remote(snapshot.record()))
        .unwrap_or_default();
    let client = RowVersion::client(
        &entry.row.fields,
        entry.metadata.user_modification_time(),
        &ancestor,
    );
    let server = RowVersion::from_remote(&incoming);

    let resolution =
        MergeConflict::new(entry.row.key.clone(), ancestor, client, server).resolve_with(tie_break);

    let writes = resolution.server_writes(&entry.row.fields);
    entry.row.record_type.clone_from(&incoming.record_type);
    let changed_fields = entry.write(writes, WriteSource::Remote, now);

    // Trigger time first, then the remote's time for a send conflict, so the
    // re-upload stamps client-won fields consistently.
    if origin == UpsertOrigin::SendConflict {
        entry
            .metadata
            .touch_user_modification_time(incoming.overall_mod_time);
    }

    let merged_record = resolution.merged_record(&incoming);
    let converged = incoming.has_values(&entry.row.fields);
    entry
        .metadata
        .refresh_confirmed(ConfirmedSnapshot::from_remote(incoming));
    if converged {
        entry.metadata.clear_pending_upload();
    }

    debug!(
        key = %entry.row.key,
        ?origin,
        written = changed_fields.len(),
        kept = resolution.client_kept().len(),
        converged,
        "merged remote record"
    );

    UpsertOutcome {
        key: entry.row.key.clone(),
        path: UpsertPath::Merge,
        changed_fields,
        resolution: Some(resolution),
        merged_record: Some(merged_record),
        pending_upload: !converged,
    }
}

/// Changes that make `local` hold exactly `incoming`.
fn adopt_all(
    local: &BTreeMap<FieldName, Value>,
    incoming: &BTreeMap<FieldName, Value>,
) -> FieldChanges {
    local
        .keys()
        .chain(incoming.keys())
        .map(|name| (name.clone(), incoming.get(name).cloned()))
        .collect()
}
