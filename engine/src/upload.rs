//! Client to remote path: building the record to send and accepting the
//! remote's confirmation.
//!
//! Neither step mutates the row itself. The local row already holds the state
//! the user wants; only its sync metadata moves.

use crate::{
    error::Result,
    metadata::RefreshOutcome,
    snapshot::{ConfirmedSnapshot, DraftSnapshot},
    store::RowEntry,
    Error, RemoteRecord, RowKey,
};
use std::collections::BTreeSet;
use tracing::debug;

/// A draft ready to hand to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedUpload {
    pub key: RowKey,
    pub draft: DraftSnapshot,
    /// Whether the draft seeded the row's baseline (first upload only)
    pub baseline: RefreshOutcome,
}

impl PreparedUpload {
    pub fn record(&self) -> &RemoteRecord {
        self.draft.record()
    }

    pub fn into_record(self) -> RemoteRecord {
        self.draft.into_record()
    }
}

/// How a confirmation left the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The remote now holds exactly the local row
    Confirmed,
    /// The row was edited while the upload was in flight and still has
    /// unsent changes
    StillPending,
    /// A fetch settled the row while the upload was in flight. The fetched
    /// record is at least as new as this confirmation, so it was ignored.
    Superseded,
}

/// Build the record to send for a row.
///
/// Starts from the last confirmed remote record so unchanged fields keep their
/// remote timestamps and the change tag travels back to the remote. Every field
/// the row changed since then is stamped with the row's modification time.
pub fn build_draft(entry: &RowEntry) -> DraftSnapshot {
    let row = &entry.row;
    let metadata = &entry.metadata;

    let mut draft = metadata
        .last_known_remote()
        .map(|snapshot| snapshot.record().clone())
        .unwrap_or_else(|| RemoteRecord::new(row.key.clone(), row.record_type.clone()));
    draft.record_type = row.record_type.clone();

    let names: BTreeSet<_> = row
        .fields
        .keys()
        .chain(draft.fields.keys())
        .cloned()
        .collect();
    let at = metadata.user_modification_time();

    for name in names {
        let current = row.fields.get(&name);
        if current != draft.fields.get(&name) {
            draft.set_field(name, current.cloned(), at);
        }
    }
    draft.recompute_overall_mod_time();

    DraftSnapshot::new(draft)
}

/// Prepare a pending row for sending.
///
/// The draft is offered as the row's baseline, which only takes effect for a
/// row that has never been confirmed by the remote.
pub fn prepare_upload(entry: &mut RowEntry) -> Result<PreparedUpload> {
    if !entry.metadata.pending_upload() {
        return Err(Error::NotPendingUpload(entry.row.key.clone()));
    }

    let draft = build_draft(entry);
    let baseline = entry.metadata.refresh_candidate(&draft);
    match baseline {
        RefreshOutcome::Stored => {
            debug!(key = %entry.row.key, "seeded baseline from first upload");
        }
        RefreshOutcome::Skipped => {
            debug!(key = %entry.row.key, "kept confirmed baseline, draft not stored");
        }
    }

    Ok(PreparedUpload {
        key: entry.row.key.clone(),
        draft,
        baseline,
    })
}

/// Accept the record the remote stored for a successful send.
///
/// A row that is no longer pending was settled by a fetch that arrived first;
/// its ancestor is already newer than `confirmed` and is left alone.
pub fn confirm_upload(entry: &mut RowEntry, confirmed: RemoteRecord) -> Result<ConfirmOutcome> {
    if confirmed.key != entry.row.key {
        return Err(Error::KeyMismatch {
            expected: entry.row.key.clone(),
            actual: confirmed.key,
        });
    }
    if !entry.metadata.pending_upload() {
        debug!(key = %entry.row.key, "row already settled by a fetch, ignoring late confirmation");
        return Ok(ConfirmOutcome::Superseded);
    }

    let overall_mod_time = confirmed.overall_mod_time;
    let converged = confirmed.has_values(&entry.row.fields);
    entry
        .metadata
        .refresh_confirmed(ConfirmedSnapshot::from_confirmed_send(confirmed));

    if converged {
        entry.metadata.touch_user_modification_time(overall_mod_time);
        entry.metadata.clear_pending_upload();
        Ok(ConfirmOutcome::Confirmed)
    } else {
        debug!(key = %entry.row.key, "row changed during upload, staying pending");
        entry.metadata.mark_pending_upload();
        Ok(ConfirmOutcome::StillPending)
    }
}
