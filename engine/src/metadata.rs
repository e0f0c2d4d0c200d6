//! Per-row sync metadata.
//!
//! Each row carries the last remote state it is known to agree with, a
//! system-only copy of that state, the time of the most recent local write, and
//! whether local edits are waiting to be sent.
//!
//! Invariants:
//! - the system-only copy exists iff the full snapshot exists, and is always
//!   its projection;
//! - the full snapshot only ever holds a [`ConfirmedSnapshot`]; a draft can
//!   seed it solely for a row that has never had one.

use crate::{
    record::{ChangeTag, RemoteRecord, RemoteRecordSystemFields},
    snapshot::{ConfirmedSnapshot, DraftSnapshot},
    Timestamp,
};
use serde::{Deserialize, Deserializer, Serialize};

/// How to refresh a row's last-known remote state.
#[derive(Debug, Clone)]
pub enum Refresh<'a> {
    /// The remote confirmed this record: always stored.
    Confirmed(ConfirmedSnapshot),
    /// A client-built draft: stored only if the row has no snapshot yet.
    Candidate(&'a DraftSnapshot),
}

/// What a refresh did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Stored,
    /// A confirmed snapshot already exists and was left untouched
    Skipped,
}

/// Sync state persisted alongside each row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "persisted_snapshot"
    )]
    last_known_remote: Option<ConfirmedSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_known_remote_system: Option<RemoteRecordSystemFields>,
    user_modification_time: Timestamp,
    pending_upload: bool,
}

fn persisted_snapshot<'de, D>(deserializer: D) -> Result<Option<ConfirmedSnapshot>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<RemoteRecord>::deserialize(deserializer)
        .map(|record| record.map(ConfirmedSnapshot::from_persisted))
}

impl SyncMetadata {
    /// Last remote state confirmed for this row (the merge ancestor).
    pub fn last_known_remote(&self) -> Option<&ConfirmedSnapshot> {
        self.last_known_remote.as_ref()
    }

    pub fn last_known_remote_system(&self) -> Option<&RemoteRecordSystemFields> {
        self.last_known_remote_system.as_ref()
    }

    /// Change tag of the last-known remote state, if any.
    pub fn change_tag(&self) -> Option<&ChangeTag> {
        self.last_known_remote_system
            .as_ref()
            .and_then(|s| s.change_tag.as_ref())
    }

    pub fn user_modification_time(&self) -> Timestamp {
        self.user_modification_time
    }

    pub fn pending_upload(&self) -> bool {
        self.pending_upload
    }

    /// Set the row's modification time. Unconditional.
    pub fn touch_user_modification_time(&mut self, at: Timestamp) {
        self.user_modification_time = at;
    }

    pub fn mark_pending_upload(&mut self) {
        self.pending_upload = true;
    }

    /// Cleared only once the remote confirmed the row's current state.
    pub(crate) fn clear_pending_upload(&mut self) {
        self.pending_upload = false;
    }

    /// Apply a refresh and report whether anything was stored.
    pub fn refresh_last_known_remote(&mut self, refresh: Refresh<'_>) -> RefreshOutcome {
        match refresh {
            Refresh::Confirmed(snapshot) => {
                self.refresh_confirmed(snapshot);
                RefreshOutcome::Stored
            }
            Refresh::Candidate(draft) => self.refresh_candidate(draft),
        }
    }

    /// Store a confirmed snapshot, replacing whatever was there.
    pub fn refresh_confirmed(&mut self, snapshot: ConfirmedSnapshot) {
        self.last_known_remote_system = Some(snapshot.record().system_fields());
        self.last_known_remote = Some(snapshot);
    }

    /// Store a draft as the baseline only when the row has none yet.
    ///
    /// An unconfirmed record must never replace a confirmed ancestor: the next
    /// merge would treat client-only edits as already present remotely and drop
    /// them.
    pub fn refresh_candidate(&mut self, draft: &DraftSnapshot) -> RefreshOutcome {
        if self.last_known_remote.is_some() {
            return RefreshOutcome::Skipped;
        }
        self.refresh_confirmed(ConfirmedSnapshot::seed_from_first_draft(draft));
        RefreshOutcome::Stored
    }

    /// Whether the system-only copy matches the full snapshot.
    pub fn is_consistent(&self) -> bool {
        match (&self.last_known_remote, &self.last_known_remote_system) {
            (None, None) => true,
            (Some(full), Some(system)) => &full.record().system_fields() == system,
            _ => false,
        }
    }
}
