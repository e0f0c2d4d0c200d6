//! Three-way, field-by-field merge.
//!
//! Given the ancestor, client and server versions of one row, every field is
//! resolved independently:
//!
//! 1. client == server: nothing to decide, keep the value.
//! 2. only the server changed it since the ancestor: take the server value.
//! 3. only the client changed it since the ancestor: keep the client value.
//! 4. both changed it to different values: the strictly newer per-field
//!    timestamp wins; equal timestamps go to [`DEFAULT_TIE_BREAK`] unless the
//!    caller passes another [`TieBreak`].
//!
//! The merge is a pure function of its inputs. It reads no clock and touches no
//! storage, so resolving the same conflict twice yields the same result.

use crate::{
    record::FieldChanges, FieldName, RemoteRecord, RowKey, RowVersion, Timestamp, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Side that wins a field changed by both at the same timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TieBreak {
    Client,
    Server,
}

/// Tie-break used when nothing else is configured.
pub const DEFAULT_TIE_BREAK: TieBreak = TieBreak::Client;

impl Default for TieBreak {
    fn default() -> Self {
        DEFAULT_TIE_BREAK
    }
}

/// One side of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Side {
    Client,
    Server,
}

impl From<TieBreak> for Side {
    fn from(tie_break: TieBreak) -> Self {
        match tie_break {
            TieBreak::Client => Side::Client,
            TieBreak::Server => Side::Server,
        }
    }
}

/// Why a field resolved the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldDecision {
    /// Client and server hold the same value
    Agreed,
    /// Only the server changed the field since the ancestor
    ServerOnly,
    /// Only the client changed the field since the ancestor
    ClientOnly,
    /// Both changed it; the server's timestamp is newer
    ServerNewer,
    /// Both changed it; the client's timestamp is newer
    ClientNewer,
    /// Both changed it at the same timestamp
    Tie(Side),
}

impl FieldDecision {
    /// Side whose value survives. Agreed fields report the client, whose value
    /// is identical anyway.
    pub fn winner(&self) -> Side {
        match self {
            FieldDecision::Agreed | FieldDecision::ClientOnly | FieldDecision::ClientNewer => {
                Side::Client
            }
            FieldDecision::ServerOnly | FieldDecision::ServerNewer => Side::Server,
            FieldDecision::Tie(side) => *side,
        }
    }

    /// Whether client and server actually disagreed on this field.
    pub fn is_contested(&self) -> bool {
        !matches!(self, FieldDecision::Agreed)
    }
}

/// Outcome for a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldResolution {
    pub decision: FieldDecision,
    /// Surviving value; `None` when the winning side has no value
    pub value: Option<Value>,
    /// Timestamp carried by the winning side
    pub timestamp: Timestamp,
}

/// A genuine conflict: pending local edits against a divergent remote state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeConflict {
    pub key: RowKey,
    pub ancestor: RowVersion,
    pub client: RowVersion,
    pub server: RowVersion,
}

impl MergeConflict {
    pub fn new(
        key: impl Into<RowKey>,
        ancestor: RowVersion,
        client: RowVersion,
        server: RowVersion,
    ) -> Self {
        Self {
            key: key.into(),
            ancestor,
            client,
            server,
        }
    }

    /// Resolve with [`DEFAULT_TIE_BREAK`].
    pub fn resolve(&self) -> MergeResolution {
        self.resolve_with(DEFAULT_TIE_BREAK)
    }

    /// Resolve every field that any of the three versions knows about.
    pub fn resolve_with(&self, tie_break: TieBreak) -> MergeResolution {
        let names: BTreeSet<&FieldName> = self
            .ancestor
            .field_names()
            .chain(self.client.field_names())
            .chain(self.server.field_names())
            .collect();

        let fields = names
            .into_iter()
            .map(|name| {
                let resolution =
                    resolve_field(&self.ancestor, &self.client, &self.server, name, tie_break);
                (name.clone(), resolution)
            })
            .collect();

        MergeResolution {
            key: self.key.clone(),
            fields,
        }
    }
}

/// Resolve one field.
pub fn resolve_field(
    ancestor: &RowVersion,
    client: &RowVersion,
    server: &RowVersion,
    field: &str,
    tie_break: TieBreak,
) -> FieldResolution {
    let a = ancestor.value(field);
    let c = client.value(field);
    let s = server.value(field);
    let client_ts = client.timestamp_of(field);
    let server_ts = server.timestamp_of(field);

    let decision = if c == s {
        FieldDecision::Agreed
    } else if a == c {
        FieldDecision::ServerOnly
    } else if a == s {
        FieldDecision::ClientOnly
    } else if server_ts > client_ts {
        FieldDecision::ServerNewer
    } else if server_ts < client_ts {
        FieldDecision::ClientNewer
    } else {
        FieldDecision::Tie(tie_break.into())
    };

    let (value, timestamp) = match decision.winner() {
        Side::Client => (c.cloned(), client_ts),
        Side::Server => (s.cloned(), server_ts),
    };
    let timestamp = if decision == FieldDecision::Agreed {
        client_ts.max(server_ts)
    } else {
        timestamp
    };

    FieldResolution {
        decision,
        value,
        timestamp,
    }
}

/// Field-level result of a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResolution {
    pub key: RowKey,
    pub fields: BTreeMap<FieldName, FieldResolution>,
}

impl MergeResolution {
    pub fn get(&self, field: &str) -> Option<&FieldResolution> {
        self.fields.get(field)
    }

    /// Resolved value of a field.
    pub fn value(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).and_then(|r| r.value.as_ref())
    }

    /// The merged row: every field that resolved to a value.
    pub fn resolved_fields(&self) -> BTreeMap<FieldName, Value> {
        self.fields
            .iter()
            .filter_map(|(name, r)| r.value.clone().map(|v| (name.clone(), v)))
            .collect()
    }

    /// Fields the server won, whose value differs from the local row.
    ///
    /// These are the only writes the row needs; every other field already
    /// holds its resolved value locally.
    pub fn server_writes(&self, local: &BTreeMap<FieldName, Value>) -> FieldChanges {
        self.fields
            .iter()
            .filter(|(_, r)| r.decision.winner() == Side::Server)
            .filter(|(name, r)| local.get(*name) != r.value.as_ref())
            .map(|(name, r)| (name.clone(), r.value.clone()))
            .collect()
    }

    /// Fields where the client's value beat a different server value.
    pub fn client_kept(&self) -> BTreeSet<&FieldName> {
        self.fields
            .iter()
            .filter(|(_, r)| r.decision.is_contested() && r.decision.winner() == Side::Client)
            .map(|(name, _)| name)
            .collect()
    }

    /// The server's record with client-won fields restored, value and
    /// timestamp. This is what a re-upload should make the remote hold.
    pub fn merged_record(&self, server: &RemoteRecord) -> RemoteRecord {
        let mut merged = server.clone();
        for name in self.client_kept() {
            if let Some(r) = self.fields.get(name) {
                merged.set_field(name.clone(), r.value.clone(), r.timestamp);
            }
        }
        merged.recompute_overall_mod_time();
        merged
    }

    /// Whether any field needed arbitration.
    pub fn has_contested_fields(&self) -> bool {
        self.fields.values().any(|r| r.decision.is_contested())
    }
}
