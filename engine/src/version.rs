//! Read-only views of a row used as merge inputs.
//!
//! A reconciliation looks at three versions of the same row:
//! - the ancestor, built from the last confirmed remote snapshot;
//! - the client, built from the local row: every field that differs from the
//!   ancestor is stamped with the row's single modification time, the rest
//!   inherit the ancestor's per-field timestamp;
//! - the server, built from the incoming remote record as-is.

use crate::{FieldName, RemoteRecord, Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Field values plus a per-field modification timestamp.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowVersion {
    fields: BTreeMap<FieldName, Value>,
    timestamps: BTreeMap<FieldName, Timestamp>,
}

impl RowVersion {
    /// View of a remote record (ancestor or server role).
    pub fn from_remote(record: &RemoteRecord) -> Self {
        Self {
            fields: record.fields.clone(),
            timestamps: record.field_mod_time.clone(),
        }
    }

    /// View of the local row relative to `ancestor`.
    pub fn client(
        fields: &BTreeMap<FieldName, Value>,
        user_modification_time: Timestamp,
        ancestor: &RowVersion,
    ) -> Self {
        let names: BTreeSet<&FieldName> = fields.keys().chain(ancestor.field_names()).collect();

        let timestamps = names
            .into_iter()
            .map(|name| {
                let at = if fields.get(name) != ancestor.value(name) {
                    user_modification_time
                } else {
                    ancestor.timestamp_of(name)
                };
                (name.clone(), at)
            })
            .collect();

        Self {
            fields: fields.clone(),
            timestamps,
        }
    }

    pub fn value(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Modification time of a field; unknown fields read as 0.
    pub fn timestamp_of(&self, field: &str) -> Timestamp {
        self.timestamps.get(field).copied().unwrap_or(0)
    }

    /// Every field with a value or a timestamp.
    pub fn field_names(&self) -> impl Iterator<Item = &FieldName> {
        self.fields.keys().chain(
            self.timestamps
                .keys()
                .filter(|name| !self.fields.contains_key(*name)),
        )
    }

    pub fn fields(&self) -> &BTreeMap<FieldName, Value> {
        &self.fields
    }
}
