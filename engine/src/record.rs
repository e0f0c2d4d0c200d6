//! Record types: the local row and the remote-side snapshot of it.

use crate::{FieldName, RecordType, RowKey, Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Field edits applied to a row. `None` clears the field.
pub type FieldChanges = BTreeMap<FieldName, Option<Value>>;

/// Opaque version marker assigned by the remote to every saved record.
///
/// The engine never interprets it; it is carried back on the next send so the
/// remote can detect that the client's view is stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeTag(String);

impl ChangeTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChangeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A remote-side snapshot of one row.
///
/// `overall_mod_time` is the max of `field_mod_time` at the moment the remote
/// last validated the record. It is not the remote's persistence timestamp,
/// which has no local equivalent and is never used for arbitration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    /// Key of the row this record mirrors
    pub key: RowKey,
    /// Record type (table name on the local side)
    pub record_type: RecordType,
    /// Field values
    #[serde(default)]
    pub fields: BTreeMap<FieldName, Value>,
    /// Per-field modification timestamps
    #[serde(default)]
    pub field_mod_time: BTreeMap<FieldName, Timestamp>,
    /// Max of the per-field timestamps
    #[serde(default)]
    pub overall_mod_time: Timestamp,
    /// Remote version marker; `None` for a record never saved remotely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_tag: Option<ChangeTag>,
}

impl RemoteRecord {
    /// Create an empty record with no fields and no change tag.
    pub fn new(key: impl Into<RowKey>, record_type: impl Into<RecordType>) -> Self {
        Self {
            key: key.into(),
            record_type: record_type.into(),
            fields: BTreeMap::new(),
            field_mod_time: BTreeMap::new(),
            overall_mod_time: 0,
            change_tag: None,
        }
    }

    /// Builder-style setter; also raises `overall_mod_time`.
    pub fn with_field(mut self, name: impl Into<FieldName>, value: Value, at: Timestamp) -> Self {
        self.set_field(name.into(), Some(value), at);
        self.overall_mod_time = self.overall_mod_time.max(at);
        self
    }

    /// Builder-style change tag setter.
    pub fn with_change_tag(mut self, tag: impl Into<String>) -> Self {
        self.change_tag = Some(ChangeTag::new(tag));
        self
    }

    pub fn value(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Modification time of a field; fields never stamped read as 0.
    pub fn mod_time_of(&self, field: &str) -> Timestamp {
        self.field_mod_time.get(field).copied().unwrap_or(0)
    }

    /// Set (or clear) a field and stamp its modification time.
    pub fn set_field(&mut self, name: FieldName, value: Option<Value>, at: Timestamp) {
        match value {
            Some(value) => {
                self.fields.insert(name.clone(), value);
            }
            None => {
                self.fields.remove(&name);
            }
        }
        self.field_mod_time.insert(name, at);
    }

    /// Recompute `overall_mod_time` as the max of all per-field timestamps.
    pub fn recompute_overall_mod_time(&mut self) {
        self.overall_mod_time = self.field_mod_time.values().copied().max().unwrap_or(0);
    }

    /// Every field name that has a value or a timestamp.
    pub fn field_names(&self) -> BTreeSet<&FieldName> {
        self.fields.keys().chain(self.field_mod_time.keys()).collect()
    }

    /// The system-only projection of this record.
    pub fn system_fields(&self) -> RemoteRecordSystemFields {
        RemoteRecordSystemFields {
            key: self.key.clone(),
            record_type: self.record_type.clone(),
            change_tag: self.change_tag.clone(),
            overall_mod_time: self.overall_mod_time,
        }
    }

    /// Whether this record holds exactly the given field values.
    pub fn has_values(&self, fields: &BTreeMap<FieldName, Value>) -> bool {
        &self.fields == fields
    }
}

/// Identity and version of a remote record, without field data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecordSystemFields {
    pub key: RowKey,
    pub record_type: RecordType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_tag: Option<ChangeTag>,
    pub overall_mod_time: Timestamp,
}

/// A row in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    pub key: RowKey,
    pub record_type: RecordType,
    #[serde(default)]
    pub fields: BTreeMap<FieldName, Value>,
}

impl Row {
    /// Create an empty row.
    pub fn new(key: impl Into<RowKey>, record_type: impl Into<RecordType>) -> Self {
        Self {
            key: key.into(),
            record_type: record_type.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn value(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Apply field changes and return the names of fields whose value actually
    /// changed.
    pub fn apply_changes(&mut self, changes: FieldChanges) -> BTreeSet<FieldName> {
        let mut changed = BTreeSet::new();
        for (name, value) in changes {
            let differs = self.fields.get(&name) != value.as_ref();
            if !differs {
                continue;
            }
            match value {
                Some(value) => {
                    self.fields.insert(name.clone(), value);
                }
                None => {
                    self.fields.remove(&name);
                }
            }
            changed.insert(name);
        }
        changed
    }
}
