//! Wire codec for remote records.
//!
//! Transports move [`WireRecord`]s: the row key plus an undecoded JSON body.
//! Decoding happens per item so one malformed record fails alone and the rest
//! of a batch still applies.
//!
//! A [`Schema`] is optional. When a record's type is registered, its fields are
//! checked against the declared [`FieldType`]s; unregistered types pass through
//! unless the codec is strict.

use crate::{error::Result, Error, FieldName, RecordType, RemoteRecord, RowKey, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Field types a schema can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// Milliseconds since the epoch
    Timestamp,
    /// Any JSON value
    Json,
}

impl FieldType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64(),
            FieldType::Json => true,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::String => "string",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Bool => "bool",
            FieldType::Timestamp => "timestamp",
            FieldType::Json => "json",
        };
        f.write_str(name)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A declared field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: FieldName,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldDef {
    pub fn required(name: impl Into<FieldName>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    pub fn optional(name: impl Into<FieldName>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Check a field's value. Absent and null are the same thing.
    pub fn check(&self, value: Option<&Value>) -> Result<()> {
        match value {
            None | Some(Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            None | Some(Value::Null) => Ok(()),
            Some(value) if self.field_type.accepts(value) => Ok(()),
            Some(value) => Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_kind(value).to_string(),
            }),
        }
    }
}

/// Declared fields of one record type. Undeclared fields are allowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSchema {
    pub record_type: RecordType,
    pub fields: Vec<FieldDef>,
}

impl RecordSchema {
    pub fn new(record_type: impl Into<RecordType>, fields: Vec<FieldDef>) -> Self {
        Self {
            record_type: record_type.into(),
            fields,
        }
    }

    pub fn check_fields(&self, fields: &BTreeMap<FieldName, Value>) -> Result<()> {
        self.fields
            .iter()
            .try_for_each(|def| def.check(fields.get(&def.name)))
    }
}

/// Registered record types.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub record_types: BTreeMap<RecordType, RecordSchema>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn with_record_type(mut self, schema: RecordSchema) -> Self {
        self.record_types.insert(schema.record_type.clone(), schema);
        self
    }

    pub fn get(&self, record_type: &str) -> Option<&RecordSchema> {
        self.record_types.get(record_type)
    }
}

/// A record as it travels: key plus undecoded body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireRecord {
    pub key: RowKey,
    pub body: Value,
}

/// Converts between wire and typed records.
pub trait RecordCodec: Send + Sync {
    fn decode(&self, wire: &WireRecord) -> Result<RemoteRecord>;
    fn encode(&self, record: &RemoteRecord) -> Result<WireRecord>;
}

/// JSON codec with optional schema validation.
#[derive(Debug, Clone, Default)]
pub struct JsonCodec {
    schema: Schema,
    strict: bool,
}

impl JsonCodec {
    /// Codec that only checks structure.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate registered record types; pass others through.
    pub fn with_schema(schema: Schema) -> Self {
        Self {
            schema,
            strict: false,
        }
    }

    /// Reject any record type the schema does not register.
    pub fn strict(schema: Schema) -> Self {
        Self {
            schema,
            strict: true,
        }
    }

    fn malformed(key: &str, reason: impl Into<String>) -> Error {
        Error::Malformed {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

impl RecordCodec for JsonCodec {
    fn decode(&self, wire: &WireRecord) -> Result<RemoteRecord> {
        let record: RemoteRecord = serde_json::from_value(wire.body.clone())
            .map_err(|e| Self::malformed(&wire.key, e.to_string()))?;

        if record.key != wire.key {
            return Err(Self::malformed(
                &wire.key,
                format!("body carries key '{}'", record.key),
            ));
        }
        if let Some(newest) = record.field_mod_time.values().max() {
            if *newest > record.overall_mod_time {
                return Err(Self::malformed(
                    &wire.key,
                    format!(
                        "overall mod time {} older than field mod time {}",
                        record.overall_mod_time, newest
                    ),
                ));
            }
        }

        match self.schema.get(&record.record_type) {
            Some(schema) => schema.check_fields(&record.fields)?,
            None if self.strict => {
                return Err(Error::UnknownRecordType(record.record_type.clone()))
            }
            None => {}
        }

        Ok(record)
    }

    fn encode(&self, record: &RemoteRecord) -> Result<WireRecord> {
        let body =
            serde_json::to_value(record).map_err(|e| Self::malformed(&record.key, e.to_string()))?;
        Ok(WireRecord {
            key: record.key.clone(),
            body,
        })
    }
}
