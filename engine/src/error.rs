//! Error types for the fieldsync engine.
//!
//! Every error is scoped to a single row or a single batch item. Nothing here is
//! fatal to the process: transport failures are retried by the caller's
//! scheduler, decode failures are reported and the item is skipped.

use crate::{FieldName, RecordType, RowKey};
use thiserror::Error;

/// All possible errors from the fieldsync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Row state errors
    #[error("row not found: {0}")]
    RowNotFound(RowKey),

    #[error("row has no pending upload: {0}")]
    NotPendingUpload(RowKey),

    #[error("send result for row that is not uploading: {0}")]
    NotInFlight(RowKey),

    #[error("row is already uploading: {0}")]
    AlreadyInFlight(RowKey),

    #[error("record key mismatch: expected {expected}, got {actual}")]
    KeyMismatch { expected: RowKey, actual: RowKey },

    // Decode errors
    #[error("malformed record {key}: {reason}")]
    Malformed { key: RowKey, reason: String },

    #[error("unknown record type: {0}")]
    UnknownRecordType(RecordType),

    #[error("missing required field: {0}")]
    MissingRequiredField(FieldName),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: FieldName,
        expected: String,
        got: String,
    },

    // Collaborator errors
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl Error {
    /// Whether the failed item should be retried on the next sync pass.
    ///
    /// Decode failures are reported and skipped; retrying them would fail the
    /// same way.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    /// Whether this error came from decoding an incoming wire record.
    pub fn is_decode_failure(&self) -> bool {
        matches!(
            self,
            Error::Malformed { .. }
                | Error::UnknownRecordType(_)
                | Error::MissingRequiredField(_)
                | Error::TypeMismatch { .. }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
