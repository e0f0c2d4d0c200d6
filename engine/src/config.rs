//! Engine configuration.

use crate::merge::{TieBreak, DEFAULT_TIE_BREAK};
use serde::{Deserialize, Serialize};
use std::env;

/// Default number of rows sent per transport batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Tunables for a sync coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Maximum rows per `send_batch` call
    pub batch_size: usize,
    /// Winner of equal-timestamp field conflicts
    pub tie_break: TieBreak,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            tie_break: DEFAULT_TIE_BREAK,
        }
    }
}

impl SyncConfig {
    /// Load from `FIELDSYNC_BATCH_SIZE` and `FIELDSYNC_TIE_BREAK`, falling back
    /// to defaults for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let batch_size = match lookup("FIELDSYNC_BATCH_SIZE") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::InvalidBatchSize(raw))?,
            None => DEFAULT_BATCH_SIZE,
        };

        let tie_break = match lookup("FIELDSYNC_TIE_BREAK") {
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "client" => TieBreak::Client,
                "server" => TieBreak::Server,
                _ => return Err(ConfigError::InvalidTieBreak(raw)),
            },
            None => DEFAULT_TIE_BREAK,
        };

        Ok(Self {
            batch_size,
            tie_break,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("FIELDSYNC_BATCH_SIZE must be a positive integer, got '{0}'")]
    InvalidBatchSize(String),

    #[error("FIELDSYNC_TIE_BREAK must be 'client' or 'server', got '{0}'")]
    InvalidTieBreak(String),
}
