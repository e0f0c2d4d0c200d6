//! Configuration management for the server.

use fieldsync_engine::{JsonCodec, Schema};
use std::env;
use std::fs;
use std::str::FromStr;

/// Default upper bound on records returned by one pull.
pub const DEFAULT_PULL_LIMIT_MAX: i64 = 1000;

/// Default upper bound on records accepted in one push.
pub const DEFAULT_PUSH_BATCH_MAX: usize = 1000;

/// Default size of the database connection pool.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Database pool size
    pub max_connections: u32,
    /// Largest `limit` a pull may ask for
    pub pull_limit_max: i64,
    /// Most records one push may carry
    pub push_batch_max: usize,
    /// JSON file with the record schema to validate pushes against
    pub schema_path: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port = lookup("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::MissingDatabaseUrl)?;

        let max_connections =
            positive(&lookup, "DATABASE_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;
        let pull_limit_max = positive(&lookup, "PULL_LIMIT_MAX", DEFAULT_PULL_LIMIT_MAX)?;
        let push_batch_max = positive(&lookup, "PUSH_BATCH_MAX", DEFAULT_PUSH_BATCH_MAX)?;

        let schema_path = lookup("SCHEMA_PATH");

        Ok(Self {
            host,
            port,
            database_url,
            max_connections,
            pull_limit_max,
            push_batch_max,
            schema_path,
        })
    }
}

impl Config {
    /// The codec pushes are decoded with: schema-checked when a schema file
    /// is configured, structural only otherwise.
    pub fn codec(&self) -> Result<JsonCodec, ConfigError> {
        let Some(path) = &self.schema_path else {
            return Ok(JsonCodec::new());
        };
        let raw = fs::read_to_string(path)
            .map_err(|e| ConfigError::Schema(format!("{}: {}", path, e)))?;
        let schema: Schema = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::Schema(format!("{}: {}", path, e)))?;
        tracing::info!(
            path = %path,
            record_types = schema.record_types.len(),
            "Loaded record schema"
        );
        Ok(JsonCodec::with_schema(schema))
    }
}

/// Parse a positive integer variable, falling back to `default` when unset.
fn positive<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    match lookup(name) {
        Some(raw) => raw
            .parse::<T>()
            .ok()
            .filter(|n| *n > T::default())
            .ok_or(ConfigError::InvalidLimit(name, raw)),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("{0} must be a positive integer, got '{1}'")]
    InvalidLimit(&'static str, String),

    #[error("Failed to load schema: {0}")]
    Schema(String),
}
