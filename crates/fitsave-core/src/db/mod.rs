//! Storage drivers for fitsave
//!
//! Two interchangeable backends sit behind [`StorageDriver`]: an embedded
//! libSQL file and a pooled PostgreSQL connection. The persistence gateway
//! picks one at startup and never looks at configuration again.

mod migrations;
mod postgres;
mod sqlite;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::DriverKind;
use crate::error::Error;
use crate::models::{OwnerId, SavedResult, SubmissionRecord};

pub use postgres::PostgresDriver;
pub use sqlite::EmbeddedDriver;

/// Driver-level failure (disk, connection, or corrupt row).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failure: {0}")]
    Io(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("stored data is invalid: {0}")]
    Corrupt(String),
}

impl From<Error> for StorageError {
    fn from(error: Error) -> Self {
        match error {
            Error::Io(inner) => Self::Io(inner.to_string()),
            Error::Serialization(inner) => Self::Corrupt(inner.to_string()),
            Error::LibSql(inner) => Self::Backend(inner.to_string()),
            Error::Postgres(inner) => Self::Backend(inner.to_string()),
        }
    }
}

impl From<libsql::Error> for StorageError {
    fn from(error: libsql::Error) -> Self {
        Error::from(error).into()
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(error: sqlx::Error) -> Self {
        Error::from(error).into()
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(error: serde_json::Error) -> Self {
        Error::from(error).into()
    }
}

impl From<std::io::Error> for StorageError {
    fn from(error: std::io::Error) -> Self {
        Error::from(error).into()
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Contract shared by both storage backends.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> DriverKind;

    /// Create files and tables if needed. Safe to call on every start.
    async fn init(&self) -> StorageResult<()>;

    /// Insert or overwrite the result keyed by `(owner, derive_key(type, data))`.
    ///
    /// `created_at` of an existing row is preserved.
    async fn upsert_saved_result(
        &self,
        owner: &OwnerId,
        calculator_type: &str,
        calculator_name: &str,
        data: &Map<String, Value>,
    ) -> StorageResult<SavedResult>;

    /// Fetch a single result by key.
    async fn get_saved_result(
        &self,
        owner: &OwnerId,
        result_key: &str,
    ) -> StorageResult<Option<SavedResult>>;

    /// Newest first, at most `limit` rows.
    async fn list_saved_results(
        &self,
        owner: &OwnerId,
        limit: usize,
    ) -> StorageResult<Vec<SavedResult>>;

    /// Returns whether a row was removed.
    async fn delete_saved_result(&self, owner: &OwnerId, result_key: &str) -> StorageResult<bool>;

    /// Returns the number of rows removed.
    async fn clear_saved_results(&self, owner: &OwnerId) -> StorageResult<u64>;

    async fn append_submission(&self, record: &SubmissionRecord) -> StorageResult<()>;
}

/// Decode a stored JSON object column.
fn decode_data(raw: &str) -> StorageResult<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(StorageError::Corrupt(format!(
            "expected stored data to be an object, found {}",
            json_type_name(&other)
        ))),
    }
}

const fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
