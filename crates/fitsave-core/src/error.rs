//! Backend errors raised while opening, migrating, or querying a result store

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Raw failure from one of the storage engines, before it is classified as a
/// [`crate::db::StorageError`].
#[derive(Error, Debug)]
pub enum Error {
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    #[error("Postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// Creating the database directory or file failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored `data`/`payload` column no longer parses as JSON
    #[error("Stored JSON is unreadable: {0}")]
    Serialization(#[from] serde_json::Error),
}
