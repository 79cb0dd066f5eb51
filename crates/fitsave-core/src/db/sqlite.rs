//! Embedded file-backed driver (libSQL local database).
//!
//! One process owns the file. Access inside the process is serialized by an
//! async mutex around the single connection; across processes the engine's own
//! WAL locking and busy timeout apply. Running several writer processes
//! against one file is not supported.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use libsql::{params, Builder, Connection, Database as LibSqlDatabase};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::{decode_data, migrations, StorageDriver, StorageResult};
use crate::config::DriverKind;
use crate::error::Result;
use crate::key::derive_key;
use crate::models::{OwnerId, SavedResult, SubmissionRecord};
use crate::util::unix_millis_now;

const SELECT_COLUMNS: &str =
    "result_key, calculator_type, calculator_name, data, created_at, updated_at";

/// Storage driver over a local libSQL file.
pub struct EmbeddedDriver {
    _db: LibSqlDatabase,
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl EmbeddedDriver {
    /// Open (creating if needed) the database file at `path`.
    ///
    /// Parent directories are created recursively.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let path_str = path.to_string_lossy().to_string();
        let db = Builder::new_local(&path_str).build().await?;
        let conn = db.connect()?;
        configure(&conn).await?;

        tracing::info!(path = %path.display(), "Opened embedded result store");
        Ok(Self {
            _db: db,
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    /// Open an in-memory database (useful for testing)
    pub async fn open_in_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        let conn = db.connect()?;
        configure(&conn).await?;
        Ok(Self {
            _db: db,
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn fetch(
        conn: &Connection,
        owner: &OwnerId,
        result_key: &str,
    ) -> StorageResult<Option<SavedResult>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM saved_results WHERE owner_id = ?1 AND result_key = ?2"
        );
        let mut rows = conn
            .query(&sql, params![owner.storage_key(), result_key])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(parse_row(&row, owner)?)),
            None => Ok(None),
        }
    }
}

/// Tune `SQLite` for a single-writer web process.
async fn configure(conn: &Connection) -> Result<()> {
    // journal_mode/busy_timeout report a row back; ignore the "returned rows" complaint
    conn.execute("PRAGMA journal_mode = WAL;", ()).await.ok();
    conn.execute("PRAGMA busy_timeout = 5000;", ()).await.ok();
    conn.execute("PRAGMA synchronous = NORMAL;", ()).await.ok();
    Ok(())
}

fn parse_row(row: &libsql::Row, owner: &OwnerId) -> StorageResult<SavedResult> {
    let data: String = row.get(3)?;
    Ok(SavedResult {
        owner_id: owner.clone(),
        result_key: row.get(0)?,
        calculator_type: row.get(1)?,
        calculator_name: row.get(2)?,
        data: decode_data(&data)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

#[async_trait]
impl StorageDriver for EmbeddedDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Sqlite
    }

    async fn init(&self) -> StorageResult<()> {
        let conn = self.conn.lock().await;
        migrations::run(&conn).await?;
        Ok(())
    }

    async fn upsert_saved_result(
        &self,
        owner: &OwnerId,
        calculator_type: &str,
        calculator_name: &str,
        data: &Map<String, Value>,
    ) -> StorageResult<SavedResult> {
        let result_key = derive_key(calculator_type, data);
        let encoded = serde_json::to_string(data)?;
        let now = unix_millis_now();

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO saved_results
                (owner_id, result_key, calculator_type, calculator_name, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(owner_id, result_key) DO UPDATE SET
                calculator_type = excluded.calculator_type,
                calculator_name = excluded.calculator_name,
                data = excluded.data,
                updated_at = excluded.updated_at",
            params![
                owner.storage_key(),
                result_key.clone(),
                calculator_type.trim().to_string(),
                calculator_name.trim().to_string(),
                encoded,
                now
            ],
        )
        .await?;

        Self::fetch(&conn, owner, &result_key).await?.ok_or_else(|| {
            super::StorageError::Backend(format!("upserted row {result_key} was not readable"))
        })
    }

    async fn get_saved_result(
        &self,
        owner: &OwnerId,
        result_key: &str,
    ) -> StorageResult<Option<SavedResult>> {
        let conn = self.conn.lock().await;
        Self::fetch(&conn, owner, result_key).await
    }

    async fn list_saved_results(
        &self,
        owner: &OwnerId,
        limit: usize,
    ) -> StorageResult<Vec<SavedResult>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM saved_results
             WHERE owner_id = ?1
             ORDER BY updated_at DESC, created_at DESC, result_key ASC
             LIMIT ?2"
        );

        let conn = self.conn.lock().await;
        let mut rows = conn.query(&sql, params![owner.storage_key(), limit]).await?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await? {
            results.push(parse_row(&row, owner)?);
        }
        Ok(results)
    }

    async fn delete_saved_result(&self, owner: &OwnerId, result_key: &str) -> StorageResult<bool> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM saved_results WHERE owner_id = ?1 AND result_key = ?2",
                params![owner.storage_key(), result_key],
            )
            .await?;
        Ok(removed > 0)
    }

    async fn clear_saved_results(&self, owner: &OwnerId) -> StorageResult<u64> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM saved_results WHERE owner_id = ?1",
                params![owner.storage_key()],
            )
            .await?;
        Ok(removed)
    }

    async fn append_submission(&self, record: &SubmissionRecord) -> StorageResult<()> {
        let payload = serde_json::to_string(&record.payload)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO submissions (kind, payload, created_at) VALUES (?1, ?2, ?3)",
            params![record.kind.as_str(), payload, record.created_at],
        )
        .await?;
        Ok(())
    }
}
