//! Networked PostgreSQL driver.
//!
//! A bounded pool is built lazily from the configured connection string. Every
//! operation checks out one connection and returns it to the pool when the
//! guard drops, on success and failure alike.

use std::str::FromStr;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::Row;

use super::{json_type_name, StorageDriver, StorageError, StorageResult};
use crate::config::{DriverKind, PostgresSettings, PostgresSslMode};
use crate::error::Result;
use crate::key::derive_key;
use crate::models::{OwnerId, SavedResult, SubmissionRecord};
use crate::util::unix_millis_now;

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS saved_results (
        owner_id TEXT NOT NULL,
        result_key TEXT NOT NULL,
        calculator_type TEXT NOT NULL,
        calculator_name TEXT NOT NULL,
        data JSONB NOT NULL,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL,
        PRIMARY KEY (owner_id, result_key)
    )",
    "CREATE INDEX IF NOT EXISTS idx_saved_results_owner_updated
        ON saved_results(owner_id, updated_at DESC)",
    "CREATE TABLE IF NOT EXISTS submissions (
        id BIGSERIAL PRIMARY KEY,
        kind TEXT NOT NULL,
        payload JSONB NOT NULL,
        created_at BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_submissions_kind_created
        ON submissions(kind, created_at DESC)",
];

const RETURNING_COLUMNS: &str =
    "result_key, calculator_type, calculator_name, data, created_at, updated_at";

/// Storage driver backed by a `PostgreSQL` connection pool.
pub struct PostgresDriver {
    pool: PgPool,
}

impl PostgresDriver {
    /// Build the pool without connecting; the first query opens a connection.
    pub fn connect_lazy(settings: &PostgresSettings) -> Result<Self> {
        let options = PgConnectOptions::from_str(&settings.url)?.ssl_mode(ssl_mode(settings.ssl_mode));
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect_lazy_with(options);

        if settings.ssl_mode == PostgresSslMode::Disable {
            tracing::warn!("Postgres TLS is disabled; only use this against a trusted host");
        }
        tracing::info!(
            max_connections = settings.max_connections,
            ssl_mode = ?settings.ssl_mode,
            "Configured postgres result store"
        );
        Ok(Self { pool })
    }
}

const fn ssl_mode(mode: PostgresSslMode) -> PgSslMode {
    match mode {
        PostgresSslMode::Require => PgSslMode::Require,
        PostgresSslMode::Prefer => PgSslMode::Prefer,
        PostgresSslMode::Disable => PgSslMode::Disable,
    }
}

fn parse_row(row: &PgRow, owner: &OwnerId) -> StorageResult<SavedResult> {
    let data = match row.try_get::<Value, _>("data")? {
        Value::Object(map) => map,
        other => {
            return Err(StorageError::Corrupt(format!(
                "expected stored data to be an object, found {}",
                json_type_name(&other)
            )))
        }
    };

    Ok(SavedResult {
        owner_id: owner.clone(),
        result_key: row.try_get("result_key")?,
        calculator_type: row.try_get("calculator_type")?,
        calculator_name: row.try_get("calculator_name")?,
        data,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl StorageDriver for PostgresDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Postgres
    }

    async fn init(&self) -> StorageResult<()> {
        let mut conn = self.pool.acquire().await?;
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&mut *conn).await?;
        }
        tracing::info!("Postgres result store schema ready");
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
        let now = unix_millis_now();
        let sql = format!(
            "INSERT INTO saved_results
                (owner_id, result_key, calculator_type, calculator_name, data, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $6)
             ON CONFLICT (owner_id, result_key) DO UPDATE SET
                calculator_type = EXCLUDED.calculator_type,
                calculator_name = EXCLUDED.calculator_name,
                data = EXCLUDED.data,
                updated_at = EXCLUDED.updated_at
             RETURNING {RETURNING_COLUMNS}"
        );

        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&sql)
            .bind(owner.storage_key())
            .bind(&result_key)
            .bind(calculator_type.trim())
            .bind(calculator_name.trim())
            .bind(Value::Object(data.clone()))
            .bind(now)
            .fetch_one(&mut *conn)
            .await?;

        parse_row(&row, owner)
    }

    async fn get_saved_result(
        &self,
        owner: &OwnerId,
        result_key: &str,
    ) -> StorageResult<Option<SavedResult>> {
        let sql = format!(
            "SELECT {RETURNING_COLUMNS} FROM saved_results WHERE owner_id = $1 AND result_key = $2"
        );
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&sql)
            .bind(owner.storage_key())
            .bind(result_key)
            .fetch_optional(&mut *conn)
            .await?;

        row.map(|row| parse_row(&row, owner)).transpose()
    }

    async fn list_saved_results(
        &self,
        owner: &OwnerId,
        limit: usize,
    ) -> StorageResult<Vec<SavedResult>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {RETURNING_COLUMNS} FROM saved_results
             WHERE owner_id = $1
             ORDER BY updated_at DESC, created_at DESC, result_key ASC
             LIMIT $2"
        );

        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&sql)
            .bind(owner.storage_key())
            .bind(limit)
            .fetch_all(&mut *conn)
            .await?;

        rows.iter().map(|row| parse_row(row, owner)).collect()
    }

    async fn delete_saved_result(&self, owner: &OwnerId, result_key: &str) -> StorageResult<bool> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query("DELETE FROM saved_results WHERE owner_id = $1 AND result_key = $2")
            .bind(owner.storage_key())
            .bind(result_key)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_saved_results(&self, owner: &OwnerId) -> StorageResult<u64> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query("DELETE FROM saved_results WHERE owner_id = $1")
            .bind(owner.storage_key())
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    async fn append_submission(&self, record: &SubmissionRecord) -> StorageResult<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("INSERT INTO submissions (kind, payload, created_at) VALUES ($1, $2, $3)")
            .bind(record.kind.as_str())
            .bind(Value::Object(record.payload.clone()))
            .bind(record.created_at)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::models::AccountId;

    fn settings(url: &str) -> PostgresSettings {
        PostgresSettings {
            url: url.to_string(),
            ssl_mode: PostgresSslMode::Disable,
            max_connections: 2,
            acquire_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn lazy_pool_does_not_connect_up_front() {
        let driver = PostgresDriver::connect_lazy(&settings("postgres://u:p@127.0.0.1:1/fit")).unwrap();
        assert_eq!(driver.kind(), DriverKind::Postgres);
        assert!(driver.init().await.is_err());
    }

    #[tokio::test]
    async fn malformed_connection_string_is_rejected() {
        assert!(PostgresDriver::connect_lazy(&settings("postgres://u:p@host:notaport/fit")).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "requires FITSAVE_TEST_POSTGRES_URL"]
    async fn round_trip_against_live_server() {
        let Ok(url) = std::env::var("FITSAVE_TEST_POSTGRES_URL") else {
            return;
        };
        let driver = PostgresDriver::connect_lazy(&settings(&url)).unwrap();
        driver.init().await.unwrap();

        let owner = OwnerId::from(AccountId::new(format!("it-{}", uuid::Uuid::new_v4())).unwrap());
        let data = json!({"bmi": 24.2, "category": "Normal"});
        let data = data.as_object().unwrap();

        let first = driver.upsert_saved_result(&owner, "bmi", "BMI", data).await.unwrap();
        let second = driver.upsert_saved_result(&owner, "bmi", "BMI", data).await.unwrap();
        assert_eq!(first.result_key, "bmi-tuvu0c");
        assert_eq!(first.created_at, second.created_at);

        assert_eq!(driver.list_saved_results(&owner, 30).await.unwrap().len(), 1);
        assert!(driver.delete_saved_result(&owner, &first.result_key).await.unwrap());
        assert_eq!(driver.clear_saved_results(&owner).await.unwrap(), 0);
    }
}
