//! Embedded database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;
    if version > CURRENT_VERSION {
        tracing::warn!(
            version,
            supported = CURRENT_VERSION,
            "Embedded database schema is newer than this build; leaving it untouched"
        );
        return Ok(());
    }

    if version < 1 {
        apply(conn, 1, &V1_STATEMENTS).await?;
    }
    if version < 2 {
        apply(conn, 2, &V2_STATEMENTS).await?;
    }

    Ok(())
}

/// Get the current schema version
pub async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Version 1: saved results keyed by owner and content key
const V1_STATEMENTS: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS saved_results (
        owner_id TEXT NOT NULL,
        result_key TEXT NOT NULL,
        calculator_type TEXT NOT NULL,
        calculator_name TEXT NOT NULL,
        data TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (owner_id, result_key)
    )",
    "CREATE INDEX IF NOT EXISTS idx_saved_results_owner_updated
        ON saved_results(owner_id, updated_at DESC)",
    "INSERT INTO schema_version (version) VALUES (1)",
];

/// Version 2: append-only form submissions
const V2_STATEMENTS: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS submissions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_submissions_kind_created ON submissions(kind, created_at DESC)",
    "INSERT INTO schema_version (version) VALUES (2)",
];

/// Apply one migration inside a transaction.
///
/// libsql has no `execute_batch`, so statements run one at a time.
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!(version, "Migrated embedded database");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    async fn setup() -> Connection {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, name: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                [name],
            )
            .await
            .unwrap();
        rows.next()
            .await
            .unwrap()
            .is_some_and(|row| row.get::<i32>(0).unwrap() != 0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
        assert!(table_exists(&conn, "saved_results").await);
        assert!(table_exists(&conn, "submissions").await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_idempotent() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn newer_schema_is_left_untouched() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [CURRENT_VERSION + 1])
            .await
            .unwrap();

        run(&conn).await.unwrap();
        assert_eq!(get_version(&conn).await.unwrap(), CURRENT_VERSION + 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn saved_results_enforce_owner_key_uniqueness() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let insert = "INSERT INTO saved_results
            (owner_id, result_key, calculator_type, calculator_name, data, created_at, updated_at)
            VALUES ('user_a', 'bmi-1', 'bmi', 'BMI', '{}', 1, 1)";
        conn.execute(insert, ()).await.unwrap();
        assert!(conn.execute(insert, ()).await.is_err());
    }
}
