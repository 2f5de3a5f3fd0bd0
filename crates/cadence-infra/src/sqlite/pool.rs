//! One tenant database: a single-connection writer and a read-only reader
//! pool over the same WAL-mode file.
//!
//! Foreign keys are enforced on every connection; run deletion cascades on
//! them.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Readers per tenant. Many tenant databases can be open at once.
const READERS: u32 = 4;

#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Connect to `database_url`, creating the file and applying pending
    /// migrations before any reader connects.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(READERS)
            .connect_with(options.read_only(true))
            .await?;

        tracing::debug!(url = database_url, readers = READERS, "tenant database ready");
        Ok(Self { reader, writer })
    }

    pub async fn open(path: &Path) -> Result<Self, sqlx::Error> {
        Self::new(&database_url(path)).await
    }

    /// Waits for in-flight queries on both sides.
    pub async fn close(&self) {
        self.writer.close().await;
        self.reader.close().await;
    }
}

pub fn database_url(path: &Path) -> String {
    format!("sqlite://{}?mode=rwc", path.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn scratch() -> (tempfile::TempDir, DatabasePool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open(&dir.path().join("tenant.db")).await.unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn migrations_create_run_state_tables() {
        let (_dir, pool) = scratch().await;
        let names: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table'")
                .fetch_all(&pool.reader)
                .await
                .unwrap();

        for table in [
            "runs",
            "steps",
            "attempts",
            "artifacts",
            "checkpoints",
            "signals",
            "gate_decisions",
        ] {
            assert!(names.iter().any(|n| n == table), "missing {table}");
        }
    }

    #[tokio::test]
    async fn writer_uses_wal_and_foreign_keys() {
        let (_dir, pool) = scratch().await;
        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        let fk: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(&pool.writer)
            .await
            .unwrap();

        assert_eq!(mode.to_lowercase(), "wal");
        assert_eq!(fk, 1);
    }

    #[tokio::test]
    async fn reader_refuses_writes() {
        let (_dir, pool) = scratch().await;
        let result = sqlx::query("DELETE FROM runs").execute(&pool.reader).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn reopening_skips_applied_migrations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tenant.db");
        DatabasePool::open(&path).await.unwrap().close().await;
        assert!(DatabasePool::open(&path).await.is_ok());
    }

    #[test]
    fn url_creates_missing_files() {
        let url = database_url(Path::new("/var/lib/cadence/acme.db"));
        assert_eq!(url, "sqlite:///var/lib/cadence/acme.db?mode=rwc");
    }
}
