// db/mod.rs - Database module with SQLx integration

pub mod frames;
pub mod migrations;
pub mod sessions;

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Database abstraction with connection pooling.
///
/// Holds the four core tables (sessions, ml frames, sync queue, conflict
/// channel) plus the small user/exercise metadata caches.
/// Cloning is cheap: `SqlitePool` is an `Arc` internally, so every clone
/// shares the same connection pool.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    /// Create a new database connection with migrations applied.
    ///
    /// Uses WAL mode for better concurrency under the orchestrator's
    /// single-writer-many-readers access pattern.
    pub async fn new(db_path: &Path) -> Result<Self> {
        let db_url = format!("sqlite:{}", db_path.display());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        migrations::run(&pool).await?;

        Ok(Self { pool })
    }

    /// Open an ephemeral in-memory database, migrated and ready to use.
    ///
    /// Intended for tests; a single connection is kept open for the
    /// lifetime of the pool since `sqlite::memory:` databases are
    /// per-connection.
    pub async fn new_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        migrations::run(&pool).await?;

        Ok(Self { pool })
    }

    /// Execute a health check query.
    pub async fn health_check(&self) -> Result<bool> {
        let result: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;

        Ok(result.0 == 1)
    }
}

// Ensure pool is Send + Sync for cross-thread sharing
const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn assert_all() {
        assert_send_sync::<Database>();
    }
};
