// db/migrations.rs - Database schema migrations

use crate::Result;
use sqlx::SqlitePool;

/// Run all database migrations.
///
/// Migrations are idempotent and safe to run multiple times.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    run_if_needed(pool, 1, "create_sessions_table").await?;
    run_if_needed(pool, 2, "create_ml_frames_table").await?;
    run_if_needed(pool, 3, "create_sync_queue_table").await?;
    run_if_needed(pool, 4, "create_metadata_cache_tables").await?;
    run_if_needed(pool, 5, "create_conflict_channel_table").await?;

    Ok(())
}

async fn run_if_needed(pool: &SqlitePool, id: i32, name: &str) -> Result<()> {
    let exists: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _migrations WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;

    if exists.0 == 0 {
        tracing::info!("running migration {}: {}", id, name);

        match id {
            1 => create_sessions_table(pool).await?,
            2 => create_ml_frames_table(pool).await?,
            3 => create_sync_queue_table(pool).await?,
            4 => create_metadata_cache_tables(pool).await?,
            5 => create_conflict_channel_table(pool).await?,
            _ => return Err(crate::Error::Config(format!("unknown migration id: {}", id))),
        }

        sqlx::query("INSERT INTO _migrations (id, name) VALUES (?, ?)")
            .bind(id)
            .bind(name)
            .execute(pool)
            .await?;

        tracing::info!("migration {} completed", id);
    }

    Ok(())
}

/// Migration 1: workout sessions.
async fn create_sessions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE sessions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            exercise_id TEXT NOT NULL,
            total_reps INTEGER NOT NULL DEFAULT 0,
            valid_reps INTEGER NOT NULL DEFAULT 0,
            total_points INTEGER NOT NULL DEFAULT 0,
            orientation TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            completed_at INTEGER,
            duration_seconds INTEGER,
            is_completed INTEGER NOT NULL DEFAULT 0,
            synced INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_synced ON sessions(synced)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Migration 2: append-only ML training frames.
async fn create_ml_frames_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE ml_frames (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            frame_number INTEGER NOT NULL,
            captured_at INTEGER NOT NULL,
            landmark_blob BLOB NOT NULL,
            angles TEXT,
            phase TEXT NOT NULL,
            is_valid INTEGER NOT NULL DEFAULT 1,
            confidence REAL NOT NULL,
            synced INTEGER NOT NULL DEFAULT 0,
            UNIQUE(session_id, frame_number)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_frames_session ON ml_frames(session_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_frames_synced ON ml_frames(session_id, synced)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Migration 3: the durable sync queue.
async fn create_sync_queue_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_kind TEXT NOT NULL CHECK(entity_kind IN ('session', 'ml_batch', 'rep')),
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL CHECK(operation IN ('create', 'update', 'delete')),
            payload BLOB NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(entity_kind, entity_id, operation)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_queue_entity ON sync_queue(entity_kind, entity_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_queue_order ON sync_queue(created_at ASC, id ASC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 4: small read-mostly caches referenced by sessions.
///
/// These are not sync targets themselves — just local copies of metadata
/// the producer API needs to stamp onto sessions.
async fn create_metadata_cache_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE users (
            id TEXT PRIMARY KEY,
            display_name TEXT,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE exercises (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            category TEXT,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 5: durable home for `manual`-strategy conflicts.
async fn create_conflict_channel_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE conflict_channel (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue_item_id INTEGER NOT NULL,
            entity_kind TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            fields TEXT NOT NULL,
            local_snapshot TEXT NOT NULL,
            server_snapshot TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(queue_item_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // no separate index: `UNIQUE(queue_item_id)` above already gives SQLite
    // an implicit index to enforce it.

    Ok(())
}
