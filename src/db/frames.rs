// db/frames.rs - Typed CRUD for ML training frames

use crate::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

/// One captured pose frame belonging to a workout session.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MLTrainingFrame {
    pub id: i64,
    pub session_id: String,
    pub frame_number: i64,
    pub captured_at: i64,
    pub landmark_blob: Vec<u8>,
    pub angles: Option<String>,
    pub phase: String,
    pub is_valid: bool,
    pub confidence: f64,
    pub synced: bool,
}

#[derive(Debug, Clone)]
pub struct NewFrame {
    pub session_id: String,
    pub frame_number: i64,
    pub captured_at: i64,
    pub landmark_blob: Vec<u8>,
    pub angles: Option<String>,
    pub phase: String,
    pub is_valid: bool,
    pub confidence: f64,
}

/// Inserts a batch of frames for one session in a single transaction.
///
/// Frames are append-only: duplicates on `(session_id,
/// frame_number)` are silently ignored rather than erroring, since the
/// producer API may retry a batch after a partial crash.
pub async fn insert_batch(pool: &SqlitePool, frames: &[NewFrame]) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let mut inserted = 0u64;

    for frame in frames {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO ml_frames (
                session_id, frame_number, captured_at, landmark_blob,
                angles, phase, is_valid, confidence, synced
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&frame.session_id)
        .bind(frame.frame_number)
        .bind(frame.captured_at)
        .bind(&frame.landmark_blob)
        .bind(&frame.angles)
        .bind(&frame.phase)
        .bind(frame.is_valid)
        .bind(frame.confidence)
        .execute(&mut *tx)
        .await?;

        inserted += result.rows_affected();
    }

    tx.commit().await?;
    Ok(inserted)
}

/// Same as `insert_batch`, but scoped to a caller-owned transaction and
/// returning the ids of the rows actually inserted, so the caller can
/// enqueue exactly those ids as the ml-batch queue payload.
pub async fn insert_batch_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    frames: &[NewFrame],
) -> Result<Vec<i64>> {
    let mut ids = Vec::with_capacity(frames.len());

    for frame in frames {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO ml_frames (
                session_id, frame_number, captured_at, landmark_blob,
                angles, phase, is_valid, confidence, synced
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&frame.session_id)
        .bind(frame.frame_number)
        .bind(frame.captured_at)
        .bind(&frame.landmark_blob)
        .bind(&frame.angles)
        .bind(&frame.phase)
        .bind(frame.is_valid)
        .bind(frame.confidence)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() > 0 {
            ids.push(result.last_insert_rowid());
        }
    }

    Ok(ids)
}

pub async fn list_for_session(pool: &SqlitePool, session_id: &str) -> Result<Vec<MLTrainingFrame>> {
    let frames = sqlx::query_as::<_, MLTrainingFrame>(
        "SELECT * FROM ml_frames WHERE session_id = ? ORDER BY frame_number ASC",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    Ok(frames)
}

pub async fn list_unsynced_for_session(
    pool: &SqlitePool,
    session_id: &str,
) -> Result<Vec<MLTrainingFrame>> {
    let frames = sqlx::query_as::<_, MLTrainingFrame>(
        "SELECT * FROM ml_frames WHERE session_id = ? AND synced = 0 ORDER BY frame_number ASC",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    Ok(frames)
}

pub async fn mark_batch_synced(pool: &SqlitePool, ids: &[i64]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    for id in ids {
        sqlx::query("UPDATE ml_frames SET synced = 1 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(())
}

/// Total blob bytes currently stored, for the storage-cap check.
pub async fn total_blob_bytes(pool: &SqlitePool) -> Result<u64> {
    let row: (Option<i64>,) =
        sqlx::query_as("SELECT SUM(LENGTH(landmark_blob)) FROM ml_frames")
            .fetch_one(pool)
            .await?;

    Ok(row.0.unwrap_or(0).max(0) as u64)
}

/// Drops the oldest synced frames until `target_bytes` is under budget.
///
/// Only ever touches already-synced frames: the storage cap is a local
/// disk concern and must never discard data that hasn't reached the server.
pub async fn evict_synced_until_under(pool: &SqlitePool, target_bytes: u64) -> Result<u64> {
    let mut evicted = 0u64;
    loop {
        let current = total_blob_bytes(pool).await?;
        if current <= target_bytes {
            break;
        }

        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM ml_frames WHERE synced = 1 ORDER BY captured_at ASC LIMIT 1",
        )
        .fetch_optional(pool)
        .await?;

        let Some((id,)) = row else {
            break;
        };

        sqlx::query("DELETE FROM ml_frames WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        evicted += 1;
    }

    Ok(evicted)
}
