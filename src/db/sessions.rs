// db/sessions.rs - Typed CRUD for workout sessions

use crate::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

/// A single workout session recorded by the producer API.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkoutSession {
    pub id: String,
    pub user_id: String,
    pub exercise_id: String,
    pub total_reps: i64,
    pub valid_reps: i64,
    pub total_points: i64,
    pub orientation: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub duration_seconds: Option<i64>,
    pub is_completed: bool,
    pub synced: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields the producer API is allowed to set when starting a session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: String,
    pub user_id: String,
    pub exercise_id: String,
    pub orientation: String,
    pub started_at: i64,
}

/// Fields mutated when a session is completed or updated mid-flight.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub total_reps: Option<i64>,
    pub valid_reps: Option<i64>,
    pub total_points: Option<i64>,
    pub completed_at: Option<i64>,
    pub duration_seconds: Option<i64>,
    pub is_completed: Option<bool>,
}

pub async fn create(pool: &SqlitePool, new: &NewSession, now: i64) -> Result<WorkoutSession> {
    let session = WorkoutSession {
        id: new.id.clone(),
        user_id: new.user_id.clone(),
        exercise_id: new.exercise_id.clone(),
        total_reps: 0,
        valid_reps: 0,
        total_points: 0,
        orientation: new.orientation.clone(),
        started_at: new.started_at,
        completed_at: None,
        duration_seconds: None,
        is_completed: false,
        synced: false,
        created_at: now,
        updated_at: now,
    };

    sqlx::query(
        r#"
        INSERT INTO sessions (
            id, user_id, exercise_id, total_reps, valid_reps, total_points,
            orientation, started_at, completed_at, duration_seconds,
            is_completed, synced, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&session.id)
    .bind(&session.user_id)
    .bind(&session.exercise_id)
    .bind(session.total_reps)
    .bind(session.valid_reps)
    .bind(session.total_points)
    .bind(&session.orientation)
    .bind(session.started_at)
    .bind(session.completed_at)
    .bind(session.duration_seconds)
    .bind(session.is_completed)
    .bind(session.synced)
    .bind(session.created_at)
    .bind(session.updated_at)
    .execute(pool)
    .await?;

    Ok(session)
}

/// Same as `create`, but scoped to a caller-owned transaction so the
/// session row and its queue item land atomically.
pub async fn create_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    new: &NewSession,
    now: i64,
) -> Result<WorkoutSession> {
    let session = WorkoutSession {
        id: new.id.clone(),
        user_id: new.user_id.clone(),
        exercise_id: new.exercise_id.clone(),
        total_reps: 0,
        valid_reps: 0,
        total_points: 0,
        orientation: new.orientation.clone(),
        started_at: new.started_at,
        completed_at: None,
        duration_seconds: None,
        is_completed: false,
        synced: false,
        created_at: now,
        updated_at: now,
    };

    sqlx::query(
        r#"
        INSERT INTO sessions (
            id, user_id, exercise_id, total_reps, valid_reps, total_points,
            orientation, started_at, completed_at, duration_seconds,
            is_completed, synced, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&session.id)
    .bind(&session.user_id)
    .bind(&session.exercise_id)
    .bind(session.total_reps)
    .bind(session.valid_reps)
    .bind(session.total_points)
    .bind(&session.orientation)
    .bind(session.started_at)
    .bind(session.completed_at)
    .bind(session.duration_seconds)
    .bind(session.is_completed)
    .bind(session.synced)
    .bind(session.created_at)
    .bind(session.updated_at)
    .execute(&mut **tx)
    .await?;

    Ok(session)
}

pub async fn update(
    pool: &SqlitePool,
    id: &str,
    patch: &SessionUpdate,
    now: i64,
) -> Result<Option<WorkoutSession>> {
    let Some(existing) = get(pool, id).await? else {
        return Ok(None);
    };

    let total_reps = patch.total_reps.unwrap_or(existing.total_reps);
    let valid_reps = patch.valid_reps.unwrap_or(existing.valid_reps);
    let total_points = patch.total_points.unwrap_or(existing.total_points);
    let completed_at = patch.completed_at.or(existing.completed_at);
    let duration_seconds = patch.duration_seconds.or(existing.duration_seconds);
    let is_completed = patch.is_completed.unwrap_or(existing.is_completed);

    sqlx::query(
        r#"
        UPDATE sessions SET
            total_reps = ?, valid_reps = ?, total_points = ?,
            completed_at = ?, duration_seconds = ?, is_completed = ?,
            synced = 0, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(total_reps)
    .bind(valid_reps)
    .bind(total_points)
    .bind(completed_at)
    .bind(duration_seconds)
    .bind(is_completed)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    get(pool, id).await
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<WorkoutSession>> {
    let session = sqlx::query_as::<_, WorkoutSession>("SELECT * FROM sessions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(session)
}

pub async fn list_for_user(pool: &SqlitePool, user_id: &str) -> Result<Vec<WorkoutSession>> {
    let sessions = sqlx::query_as::<_, WorkoutSession>(
        "SELECT * FROM sessions WHERE user_id = ? ORDER BY started_at DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(sessions)
}

pub async fn list_unsynced(pool: &SqlitePool) -> Result<Vec<WorkoutSession>> {
    let sessions = sqlx::query_as::<_, WorkoutSession>(
        "SELECT * FROM sessions WHERE synced = 0 ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await?;

    Ok(sessions)
}

pub async fn mark_synced(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("UPDATE sessions SET synced = 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Deletes a session and, via `ON DELETE CASCADE`, its ML frames.
pub async fn delete(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM sessions WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Safety-net garbage collection for unsynced rows past retention.
pub async fn delete_unsynced_older_than(pool: &SqlitePool, cutoff: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE synced = 0 AND created_at < ?")
        .bind(cutoff)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}
