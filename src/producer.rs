// producer.rs - Producer-facing API
//
// The capture subsystem is a collaborator, not part of the kernel: it calls these three methods and gets back a persisted, enqueued
// record. Precondition violations are rejected here, before anything is
// queued.

use crate::conflict::EntitySnapshot;
use crate::db::frames::{self, NewFrame};
use crate::db::sessions::{self, NewSession, SessionUpdate, WorkoutSession};
use crate::queue::{self, EntityKind, Operation};
use crate::{Error, Result, SyncKernel};
use serde::{Deserialize, Serialize};

/// Final counters supplied when a capture completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionStats {
    pub total_reps: i64,
    pub valid_reps: i64,
    pub total_points: i64,
    pub completed_at: i64,
}

impl SyncKernel {
    /// Persists a new session and enqueues its `create` operation in one
    /// transaction.
    pub async fn record_session(&self, new: NewSession, now: i64) -> Result<WorkoutSession> {
        let mut tx = self.db.pool.begin().await?;
        let session = sessions::create_tx(&mut tx, &new, now).await?;
        let payload = serde_json::to_vec(&snapshot_of(&session)?)?;
        queue::enqueue_tx(
            &mut tx,
            EntityKind::Session,
            &session.id,
            Operation::Create,
            payload,
            now,
        )
        .await?;
        tx.commit().await?;

        Ok(session)
    }

    /// Bulk-inserts a batch of ML frames for a session and enqueues a
    /// single `ml-batch` item carrying the ids of the rows it inserted,
    /// atomically.
    ///
    /// Rejected at the boundary (not queued) if the parent session does
    /// not exist locally — frames cannot outlive their session.
    pub async fn append_frames(
        &self,
        session_id: &str,
        new_frames: Vec<NewFrame>,
        now: i64,
    ) -> Result<u64> {
        if new_frames.is_empty() {
            return Ok(0);
        }
        if new_frames.iter().any(|f| f.session_id != session_id) {
            return Err(Error::Validation(
                "all frames in a batch must belong to the same session".to_string(),
            ));
        }

        let mut tx = self.db.pool.begin().await?;

        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(Error::Validation(format!(
                "cannot append frames: session {} does not exist locally",
                session_id
            )));
        }

        let inserted_ids = frames::insert_batch_tx(&mut tx, &new_frames).await?;
        let inserted = inserted_ids.len() as u64;

        if inserted > 0 {
            let payload = serde_json::to_vec(&inserted_ids)?;
            queue::enqueue_tx(
                &mut tx,
                EntityKind::MlBatch,
                session_id,
                Operation::Create,
                payload,
                now,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Freezes a session at completion and enqueues its `update` operation
    ///.
    ///
    /// Enforces `valid_reps <= total_reps` at the boundary rather than
    /// silently clamping it — a violation here means the capture
    /// subsystem computed something wrong, and queueing it would just
    /// move the bug onto the server.
    pub async fn complete_session(
        &self,
        session_id: &str,
        stats: CompletionStats,
        now: i64,
    ) -> Result<WorkoutSession> {
        if stats.valid_reps > stats.total_reps {
            return Err(Error::Validation(format!(
                "valid_reps ({}) cannot exceed total_reps ({})",
                stats.valid_reps, stats.total_reps
            )));
        }

        let existing = sessions::get(&self.db.pool, session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {} not found", session_id)))?;

        let duration_seconds = (stats.completed_at - existing.started_at) / 1000;

        let patch = SessionUpdate {
            total_reps: Some(stats.total_reps),
            valid_reps: Some(stats.valid_reps),
            total_points: Some(stats.total_points),
            completed_at: Some(stats.completed_at),
            duration_seconds: Some(duration_seconds),
            is_completed: Some(true),
        };

        let updated = sessions::update(&self.db.pool, session_id, &patch, now)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {} not found", session_id)))?;

        let payload = serde_json::to_vec(&snapshot_of(&updated)?)?;
        self.queue
            .enqueue(EntityKind::Session, session_id, Operation::Update, payload, now)
            .await?;

        Ok(updated)
    }
}

/// Flattens a serializable record into the field-map shape the conflict
/// detector and transport layer operate on.
fn snapshot_of<T: Serialize>(value: &T) -> Result<EntitySnapshot> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Ok(EntitySnapshot::new()),
    }
}
