// operator.rs - Operator-facing API
//
// The UI layer is a collaborator: it drives sync_now/
// retry_failed/clear_failed, subscribes to progress events, and resolves
// conflicts the detector couldn't auto-resolve. None of this talks to the
// network directly — everything here delegates to the orchestrator, the
// queue manager, or the conflict channel the orchestrator parked rows in.

use crate::conflict::EntitySnapshot;
use crate::db::sessions::{self, SessionUpdate};
use crate::network::NetworkStatus;
use crate::orchestrator::events::{DrainProgress, SyncEvent};
use crate::queue::{EntityKind, QueueStats};
use crate::{Error, Result, SyncKernel};
use serde::{Deserialize, Serialize};

/// What the operator chose to do with a parked manual conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictAction {
    /// Accept the server's version: apply it locally, drop the queued change.
    Accept,
    /// Re-attempt the original local change (clears the elevated retry state).
    Retry,
    /// Discard the queued change entirely, leaving the local row as-is.
    Skip,
}

/// Aggregated status for the UI's sync indicator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub queue_stats: QueueStats,
    pub network_status: NetworkStatus,
}

#[derive(Debug, sqlx::FromRow)]
struct ConflictRow {
    id: i64,
    queue_item_id: i64,
    entity_kind: String,
    entity_id: String,
    server_snapshot: String,
}

impl SyncKernel {
    /// Triggers a drain. Per the resolved open question, this
    /// does not bypass backoff — it's exactly `orchestrator::drain`.
    pub async fn sync_now(&self) -> Result<Option<DrainProgress>> {
        self.orchestrator.sync_now().await
    }

    /// Resets retry counts on every failed item, then drains.
    pub async fn retry_failed(&self) -> Result<Option<DrainProgress>> {
        self.orchestrator.retry_failed().await
    }

    /// Deletes every item at or above the retry ceiling.
    pub async fn clear_failed(&self) -> Result<u64> {
        self.orchestrator.clear_failed().await
    }

    /// Subscribes to the orchestrator's event bus. Delivery is synchronous
    /// on the orchestrator's task; the listener must not block.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.orchestrator.subscribe(listener);
    }

    /// Snapshot of everything the UI's status indicator needs in one call.
    pub async fn get_status(&self) -> Result<SyncStatus> {
        let queue_stats = self.queue.stats().await?;
        let network_status = self.network.current();

        Ok(SyncStatus {
            is_online: network_status.connected,
            is_syncing: self.orchestrator.is_syncing(),
            queue_stats,
            network_status,
        })
    }

    /// Resolves a `manual`-strategy conflict the orchestrator parked
    ///.
    pub async fn resolve_conflict(&self, item_id: i64, action: ConflictAction, now: i64) -> Result<()> {
        let row: Option<ConflictRow> = sqlx::query_as(
            "SELECT id, queue_item_id, entity_kind, entity_id, server_snapshot FROM conflict_channel WHERE queue_item_id = ?",
        )
        .bind(item_id)
        .fetch_optional(&self.db.pool)
        .await?;

        let Some(row) = row else {
            return Err(Error::NotFound(format!(
                "no parked conflict for queue item {}",
                item_id
            )));
        };

        match action {
            ConflictAction::Accept => {
                self.apply_server_snapshot(&row).await?;
                self.queue.remove(item_id).await?;
            }
            ConflictAction::Retry => {
                self.queue.reset(item_id, now).await?;
            }
            ConflictAction::Skip => {
                self.queue.remove(item_id).await?;
            }
        }

        self.delete_conflict_row(row.id).await?;
        Ok(())
    }

    async fn apply_server_snapshot(&self, row: &ConflictRow) -> Result<()> {
        let Some(kind) = EntityKind::from_str(&row.entity_kind) else {
            return Err(Error::Sync(format!("unknown entity kind: {}", row.entity_kind)));
        };
        let server: EntitySnapshot = serde_json::from_str(&row.server_snapshot)?;

        match kind {
            EntityKind::Session => {
                let patch = session_update_from_snapshot(&server);
                let now = server
                    .get("updated_at")
                    .and_then(|v| v.as_i64())
                    .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
                sessions::update(&self.db.pool, &row.entity_id, &patch, now).await?;
            }
            EntityKind::MlBatch | EntityKind::Rep => {
                // ML frames are append-only (never server_wins/manual in
                // practice) and reps are reserved; nothing to reconcile
                // locally beyond dropping the queue item.
            }
        }

        Ok(())
    }

    async fn delete_conflict_row(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM conflict_channel WHERE id = ?")
            .bind(id)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }
}

fn session_update_from_snapshot(snapshot: &EntitySnapshot) -> SessionUpdate {
    SessionUpdate {
        total_reps: snapshot.get("total_reps").and_then(|v| v.as_i64()),
        valid_reps: snapshot.get("valid_reps").and_then(|v| v.as_i64()),
        total_points: snapshot.get("total_points").and_then(|v| v.as_i64()),
        completed_at: snapshot.get("completed_at").and_then(|v| v.as_i64()),
        duration_seconds: snapshot.get("duration_seconds").and_then(|v| v.as_i64()),
        is_completed: snapshot.get("is_completed").and_then(|v| v.as_bool()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::db::sessions::NewSession;
    use crate::queue::Operation;
    use crate::transport::{Transport, UploadOutcome};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct NoopTransport;

    #[async_trait]
    impl Transport for NoopTransport {
        async fn upload(&self, _item: &crate::queue::SyncQueueItem) -> Result<UploadOutcome> {
            Ok(UploadOutcome::Ack)
        }
    }

    async fn kernel() -> SyncKernel {
        SyncKernel::new_in_memory(Arc::new(NoopTransport), SyncConfig::default())
            .await
            .unwrap()
    }

    async fn park_conflict(kernel: &SyncKernel, item_id: i64, entity_id: &str) {
        sqlx::query(
            "INSERT INTO conflict_channel (queue_item_id, entity_kind, entity_id, fields, local_snapshot, server_snapshot, created_at) VALUES (?, 'session', ?, '[]', '{}', ?, 0)",
        )
        .bind(item_id)
        .bind(entity_id)
        .bind(
            json!({"is_completed": true, "completed_at": 5000, "total_reps": 10, "valid_reps": 9, "total_points": 90, "duration_seconds": 5, "updated_at": 5000})
                .to_string(),
        )
        .execute(&kernel.db.pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn accept_applies_server_snapshot_and_clears_queue() {
        let kernel = kernel().await;
        sessions::create(
            &kernel.db.pool,
            &NewSession {
                id: "s1".into(),
                user_id: "u1".into(),
                exercise_id: "pushup".into(),
                orientation: "landscape".into(),
                started_at: 0,
            },
            0,
        )
        .await
        .unwrap();
        let item_id = kernel
            .queue
            .enqueue(EntityKind::Session, "s1", Operation::Update, b"{}".to_vec(), 0)
            .await
            .unwrap();
        park_conflict(&kernel, item_id, "s1").await;

        kernel
            .resolve_conflict(item_id, ConflictAction::Accept, 10_000)
            .await
            .unwrap();

        let session = sessions::get(&kernel.db.pool, "s1").await.unwrap().unwrap();
        assert!(session.is_completed);
        assert_eq!(session.total_reps, 10);
        assert!(kernel.queue.get(item_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_resets_backoff_without_touching_local_state() {
        let kernel = kernel().await;
        let item_id = kernel
            .queue
            .enqueue(EntityKind::Session, "s1", Operation::Update, b"{}".to_vec(), 0)
            .await
            .unwrap();
        kernel.queue.record_failure(item_id, "manual_conflict", 0).await.unwrap();
        park_conflict(&kernel, item_id, "s1").await;

        kernel
            .resolve_conflict(item_id, ConflictAction::Retry, 10_000)
            .await
            .unwrap();

        let item = kernel.queue.get(item_id).await.unwrap().unwrap();
        assert_eq!(item.retry_count, 0);
    }

    #[tokio::test]
    async fn skip_drops_the_queue_item() {
        let kernel = kernel().await;
        let item_id = kernel
            .queue
            .enqueue(EntityKind::Session, "s1", Operation::Update, b"{}".to_vec(), 0)
            .await
            .unwrap();
        park_conflict(&kernel, item_id, "s1").await;

        kernel
            .resolve_conflict(item_id, ConflictAction::Skip, 10_000)
            .await
            .unwrap();

        assert!(kernel.queue.get(item_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_status_reports_queue_and_network() {
        let kernel = kernel().await;
        kernel
            .queue
            .enqueue(EntityKind::Session, "s1", Operation::Create, vec![], 0)
            .await
            .unwrap();

        let status = kernel.get_status().await.unwrap();
        assert_eq!(status.queue_stats.total, 1);
        assert!(!status.is_syncing);
    }
}
