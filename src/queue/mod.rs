// queue/mod.rs - Durable, transactional sync queue
//
// A fixed small set of entity kinds rather than a generic type parameter,
// with the retry-readiness decision delegated to `crate::retry` rather
// than a bare `retry_count < 5` filter.

use crate::config::SyncConfig;
use crate::retry;
use crate::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

/// What kind of entity a queue item carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Session,
    MlBatch,
    /// Reserved: individual reps are not yet synced independently.
    Rep,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Session => "session",
            EntityKind::MlBatch => "ml_batch",
            EntityKind::Rep => "rep",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "session" => Some(EntityKind::Session),
            "ml_batch" => Some(EntityKind::MlBatch),
            "rep" => Some(EntityKind::Rep),
            _ => None,
        }
    }
}

/// What the orchestrator should do with the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }
}

/// A unit of work for the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: i64,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Vec<u8>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct ItemRow {
    id: i64,
    entity_kind: String,
    entity_id: String,
    operation: String,
    payload: Vec<u8>,
    retry_count: i64,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl ItemRow {
    fn into_item(self) -> Result<SyncQueueItem> {
        let entity_kind = EntityKind::from_str(&self.entity_kind)
            .ok_or_else(|| crate::Error::Sync(format!("unknown entity kind: {}", self.entity_kind)))?;
        let operation = Operation::from_str(&self.operation)
            .ok_or_else(|| crate::Error::Sync(format!("unknown operation: {}", self.operation)))?;

        Ok(SyncQueueItem {
            id: self.id,
            entity_kind,
            entity_id: self.entity_id,
            operation,
            payload: self.payload,
            retry_count: self.retry_count.max(0) as u32,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Queue statistics`).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: u64,
    pub pending: u64,
    pub retrying: u64,
    pub failed: u64,
}

pub struct SyncQueueManager {
    pool: SqlitePool,
    config: SyncConfig,
}

impl SyncQueueManager {
    pub fn new(pool: SqlitePool, config: SyncConfig) -> Self {
        Self { pool, config }
    }

    /// Appends a new item, deduping on `(entity_kind, entity_id, operation)`
    /// by replacing the payload and resetting retry state — mirrors the
    /// teacher's `ON CONFLICT ... DO UPDATE` clause.
    pub async fn enqueue(
        &self,
        kind: EntityKind,
        entity_id: &str,
        operation: Operation,
        payload: Vec<u8>,
        now: i64,
    ) -> Result<i64> {
        sqlx::query(
            r#"
            INSERT INTO sync_queue (entity_kind, entity_id, operation, payload, retry_count, last_error, created_at, updated_at)
            VALUES (?, ?, ?, ?, 0, NULL, ?, ?)
            ON CONFLICT(entity_kind, entity_id, operation) DO UPDATE SET
                payload = excluded.payload,
                retry_count = 0,
                last_error = NULL,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(kind.as_str())
        .bind(entity_id)
        .bind(operation.as_str())
        .bind(&payload)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row: (i64,) = sqlx::query_as(
            "SELECT id FROM sync_queue WHERE entity_kind = ? AND entity_id = ? AND operation = ?",
        )
        .bind(kind.as_str())
        .bind(entity_id)
        .bind(operation.as_str())
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(kind = kind.as_str(), entity_id, "enqueued sync item");
        Ok(row.0)
    }

    /// Oldest `limit` items regardless of readiness, stable FIFO order.
    pub async fn pending(&self, limit: i64) -> Result<Vec<SyncQueueItem>> {
        let rows = sqlx::query_as::<_, ItemRow>(
            "SELECT * FROM sync_queue ORDER BY created_at ASC, id ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ItemRow::into_item).collect()
    }

    /// Items whose backoff window has elapsed, per `retry::is_ready`.
    ///
    /// Readiness depends on `now`, which SQL cannot evaluate against a
    /// per-row exponential function portably, so the ceiling is pushed
    /// down to SQL (cheap, indexed) and the window check stays in Rust.
    pub async fn retryable(&self, limit: i64, now: i64) -> Result<Vec<SyncQueueItem>> {
        let rows = sqlx::query_as::<_, ItemRow>(
            "SELECT * FROM sync_queue WHERE retry_count < ? ORDER BY updated_at ASC, id ASC",
        )
        .bind(self.config.max_retries as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut ready = Vec::new();
        for row in rows {
            let item = row.into_item()?;
            if retry::is_ready(item.updated_at, item.retry_count, now, &self.config) {
                ready.push(item);
                if ready.len() as i64 >= limit {
                    break;
                }
            }
        }

        Ok(ready)
    }

    /// Increments retry count, records the error, and restarts the backoff
    /// window by bumping `updated_at` to `now`.
    pub async fn record_failure(&self, id: i64, err_text: &str, now: i64) -> Result<()> {
        sqlx::query(
            "UPDATE sync_queue SET retry_count = retry_count + 1, last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(err_text)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn remove(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn remove_batch(&self, ids: &[i64]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("DELETE FROM sync_queue WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    /// Items at or above the retry ceiling.
    pub async fn failed(&self) -> Result<Vec<SyncQueueItem>> {
        let rows = sqlx::query_as::<_, ItemRow>(
            "SELECT * FROM sync_queue WHERE retry_count >= ? ORDER BY updated_at ASC, id ASC",
        )
        .bind(self.config.max_retries as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ItemRow::into_item).collect()
    }

    /// Deletes all failed items; returns how many were deleted.
    pub async fn clear_failed(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE retry_count >= ?")
            .bind(self.config.max_retries as i64)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Zeroes the retry count of a single item (operator-initiated retry).
    pub async fn reset(&self, id: i64, now: i64) -> Result<()> {
        sqlx::query("UPDATE sync_queue SET retry_count = 0, last_error = NULL, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Zeroes the retry count of every failed item.
    pub async fn reset_all_failed(&self, now: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sync_queue SET retry_count = 0, last_error = NULL, updated_at = ? WHERE retry_count >= ?",
        )
        .bind(now)
        .bind(self.config.max_retries as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_queue")
            .fetch_one(&self.pool)
            .await?;
        let pending: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_queue WHERE retry_count = 0")
            .fetch_one(&self.pool)
            .await?;
        let failed: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_queue WHERE retry_count >= ?")
            .bind(self.config.max_retries as i64)
            .fetch_one(&self.pool)
            .await?;

        let retrying = total.0 - pending.0 - failed.0;

        Ok(QueueStats {
            total: total.0.max(0) as u64,
            pending: pending.0.max(0) as u64,
            retrying: retrying.max(0) as u64,
            failed: failed.0.max(0) as u64,
        })
    }

    pub async fn contains(&self, kind: EntityKind, entity_id: &str) -> Result<bool> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sync_queue WHERE entity_kind = ? AND entity_id = ?",
        )
        .bind(kind.as_str())
        .bind(entity_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0 > 0)
    }

    pub async fn get(&self, id: i64) -> Result<Option<SyncQueueItem>> {
        let row = sqlx::query_as::<_, ItemRow>("SELECT * FROM sync_queue WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(ItemRow::into_item).transpose()
    }
}

/// Transaction-scoped enqueue, for producer-API callers that must commit
/// the entity write and the queue insert atomically. Same
/// dedup-on-enqueue semantics as `SyncQueueManager::enqueue`.
pub async fn enqueue_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    kind: EntityKind,
    entity_id: &str,
    operation: Operation,
    payload: Vec<u8>,
    now: i64,
) -> Result<i64> {
    sqlx::query(
        r#"
        INSERT INTO sync_queue (entity_kind, entity_id, operation, payload, retry_count, last_error, created_at, updated_at)
        VALUES (?, ?, ?, ?, 0, NULL, ?, ?)
        ON CONFLICT(entity_kind, entity_id, operation) DO UPDATE SET
            payload = excluded.payload,
            retry_count = 0,
            last_error = NULL,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(kind.as_str())
    .bind(entity_id)
    .bind(operation.as_str())
    .bind(&payload)
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    let row: (i64,) = sqlx::query_as(
        "SELECT id FROM sync_queue WHERE entity_kind = ? AND entity_id = ? AND operation = ?",
    )
    .bind(kind.as_str())
    .bind(entity_id)
    .bind(operation.as_str())
    .fetch_one(&mut **tx)
    .await?;

    Ok(row.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn manager() -> SyncQueueManager {
        let db = Database::new_in_memory().await.unwrap();
        SyncQueueManager::new(db.pool, SyncConfig::default())
    }

    #[tokio::test]
    async fn enqueue_dedupes_same_key() {
        let q = manager().await;
        let id1 = q
            .enqueue(EntityKind::Session, "s1", Operation::Create, b"v1".to_vec(), 0)
            .await
            .unwrap();
        let id2 = q
            .enqueue(EntityKind::Session, "s1", Operation::Create, b"v2".to_vec(), 100)
            .await
            .unwrap();

        assert_eq!(id1, id2);
        let item = q.get(id1).await.unwrap().unwrap();
        assert_eq!(item.payload, b"v2");
        assert_eq!(item.retry_count, 0);

        let stats = q.stats().await.unwrap();
        assert_eq!(stats.total, 1);
    }

    #[tokio::test]
    async fn retryable_respects_backoff_window() {
        let q = manager().await;
        let id = q
            .enqueue(EntityKind::Session, "s1", Operation::Create, vec![], 0)
            .await
            .unwrap();
        q.record_failure(id, "boom", 0).await.unwrap();

        // immediately after failure, still within the 1s backoff window
        assert!(q.retryable(10, 500).await.unwrap().is_empty());
        // past the window
        let ready = q.retryable(10, 1_500).await.unwrap();
        assert_eq!(ready.len(), 1);
    }

    #[tokio::test]
    async fn item_parks_as_failed_at_ceiling() {
        let q = manager().await;
        let id = q
            .enqueue(EntityKind::Session, "s1", Operation::Create, vec![], 0)
            .await
            .unwrap();

        for i in 0..5 {
            q.record_failure(id, "boom", i * 100_000).await.unwrap();
        }

        assert!(q.retryable(10, 1_000_000).await.unwrap().is_empty());
        let failed = q.failed().await.unwrap();
        assert_eq!(failed.len(), 1);

        let stats = q.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn reset_all_failed_reopens_for_retry() {
        let q = manager().await;
        let id = q
            .enqueue(EntityKind::Session, "s1", Operation::Create, vec![], 0)
            .await
            .unwrap();
        for i in 0..5 {
            q.record_failure(id, "boom", i * 100_000).await.unwrap();
        }

        let reset = q.reset_all_failed(600_000).await.unwrap();
        assert_eq!(reset, 1);
        assert!(!q.retryable(10, 600_000).await.unwrap().is_empty());
    }
}
