// lifecycle.rs - Post-sync deletion and periodic cleanup
//
// Post-sync deletion itself lives in `orchestrator::finalize_success` (it
// runs inline, right after the `Ack`). This module is the *independent*
// periodic sweep: storage caps, unsynced-retention safety GC, and orphan
// queue purge. Every deletion query here is qualified with "no pending
// queue item references this row" — the one invariant cleanup must never
// violate.

use crate::config::SyncConfig;
use crate::db::{frames, Database};
use crate::Result;
use serde::{Deserialize, Serialize};

/// Summary of one cleanup pass, for logging/telemetry by the host.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    pub unsynced_sessions_deleted: u64,
    pub unsynced_frames_deleted: u64,
    pub orphan_queue_items_deleted: u64,
    pub ml_bytes_evicted: u64,
    pub ml_cap_warning: bool,
}

pub struct Cleanup<'a> {
    db: &'a Database,
    config: &'a SyncConfig,
}

impl<'a> Cleanup<'a> {
    pub fn new(db: &'a Database, config: &'a SyncConfig) -> Self {
        Self { db, config }
    }

    /// Runs one full cleanup pass.
    pub async fn run(&self, now: i64) -> Result<CleanupReport> {
        let cutoff = now - self.config.unsynced_retention_days * 24 * 60 * 60 * 1000;

        let unsynced_sessions_deleted = self.gc_unsynced_sessions(cutoff).await?;
        let unsynced_frames_deleted = self.gc_unsynced_frames(cutoff).await?;
        let orphan_queue_items_deleted = self.purge_orphan_queue_items().await?;
        let (ml_bytes_evicted, ml_cap_warning) = self.enforce_storage_cap().await?;

        if unsynced_sessions_deleted > 0 || unsynced_frames_deleted > 0 || orphan_queue_items_deleted > 0 {
            tracing::info!(
                unsynced_sessions_deleted,
                unsynced_frames_deleted,
                orphan_queue_items_deleted,
                "cleanup pass complete"
            );
        }

        Ok(CleanupReport {
            unsynced_sessions_deleted,
            unsynced_frames_deleted,
            orphan_queue_items_deleted,
            ml_bytes_evicted,
            ml_cap_warning,
        })
    }

    /// Deletes unsynced sessions older than the retention window, skipping
    /// any session a queue item still references.
    /// Frames cascade with the session via `ON DELETE CASCADE`.
    async fn gc_unsynced_sessions(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM sessions
            WHERE synced = 0
              AND created_at < ?
              AND id NOT IN (SELECT entity_id FROM sync_queue WHERE entity_kind = 'session')
            "#,
        )
        .bind(cutoff)
        .execute(&self.db.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Deletes unsynced frames older than the retention window whose
    /// parent session's ml-batch is not queued, independent of whether
    /// the parent session row itself still exists.
    async fn gc_unsynced_frames(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM ml_frames
            WHERE synced = 0
              AND captured_at < ?
              AND session_id NOT IN (SELECT entity_id FROM sync_queue WHERE entity_kind = 'ml_batch')
            "#,
        )
        .bind(cutoff)
        .execute(&self.db.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Purges queue items that reference entities no longer present
    /// locally. `rep` items are reserved/unused and left
    /// alone.
    async fn purge_orphan_queue_items(&self) -> Result<u64> {
        let sessions = sqlx::query(
            r#"
            DELETE FROM sync_queue
            WHERE entity_kind = 'session'
              AND entity_id NOT IN (SELECT id FROM sessions)
            "#,
        )
        .execute(&self.db.pool)
        .await?;

        let ml_batches = sqlx::query(
            r#"
            DELETE FROM sync_queue
            WHERE entity_kind = 'ml_batch'
              AND entity_id NOT IN (SELECT id FROM sessions)
            "#,
        )
        .execute(&self.db.pool)
        .await?;

        Ok(sessions.rows_affected() + ml_batches.rows_affected())
    }

    /// Honors the ML storage soft cap, warning at `ml_cap_warn_ratio` and
    /// evicting already-synced frames (oldest first) once over budget
    ///. Never touches unsynced data.
    async fn enforce_storage_cap(&self) -> Result<(u64, bool)> {
        let current = frames::total_blob_bytes(&self.db.pool).await?;
        let warn_threshold =
            (self.config.ml_storage_cap_bytes as f64 * self.config.ml_cap_warn_ratio) as u64;

        let warning = current >= warn_threshold;
        if warning {
            tracing::warn!(
                current_bytes = current,
                cap_bytes = self.config.ml_storage_cap_bytes,
                "ml frame storage approaching cap"
            );
        }

        let evicted = if current > self.config.ml_storage_cap_bytes {
            frames::evict_synced_until_under(&self.db.pool, self.config.ml_storage_cap_bytes).await?
        } else {
            0
        };

        Ok((evicted, warning))
    }
}
