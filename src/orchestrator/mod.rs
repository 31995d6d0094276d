// orchestrator/mod.rs - Sync orchestrator: drain loop, event bus, auto-sync timer
//
// Single-flight is a bare `Arc<AtomicBool>` compare_exchange, exactly the
// pack's hubnity-desktop `SyncManager::sync_queue` pattern: the flag is
// acquired before any network I/O and released via a drop guard so a
// panicking drain can't wedge the orchestrator permanently (the teacher
// pack uses `scopeguard` for this; this crate stays on the existing
// dependency stack and gets the same guarantee from a local RAII type).

pub mod events;

use crate::conflict::{ConflictReport, Detector, EntitySnapshot, ResolutionStrategy};
use crate::db::Database;
use crate::network::NetworkMonitor;
use crate::queue::{EntityKind, Operation, SyncQueueItem, SyncQueueManager};
use crate::transport::{Transport, UploadOutcome};
use crate::{config::SyncConfig, db, Error, Result};
use events::{DrainProgress, EventBus, SyncEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncOrchestrator {
    db: Database,
    queue: Arc<SyncQueueManager>,
    network: Arc<NetworkMonitor>,
    transport: Arc<dyn Transport>,
    config: SyncConfig,
    events: Arc<EventBus>,
    is_syncing: Arc<AtomicBool>,
    auto_sync_paused: Arc<AtomicBool>,
}

impl SyncOrchestrator {
    pub fn new(
        db: Database,
        queue: Arc<SyncQueueManager>,
        network: Arc<NetworkMonitor>,
        transport: Arc<dyn Transport>,
        config: SyncConfig,
    ) -> Self {
        Self {
            db,
            queue,
            network,
            transport,
            config,
            events: Arc::new(EventBus::new()),
            is_syncing: Arc::new(AtomicBool::new(false)),
            auto_sync_paused: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener);
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::Acquire)
    }

    /// One drain pass. Single-flight: a second concurrent
    /// call while a drain is in progress is a no-op returning `None`.
    pub async fn drain(&self) -> Result<Option<DrainProgress>> {
        if self
            .is_syncing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            tracing::debug!("drain already in progress, skipping");
            return Ok(None);
        }
        let _guard = SyncingGuard(&self.is_syncing);

        let now = now_ms();
        let status = self.network.current();

        if !status.can_sync {
            self.events.publish(SyncEvent::SyncFailed {
                reason: "network_unavailable".to_string(),
            });
            return Ok(Some(DrainProgress::default()));
        }

        let items = self.queue.retryable(status.batch_size as i64, now).await?;
        let total = items.len();

        self.events.publish(SyncEvent::SyncStarted);
        self.events.publish(SyncEvent::SyncQueueing { total });

        let mut progress = DrainProgress {
            total,
            ..Default::default()
        };
        let mut total_elapsed_ms: u128 = 0;

        for item in items {
            self.events.publish(SyncEvent::SyncProcessing {
                entity_kind: item.entity_kind.as_str().to_string(),
                entity_id: item.entity_id.clone(),
            });

            let started = Instant::now();
            let outcome = self.transport.upload(&item).await;
            total_elapsed_ms += started.elapsed().as_millis();

            progress.current += 1;

            match outcome {
                Ok(UploadOutcome::Ack) => {
                    self.finalize_success(&item).await?;
                    progress.synced += 1;
                }
                Ok(UploadOutcome::Conflict(server_record)) => {
                    self.handle_conflict(&item, server_record, now).await?;
                    progress.conflicts += 1;
                }
                Ok(UploadOutcome::TransientErr(msg)) => {
                    self.queue.record_failure(item.id, &msg, now_ms()).await?;
                    progress.failed += 1;
                }
                Ok(UploadOutcome::PermanentErr(msg)) => {
                    self.queue.record_failure(item.id, &msg, now_ms()).await?;
                    progress.failed += 1;
                }
                Err(err) => {
                    // transport-level error distinct from a protocol-level
                    // TransientErr/PermanentErr outcome; still recoverable,
                    // so it advances retry state rather than aborting the drain.
                    self.queue
                        .record_failure(item.id, &err.to_string(), now_ms())
                        .await?;
                    progress.failed += 1;
                }
            }

            let completed = progress.current.max(1) as u128;
            let avg_latency_ms = total_elapsed_ms / completed;
            let remaining = total.saturating_sub(progress.current);
            progress.estimated_ms_remaining = (avg_latency_ms as i64) * (remaining as i64);

            self.events.publish(SyncEvent::SyncProgress(progress));
        }

        self.events.publish(SyncEvent::SyncCompleted(progress));
        Ok(Some(progress))
    }

    /// Operator-visible manual sync; per the resolved open question, this
    /// does not bypass backoff — it is exactly a drain.
    pub async fn sync_now(&self) -> Result<Option<DrainProgress>> {
        self.drain().await
    }

    /// Resets retry counts on all failed items, then drains.
    pub async fn retry_failed(&self) -> Result<Option<DrainProgress>> {
        self.queue.reset_all_failed(now_ms()).await?;
        self.drain().await
    }

    pub async fn clear_failed(&self) -> Result<u64> {
        self.queue.clear_failed().await
    }

    /// Deletes local rows after a confirmed upload.
    async fn finalize_success(&self, item: &SyncQueueItem) -> Result<()> {
        self.queue.remove(item.id).await?;

        match item.entity_kind {
            EntityKind::Session => {
                if item.operation != Operation::Delete {
                    db::sessions::delete(&self.db.pool, &item.entity_id).await?;
                }
            }
            EntityKind::MlBatch => {
                let frame_ids: Vec<i64> = serde_json::from_slice(&item.payload).unwrap_or_default();
                delete_frames(&self.db, &frame_ids).await?;
            }
            EntityKind::Rep => {}
        }

        Ok(())
    }

    async fn handle_conflict(
        &self,
        item: &SyncQueueItem,
        server_record: crate::transport::ServerRecord,
        now: i64,
    ) -> Result<()> {
        let local: EntitySnapshot = serde_json::from_slice(&item.payload).unwrap_or_default();
        let t_local = extract_timestamp(&local).unwrap_or(item.updated_at);
        let t_server = extract_timestamp(&server_record).unwrap_or(now);

        let report = Detector::detect(item.entity_kind, &local, &server_record, t_local, t_server);

        match report.strategy {
            ResolutionStrategy::Manual => {
                self.park_for_manual_resolution(item, &local, &server_record, &report, now)
                    .await?;
                self.queue
                    .record_failure(item.id, "manual_conflict", now)
                    .await?;
                self.events.publish(SyncEvent::SyncConflict {
                    item_id: item.id,
                    fields: report.fields.clone(),
                });
            }
            ResolutionStrategy::Merge => {
                let (resolved, _) = Detector::merge(&local, &server_record, t_local, t_server);
                self.requeue_resolved(item, resolved, now).await?;
            }
            ResolutionStrategy::ServerWins => {
                let resolved = Detector::server_wins(&server_record);
                self.requeue_resolved(item, resolved, now).await?;
            }
            ResolutionStrategy::ClientWins => {
                // server disagreed, but our view wins: re-push the same state.
                self.requeue_resolved(item, local, now).await?;
            }
        }

        Ok(())
    }

    async fn requeue_resolved(
        &self,
        item: &SyncQueueItem,
        resolved: EntitySnapshot,
        now: i64,
    ) -> Result<()> {
        // `item` is frequently already an `Update` for this same
        // (entity_kind, entity_id) — enqueueing the resolved payload before
        // removing `item` would dedup onto `item`'s own row (queue/mod.rs's
        // `ON CONFLICT` upsert), and the subsequent remove would then delete
        // the just-upserted resolved state instead of the stale one. Remove
        // first so the enqueue always lands on a fresh row.
        self.queue.remove(item.id).await?;

        let payload = serde_json::to_vec(&resolved)?;
        self.queue
            .enqueue(item.entity_kind, &item.entity_id, Operation::Update, payload, now)
            .await?;
        Ok(())
    }

    async fn park_for_manual_resolution(
        &self,
        item: &SyncQueueItem,
        local: &EntitySnapshot,
        server: &crate::transport::ServerRecord,
        report: &ConflictReport,
        now: i64,
    ) -> Result<()> {
        let fields_json = serde_json::to_string(&report.fields)?;
        let local_json = serde_json::to_string(local)?;
        let server_json = serde_json::to_string(server)?;

        // Dedup on `queue_item_id`, same upsert idiom as `sync_queue`'s
        // `ON CONFLICT ... DO UPDATE` (queue/mod.rs): an item still unresolved
        // by the operator goes through this path again on every subsequent
        // drain, and each pass must refresh the one parked row rather than
        // accumulate a new duplicate.
        sqlx::query(
            r#"
            INSERT INTO conflict_channel
                (queue_item_id, entity_kind, entity_id, fields, local_snapshot, server_snapshot, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(queue_item_id) DO UPDATE SET
                fields = excluded.fields,
                local_snapshot = excluded.local_snapshot,
                server_snapshot = excluded.server_snapshot,
                created_at = excluded.created_at
            "#,
        )
        .bind(item.id)
        .bind(item.entity_kind.as_str())
        .bind(&item.entity_id)
        .bind(fields_json)
        .bind(local_json)
        .bind(server_json)
        .bind(now)
        .execute(&self.db.pool)
        .await?;

        Ok(())
    }

    /// Spawns the cooperative auto-sync timer.
    ///
    /// Returns a handle the host can abort on shutdown. Pausing is
    /// cooperative via `auto_sync_paused`, not task cancellation, so a
    /// resume can trigger an immediate drain without re-spawning.
    pub fn spawn_auto_sync(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let interval_secs = self.config.auto_sync_interval_secs.max(1);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                ticker.tick().await;
                if orchestrator.auto_sync_paused.load(Ordering::Acquire) {
                    continue;
                }
                if let Err(err) = orchestrator.drain().await {
                    tracing::warn!(error = %err, "auto-sync drain failed");
                }
            }
        })
    }

    /// App backgrounding: pause the auto-sync timer.
    pub fn pause_auto_sync(&self) {
        self.auto_sync_paused.store(true, Ordering::Release);
    }

    /// App foregrounding: resume the timer and drain immediately.
    pub async fn resume_auto_sync(&self) -> Result<Option<DrainProgress>> {
        self.auto_sync_paused.store(false, Ordering::Release);
        self.drain().await
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn extract_timestamp(snapshot: &EntitySnapshot) -> Option<i64> {
    snapshot.get("updated_at").and_then(|v| v.as_i64())
}

async fn delete_frames(db: &Database, frame_ids: &[i64]) -> Result<()> {
    if frame_ids.is_empty() {
        return Ok(());
    }

    let mut tx = db.pool.begin().await?;
    for id in frame_ids {
        sqlx::query("DELETE FROM ml_frames WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SyncQueueManager;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct ScriptedTransport {
        responses: Mutex<Vec<UploadOutcome>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn upload(&self, _item: &SyncQueueItem) -> Result<UploadOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            Ok(responses.pop().unwrap_or(UploadOutcome::Ack))
        }
    }

    async fn setup(
        responses: Vec<UploadOutcome>,
    ) -> (SyncOrchestrator, Arc<NetworkMonitor>) {
        let db = Database::new_in_memory().await.unwrap();
        let config = SyncConfig::default();
        let queue = Arc::new(SyncQueueManager::new(db.pool.clone(), config.clone()));
        let network = Arc::new(NetworkMonitor::new());
        network.apply_event(crate::network::RawNetworkEvent {
            connected: true,
            connection_type: crate::network::ConnectionType::Wifi,
            cellular_generation: None,
            metered: false,
        });

        // responses are popped in reverse, so reverse the input so the
        // first call gets the first listed outcome
        let mut reversed = responses;
        reversed.reverse();
        let transport = Arc::new(ScriptedTransport {
            responses: Mutex::new(reversed),
            calls: AtomicUsize::new(0),
        });

        let orchestrator = SyncOrchestrator::new(db, queue, network.clone(), transport, config);
        (orchestrator, network)
    }

    #[tokio::test]
    async fn happy_path_drains_and_removes_item() {
        let (orchestrator, _network) = setup(vec![UploadOutcome::Ack]).await;
        orchestrator
            .queue
            .enqueue(EntityKind::Session, "s1", Operation::Create, b"{}".to_vec(), 0)
            .await
            .unwrap();

        let progress = orchestrator.drain().await.unwrap().unwrap();
        assert_eq!(progress.synced, 1);
        assert_eq!(progress.total, 1);

        let stats = orchestrator.queue.stats().await.unwrap();
        assert_eq!(stats.total, 0);
    }

    #[tokio::test]
    async fn offline_network_skips_drain_without_touching_queue() {
        let (orchestrator, network) = setup(vec![]).await;
        network.apply_event(crate::network::RawNetworkEvent {
            connected: false,
            connection_type: crate::network::ConnectionType::None,
            cellular_generation: None,
            metered: false,
        });

        orchestrator
            .queue
            .enqueue(EntityKind::Session, "s1", Operation::Create, b"{}".to_vec(), 0)
            .await
            .unwrap();

        orchestrator.drain().await.unwrap();
        let stats = orchestrator.queue.stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn single_flight_prevents_concurrent_drains() {
        let (orchestrator, _network) = setup(vec![UploadOutcome::Ack]).await;
        let orchestrator = Arc::new(orchestrator);

        orchestrator.is_syncing.store(true, Ordering::SeqCst);
        let result = orchestrator.drain().await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn conflict_merge_requeues_the_resolved_state_instead_of_losing_it() {
        let server = crate::transport::ServerRecord::from([
            ("valid_reps".to_string(), serde_json::json!(11)),
            ("is_completed".to_string(), serde_json::json!(false)),
            ("updated_at".to_string(), serde_json::json!(6_000)),
        ]);
        let (orchestrator, _network) = setup(vec![UploadOutcome::Conflict(server)]).await;

        // mirrors what `complete_session` enqueues: an `Update` item for a
        // session already mid-flight, the exact case the dedup-onto-the-
        // same-row bug required to reproduce.
        let local = serde_json::json!({"valid_reps": 12, "updated_at": 1_000});
        orchestrator
            .queue
            .enqueue(
                EntityKind::Session,
                "s1",
                Operation::Update,
                serde_json::to_vec(&local).unwrap(),
                1_000,
            )
            .await
            .unwrap();

        let progress = orchestrator.drain().await.unwrap().unwrap();
        assert_eq!(progress.conflicts, 1);

        // the merged state must still be queryable — not upserted onto
        // `item`'s own row and then deleted within the same drain.
        let stats = orchestrator.queue.stats().await.unwrap();
        assert_eq!(stats.total, 1);

        let pending = orchestrator.queue.pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, Operation::Update);
        let resolved: serde_json::Value = serde_json::from_slice(&pending[0].payload).unwrap();
        assert_eq!(resolved["valid_reps"], serde_json::json!(12));
        assert_eq!(resolved["updated_at"], serde_json::json!(6_000));
    }

    #[tokio::test]
    async fn conflict_server_wins_requeues_the_server_state_instead_of_losing_it() {
        let server = crate::transport::ServerRecord::from([
            ("is_completed".to_string(), serde_json::json!(true)),
            ("completed_at".to_string(), serde_json::json!(10_000)),
            ("updated_at".to_string(), serde_json::json!(10_000)),
        ]);
        let (orchestrator, _network) = setup(vec![UploadOutcome::Conflict(server)]).await;

        let local = serde_json::json!({"is_completed": false, "updated_at": 1_000});
        orchestrator
            .queue
            .enqueue(
                EntityKind::Session,
                "s1",
                Operation::Update,
                serde_json::to_vec(&local).unwrap(),
                1_000,
            )
            .await
            .unwrap();

        let progress = orchestrator.drain().await.unwrap().unwrap();
        assert_eq!(progress.conflicts, 1);

        let stats = orchestrator.queue.stats().await.unwrap();
        assert_eq!(stats.total, 1);

        let pending = orchestrator.queue.pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        let resolved: serde_json::Value = serde_json::from_slice(&pending[0].payload).unwrap();
        assert_eq!(resolved["is_completed"], serde_json::json!(true));
        assert_eq!(resolved["completed_at"], serde_json::json!(10_000));
    }

    #[tokio::test]
    async fn manual_conflict_dedupes_parked_rows_across_repeated_drains() {
        let (orchestrator, _network) = setup(vec![]).await;
        let id = orchestrator
            .queue
            .enqueue(EntityKind::Rep, "r1", Operation::Update, b"{}".to_vec(), 0)
            .await
            .unwrap();
        let item = orchestrator.queue.get(id).await.unwrap().unwrap();

        let server = crate::transport::ServerRecord::from([
            ("x".to_string(), serde_json::json!(1)),
            ("updated_at".to_string(), serde_json::json!(5_000)),
        ]);

        // same unresolved conflict re-entering `handle_conflict` on two
        // separate drains (the operator never called `resolve_conflict`)
        // must refresh the one parked row, not insert a second.
        orchestrator
            .handle_conflict(&item, server.clone(), 1_000)
            .await
            .unwrap();
        orchestrator.handle_conflict(&item, server, 2_000).await.unwrap();

        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM conflict_channel WHERE queue_item_id = ?")
                .bind(item.id)
                .fetch_all(&orchestrator.db.pool)
                .await
                .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
