// lib.rs - Offline-first synchronization kernel entry point
//
// `SyncKernel` is what the host app constructs and holds: the durable
// store, the queue manager, the network monitor, and the orchestrator
//. Everything outside the core — capture, UI, credential
// storage, the GraphQL transport's concrete wire format, OS task
// scheduling, config loading — is a collaborator the host supplies through
// one of the narrow traits in `network` or `transport`.

pub mod config;
pub mod conflict;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod network;
pub mod operator;
pub mod orchestrator;
pub mod producer;
pub mod queue;
pub mod retry;
pub mod transport;

pub use config::SyncConfig;
pub use error::{Error, Result};
pub use operator::{ConflictAction, SyncStatus};
pub use producer::CompletionStats;

use db::Database;
use network::NetworkMonitor;
use orchestrator::SyncOrchestrator;
use queue::SyncQueueManager;
use std::path::Path;
use std::sync::Arc;
use transport::Transport;

/// The offline-first sync kernel.
///
/// Owns the durable store, the sync queue manager, the retry scheduler
/// (stateless, invoked by the queue manager), the network monitor, and the
/// sync orchestrator. The conflict detector is stateless and invoked by
/// the orchestrator as needed; it has no kernel-owned state of its own.
pub struct SyncKernel {
    pub(crate) db: Database,
    pub(crate) queue: Arc<SyncQueueManager>,
    pub(crate) network: Arc<NetworkMonitor>,
    pub(crate) orchestrator: Arc<SyncOrchestrator>,
    pub(crate) config: SyncConfig,
}

impl SyncKernel {
    /// Opens (or creates) the durable store at `db_path` and wires up the
    /// queue, network monitor, and orchestrator around it.
    pub async fn new(db_path: &Path, transport: Arc<dyn Transport>, config: SyncConfig) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db = Database::new(db_path).await?;
        Self::from_database(db, transport, config)
    }

    /// Ephemeral in-memory variant, for tests and short-lived embeddings.
    pub async fn new_in_memory(transport: Arc<dyn Transport>, config: SyncConfig) -> Result<Self> {
        let db = Database::new_in_memory().await?;
        Self::from_database(db, transport, config)
    }

    fn from_database(db: Database, transport: Arc<dyn Transport>, config: SyncConfig) -> Result<Self> {
        let queue = Arc::new(SyncQueueManager::new(db.pool.clone(), config.clone()));
        let network = Arc::new(NetworkMonitor::new());
        let orchestrator = Arc::new(SyncOrchestrator::new(
            db.clone(),
            queue.clone(),
            network.clone(),
            transport,
            config.clone(),
        ));

        Ok(Self {
            db,
            queue,
            network,
            orchestrator,
            config,
        })
    }

    /// The process-wide network status observable.
    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    /// The sync queue manager, for callers that need raw
    /// access beyond the producer/operator API surfaces.
    pub fn queue(&self) -> &Arc<SyncQueueManager> {
        &self.queue
    }

    /// The sync orchestrator.
    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    /// Spawns the cooperative auto-sync timer. The host
    /// is responsible for aborting the returned handle on shutdown, and
    /// for calling `pause_auto_sync`/`resume_auto_sync` around
    /// backgrounding transitions.
    pub fn spawn_auto_sync(&self) -> tokio::task::JoinHandle<()> {
        self.orchestrator.spawn_auto_sync()
    }

    /// App backgrounding: pauses the auto-sync timer.
    pub fn pause_auto_sync(&self) {
        self.orchestrator.pause_auto_sync();
    }

    /// App foregrounding: resumes the timer and triggers an immediate
    /// drain.
    pub async fn resume_auto_sync(&self) -> Result<Option<orchestrator::events::DrainProgress>> {
        self.orchestrator.resume_auto_sync().await
    }

    /// Runs one periodic cleanup pass: storage caps, unsynced-retention
    /// GC, and orphan queue purge. The host schedules this
    /// independently of the auto-sync timer.
    pub async fn run_cleanup(&self, now: i64) -> Result<lifecycle::CleanupReport> {
        lifecycle::Cleanup::new(&self.db, &self.config).run(now).await
    }
}
