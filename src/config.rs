// config.rs - Tunable parameters for the sync kernel
//
// The host app owns *loading* configuration (file, remote flag, env); this
// crate only owns the shape of the values and sensible defaults, per
// spec.md's "configuration loading" being an out-of-scope collaborator.

use serde::{Deserialize, Serialize};

/// Runtime tunables for the sync kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Retry count at or above which an item is considered "failed".
    pub max_retries: u32,
    /// Backoff floor: `delay_ms = min(initial_backoff_ms * 2^retry, max_backoff_ms)`.
    pub initial_backoff_ms: i64,
    /// Backoff ceiling.
    pub max_backoff_ms: i64,
    /// Auto-sync timer period.
    pub auto_sync_interval_secs: u64,
    /// Unsynced rows older than this are eligible for safety GC.
    pub unsynced_retention_days: i64,
    /// Soft cap on total local storage used by synced-pending tables.
    pub storage_cap_bytes: u64,
    /// Soft cap specifically for ML frame blobs.
    pub ml_storage_cap_bytes: u64,
    /// Fraction of `ml_storage_cap_bytes` at which a warning is logged.
    pub ml_cap_warn_ratio: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            auto_sync_interval_secs: 60,
            unsynced_retention_days: 7,
            storage_cap_bytes: 100 * 1024 * 1024,
            ml_storage_cap_bytes: 80 * 1024 * 1024,
            ml_cap_warn_ratio: 0.8,
        }
    }
}
