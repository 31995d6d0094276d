// orchestrator/events.rs - In-process event bus
//
// A typed enum instead of the dynamic payload/callback style the teacher's
// Tauri commands use for the frontend bridge.

use serde::{Deserialize, Serialize};

/// Aggregated progress counters for one drain.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DrainProgress {
    pub total: usize,
    pub current: usize,
    pub synced: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub estimated_ms_remaining: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncEvent {
    SyncStarted,
    SyncQueueing { total: usize },
    SyncProcessing { entity_kind: String, entity_id: String },
    SyncProgress(DrainProgress),
    SyncCompleted(DrainProgress),
    SyncFailed { reason: String },
    SyncConflict { item_id: i64, fields: Vec<String> },
}

type Listener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// Synchronous publish/subscribe event bus.
///
/// Delivery happens inline on the orchestrator's task; listeners must not
/// block. There is no async dispatch or buffering here —
/// a listener that needs to do I/O should spawn its own task.
#[derive(Default)]
pub struct EventBus {
    listeners: std::sync::Mutex<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.listeners.lock().unwrap().push(Box::new(listener));
    }

    pub fn publish(&self, event: SyncEvent) {
        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.iter() {
            listener(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn subscribers_receive_published_events_in_order() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();

        bus.subscribe(move |_event| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(SyncEvent::SyncStarted);
        bus.publish(SyncEvent::SyncCompleted(DrainProgress::default()));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
