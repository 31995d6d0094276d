// network.rs - Network quality monitor and adaptive parameter table
//
// Modeled as a process-wide observable over `tokio::sync::watch`, chosen
// specifically because a `watch` channel's defining property — a new
// receiver immediately observes the current value — is exactly what a
// newly-subscribed listener needs: the current status on subscription,
// then every update after.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
    Unknown,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellularGeneration {
    G5,
    G4,
    G3,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Offline,
}

/// Raw event as delivered by the host's network-events collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawNetworkEvent {
    pub connected: bool,
    pub connection_type: ConnectionType,
    pub cellular_generation: Option<CellularGeneration>,
    pub metered: bool,
}

/// Derived, in-memory-only network status.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub connected: bool,
    pub quality: NetworkQuality,
    pub connection_type: ConnectionType,
    pub metered: bool,
    pub can_sync: bool,
    pub batch_size: u32,
    pub retry_floor_ms: i64,
}

impl NetworkStatus {
    /// Classifies a raw host event into the derived status.
    pub fn classify(event: RawNetworkEvent) -> Self {
        let quality = if !event.connected {
            NetworkQuality::Offline
        } else {
            match event.connection_type {
                ConnectionType::Wifi | ConnectionType::Ethernet => NetworkQuality::Excellent,
                ConnectionType::Cellular => match event.cellular_generation {
                    Some(CellularGeneration::G5) => NetworkQuality::Excellent,
                    Some(CellularGeneration::G4) => NetworkQuality::Good,
                    Some(CellularGeneration::G3) => NetworkQuality::Fair,
                    Some(CellularGeneration::Other) | None => NetworkQuality::Poor,
                },
                ConnectionType::Unknown => NetworkQuality::Good,
                ConnectionType::None => NetworkQuality::Offline,
            }
        };

        let (batch_size, retry_floor_ms) = adaptive_params(quality);

        let metered_cellular = event.metered && event.connection_type == ConnectionType::Cellular;
        let can_sync = !matches!(quality, NetworkQuality::Poor | NetworkQuality::Offline) && !metered_cellular;

        Self {
            connected: event.connected,
            quality,
            connection_type: event.connection_type,
            metered: event.metered,
            can_sync,
            batch_size,
            retry_floor_ms,
        }
    }
}

/// Adaptive parameter table.
fn adaptive_params(quality: NetworkQuality) -> (u32, i64) {
    match quality {
        NetworkQuality::Excellent => (20, 2_000),
        NetworkQuality::Good => (10, 5_000),
        NetworkQuality::Fair => (5, 10_000),
        NetworkQuality::Poor => (1, 60_000),
        NetworkQuality::Offline => (0, 30_000),
    }
}

/// Collaborator trait the host implements to deliver network events.
///
/// The crate does not implement OS-level connectivity detection; it only
/// consumes whatever the host delivers through this interface.
pub trait HostNetworkEvents: Send + Sync {
    fn subscribe(&self) -> tokio::sync::mpsc::Receiver<RawNetworkEvent>;
}

/// Process-wide network status observable.
pub struct NetworkMonitor {
    tx: watch::Sender<NetworkStatus>,
}

impl NetworkMonitor {
    /// Starts offline until the first host event arrives.
    pub fn new() -> Self {
        let initial = NetworkStatus::classify(RawNetworkEvent {
            connected: false,
            connection_type: ConnectionType::None,
            cellular_generation: None,
            metered: false,
        });

        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Current status, read-only to all consumers except the monitor itself.
    pub fn current(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    /// New subscribers observe the current value immediately.
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }

    /// Applies a raw host event, notifying subscribers only on transition
    /// of connected/quality/type.
    pub fn apply_event(&self, event: RawNetworkEvent) {
        let next = NetworkStatus::classify(event);
        let changed = {
            let current = self.tx.borrow();
            current.connected != next.connected
                || current.quality != next.quality
                || current.connection_type != next.connection_type
        };

        if changed {
            tracing::info!(
                quality = ?next.quality,
                can_sync = next.can_sync,
                "network status transitioned"
            );
            // `send` only errors when there are no receivers left; the
            // monitor itself still holds the current value via `borrow`.
            let _ = self.tx.send(next);
        } else {
            // still update metered/derived fields without notifying,
            // e.g. the host toggling the metered flag mid-session.
            self.tx.send_if_modified(|s| {
                if *s != next {
                    *s = next;
                }
                false
            });
        }
    }

    /// Spawns a task that drains the host's event receiver into this monitor.
    pub fn spawn_listener(monitor: std::sync::Arc<Self>, mut rx: tokio::sync::mpsc::Receiver<RawNetworkEvent>) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                monitor.apply_event(event);
            }
        });
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(
        connected: bool,
        connection_type: ConnectionType,
        gen: Option<CellularGeneration>,
        metered: bool,
    ) -> RawNetworkEvent {
        RawNetworkEvent {
            connected,
            connection_type,
            cellular_generation: gen,
            metered,
        }
    }

    #[test]
    fn wifi_is_excellent() {
        let status = NetworkStatus::classify(event(true, ConnectionType::Wifi, None, false));
        assert_eq!(status.quality, NetworkQuality::Excellent);
        assert!(status.can_sync);
        assert_eq!(status.batch_size, 20);
    }

    #[test]
    fn cellular_generations_map_correctly() {
        let g5 = NetworkStatus::classify(event(
            true,
            ConnectionType::Cellular,
            Some(CellularGeneration::G5),
            false,
        ));
        assert_eq!(g5.quality, NetworkQuality::Excellent);

        let g4 = NetworkStatus::classify(event(
            true,
            ConnectionType::Cellular,
            Some(CellularGeneration::G4),
            false,
        ));
        assert_eq!(g4.quality, NetworkQuality::Good);

        let g3 = NetworkStatus::classify(event(
            true,
            ConnectionType::Cellular,
            Some(CellularGeneration::G3),
            false,
        ));
        assert_eq!(g3.quality, NetworkQuality::Fair);

        let other = NetworkStatus::classify(event(
            true,
            ConnectionType::Cellular,
            Some(CellularGeneration::Other),
            false,
        ));
        assert_eq!(other.quality, NetworkQuality::Poor);
        assert!(!other.can_sync);
    }

    #[test]
    fn metered_cellular_cannot_sync_even_if_fast() {
        let status = NetworkStatus::classify(event(
            true,
            ConnectionType::Cellular,
            Some(CellularGeneration::G5),
            true,
        ));
        assert_eq!(status.quality, NetworkQuality::Excellent);
        assert!(!status.can_sync);
    }

    #[test]
    fn disconnected_is_offline() {
        let status = NetworkStatus::classify(event(false, ConnectionType::None, None, false));
        assert_eq!(status.quality, NetworkQuality::Offline);
        assert!(!status.can_sync);
        assert_eq!(status.batch_size, 0);
    }

    #[tokio::test]
    async fn new_subscriber_observes_current_value_immediately() {
        let monitor = NetworkMonitor::new();
        monitor.apply_event(event(true, ConnectionType::Wifi, None, false));

        let rx = monitor.subscribe();
        assert_eq!(rx.borrow().quality, NetworkQuality::Excellent);
    }

    #[tokio::test]
    async fn transition_notifies_subscribers() {
        let monitor = NetworkMonitor::new();
        let mut rx = monitor.subscribe();

        monitor.apply_event(event(true, ConnectionType::Wifi, None, false));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().quality, NetworkQuality::Excellent);
    }
}
