//! Health snapshots, published every 10s by the health publisher
//! (spec.md sections 4.2 and 6).

use crate::drivers::traits::DriverStatus;
use crate::plc_manager::PlcManager;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

#[derive(Debug, Clone, Serialize)]
pub struct HealthMessage {
    pub factory: String,
    pub plc: String,
    pub driver: String,
    pub online: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: u64,
}

impl HealthMessage {
    pub fn from_status(factory: &str, plc: &str, driver_family: &str, status: &DriverStatus) -> Self {
        let (online, status_str, error) = match status {
            DriverStatus::Disconnected => (false, "disconnected".to_string(), None),
            DriverStatus::Connecting => (false, "connecting".to_string(), None),
            DriverStatus::Connected => (true, "connected".to_string(), None),
            DriverStatus::Error(msg) => (false, "error".to_string(), Some(msg.clone())),
        };
        HealthMessage {
            factory: factory.to_string(),
            plc: plc.to_string(),
            driver: driver_family.to_string(),
            online,
            status: status_str,
            error,
            timestamp: now_millis(),
        }
    }
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

const PUBLISH_INTERVAL: Duration = Duration::from_secs(10);

/// Publishes a full health snapshot onto the PLC manager's health
/// broadcast every 10s, independent of the on-change sends the PLC
/// manager already does as a status transitions.
pub struct HealthPublisher {
    plc_manager: PlcManager,
}

impl HealthPublisher {
    pub fn new(plc_manager: PlcManager) -> Self {
        HealthPublisher { plc_manager }
    }

    pub fn spawn(self, join_set: &mut JoinSet<()>, mut shutdown: watch::Receiver<bool>) {
        join_set.spawn(async move {
            let mut ticker = tokio::time::interval(PUBLISH_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.plc_manager.broadcast_health_snapshot().await,
                    _ = shutdown.changed() => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_status_is_online() {
        let msg = HealthMessage::from_status("acme", "plc1", "opcua", &DriverStatus::Connected);
        assert!(msg.online);
        assert!(msg.error.is_none());
    }

    #[test]
    fn error_status_carries_message() {
        let msg = HealthMessage::from_status("acme", "plc1", "opcua", &DriverStatus::Error("boom".into()));
        assert!(!msg.online);
        assert_eq!(msg.error.as_deref(), Some("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn publisher_emits_a_snapshot_per_plc_on_tick() {
        use crate::config::settings::{PlcConfig, TagConfig};
        use crate::drivers::registry::DriverRegistry;
        use crate::value::TypeName;

        let registry = DriverRegistry::with_builtins();
        let plcs = vec![PlcConfig {
            name: "plc1".into(),
            address: "mock://".into(),
            family: "mock".into(),
            enabled: true,
            poll_rate_ms: 1000,
            tags: vec![TagConfig {
                name: "t1".into(),
                alias: None,
                address: None,
                type_name: TypeName::Bool,
                writable: false,
                no_mqtt: false,
                no_kv: false,
                no_log: false,
            }],
        }];
        let plc_manager = PlcManager::new("acme", &plcs, &registry).unwrap();
        let mut rx = plc_manager.subscribe_health();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut join_set = JoinSet::new();
        HealthPublisher::new(plc_manager).spawn(&mut join_set, shutdown_rx);

        tokio::time::advance(PUBLISH_INTERVAL).await;
        let health = rx.recv().await.unwrap();
        assert_eq!(health.plc, "plc1");
    }
}
