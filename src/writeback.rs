//! Writeback router (spec.md section 4.9): the single path every bus's
//! `WriteRequest` flows through on its way to a driver write.

use crate::bus::common::{WriteRequest, WriteResponse};
use crate::plc_manager::PlcManager;
use async_trait::async_trait;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Where a `WriteResponse` is published back (spec.md: "Publishes a
/// `WriteResponse`... back on the bus's response channel/topic"). Each
/// bus manager implements this against its own publisher.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn publish_response(&self, response: &WriteResponse);
}

pub struct WritebackRouter {
    plc_manager: PlcManager,
}

impl WritebackRouter {
    pub fn new(plc_manager: PlcManager) -> Self {
        WritebackRouter { plc_manager }
    }

    /// Validates, coerces, and dispatches one request. No partial
    /// mutation occurs on coercion/validation failure — `write_tag`
    /// itself never touches driver state until it has a coerced value
    /// for a known, writable tag.
    pub async fn handle(&self, request: WriteRequest) -> WriteResponse {
        match self.plc_manager.write_tag(&request.plc, &request.tag, request.value).await {
            Ok(_) => WriteResponse {
                factory: request.factory,
                plc: request.plc,
                tag: request.tag,
                success: true,
                error: None,
                timestamp: now_millis(),
            },
            Err(err) => WriteResponse {
                factory: request.factory,
                plc: request.plc,
                tag: request.tag,
                success: false,
                error: Some(err.to_string()),
                timestamp: now_millis(),
            },
        }
    }

    /// Drains `rx` until closed or `shutdown` fires, publishing a
    /// response for every request.
    pub async fn run(&self, mut rx: mpsc::Receiver<WriteRequest>, response_sink: &dyn ResponseSink, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                maybe_request = rx.recv() => {
                    let Some(request) = maybe_request else { break };
                    let plc = request.plc.clone();
                    let tag = request.tag.clone();
                    let response = self.handle(request).await;
                    if response.success {
                        info!(plc = %plc, tag = %tag, "writeback applied");
                    } else {
                        warn!(plc = %plc, tag = %tag, error = ?response.error, "writeback rejected");
                    }
                    response_sink.publish_response(&response).await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::{PlcConfig, TagConfig};
    use crate::drivers::registry::DriverRegistry;
    use crate::value::TypeName;
    use std::time::Duration;

    fn settings() -> Vec<PlcConfig> {
        vec![PlcConfig {
            name: "plc1".into(),
            address: "mock://".into(),
            family: "mock".into(),
            enabled: true,
            poll_rate_ms: 1000,
            tags: vec![TagConfig {
                name: "count".into(),
                alias: None,
                address: Some("count".into()),
                type_name: TypeName::Dint,
                writable: true,
                no_mqtt: false,
                no_kv: false,
                no_log: false,
            }],
        }]
    }

    /// Scenario 4 (spec.md section 8): a string `"42"` written to a
    /// DINT tag coerces and reaches the driver, yielding
    /// `{success:true}` plus a matching optimistic `ValueChange` —
    /// the writeback round-trip law.
    #[tokio::test]
    async fn scenario_4_writeback_coerces_and_succeeds() {
        let registry = DriverRegistry::with_builtins();
        let plc_manager = PlcManager::new("acme", &settings(), &registry).unwrap();
        let mut changes = plc_manager.subscribe_changes();

        let mut join_set = tokio::task::JoinSet::new();
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        plc_manager.spawn_polling(&mut join_set, shutdown_rx);
        wait_until_connected(&plc_manager).await;

        let router = WritebackRouter::new(plc_manager);
        let request = WriteRequest { factory: "acme".into(), plc: "plc1".into(), tag: "count".into(), value: serde_json::json!("42") };
        let response = router.handle(request).await;
        assert!(response.success, "a writable DINT tag coerces a numeric string and reaches the connected mock driver");
        assert!(response.error.is_none());

        let batch = tokio::time::timeout(Duration::from_secs(2), changes.recv()).await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].tag_name, "count");
        assert_eq!(batch[0].tag_value.value, crate::value::ValueVariant::Int(42));
    }

    async fn wait_until_connected(plc_manager: &PlcManager) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if plc_manager.health_snapshot().await.iter().any(|h| h.online) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn unknown_tag_fails_without_reaching_the_driver() {
        let registry = DriverRegistry::with_builtins();
        let plc_manager = PlcManager::new("acme", &settings(), &registry).unwrap();
        let router = WritebackRouter::new(plc_manager);
        let request = WriteRequest { factory: "acme".into(), plc: "plc1".into(), tag: "missing".into(), value: serde_json::json!(1) };
        let response = router.handle(request).await;
        assert!(!response.success);
        assert!(response.error.is_some());
    }
}
