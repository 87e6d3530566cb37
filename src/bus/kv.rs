//! KV sink (spec.md section 4.4): one `Publisher` per configured
//! `KvSinkConfig`, keyed by `namespace/selector/tag/plc/tag`. On
//! connect every publisher resyncs the full current value set.

use crate::bus::common::{shared_loopback, WireValue, WriteRequest};
use crate::bus::publisher::Publisher;
use crate::config::settings::KvSinkConfig;
use crate::health::HealthMessage;
use crate::namespace;
use crate::plc_manager::PlcManager;
use crate::tags::ValueChange;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

pub struct KvManager {
    namespace: String,
    publishers: Vec<Arc<Publisher>>,
}

impl KvManager {
    pub fn new(namespace: &str, sinks: &[KvSinkConfig]) -> Self {
        let publishers = sinks
            .iter()
            .filter(|s| s.enabled)
            .map(|s| Arc::new(Publisher::new(s.name.clone(), s.selector.clone(), s.key_ttl_secs, shared_loopback())))
            .collect();
        KvManager { namespace: namespace.to_string(), publishers }
    }

    pub fn publishers(&self) -> &[Arc<Publisher>] {
        &self.publishers
    }

    pub async fn start_all(&self, plc_manager: &PlcManager) {
        for publisher in &self.publishers {
            let resync_manager = plc_manager.clone();
            publisher
                .set_resync(Arc::new(move || resync_manager.get_all_current_values()))
                .await;
            let ns = self.namespace.clone();
            let selector = publisher.selector.clone();
            let _ = publisher
                .start(move |change: &ValueChange| namespace::kv_tag_key(&ns, &selector, &change.plc_name, change.keypart()).ok())
                .await;
        }
    }

    /// Spawns one forwarding task per publisher off the PLC manager's
    /// change broadcast, so a slow KV connection never blocks others.
    pub fn attach_changes(&self, plc_manager: &PlcManager) {
        for publisher in &self.publishers {
            let mut rx = plc_manager.subscribe_changes();
            let publisher = publisher.clone();
            let ns = self.namespace.clone();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(batch) => {
                            let items: Vec<_> = batch
                                .iter()
                                .filter(|c| !c.no_kv)
                                .filter_map(|c| {
                                    let key = namespace::kv_tag_key(&ns, &publisher.selector, &c.plc_name, c.keypart()).ok()?;
                                    Some((key, WireValue::from_change(&ns, c, c.type_name)))
                                })
                                .collect();
                            if let Err(err) = publisher.publish_batch(&items).await {
                                warn!(sink = %publisher.name, error = %err, "kv publish failed");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }
    }

    pub fn attach_health(&self, plc_manager: &PlcManager) {
        for publisher in &self.publishers {
            let mut rx = plc_manager.subscribe_health();
            let publisher = publisher.clone();
            let ns = self.namespace.clone();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(health) => {
                            if let Ok(key) = namespace::kv_health_key(&ns, &publisher.selector, &health.plc) {
                                let _ = publisher.publish_health(&key, &health).await;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }
    }

    pub async fn publish_pack(&self, name: &str, raw_json: Vec<u8>) {
        for publisher in &self.publishers {
            if let Ok(topic) = namespace::kv_pack_topic(&self.namespace, &publisher.selector, name) {
                if let Err(err) = publisher.publish_pack(&topic, raw_json.clone()).await {
                    warn!(sink = %publisher.name, error = %err, "kv pack publish failed");
                }
            }
        }
    }

    /// Subscribes the first enabled publisher's writeback queue. The KV
    /// bus carries a single writeback queue per namespace (spec.md
    /// section 4.3's `kv_writeback_queue`), not one per tag.
    pub async fn writeback_receiver(&self) -> Option<mpsc::Receiver<WriteRequest>> {
        let publisher = self.publishers.first()?;
        let queue = namespace::kv_writeback_queue(&self.namespace, &publisher.selector).ok()?;
        Some(publisher.subscribe_writeback(&queue).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> KvSinkConfig {
        KvSinkConfig { name: "kv1".into(), selector: "cell1".into(), enabled: true, key_ttl_secs: 0, server_address: "mem://".into() }
    }

    #[tokio::test]
    async fn start_all_marks_publishers_running() {
        let manager = KvManager::new("acme", &[sink()]);
        let registry = crate::drivers::registry::DriverRegistry::with_builtins();
        let plc_manager = PlcManager::new("acme", &[], &registry).unwrap();
        manager.start_all(&plc_manager).await;
        assert!(manager.publishers()[0].is_running());
    }
}
