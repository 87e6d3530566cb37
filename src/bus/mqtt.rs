//! MQTT sink (spec.md section 4.4): topic `namespace/selector/plc/tag`,
//! plus a `/set` write-subscription per writable tag.

use crate::bus::common::{shared_loopback, WireValue, WriteRequest};
use crate::bus::publisher::Publisher;
use crate::config::settings::{MqttSinkConfig, PlcConfig};
use crate::namespace;
use crate::plc_manager::PlcManager;
use crate::tags::ValueChange;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

pub struct MqttManager {
    namespace: String,
    publishers: Vec<Arc<Publisher>>,
}

impl MqttManager {
    pub fn new(namespace: &str, sinks: &[MqttSinkConfig]) -> Self {
        let publishers = sinks
            .iter()
            .filter(|s| s.enabled)
            .map(|s| Arc::new(Publisher::new(s.name.clone(), s.selector.clone(), s.key_ttl_secs, shared_loopback())))
            .collect();
        MqttManager { namespace: namespace.to_string(), publishers }
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
                .start(move |change: &ValueChange| namespace::mqtt_topic(&ns, &selector, &change.plc_name, change.keypart()).ok())
                .await;
        }
    }

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
                                .filter(|c| !c.no_mqtt)
                                .filter_map(|c| {
                                    let topic = namespace::mqtt_topic(&ns, &publisher.selector, &c.plc_name, c.keypart()).ok()?;
                                    Some((topic, WireValue::from_change(&ns, c, c.type_name)))
                                })
                                .collect();
                            if let Err(err) = publisher.publish_batch(&items).await {
                                warn!(sink = %publisher.name, error = %err, "mqtt publish failed");
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
                            if let Ok(topic) = namespace::kv_health_key(&ns, &publisher.selector, &health.plc) {
                                let _ = publisher.publish_health(&topic, &health).await;
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
            if let Ok(topic) = namespace::mqtt_pack_topic(&self.namespace, &publisher.selector, name) {
                if let Err(err) = publisher.publish_pack(&topic, raw_json.clone()).await {
                    warn!(sink = %publisher.name, error = %err, "mqtt pack publish failed");
                }
            }
        }
    }

    /// Subscribes `<tag>/set` for every writable tag across every PLC,
    /// on the first enabled publisher, fanning all of them into one
    /// receiver (spec.md: "subscribes... for every configured writable
    /// tag; payload is raw scalar JSON").
    pub async fn writeback_receiver(&self, plcs: &[PlcConfig]) -> Option<mpsc::Receiver<WriteRequest>> {
        let publisher = self.publishers.first()?.clone();
        let ns = self.namespace.clone();
        let selector = publisher.selector.clone();
        let (tx, rx) = mpsc::channel(128);
        for plc in plcs {
            for tag in plc.tags.iter().filter(|t| t.writable) {
                let Ok(topic) = namespace::mqtt_write_topic(&ns, &selector, &plc.name, tag.keypart()) else { continue };
                // `/set` payloads are a bare scalar, not the full WriteRequest
                // envelope, so parse as a raw JSON value and wrap it ourselves.
                let mut raw = publisher.subscribe_parsed::<serde_json::Value>(&topic).await;
                let tx = tx.clone();
                let factory = ns.clone();
                let plc_name = plc.name.clone();
                let tag_name = tag.keypart().to_string();
                tokio::spawn(async move {
                    while let Some(value) = raw.recv().await {
                        let req = WriteRequest { factory: factory.clone(), plc: plc_name.clone(), tag: tag_name.clone(), value };
                        if tx.send(req).await.is_err() {
                            break;
                        }
                    }
                });
            }
        }
        Some(rx)
    }
}
