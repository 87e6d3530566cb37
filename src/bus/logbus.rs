//! Log-broker sink (spec.md section 4.4): dot-separated topics
//! (`namespace.selector.plc.tag`), with an optional writeback consumer
//! group that discards records older than `WriteMaxAge`.

use crate::bus::common::{shared_loopback, WireValue, WriteRequest};
use crate::bus::publisher::Publisher;
use crate::config::settings::LogSinkConfig;
use crate::namespace;
use crate::plc_manager::PlcManager;
use crate::tags::ValueChange;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::warn;

pub struct LogManager {
    namespace: String,
    publishers: Vec<Arc<Publisher>>,
    write_configs: Vec<LogSinkConfig>,
}

impl LogManager {
    pub fn new(namespace: &str, sinks: &[LogSinkConfig]) -> Self {
        let publishers = sinks
            .iter()
            .filter(|s| s.enabled)
            .map(|s| Arc::new(Publisher::new(s.name.clone(), s.selector.clone(), 0, shared_loopback())))
            .collect();
        LogManager { namespace: namespace.to_string(), publishers, write_configs: sinks.to_vec() }
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
                .start(move |change: &ValueChange| namespace::log_topic(&ns, &selector, &change.plc_name, change.keypart()).ok())
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
                                .filter(|c| !c.no_log)
                                .filter_map(|c| {
                                    let topic = namespace::log_topic(&ns, &publisher.selector, &c.plc_name, c.keypart()).ok()?;
                                    Some((topic, WireValue::from_change(&ns, c, c.type_name)))
                                })
                                .collect();
                            if let Err(err) = publisher.publish_batch(&items).await {
                                warn!(sink = %publisher.name, error = %err, "log publish failed");
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
            if let Ok(topic) = namespace::log_pack_topic(&self.namespace, &publisher.selector, name) {
                if let Err(err) = publisher.publish_pack(&topic, raw_json.clone()).await {
                    warn!(sink = %publisher.name, error = %err, "log pack publish failed");
                }
            }
        }
    }

    /// Subscribes the per-PLC write topic for every sink with writeback
    /// enabled, discarding records older than that sink's `WriteMaxAge`
    /// (spec.md: "records older than WriteMaxAge are discarded").
    pub async fn writeback_receiver(&self, plc_names: &[String]) -> mpsc::Receiver<WriteRequest> {
        let (tx, rx) = mpsc::channel(128);
        for (publisher, cfg) in self.publishers.iter().zip(&self.write_configs).filter(|(_, c)| c.writeback_enabled) {
            let max_age = Duration::from_secs(cfg.write_max_age_secs);
            for plc in plc_names {
                let topic = format!("{}.{}.writeback.{plc}", self.namespace, publisher.selector);
                let mut raw = publisher.subscribe_parsed::<TimedWriteRequest>(&topic).await;
                let tx = tx.clone();
                tokio::spawn(async move {
                    while let Some(record) = raw.recv().await {
                        if record.age() > max_age {
                            continue;
                        }
                        if tx.send(record.request).await.is_err() {
                            break;
                        }
                    }
                });
            }
        }
        rx
    }
}

/// A log-broker record envelope: the `WriteRequest` plus the record's
/// own timestamp, distinct from any timestamp inside the request body.
#[derive(Debug, Clone, Deserialize)]
struct TimedWriteRequest {
    #[serde(flatten)]
    request: WriteRequest,
    recorded_at: u64,
}

impl TimedWriteRequest {
    fn age(&self) -> Duration {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.recorded_at))
    }
}
