//! PLC manager (spec.md section 4.2): owns the configured PLCs, runs
//! one polling task per enabled PLC, diffs reads against the last
//! known value, and fans `ValueChange` batches out to every consumer
//! through a broadcast channel.

use crate::coerce;
use crate::config::settings::{PlcConfig, TagConfig};
use crate::drivers::registry::DriverRegistry;
use crate::drivers::traits::{Driver, DriverStatus, TagRequest};
use crate::error::WarlinkError;
use crate::health::HealthMessage;
use crate::tags::ValueChange;
use crate::value::{Quality, TagValue};
use dashmap::DashMap;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
const CHANGE_CHANNEL_CAPACITY: usize = 1024;
const HEALTH_CHANNEL_CAPACITY: usize = 256;

struct PlcHandle {
    config: PlcConfig,
    driver: Mutex<Box<dyn Driver>>,
    values: DashMap<String, TagValue>,
    status: RwLock<DriverStatus>,
}

impl PlcHandle {
    fn tag(&self, name: &str) -> Option<&TagConfig> {
        self.config.tags.iter().find(|t| t.name == name)
    }
}

/// Owns every configured PLC and its driver. Cheaply cloneable (an
/// `Arc` wrapper around shared state) so both the polling tasks and
/// bus/condition consumers can hold a handle.
#[derive(Clone)]
pub struct PlcManager {
    namespace: String,
    plcs: Arc<HashMap<String, Arc<PlcHandle>>>,
    changes_tx: broadcast::Sender<Vec<ValueChange>>,
    health_tx: broadcast::Sender<HealthMessage>,
}

impl PlcManager {
    pub fn new(namespace: &str, plcs: &[PlcConfig], registry: &DriverRegistry) -> Result<Self, WarlinkError> {
        let mut built = HashMap::with_capacity(plcs.len());
        for plc in plcs {
            let driver_config = crate::drivers::traits::DriverConfig {
                id: plc.name.clone(),
                name: plc.name.clone(),
                address: plc.address.clone(),
                scan_rate_ms: plc.poll_rate_ms,
                application_name: None,
                application_uri: None,
                session_name: None,
                max_message_size: None,
                max_chunk_count: None,
                connect_retry_attempts: None,
                connect_retry_delay_ms: None,
                connect_retry_backoff: None,
                connect_timeout_ms: None,
            };
            let driver = registry.build(&plc.family, driver_config)?;
            built.insert(
                plc.name.clone(),
                Arc::new(PlcHandle {
                    config: plc.clone(),
                    driver: Mutex::new(driver),
                    values: DashMap::new(),
                    status: RwLock::new(DriverStatus::Disconnected),
                }),
            );
        }
        let (changes_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let (health_tx, _) = broadcast::channel(HEALTH_CHANNEL_CAPACITY);
        Ok(PlcManager {
            namespace: namespace.to_string(),
            plcs: Arc::new(built),
            changes_tx,
            health_tx,
        })
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<Vec<ValueChange>> {
        self.changes_tx.subscribe()
    }

    pub fn subscribe_health(&self) -> broadcast::Receiver<HealthMessage> {
        self.health_tx.subscribe()
    }

    /// Registers a callback invoked with a batch of changes per poll.
    /// The manager hands the callback an owned `Vec`, never a borrowed
    /// driver buffer, satisfying spec.md's "must copy the slice" rule
    /// by construction.
    pub fn set_on_value_change<F>(&self, mut callback: F) -> tokio::task::JoinHandle<()>
    where
        F: FnMut(Vec<ValueChange>) + Send + 'static,
    {
        let mut rx = self.subscribe_changes();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(batch) => callback(batch),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "value-change subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Every known `TagValue`, as a `ValueChange` batch — used by sinks
    /// on (re)connect to force a full resync.
    pub fn get_all_current_values(&self) -> Vec<ValueChange> {
        let mut out = Vec::new();
        for handle in self.plcs.values() {
            for entry in handle.values.iter() {
                if let Some(tag) = handle.tag(entry.key()) {
                    out.push(to_value_change(&handle.config.name, tag, entry.value().clone()));
                }
            }
        }
        out
    }

    pub fn current_value(&self, plc: &str, tag: &str) -> Option<TagValue> {
        self.plcs.get(plc)?.values.get(tag).map(|v| v.clone())
    }

    pub fn tag_config(&self, plc: &str, tag: &str) -> Option<TagConfig> {
        self.plcs.get(plc)?.tag(tag).cloned()
    }

    pub fn plc_config(&self, plc: &str) -> Option<PlcConfig> {
        self.plcs.get(plc).map(|h| h.config.clone())
    }

    /// Validates, coerces, and dispatches a write to the named tag's
    /// driver, then optimistically publishes a synthetic `ValueChange`
    /// so downstream consumers don't wait a full poll interval. The
    /// next poll will observe the same value and skip re-emitting it.
    pub async fn write_tag(&self, plc: &str, tag: &str, raw: serde_json::Value) -> Result<TagValue, WarlinkError> {
        let handle = self
            .plcs
            .get(plc)
            .ok_or_else(|| WarlinkError::Validation(format!("unknown plc {plc:?}")))?
            .clone();
        let tag_config = handle
            .tag(tag)
            .ok_or_else(|| WarlinkError::Validation(format!("unknown tag {plc}.{tag}")))?
            .clone();
        if !tag_config.writable {
            return Err(WarlinkError::Validation(format!("{plc}.{tag} is not writable")));
        }
        let coerced = coerce::coerce(tag_config.type_name, &raw)?;
        let tag_value = TagValue::new(coerced, Quality::Good);

        let address = tag_config.address.clone().unwrap_or_else(|| tag_config.name.clone());
        let mut writes = HashMap::with_capacity(1);
        writes.insert(address.clone(), tag_value.clone());

        let mut driver = handle.driver.lock().await;
        let written = driver.write_tags(writes).await?;
        drop(driver);

        let result = written.get(&address).cloned().unwrap_or(tag_value);
        handle.values.insert(tag_config.name.clone(), result.clone());

        let change = to_value_change(&handle.config.name, &tag_config, result.clone());
        let _ = self.changes_tx.send(vec![change]);
        Ok(result)
    }

    /// Spawns one polling task per enabled PLC onto `join_set`, all
    /// observing `shutdown` to exit cleanly.
    pub fn spawn_polling(&self, join_set: &mut JoinSet<()>, shutdown: watch::Receiver<bool>) {
        for handle in self.plcs.values() {
            if !handle.config.enabled {
                continue;
            }
            let handle = handle.clone();
            let manager = self.clone();
            let mut shutdown = shutdown.clone();
            join_set.spawn(async move {
                tokio::select! {
                    _ = manager.poll_loop(handle) => {}
                    _ = shutdown.changed() => {}
                }
            });
        }
    }

    async fn poll_loop(&self, handle: Arc<PlcHandle>) {
        let tag_requests: Vec<TagRequest> = handle
            .config
            .tags
            .iter()
            .map(|t| TagRequest { address: t.address.clone().unwrap_or_else(|| t.name.clone()) })
            .collect();
        let address_to_tag: HashMap<String, &TagConfig> = handle
            .config
            .tags
            .iter()
            .map(|t| (t.address.clone().unwrap_or_else(|| t.name.clone()), t))
            .collect();

        let mut backoff = RECONNECT_BASE;
        loop {
            if !self.ensure_connected(&handle, &mut backoff).await {
                continue;
            }

            let read = {
                let mut driver = handle.driver.lock().await;
                driver.read_tags(&tag_requests).await
            };

            match read {
                Ok(values) => {
                    backoff = RECONNECT_BASE;
                    self.set_status(&handle, DriverStatus::Connected).await;
                    let mut batch = Vec::new();
                    for (address, value) in values {
                        let Some(&tag) = address_to_tag.get(&address) else { continue };
                        let changed = match handle.values.get(&tag.name) {
                            Some(existing) => *existing != value,
                            None => true,
                        };
                        handle.values.insert(tag.name.clone(), value.clone());
                        if changed {
                            batch.push(to_value_change(&handle.config.name, tag, value));
                        }
                    }
                    if !batch.is_empty() {
                        debug!(plc = %handle.config.name, count = batch.len(), "value change batch");
                        let _ = self.changes_tx.send(batch);
                    }
                }
                Err(err) => {
                    warn!(plc = %handle.config.name, error = %err, "poll failed");
                    self.set_status(&handle, DriverStatus::Error(err.to_string())).await;
                }
            }

            tokio::time::sleep(Duration::from_millis(handle.config.poll_rate_ms)).await;
        }
    }

    /// Connects (or reconnects with backoff) until the driver reports
    /// `Connected`. Returns `true` once connected, `false` if it had to
    /// back off and the caller should loop back around (allowing
    /// shutdown to be observed between attempts).
    async fn ensure_connected(&self, handle: &Arc<PlcHandle>, backoff: &mut Duration) -> bool {
        let already_connected = matches!(*handle.status.read().await, DriverStatus::Connected);
        if already_connected {
            return true;
        }

        self.set_status(handle, DriverStatus::Connecting).await;
        let mut driver = handle.driver.lock().await;
        match driver.connect().await {
            Ok(()) => {
                drop(driver);
                info!(plc = %handle.config.name, "connected");
                self.set_status(handle, DriverStatus::Connected).await;
                true
            }
            Err(err) => {
                drop(driver);
                error!(plc = %handle.config.name, error = %err, "connect failed, backing off");
                self.set_status(handle, DriverStatus::Error(err.to_string())).await;
                let jittered = jitter(*backoff);
                tokio::time::sleep(jittered).await;
                *backoff = (*backoff * 2).min(RECONNECT_CAP);
                false
            }
        }
    }

    async fn set_status(&self, handle: &Arc<PlcHandle>, status: DriverStatus) {
        *handle.status.write().await = status.clone();
        let health = HealthMessage::from_status(&self.namespace, &handle.config.name, &handle.config.family, &status);
        let _ = self.health_tx.send(health);
    }

    pub async fn health_snapshot(&self) -> Vec<HealthMessage> {
        let mut out = Vec::with_capacity(self.plcs.len());
        for handle in self.plcs.values() {
            let status = handle.status.read().await.clone();
            out.push(HealthMessage::from_status(&self.namespace, &handle.config.name, &handle.config.family, &status));
        }
        out
    }

    /// Re-sends the current status of every PLC onto the health
    /// broadcast, for the periodic `HealthPublisher` task.
    pub async fn broadcast_health_snapshot(&self) {
        for health in self.health_snapshot().await {
            let _ = self.health_tx.send(health);
        }
    }

    /// Disconnects every driver. Called last in the shutdown cascade,
    /// after polling tasks have already observed the shutdown signal
    /// and returned.
    pub async fn stop(&self) {
        for handle in self.plcs.values() {
            let mut driver = handle.driver.lock().await;
            if let Err(err) = driver.disconnect().await {
                warn!(plc = %handle.config.name, error = %err, "driver disconnect failed during shutdown");
            }
        }
    }
}

fn jitter(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

fn to_value_change(plc_name: &str, tag: &TagConfig, value: TagValue) -> ValueChange {
    ValueChange {
        plc_name: plc_name.to_string(),
        tag_name: tag.name.clone(),
        alias: tag.alias.clone(),
        address: tag.address.clone(),
        type_name: tag.type_name,
        tag_value: value,
        writable: tag.writable,
        no_mqtt: tag.no_mqtt,
        no_kv: tag.no_kv,
        no_log: tag.no_log,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TypeName;

    /// A driver that plays back a fixed sequence of readings, one per
    /// `read_tags` call, holding the last value once the script runs
    /// out. Used to drive scenario 1 (spec.md section 8) without
    /// reaching into `PlcManager`'s private driver handle.
    struct ScriptedDriver {
        config: crate::drivers::traits::DriverConfig,
        connected: bool,
        script: Vec<crate::value::ValueVariant>,
        step: usize,
    }

    #[async_trait::async_trait]
    impl Driver for ScriptedDriver {
        fn config(&self) -> &crate::drivers::traits::DriverConfig {
            &self.config
        }

        async fn connect(&mut self) -> Result<(), WarlinkError> {
            self.connected = true;
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), WarlinkError> {
            self.connected = false;
            Ok(())
        }

        async fn check_status(&mut self) -> Result<DriverStatus, WarlinkError> {
            Ok(DriverStatus::Connected)
        }

        async fn read_tags(&mut self, tags: &[TagRequest]) -> Result<HashMap<String, TagValue>, WarlinkError> {
            if !self.connected {
                return Err(WarlinkError::NotConnected(self.config.id.clone()));
            }
            let value = self.script[self.step.min(self.script.len() - 1)].clone();
            self.step += 1;
            let mut out = HashMap::with_capacity(tags.len());
            for req in tags {
                out.insert(req.address.clone(), TagValue::new(value.clone(), Quality::Good));
            }
            Ok(out)
        }

        async fn write_tags(&mut self, tags: HashMap<String, TagValue>) -> Result<HashMap<String, TagValue>, WarlinkError> {
            Ok(tags)
        }
    }

    fn scripted_registry() -> DriverRegistry {
        let mut registry = DriverRegistry::with_builtins();
        registry.register("scripted_bool", |config| {
            Box::new(ScriptedDriver {
                config,
                connected: false,
                script: vec![
                    crate::value::ValueVariant::Bool(false),
                    crate::value::ValueVariant::Bool(true),
                    crate::value::ValueVariant::Bool(true),
                    crate::value::ValueVariant::Bool(false),
                ],
                step: 0,
            })
        });
        registry
    }

    /// Scenario 1 (spec.md section 8): a BOOL tag alternating
    /// `false, true, true, false` across four poll cycles must surface
    /// exactly three `ValueChange` events (the unset-to-`false` baseline
    /// plus the two genuine transitions; the repeated middle `true`
    /// does not re-fire), and those three changes reach both the KV and
    /// MQTT buses with matching payloads.
    #[tokio::test]
    async fn scenario_1_poll_dedup_reaches_kv_and_mqtt() {
        let registry = scripted_registry();
        let plcs = vec![PlcConfig {
            name: "plc1".into(),
            address: "mock://".into(),
            family: "scripted_bool".into(),
            enabled: true,
            poll_rate_ms: 20,
            tags: vec![TagConfig {
                name: "alarm".into(),
                alias: None,
                address: Some("alarm".into()),
                type_name: TypeName::Bool,
                writable: false,
                no_mqtt: false,
                no_kv: false,
                no_log: false,
            }],
        }];
        let manager = PlcManager::new("acme", &plcs, &registry).unwrap();

        let kv = crate::bus::kv::KvManager::new(
            "acme",
            &[crate::config::settings::KvSinkConfig { name: "kv1".into(), selector: "cell1".into(), enabled: true, key_ttl_secs: 0, server_address: "mem://".into() }],
        );
        let mqtt = crate::bus::mqtt::MqttManager::new(
            "acme",
            &[crate::config::settings::MqttSinkConfig { name: "m1".into(), selector: "cell1".into(), enabled: true, key_ttl_secs: 0, broker_address: "mem://".into() }],
        );
        kv.start_all(&manager).await;
        mqtt.start_all(&manager).await;

        let kv_topic = crate::namespace::kv_tag_key("acme", "cell1", "plc1", "alarm").unwrap();
        let mqtt_topic = crate::namespace::mqtt_topic("acme", "cell1", "plc1", "alarm").unwrap();
        let mut kv_rx = kv.publishers()[0].subscribe_parsed::<crate::bus::common::WireValue>(&kv_topic).await;
        let mut mqtt_rx = mqtt.publishers()[0].subscribe_parsed::<crate::bus::common::WireValue>(&mqtt_topic).await;

        kv.attach_changes(&manager);
        mqtt.attach_changes(&manager);

        let mut join_set = JoinSet::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        manager.spawn_polling(&mut join_set, shutdown_rx);

        // The first poll has no prior value, so it counts as a change
        // (spec.md section 8's invariant (a)); the repeated `true` in
        // the middle of the script does not. Three changes in total:
        // false (baseline), true (rising), false (falling).
        let mut kv_values = Vec::new();
        for _ in 0..3 {
            kv_values.push(tokio::time::timeout(Duration::from_secs(2), kv_rx.recv()).await.unwrap().unwrap().value);
        }
        assert_eq!(
            kv_values,
            vec![crate::value::ValueVariant::Bool(false), crate::value::ValueVariant::Bool(true), crate::value::ValueVariant::Bool(false)]
        );
        assert!(tokio::time::timeout(Duration::from_millis(100), kv_rx.recv()).await.is_err(), "no change for the repeated middle `true`");

        let mut mqtt_values = Vec::new();
        for _ in 0..3 {
            mqtt_values.push(tokio::time::timeout(Duration::from_secs(2), mqtt_rx.recv()).await.unwrap().unwrap().value);
        }
        assert_eq!(mqtt_values, kv_values);
    }

    fn settings() -> Vec<PlcConfig> {
        vec![PlcConfig {
            name: "plc1".into(),
            address: "mock://".into(),
            family: "mock".into(),
            enabled: true,
            poll_rate_ms: 50,
            tags: vec![TagConfig {
                name: "temp".into(),
                alias: None,
                address: Some("temp".into()),
                type_name: TypeName::Dint,
                writable: true,
                no_mqtt: false,
                no_kv: false,
                no_log: false,
            }],
        }]
    }

    #[tokio::test]
    async fn write_tag_rejects_unwritable() {
        let registry = DriverRegistry::with_builtins();
        let mut cfg = settings();
        cfg[0].tags[0].writable = false;
        let manager = PlcManager::new("acme", &cfg, &registry).unwrap();
        let err = manager.write_tag("plc1", "temp", serde_json::json!(5)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn write_tag_rejects_unknown_tag() {
        let registry = DriverRegistry::with_builtins();
        let manager = PlcManager::new("acme", &settings(), &registry).unwrap();
        let err = manager.write_tag("plc1", "nope", serde_json::json!(5)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn get_all_current_values_starts_empty() {
        let registry = DriverRegistry::with_builtins();
        let manager = PlcManager::new("acme", &settings(), &registry).unwrap();
        assert!(manager.get_all_current_values().is_empty());
    }

}
