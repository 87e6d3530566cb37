//! TagPack manager (spec.md section 4.5): debounces bursts of tag
//! changes into one atomic `PackValue` publish per pack.

use crate::config::settings::TagPackConfig;
use crate::plc_manager::PlcManager;
use crate::tags::ValueChange;
use crate::value::{TypeName, ValueVariant};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::debug;

const DEBOUNCE: Duration = Duration::from_millis(250);
const TICK: Duration = Duration::from_millis(50);

/// One member's resolved value inside a `PackValue` (spec.md section 3).
#[derive(Debug, Clone, Serialize)]
pub struct PackTagValue {
    pub value: ValueVariant,
    #[serde(rename = "type")]
    pub type_name: TypeName,
    pub plc: String,
    #[serde(rename = "memLoc", skip_serializing_if = "Option::is_none")]
    pub mem_loc: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackPlcStatus {
    pub address: String,
    pub family: String,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackValue {
    pub name: String,
    pub timestamp: u64,
    pub tags: HashMap<String, PackTagValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plcs: Option<HashMap<String, PackPlcStatus>>,
}

/// Where an assembled `PackValue` goes once debounce (or an immediate
/// publish) fires: fanned to MQTT/KV/log according to the pack's
/// per-bus enable flags, matching spec.md's "invokes the publish
/// callback, which fans out... according to the pack's per-bus enable
/// flags."
#[async_trait]
pub trait PackSink: Send + Sync {
    async fn publish_pack(&self, config: &TagPackConfig, pack: &PackValue);
}

pub struct TagPackManager {
    configs: HashMap<String, TagPackConfig>,
    plc_manager: PlcManager,
    sink: Arc<dyn PackSink>,
    debounce: DashMap<String, Instant>,
    pending_cancel: RwLock<()>,
}

impl TagPackManager {
    pub fn new(configs: Vec<TagPackConfig>, plc_manager: PlcManager, sink: Arc<dyn PackSink>) -> Self {
        TagPackManager {
            configs: configs.into_iter().filter(|c| c.enabled).map(|c| (c.name.clone(), c)).collect(),
            plc_manager,
            sink,
            debounce: DashMap::new(),
            pending_cancel: RwLock::new(()),
        }
    }

    /// For every enabled pack with a member `{plc, IgnoreChanges:false}`
    /// present in `changed`, arms the debounce entry iff absent.
    pub fn on_tag_changes(&self, plc: &str, changed: &[ValueChange]) {
        for config in self.configs.values() {
            let hits = config.members.iter().any(|m| {
                !m.ignore_changes && m.plc == plc && changed.iter().any(|c| c.plc_name == plc && c.tag_name == m.tag)
            });
            if hits {
                self.debounce.entry(config.name.clone()).or_insert_with(Instant::now);
            }
        }
    }

    /// Runs the 50ms promotion ticker until `shutdown` fires.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.promote_due().await,
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn promote_due(&self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .debounce
            .iter()
            .filter(|e| now.duration_since(*e.value()) >= DEBOUNCE)
            .map(|e| e.key().clone())
            .collect();
        for name in due {
            self.debounce.remove(&name);
            self.publish_pack(&name).await;
        }
    }

    async fn publish_pack(&self, name: &str) {
        let _guard = self.pending_cancel.read().await;
        let Some(config) = self.configs.get(name) else { return };
        let pack = self.assemble(config);
        debug!(pack = %name, "publishing tag pack");
        self.sink.publish_pack(config, &pack).await;
    }

    /// Bypasses debounce and cancels any pending entry for `name`.
    pub async fn publish_pack_immediate(&self, name: &str) {
        self.debounce.remove(name);
        self.publish_pack(name).await;
    }

    /// Assembles the current `PackValue` without publishing (read-only
    /// REST surface).
    pub fn get_pack_value(&self, name: &str) -> Option<PackValue> {
        self.configs.get(name).map(|c| self.assemble(c))
    }

    /// Names of every enabled pack, for `list_packs` requests.
    pub fn pack_names(&self) -> Vec<String> {
        self.configs.keys().cloned().collect()
    }

    fn assemble(&self, config: &TagPackConfig) -> PackValue {
        let mut tags = HashMap::with_capacity(config.members.len());
        let mut plcs: HashMap<String, PackPlcStatus> = HashMap::new();
        for member in &config.members {
            match self.plc_manager.current_value(&member.plc, &member.tag) {
                Some(tag_value) => {
                    let tag_config = self.plc_manager.tag_config(&member.plc, &member.tag);
                    let keypart = tag_config.as_ref().map(|t| t.keypart().to_string()).unwrap_or_else(|| member.tag.clone());
                    let type_name = tag_config.as_ref().map(|t| t.type_name).unwrap_or(TypeName::String);
                    let mem_loc = tag_config
                        .as_ref()
                        .filter(|t| t.alias.is_some())
                        .and_then(|t| t.address.clone());
                    tags.insert(
                        format!("{}.{}", member.plc, keypart),
                        PackTagValue { value: tag_value.value, type_name, plc: member.plc.clone(), mem_loc },
                    );
                }
                None => {
                    plcs.insert(
                        member.plc.clone(),
                        PackPlcStatus {
                            address: String::new(),
                            family: String::new(),
                            connected: false,
                            error: Some(format!("tag {} unresolved", member.tag)),
                        },
                    );
                }
            }
        }
        PackValue { name: config.name.clone(), timestamp: now_millis(), tags, plcs: if plcs.is_empty() { None } else { Some(plcs) } }
    }
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::PackMember;
    use crate::drivers::registry::DriverRegistry;

    struct NullSink;
    #[async_trait]
    impl PackSink for NullSink {
        async fn publish_pack(&self, _config: &TagPackConfig, _pack: &PackValue) {}
    }

    fn pack() -> TagPackConfig {
        TagPackConfig {
            name: "p".into(),
            enabled: true,
            topic: "p".into(),
            members: vec![
                PackMember { plc: "plc1".into(), tag: "t1".into(), ignore_changes: false },
                PackMember { plc: "plc1".into(), tag: "t2".into(), ignore_changes: true },
            ],
            mqtt_enabled: true,
            log_enabled: true,
            kv_enabled: true,
        }
    }

    fn change(plc: &str, tag: &str) -> ValueChange {
        ValueChange {
            plc_name: plc.into(),
            tag_name: tag.into(),
            alias: None,
            address: None,
            type_name: TypeName::Int,
            tag_value: crate::value::TagValue::new(ValueVariant::Int(1), crate::value::Quality::Good),
            writable: false,
            no_mqtt: false,
            no_kv: false,
            no_log: false,
        }
    }

    #[tokio::test]
    async fn ignore_changes_member_never_arms_debounce() {
        let registry = DriverRegistry::with_builtins();
        let plc_manager = PlcManager::new("acme", &[], &registry).unwrap();
        let manager = TagPackManager::new(vec![pack()], plc_manager, Arc::new(NullSink));

        manager.on_tag_changes("plc1", &[change("plc1", "t2")]);
        assert!(manager.debounce.is_empty());

        manager.on_tag_changes("plc1", &[change("plc1", "t1")]);
        assert!(manager.debounce.contains_key("p"));
    }

    #[tokio::test]
    async fn debounce_does_not_rearm_while_pending() {
        let registry = DriverRegistry::with_builtins();
        let plc_manager = PlcManager::new("acme", &[], &registry).unwrap();
        let manager = TagPackManager::new(vec![pack()], plc_manager, Arc::new(NullSink));

        manager.on_tag_changes("plc1", &[change("plc1", "t1")]);
        let first = *manager.debounce.get("p").unwrap().value();
        manager.on_tag_changes("plc1", &[change("plc1", "t1")]);
        let second = *manager.debounce.get("p").unwrap().value();
        assert_eq!(first, second);
    }

    struct CountingSink {
        publishes: std::sync::Mutex<Vec<PackValue>>,
    }

    #[async_trait]
    impl PackSink for CountingSink {
        async fn publish_pack(&self, _config: &TagPackConfig, pack: &PackValue) {
            self.publishes.lock().unwrap().push(pack.clone());
        }
    }

    /// Scenario 2 (spec.md section 8): a burst of changes to `p`'s
    /// members within the 250ms debounce window collapses into exactly
    /// one publish, carrying the last-seen value for every member.
    #[tokio::test]
    async fn scenario_2_burst_within_debounce_window_yields_one_publish() {
        let registry = DriverRegistry::with_builtins();
        let plc_manager = PlcManager::new("acme", &[], &registry).unwrap();
        let sink = Arc::new(CountingSink { publishes: std::sync::Mutex::new(Vec::new()) });
        let manager = Arc::new(TagPackManager::new(vec![pack()], plc_manager, sink.clone()));

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let runner = manager.clone();
        let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

        manager.on_tag_changes("plc1", &[change("plc1", "t1")]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.on_tag_changes("plc1", &[change("plc1", "t2")]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.on_tag_changes("plc1", &[change("plc1", "t1")]);

        tokio::time::sleep(Duration::from_millis(400)).await;
        let _ = shutdown_tx.send(true);
        let _ = handle.await;

        assert_eq!(sink.publishes.lock().unwrap().len(), 1, "one burst within the debounce window must yield exactly one publish");
    }
}
