//! Persisted configuration (spec.md section 6): a single
//! `{namespace, plcs[], mqtt[], kv[], log[], tagpacks[], triggers[],
//! pushes[], web, sshUsers}` document, loaded once at startup and
//! replaced wholesale on reload.

use crate::condition::{ConditionSpec, CooldownMode};
use crate::value::TypeName;
use config::{Config, ConfigError, File};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;

static NAMESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").unwrap());

/// One tag definition, immutable after load (reload replaces the whole `Settings`).
#[derive(Debug, Clone, Deserialize)]
pub struct TagConfig {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(rename = "type")]
    pub type_name: TypeName,
    #[serde(default)]
    pub writable: bool,
    #[serde(default)]
    pub no_mqtt: bool,
    #[serde(default)]
    pub no_kv: bool,
    #[serde(default)]
    pub no_log: bool,
}

impl TagConfig {
    /// The label used in external keys: the alias when present, else the tag name.
    pub fn keypart(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

fn default_poll_rate_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlcConfig {
    pub name: String,
    pub address: String,
    pub family: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_poll_rate_ms")]
    pub poll_rate_ms: u64,
    #[serde(default)]
    pub tags: Vec<TagConfig>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttSinkConfig {
    pub name: String,
    #[serde(default)]
    pub selector: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub key_ttl_secs: u64,
    pub broker_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KvSinkConfig {
    pub name: String,
    #[serde(default)]
    pub selector: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub key_ttl_secs: u64,
    pub server_address: String,
}

fn default_write_max_age_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSinkConfig {
    pub name: String,
    #[serde(default)]
    pub selector: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub broker_address: String,
    #[serde(default)]
    pub writeback_enabled: bool,
    #[serde(default = "default_write_max_age_secs")]
    pub write_max_age_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PackMember {
    pub plc: String,
    pub tag: String,
    #[serde(default)]
    pub ignore_changes: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagPackConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub topic: String,
    pub members: Vec<PackMember>,
    #[serde(default = "default_enabled")]
    pub mqtt_enabled: bool,
    #[serde(default = "default_enabled")]
    pub log_enabled: bool,
    #[serde(default = "default_enabled")]
    pub kv_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TriggerAction {
    WriteTag { plc: String, tag: String, value: serde_json::Value },
    PublishPack { name: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub conditions: Vec<ConditionSpec>,
    #[serde(default)]
    pub cooldown_mode: CooldownMode,
    #[serde(default)]
    pub cooldown_min: f64,
    pub actions: Vec<TriggerAction>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PushAuth {
    None,
    Bearer,
    Jwt,
    Basic,
    CustomHeader,
}

impl Default for PushAuth {
    fn default() -> Self {
        PushAuth::None
    }
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub conditions: Vec<ConditionSpec>,
    #[serde(default)]
    pub cooldown_mode: CooldownMode,
    #[serde(default)]
    pub cooldown_min: f64,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub body_template: String,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub auth: PushAuth,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub auth_username: Option<String>,
    #[serde(default)]
    pub auth_password: Option<String>,
    #[serde(default)]
    pub auth_header_name: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub namespace: String,
    #[serde(default)]
    pub plcs: Vec<PlcConfig>,
    #[serde(default)]
    pub mqtt: Vec<MqttSinkConfig>,
    #[serde(default)]
    pub kv: Vec<KvSinkConfig>,
    #[serde(default)]
    pub log: Vec<LogSinkConfig>,
    #[serde(default)]
    pub tagpacks: Vec<TagPackConfig>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default)]
    pub pushes: Vec<PushConfig>,
    /// Peripheral REST/HTML admin surface configuration; opaque to the core.
    #[serde(default)]
    pub web: Option<serde_json::Value>,
    /// Peripheral SSH front-end user list; opaque to the core.
    #[serde(default, rename = "sshUsers")]
    pub ssh_users: Option<serde_json::Value>,
}

pub fn validate_namespace(namespace: &str) -> Result<(), ConfigError> {
    if NAMESPACE_RE.is_match(namespace) {
        Ok(())
    } else {
        Err(ConfigError::Message(format!(
            "namespace {namespace:?} must match ^[A-Za-z0-9._-]+$"
        )))
    }
}

impl Settings {
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        let s = Config::builder().add_source(File::from(config_path)).build()?;
        let settings: Settings = s.try_deserialize()?;
        validate_namespace(&settings.namespace)?;
        Ok(settings)
    }

    /// Override the namespace (e.g. from `--namespace`), re-validating it.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Result<Self, ConfigError> {
        let namespace = namespace.into();
        validate_namespace(&namespace)?;
        self.namespace = namespace;
        Ok(self)
    }
}
