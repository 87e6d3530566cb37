use crate::error::WarlinkError;
use crate::value::TagValue;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Common configuration for all drivers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverConfig {
    pub id: String,
    pub name: String,
    pub address: String,
    pub scan_rate_ms: u64,
    #[serde(default)]
    pub application_name: Option<String>,
    #[serde(default)]
    pub application_uri: Option<String>,
    #[serde(default)]
    pub session_name: Option<String>,
    #[serde(default)]
    pub max_message_size: Option<usize>,
    #[serde(default)]
    pub max_chunk_count: Option<usize>,
    #[serde(default)]
    pub connect_retry_attempts: Option<u32>,
    #[serde(default)]
    pub connect_retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub connect_retry_backoff: Option<f64>,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
}

/// A request to read or write one tag, by driver-native address.
#[derive(Debug, Clone)]
pub struct TagRequest {
    pub address: String,
}

pub type DriverResult<T> = Result<T, WarlinkError>;

/// Connection status, per spec.md section 4.2's health model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/// The interface every pluggable PLC-family driver implements.
///
/// Methods take `&mut self`: the PLC manager owns each driver behind a
/// per-PLC `tokio::sync::Mutex`, so only one caller ever holds a
/// `&mut` at a time (spec.md section 5, "per-PLC mutexes guard driver
/// access").
#[async_trait]
pub trait Driver: Send + Sync {
    fn config(&self) -> &DriverConfig;

    async fn connect(&mut self) -> DriverResult<()>;

    async fn disconnect(&mut self) -> DriverResult<()>;

    async fn check_status(&mut self) -> DriverResult<DriverStatus>;

    /// Read a batch of tags, returning a map from driver-native address to value.
    async fn read_tags(&mut self, tags: &[TagRequest]) -> DriverResult<HashMap<String, TagValue>>;

    /// Write a batch of tags, returning a map from driver-native address to the
    /// resulting value (or an error status per tag if the driver reports one).
    async fn write_tags(
        &mut self,
        tags: HashMap<String, TagValue>,
    ) -> DriverResult<HashMap<String, TagValue>>;
}
