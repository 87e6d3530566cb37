//! Shared wire shapes and the loopback transport every bus publisher
//! family (KV, MQTT, log) builds on. Spec.md section 9 treats the real
//! client libraries for these three buses as assumed-external, the way
//! it treats PLC drivers — so this crate ships the same kind of
//! trait-plus-loopback pair it ships for drivers (`src/drivers/mock.rs`),
//! letting `src/bus/{kv,mqtt,logbus}.rs` exercise real publish/
//! subscribe/TTL/reconnect semantics in tests without a vendor SDK.

use crate::error::WarlinkError;
use crate::tags::ValueChange;
use crate::value::{TypeName, ValueVariant};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

/// Publish payload shared by all three buses (spec.md section 4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireValue {
    pub factory: String,
    pub plc: String,
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
    pub value: ValueVariant,
    #[serde(rename = "type")]
    pub type_name: TypeName,
    pub writable: bool,
    pub timestamp: u64,
}

impl WireValue {
    pub fn from_change(factory: &str, change: &ValueChange, type_name: TypeName) -> Self {
        WireValue {
            factory: factory.to_string(),
            plc: change.plc_name.clone(),
            tag: change.keypart().to_string(),
            offset: change.alias.as_ref().and(change.address.clone()),
            value: change.tag_value.value.clone(),
            type_name,
            writable: change.writable,
            timestamp: change.tag_value.timestamp,
        }
    }
}

/// `{factory, plc, tag, value}` arriving off any of the three buses
/// (spec.md section 4.9).
#[derive(Debug, Clone, Deserialize)]
pub struct WriteRequest {
    pub factory: String,
    pub plc: String,
    pub tag: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteResponse {
    pub factory: String,
    pub plc: String,
    pub tag: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: u64,
}

/// The interface a real bus SDK would implement: connect once, publish
/// keyed payloads with an optional TTL, and hand back a broadcast
/// subscription for inbound channels (writeback, MQTT `/set` topics).
#[async_trait]
pub trait BusTransport: Send + Sync {
    async fn connect(&mut self) -> Result<(), WarlinkError>;
    async fn publish(&mut self, channel: &str, payload: Vec<u8>, ttl: Option<Duration>) -> Result<(), WarlinkError>;
    async fn subscribe(&self, channel: &str) -> broadcast::Receiver<Vec<u8>>;
    fn is_connected(&self) -> bool;
}

struct LoopbackChannel {
    tx: broadcast::Sender<Vec<u8>>,
    last_payload: Option<Vec<u8>>,
    ttl: Option<Duration>,
}

/// An in-process publish/subscribe bus: `publish` stores the payload
/// and broadcasts it to every live subscriber of that channel.
/// Subscribers created before a publish only see future payloads,
/// matching real pub/sub semantics (no replay-on-subscribe) — callers
/// that need a resync use `PublishBatch`/`get_all_current_values`
/// instead.
pub struct LoopbackTransport {
    connected: bool,
    channels: Mutex<HashMap<String, LoopbackChannel>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        LoopbackTransport { connected: false, channels: Mutex::new(HashMap::new()) }
    }

    pub async fn last_payload(&self, channel: &str) -> Option<Vec<u8>> {
        self.channels.lock().await.get(channel).and_then(|c| c.last_payload.clone())
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusTransport for LoopbackTransport {
    async fn connect(&mut self) -> Result<(), WarlinkError> {
        self.connected = true;
        Ok(())
    }

    async fn publish(&mut self, channel: &str, payload: Vec<u8>, ttl: Option<Duration>) -> Result<(), WarlinkError> {
        if !self.connected {
            return Err(WarlinkError::SinkUnavailable(channel.to_string()));
        }
        let mut channels = self.channels.lock().await;
        let entry = channels.entry(channel.to_string()).or_insert_with(|| LoopbackChannel {
            tx: broadcast::channel(64).0,
            last_payload: None,
            ttl: None,
        });
        entry.last_payload = Some(payload.clone());
        entry.ttl = ttl;
        let _ = entry.tx.send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> broadcast::Receiver<Vec<u8>> {
        let mut channels = self.channels.lock().await;
        let entry = channels.entry(channel.to_string()).or_insert_with(|| LoopbackChannel {
            tx: broadcast::channel(64).0,
            last_payload: None,
            ttl: None,
        });
        entry.tx.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Shareable handle to a `LoopbackTransport`, since `BusTransport` is
/// typically held behind an `Arc<Mutex<dyn BusTransport>>` by a
/// publisher but test code wants a second handle to assert on.
pub type SharedTransport = Arc<Mutex<dyn BusTransport>>;

pub fn shared_loopback() -> SharedTransport {
    Arc::new(Mutex::new(LoopbackTransport::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_before_connect_fails() {
        let mut t = LoopbackTransport::new();
        assert!(t.publish("c", vec![1], None).await.is_err());
    }

    #[tokio::test]
    async fn subscriber_receives_published_payload() {
        let mut t = LoopbackTransport::new();
        t.connect().await.unwrap();
        let mut rx = t.subscribe("chan").await;
        t.publish("chan", b"hello".to_vec(), None).await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn last_payload_is_retained() {
        let mut t = LoopbackTransport::new();
        t.connect().await.unwrap();
        t.publish("chan", b"v1".to_vec(), None).await.unwrap();
        assert_eq!(t.last_payload("chan").await, Some(b"v1".to_vec()));
    }
}
