//! One sink connection (spec.md section 4.4's `Publisher`): owns a
//! transport, reconnects with backoff, and republishes every current
//! value on reconnect. Shared by the KV, MQTT, and log-broker managers
//! — they differ only in topic/key shape and whether writeback is
//! wired in, both supplied by the caller.

use crate::bus::common::{BusTransport, SharedTransport, WireValue, WriteRequest, WriteResponse};
use crate::error::WarlinkError;
use crate::health::HealthMessage;
use crate::tags::ValueChange;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// A function that returns every tag's current value, for the
/// on-connect resync `Start` performs (spec.md: "for KV this forces a
/// full resync by publishing every current TagValue").
pub type ResyncFn = Arc<dyn Fn() -> Vec<ValueChange> + Send + Sync>;

pub struct Publisher {
    pub name: String,
    pub selector: String,
    key_ttl: Option<Duration>,
    transport: SharedTransport,
    running: Arc<AtomicBool>,
    resync: RwLock<Option<ResyncFn>>,
}

impl Publisher {
    pub fn new(name: impl Into<String>, selector: impl Into<String>, key_ttl_secs: u64, transport: SharedTransport) -> Self {
        Publisher {
            name: name.into(),
            selector: selector.into(),
            key_ttl: if key_ttl_secs > 0 { Some(Duration::from_secs(key_ttl_secs)) } else { None },
            transport,
            running: Arc::new(AtomicBool::new(false)),
            resync: RwLock::new(None),
        }
    }

    pub async fn set_resync(&self, resync: ResyncFn) {
        *self.resync.write().await = Some(resync);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Idempotent: connects if not already connected, then (for sinks
    /// that registered one) runs the resync callback once.
    pub async fn start(&self, channel_for_value: impl Fn(&ValueChange) -> Option<String>) -> Result<(), WarlinkError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.connect_with_backoff().await;
        if let Some(resync) = self.resync.read().await.clone() {
            for change in resync() {
                if let Some(channel) = channel_for_value(&change) {
                    let _ = self.publish_value(&channel, &WireValue::from_change("", &change, change.type_name)).await;
                }
            }
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn connect_with_backoff(&self) {
        let mut backoff = RECONNECT_BASE;
        loop {
            let mut transport = self.transport.lock().await;
            match transport.connect().await {
                Ok(()) => {
                    info!(sink = %self.name, "bus publisher connected");
                    return;
                }
                Err(err) => {
                    warn!(sink = %self.name, error = %err, "bus publisher connect failed, retrying");
                    drop(transport);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RECONNECT_CAP);
                }
            }
        }
    }

    pub async fn publish_value(&self, channel: &str, value: &WireValue) -> Result<(), WarlinkError> {
        let payload = serde_json::to_vec(value).map_err(|e| WarlinkError::Protocol(e.to_string()))?;
        self.publish_raw(channel, payload).await
    }

    /// All SET/PUBLISH operations for one change batch, in batch order.
    pub async fn publish_batch(&self, items: &[(String, WireValue)]) -> Result<(), WarlinkError> {
        for (channel, value) in items {
            self.publish_value(channel, value).await?;
        }
        Ok(())
    }

    pub async fn publish_health(&self, channel: &str, health: &HealthMessage) -> Result<(), WarlinkError> {
        let payload = serde_json::to_vec(health).map_err(|e| WarlinkError::Protocol(e.to_string()))?;
        self.publish_raw(channel, payload).await
    }

    pub async fn publish_pack(&self, channel: &str, raw_json: Vec<u8>) -> Result<(), WarlinkError> {
        self.publish_raw(channel, raw_json).await
    }

    pub async fn publish_response(&self, channel: &str, response: &WriteResponse) -> Result<(), WarlinkError> {
        let payload = serde_json::to_vec(response).map_err(|e| WarlinkError::Protocol(e.to_string()))?;
        self.publish_raw(channel, payload).await
    }

    pub async fn publish_raw(&self, channel: &str, bytes: Vec<u8>) -> Result<(), WarlinkError> {
        if !self.is_running() {
            return Err(WarlinkError::SinkUnavailable(self.name.clone()));
        }
        let mut transport = self.transport.lock().await;
        transport.publish(channel, bytes, self.key_ttl).await
    }

    /// Subscribes to a channel, returning a receiver of parsed `T`;
    /// malformed payloads are logged and dropped (spec.md section 7:
    /// "malformed wire data — discarded, logged"), never surfaced to
    /// the consumer.
    pub async fn subscribe_parsed<T>(&self, channel: &str) -> mpsc::Receiver<T>
    where
        T: serde::de::DeserializeOwned + Send + 'static,
    {
        let mut raw = self.transport.lock().await.subscribe(channel).await;
        let (tx, rx) = mpsc::channel(64);
        let sink = self.name.clone();
        tokio::spawn(async move {
            loop {
                match raw.recv().await {
                    Ok(bytes) => match serde_json::from_slice::<T>(&bytes) {
                        Ok(value) => {
                            if tx.send(value).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(sink = %sink, error = %err, "malformed payload, dropping"),
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }

    /// Subscribes to a writeback-carrying channel using the shared
    /// `WriteRequest` envelope (KV and log-broker writeback).
    pub async fn subscribe_writeback(&self, channel: &str) -> mpsc::Receiver<WriteRequest> {
        self.subscribe_parsed(channel).await
    }
}
