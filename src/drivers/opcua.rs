use crate::drivers::traits::{Driver, DriverConfig, DriverResult, DriverStatus, TagRequest};
use crate::error::WarlinkError;
use crate::value::{Quality, TagValue, ValueVariant};
use async_trait::async_trait;
use opcua::{
    client::Client,
    types::{DataValue, NodeId, NumericRange, QualifiedName, ReadValueId, Variant},
};
use std::collections::HashMap;
use std::fmt::Debug;
use tokio::sync::Mutex;

/// OPC UA family driver: one session per instance, serialized through
/// the PLC manager's per-PLC mutex plus an internal session guard
/// since the underlying client is not `Sync`.
pub struct OpcUaDriver {
    config: DriverConfig,
    client: Mutex<Option<Client>>,
}

impl Debug for OpcUaDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpcUaDriver").field("config", &self.config).finish()
    }
}

impl OpcUaDriver {
    pub fn new(config: DriverConfig) -> Self {
        OpcUaDriver {
            config,
            client: Mutex::new(None),
        }
    }

    fn parse_node_id(node_id_str: &str) -> DriverResult<NodeId> {
        let parts: Vec<&str> = node_id_str.split(';').collect();
        if parts.len() != 2 {
            return Err(WarlinkError::Protocol(format!("invalid NodeId format: {node_id_str}")));
        }
        let ns = parts[0]
            .trim_start_matches("ns=")
            .parse::<u16>()
            .map_err(|e| WarlinkError::Protocol(format!("invalid namespace index: {e}")))?;
        let identifier = parts[1];
        if let Some(s) = identifier.strip_prefix("s=") {
            Ok(NodeId::new(ns, s.to_string()))
        } else if let Some(i) = identifier.strip_prefix("i=") {
            let numeric = i
                .parse::<u32>()
                .map_err(|e| WarlinkError::Protocol(format!("invalid numeric identifier: {e}")))?;
            Ok(NodeId::new(ns, numeric))
        } else {
            Err(WarlinkError::Protocol(format!("unsupported NodeId identifier: {identifier}")))
        }
    }

    fn data_value_to_tag_value(dv: &DataValue) -> TagValue {
        let quality = if dv.status().is_good() {
            Quality::Good
        } else {
            Quality::Bad
        };
        let timestamp = dv.source_timestamp.map_or_else(
            || dv.server_timestamp.map_or(0, |dt| dt.as_chrono().timestamp_millis().max(0) as u64),
            |dt| dt.as_chrono().timestamp_millis().max(0) as u64,
        );

        let value_variant = match dv.value.as_ref() {
            Some(variant) => match variant {
                Variant::Boolean(b) => ValueVariant::Bool(*b),
                Variant::SByte(i) => ValueVariant::Int(*i as i64),
                Variant::Byte(u) => ValueVariant::Uint(*u as u64),
                Variant::Int16(i) => ValueVariant::Int(*i as i64),
                Variant::UInt16(u) => ValueVariant::Uint(*u as u64),
                Variant::Int32(i) => ValueVariant::Int(*i as i64),
                Variant::UInt32(u) => ValueVariant::Uint(*u as u64),
                Variant::Int64(i) => ValueVariant::Int(*i),
                Variant::UInt64(u) => ValueVariant::Uint(*u),
                Variant::Float(f) => ValueVariant::Float(*f as f64),
                Variant::Double(d) => ValueVariant::Float(*d),
                Variant::String(s) => ValueVariant::String(s.to_string()),
                _ => ValueVariant::Null,
            },
            None => ValueVariant::Null,
        };

        TagValue {
            value: value_variant,
            quality,
            timestamp,
        }
    }

}

#[async_trait]
impl Driver for OpcUaDriver {
    fn config(&self) -> &DriverConfig {
        &self.config
    }

    async fn connect(&mut self) -> DriverResult<()> {
        let mut client_guard = self.client.lock().await;
        if client_guard.is_some() {
            return Ok(());
        }

        tracing::info!(driver = %self.config.id, address = %self.config.address, "connecting");
        let client = Client::new(&self.config.address, None, None)
            .map_err(|e| WarlinkError::Driver { retryable: true, message: e.to_string() })?;
        *client_guard = Some(client);
        Ok(())
    }

    async fn disconnect(&mut self) -> DriverResult<()> {
        let mut client_guard = self.client.lock().await;
        client_guard.take();
        Ok(())
    }

    async fn check_status(&mut self) -> DriverResult<DriverStatus> {
        let mut client_guard = self.client.lock().await;
        let client = client_guard
            .as_mut()
            .ok_or_else(|| WarlinkError::NotConnected(self.config.id.clone()))?;

        let read_req = ReadValueId {
            node_id: NodeId::new(0, 2256u32),
            attribute_id: 13,
            index_range: NumericRange::None,
            data_encoding: QualifiedName::null(),
        };
        match client.read(&[read_req], 0.0).await {
            Ok(results) if !results.is_empty() && results[0].status().is_good() => {
                Ok(DriverStatus::Connected)
            }
            Ok(_) => Err(WarlinkError::Driver {
                retryable: true,
                message: "server status read returned a bad status code".into(),
            }),
            Err(e) => Err(WarlinkError::Driver { retryable: true, message: e.to_string() }),
        }
    }

    async fn read_tags(&mut self, tags: &[TagRequest]) -> DriverResult<HashMap<String, TagValue>> {
        let mut client_guard = self.client.lock().await;
        let client = client_guard
            .as_mut()
            .ok_or_else(|| WarlinkError::NotConnected(self.config.id.clone()))?;

        let mut read_requests = Vec::with_capacity(tags.len());
        let mut addresses = Vec::with_capacity(tags.len());
        for req in tags {
            let node_id = Self::parse_node_id(&req.address)?;
            addresses.push(req.address.clone());
            read_requests.push(ReadValueId {
                node_id,
                attribute_id: 13,
                index_range: NumericRange::None,
                data_encoding: QualifiedName::null(),
            });
        }

        let results = client
            .read(&read_requests, 0.0)
            .await
            .map_err(|e| WarlinkError::Driver { retryable: true, message: e.to_string() })?;

        let mut tag_values = HashMap::with_capacity(results.len());
        for (address, data_value) in addresses.into_iter().zip(results.iter()) {
            tag_values.insert(address, Self::data_value_to_tag_value(data_value));
        }
        Ok(tag_values)
    }

    async fn write_tags(
        &mut self,
        _tags: HashMap<String, TagValue>,
    ) -> DriverResult<HashMap<String, TagValue>> {
        Err(WarlinkError::Driver {
            retryable: false,
            message: "OPC UA write not implemented".into(),
        })
    }
}
