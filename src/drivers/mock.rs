//! An in-memory driver used by tests, the demo binary, and anywhere a
//! scriptable PLC is more useful than a real protocol client.
//!
//! Writes apply immediately to the mock's own state, matching the
//! "driver mock that applies writes immediately" assumption in
//! spec.md section 8's writeback law.

use crate::drivers::traits::{Driver, DriverConfig, DriverResult, DriverStatus, TagRequest};
use crate::error::WarlinkError;
use crate::value::TagValue;
use async_trait::async_trait;
use std::collections::HashMap;

pub struct MockDriver {
    config: DriverConfig,
    connected: bool,
    values: HashMap<String, TagValue>,
}

impl MockDriver {
    pub fn new(config: DriverConfig) -> Self {
        MockDriver {
            config,
            connected: false,
            values: HashMap::new(),
        }
    }

    /// Seed or overwrite a tag's value as the next `read_tags` would see it.
    pub fn set(&mut self, address: &str, value: TagValue) {
        self.values.insert(address.to_string(), value);
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn config(&self) -> &DriverConfig {
        &self.config
    }

    async fn connect(&mut self) -> DriverResult<()> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> DriverResult<()> {
        self.connected = false;
        Ok(())
    }

    async fn check_status(&mut self) -> DriverResult<DriverStatus> {
        if self.connected {
            Ok(DriverStatus::Connected)
        } else {
            Err(WarlinkError::NotConnected(self.config.id.clone()))
        }
    }

    async fn read_tags(&mut self, tags: &[TagRequest]) -> DriverResult<HashMap<String, TagValue>> {
        if !self.connected {
            return Err(WarlinkError::NotConnected(self.config.id.clone()));
        }
        let mut out = HashMap::with_capacity(tags.len());
        for req in tags {
            if let Some(v) = self.values.get(&req.address) {
                out.insert(req.address.clone(), v.clone());
            }
        }
        Ok(out)
    }

    async fn write_tags(
        &mut self,
        tags: HashMap<String, TagValue>,
    ) -> DriverResult<HashMap<String, TagValue>> {
        if !self.connected {
            return Err(WarlinkError::NotConnected(self.config.id.clone()));
        }
        for (address, value) in &tags {
            self.values.insert(address.clone(), value.clone());
        }
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Quality, ValueVariant};

    fn config() -> DriverConfig {
        DriverConfig {
            id: "mock1".into(),
            name: "Mock".into(),
            address: "mock://".into(),
            scan_rate_ms: 100,
            application_name: None,
            application_uri: None,
            session_name: None,
            max_message_size: None,
            max_chunk_count: None,
            connect_retry_attempts: None,
            connect_retry_delay_ms: None,
            connect_retry_backoff: None,
            connect_timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn read_requires_connection() {
        let mut driver = MockDriver::new(config());
        let err = driver.read_tags(&[TagRequest { address: "a".into() }]).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let mut driver = MockDriver::new(config());
        driver.connect().await.unwrap();
        let mut writes = HashMap::new();
        writes.insert("a".to_string(), TagValue::new(ValueVariant::Int(42), Quality::Good));
        driver.write_tags(writes).await.unwrap();

        let read = driver
            .read_tags(&[TagRequest { address: "a".into() }])
            .await
            .unwrap();
        assert_eq!(read["a"].value, ValueVariant::Int(42));
    }
}
