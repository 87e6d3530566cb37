//! Driver plugin registry: maps a `PlcConfig.family` string to a
//! constructor, so the PLC manager never hardcodes a match arm per
//! protocol family (spec.md section 1: "the core assumes a driver
//! plugin registry... exist[s]").

use crate::drivers::ethernet_ip::EtherNetIpDriver;
use crate::drivers::mock::MockDriver;
use crate::drivers::opcua::OpcUaDriver;
use crate::drivers::traits::{Driver, DriverConfig};
use crate::error::WarlinkError;
use std::collections::HashMap;

type Constructor = fn(DriverConfig) -> Box<dyn Driver>;

pub struct DriverRegistry {
    constructors: HashMap<String, Constructor>,
}

impl DriverRegistry {
    /// A registry with the families this crate ships a driver for built in.
    pub fn with_builtins() -> Self {
        let mut registry = DriverRegistry { constructors: HashMap::new() };
        registry.register("opcua", |config| Box::new(OpcUaDriver::new(config)));
        registry.register("ethernet_ip", |config| Box::new(EtherNetIpDriver::new(config)));
        registry.register("mock", |config| Box::new(MockDriver::new(config)));
        registry
    }

    pub fn register(&mut self, family: &str, constructor: Constructor) {
        self.constructors.insert(family.to_string(), constructor);
    }

    pub fn build(&self, family: &str, config: DriverConfig) -> Result<Box<dyn Driver>, WarlinkError> {
        let constructor = self
            .constructors
            .get(family)
            .ok_or_else(|| WarlinkError::Config(format!("unknown driver family {family:?}")))?;
        Ok(constructor(config))
    }

    pub fn families(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(|s| s.as_str())
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DriverConfig {
        DriverConfig {
            id: "x".into(),
            name: "x".into(),
            address: "x".into(),
            scan_rate_ms: 1000,
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

    #[test]
    fn builds_known_families() {
        let registry = DriverRegistry::with_builtins();
        assert!(registry.build("mock", config()).is_ok());
        assert!(registry.build("opcua", config()).is_ok());
        assert!(registry.build("ethernet_ip", config()).is_ok());
    }

    #[test]
    fn rejects_unknown_family() {
        let registry = DriverRegistry::with_builtins();
        assert!(registry.build("modbus", config()).is_err());
    }
}
