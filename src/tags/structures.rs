//! The `ValueChange` event (spec.md section 3): produced only when a
//! poll observes a value distinct from the current `TagValue`, or on
//! forced resync. This is what flows from the PLC manager into every
//! fan-out consumer.

use crate::value::{TagValue, TypeName};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ValueChange {
    pub plc_name: String,
    pub tag_name: String,
    pub alias: Option<String>,
    pub address: Option<String>,
    pub type_name: TypeName,
    #[serde(flatten)]
    pub tag_value: TagValue,
    pub writable: bool,
    pub no_mqtt: bool,
    pub no_kv: bool,
    pub no_log: bool,
}

impl ValueChange {
    /// The label external keys use: the alias when present, else the tag name.
    pub fn keypart(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.tag_name)
    }
}
