//! Dynamically-typed tag values.
//!
//! PLC tags carry a small set of scalar/array types known only at
//! config time, not compile time. `ValueVariant` is the tagged union
//! those values flow through; `TypeName` is the abstract type the
//! config declares per tag and is what writeback coercion targets.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Quality of a tag's last observed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Good,
    Uncertain,
    Bad,
    Initializing,
    CommFailure,
    ConfigError,
}

impl Default for Quality {
    fn default() -> Self {
        Quality::Initializing
    }
}

/// A dynamically-typed scalar or array value.
///
/// Equality is structural: floats compare bitwise, arrays compare
/// element-by-element and length. The core never invents a tolerance
/// for float comparison — that is a policy decision left to whoever
/// configures deadbands upstream of this type, which this spec does
/// not include.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueVariant {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<ValueVariant>),
}

impl PartialEq for ValueVariant {
    fn eq(&self, other: &Self) -> bool {
        use ValueVariant::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Uint(a), Uint(b)) => a == b,
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (String(a), String(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (Array(a), Array(b)) => a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y),
            _ => false,
        }
    }
}

impl fmt::Display for ValueVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueVariant::Null => write!(f, "null"),
            ValueVariant::Bool(b) => write!(f, "{b}"),
            ValueVariant::Int(i) => write!(f, "{i}"),
            ValueVariant::Uint(u) => write!(f, "{u}"),
            ValueVariant::Float(x) => write!(f, "{x}"),
            ValueVariant::String(s) => write!(f, "{s}"),
            ValueVariant::Bytes(b) => write!(f, "{}", base16(b)),
            ValueVariant::Array(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(","))
            }
        }
    }
}

fn base16(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Abstract tag type names, matching spec.md section 4.9's coercion table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TypeName {
    Bool,
    Sint,
    Int,
    Dint,
    Lint,
    Usint,
    Uint,
    Udint,
    Ulint,
    Real,
    Lreal,
    String,
    Wstring,
}

impl TypeName {
    pub fn is_array(self) -> bool {
        false
    }

    /// Inclusive range for signed integer type names; `None` for non-integer types.
    pub fn signed_range(self) -> Option<(i64, i64)> {
        match self {
            TypeName::Sint => Some((i8::MIN as i64, i8::MAX as i64)),
            TypeName::Int => Some((i16::MIN as i64, i16::MAX as i64)),
            TypeName::Dint => Some((i32::MIN as i64, i32::MAX as i64)),
            TypeName::Lint => Some((i64::MIN, i64::MAX)),
            _ => None,
        }
    }

    /// Inclusive range for unsigned integer type names; `None` for non-integer types.
    pub fn unsigned_range(self) -> Option<(u64, u64)> {
        match self {
            TypeName::Usint => Some((0, u8::MAX as u64)),
            TypeName::Uint => Some((0, u16::MAX as u64)),
            TypeName::Udint => Some((0, u32::MAX as u64)),
            TypeName::Ulint => Some((0, u64::MAX)),
            _ => None,
        }
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TypeName::Bool => "BOOL",
            TypeName::Sint => "SINT",
            TypeName::Int => "INT",
            TypeName::Dint => "DINT",
            TypeName::Lint => "LINT",
            TypeName::Usint => "USINT",
            TypeName::Uint => "UINT",
            TypeName::Udint => "UDINT",
            TypeName::Ulint => "ULINT",
            TypeName::Real => "REAL",
            TypeName::Lreal => "LREAL",
            TypeName::String => "STRING",
            TypeName::Wstring => "WSTRING",
        };
        write!(f, "{s}")
    }
}

/// Last-observed value, quality, and timestamp for one tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagValue {
    pub value: ValueVariant,
    pub quality: Quality,
    /// Unix timestamp, milliseconds.
    pub timestamp: u64,
}

impl TagValue {
    pub fn new(value: ValueVariant, quality: Quality) -> Self {
        TagValue {
            value,
            quality,
            timestamp: now_millis(),
        }
    }

    pub fn bad(quality: Quality) -> Self {
        Self::new(ValueVariant::Null, quality)
    }
}

impl PartialEq for TagValue {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
