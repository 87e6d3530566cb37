//! Writeback type coercion (spec.md section 4.9's table). Shared by
//! the writeback router (coercing values arriving off a bus) and the
//! PLC manager's `write_tag` (coercing values a trigger or an
//! optimistic-emit caller wants to push straight to a driver).

use crate::error::WarlinkError;
use crate::value::{TypeName, ValueVariant};
use serde_json::Value as JsonValue;

pub fn coerce(type_name: TypeName, raw: &JsonValue) -> Result<ValueVariant, WarlinkError> {
    if let JsonValue::Array(items) = raw {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            out.push(coerce(type_name, item)?);
        }
        return Ok(ValueVariant::Array(out));
    }

    match type_name {
        TypeName::Bool => coerce_bool(raw),
        TypeName::Sint | TypeName::Int | TypeName::Dint | TypeName::Lint => coerce_signed(type_name, raw),
        TypeName::Usint | TypeName::Uint | TypeName::Udint | TypeName::Ulint => coerce_unsigned(type_name, raw),
        TypeName::Real => coerce_f32(raw),
        TypeName::Lreal => coerce_f64(raw),
        TypeName::String | TypeName::Wstring => coerce_string(raw),
    }
}

fn coerce_bool(raw: &JsonValue) -> Result<ValueVariant, WarlinkError> {
    match raw {
        JsonValue::Bool(b) => Ok(ValueVariant::Bool(*b)),
        JsonValue::Number(n) if n.as_i64() == Some(0) => Ok(ValueVariant::Bool(false)),
        JsonValue::Number(n) if n.as_i64() == Some(1) => Ok(ValueVariant::Bool(true)),
        JsonValue::String(s) if s.eq_ignore_ascii_case("true") => Ok(ValueVariant::Bool(true)),
        JsonValue::String(s) if s.eq_ignore_ascii_case("false") => Ok(ValueVariant::Bool(false)),
        other => Err(WarlinkError::Coercion(format!("{other} is not a valid BOOL"))),
    }
}

fn as_i64(raw: &JsonValue) -> Result<i64, WarlinkError> {
    match raw {
        JsonValue::Number(n) => n.as_i64().ok_or_else(|| WarlinkError::Coercion(format!("{n} is not an integer"))),
        JsonValue::String(s) => s.parse::<i64>().map_err(|e| WarlinkError::Coercion(e.to_string())),
        other => Err(WarlinkError::Coercion(format!("{other} is not an integer"))),
    }
}

fn as_u64(raw: &JsonValue) -> Result<u64, WarlinkError> {
    match raw {
        JsonValue::Number(n) => n.as_u64().ok_or_else(|| WarlinkError::Coercion(format!("{n} is not an unsigned integer"))),
        JsonValue::String(s) => s.parse::<u64>().map_err(|e| WarlinkError::Coercion(e.to_string())),
        other => Err(WarlinkError::Coercion(format!("{other} is not an unsigned integer"))),
    }
}

fn coerce_signed(type_name: TypeName, raw: &JsonValue) -> Result<ValueVariant, WarlinkError> {
    let value = as_i64(raw)?;
    let (lo, hi) = type_name.signed_range().expect("signed type_name");
    if value < lo || value > hi {
        return Err(WarlinkError::Coercion(format!("{value} out of range for {type_name}")));
    }
    Ok(ValueVariant::Int(value))
}

fn coerce_unsigned(type_name: TypeName, raw: &JsonValue) -> Result<ValueVariant, WarlinkError> {
    let value = as_u64(raw)?;
    let (lo, hi) = type_name.unsigned_range().expect("unsigned type_name");
    if value < lo || value > hi {
        return Err(WarlinkError::Coercion(format!("{value} out of range for {type_name}")));
    }
    Ok(ValueVariant::Uint(value))
}

fn coerce_f32(raw: &JsonValue) -> Result<ValueVariant, WarlinkError> {
    let value = raw
        .as_f64()
        .or_else(|| raw.as_str().and_then(|s| s.parse::<f64>().ok()))
        .ok_or_else(|| WarlinkError::Coercion(format!("{raw} is not a valid REAL")))?;
    Ok(ValueVariant::Float(value as f32 as f64))
}

fn coerce_f64(raw: &JsonValue) -> Result<ValueVariant, WarlinkError> {
    let value = raw
        .as_f64()
        .or_else(|| raw.as_str().and_then(|s| s.parse::<f64>().ok()))
        .ok_or_else(|| WarlinkError::Coercion(format!("{raw} is not a valid LREAL")))?;
    Ok(ValueVariant::Float(value))
}

fn coerce_string(raw: &JsonValue) -> Result<ValueVariant, WarlinkError> {
    match raw {
        JsonValue::String(s) => Ok(ValueVariant::String(s.clone())),
        other => Err(WarlinkError::Coercion(format!("{other} is not a STRING"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bool_accepts_documented_forms() {
        assert_eq!(coerce(TypeName::Bool, &json!(true)).unwrap(), ValueVariant::Bool(true));
        assert_eq!(coerce(TypeName::Bool, &json!(0)).unwrap(), ValueVariant::Bool(false));
        assert_eq!(coerce(TypeName::Bool, &json!(1)).unwrap(), ValueVariant::Bool(true));
        assert_eq!(coerce(TypeName::Bool, &json!("true")).unwrap(), ValueVariant::Bool(true));
        assert_eq!(coerce(TypeName::Bool, &json!("false")).unwrap(), ValueVariant::Bool(false));
        assert!(coerce(TypeName::Bool, &json!("maybe")).is_err());
    }

    #[test]
    fn dint_rejects_overflow() {
        assert!(coerce(TypeName::Dint, &json!(42)).is_ok());
        assert!(coerce(TypeName::Dint, &json!(i64::from(i32::MAX) + 1)).is_err());
    }

    #[test]
    fn sint_range_is_i8() {
        assert!(coerce(TypeName::Sint, &json!(127)).is_ok());
        assert!(coerce(TypeName::Sint, &json!(128)).is_err());
    }

    #[test]
    fn unsigned_rejects_negative() {
        assert!(coerce(TypeName::Udint, &json!(-1)).is_err());
    }

    #[test]
    fn string_from_wire_string() {
        assert_eq!(
            coerce(TypeName::String, &json!("hello")).unwrap(),
            ValueVariant::String("hello".to_string())
        );
        assert!(coerce(TypeName::String, &json!(1)).is_err());
    }

    #[test]
    fn array_of_element_type() {
        let v = coerce(TypeName::Dint, &json!([1, 2, 3])).unwrap();
        assert_eq!(
            v,
            ValueVariant::Array(vec![ValueVariant::Int(1), ValueVariant::Int(2), ValueVariant::Int(3)])
        );
    }

    #[test]
    fn real_narrows_to_f32_precision() {
        let v = coerce(TypeName::Real, &json!(1.1)).unwrap();
        if let ValueVariant::Float(f) = v {
            assert_eq!(f, 1.1f32 as f64);
        } else {
            panic!("expected float");
        }
    }
}
