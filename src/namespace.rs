//! Canonical topic/key/channel strings, derived from
//! `(namespace, selector, plc, tag)` per spec.md section 4.3.
//!
//! Every function here is pure: same inputs always produce identical
//! output, and none of them touch I/O or shared state.

use unicode_normalization::UnicodeNormalization;

const DEFAULT_SELECTOR: &str = "plc";
// `/`-joined builders (KV, MQTT) must reject `/`; `.`-joined builders
// (log) must reject `.`. Both reject `*`, the wildcard `kv_all_changes`
// reserves for itself. Neither set rejects the other's separator, so a
// namespace containing a dot (spec.md section 4.2's allowed charset)
// still builds valid KV/MQTT keys.
const SLASH_RESERVED: &[char] = &['/', '*'];
const DOT_RESERVED: &[char] = &['.', '*'];

/// Error returned when a namespace/selector/plc/tag combination would
/// collide with the builder's reserved separators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("namespace component {0:?} contains a reserved separator")]
pub struct NamespaceError(pub String);

fn normalize(s: &str) -> String {
    s.nfc().collect()
}

fn check_component(raw: &str, reserved: &[char]) -> Result<String, NamespaceError> {
    let normalized = normalize(raw);
    if normalized.chars().any(|c| reserved.contains(&c)) {
        return Err(NamespaceError(raw.to_string()));
    }
    Ok(normalized)
}

fn check_slash_component(raw: &str) -> Result<String, NamespaceError> {
    check_component(raw, SLASH_RESERVED)
}

fn check_dot_component(raw: &str) -> Result<String, NamespaceError> {
    check_component(raw, DOT_RESERVED)
}

fn effective_selector(selector: &str) -> &str {
    if selector.is_empty() {
        DEFAULT_SELECTOR
    } else {
        selector
    }
}

pub fn kv_tag_key(ns: &str, selector: &str, plc: &str, tag: &str) -> Result<String, NamespaceError> {
    let (ns, selector, plc, tag) = (
        check_slash_component(ns)?,
        check_slash_component(effective_selector(selector))?,
        check_slash_component(plc)?,
        check_slash_component(tag)?,
    );
    Ok(format!("{ns}/{selector}/tag/{plc}/{tag}"))
}

pub fn kv_health_key(ns: &str, selector: &str, plc: &str) -> Result<String, NamespaceError> {
    let (ns, selector, plc) = (
        check_slash_component(ns)?,
        check_slash_component(effective_selector(selector))?,
        check_slash_component(plc)?,
    );
    Ok(format!("{ns}/{selector}/health/{plc}"))
}

pub fn kv_changes_channel(ns: &str, selector: &str, plc: &str) -> Result<String, NamespaceError> {
    let (ns, selector, plc) = (
        check_slash_component(ns)?,
        check_slash_component(effective_selector(selector))?,
        check_slash_component(plc)?,
    );
    Ok(format!("{ns}/{selector}/changes/{plc}"))
}

pub fn kv_all_changes(ns: &str, selector: &str) -> Result<String, NamespaceError> {
    let (ns, selector) = (check_slash_component(ns)?, check_slash_component(effective_selector(selector))?);
    Ok(format!("{ns}/{selector}/changes/*"))
}

pub fn kv_writeback_queue(ns: &str, selector: &str) -> Result<String, NamespaceError> {
    let (ns, selector) = (check_slash_component(ns)?, check_slash_component(effective_selector(selector))?);
    Ok(format!("{ns}/{selector}/writeback"))
}

pub fn mqtt_topic(ns: &str, selector: &str, plc: &str, tag: &str) -> Result<String, NamespaceError> {
    let (ns, selector, plc, tag) = (
        check_slash_component(ns)?,
        check_slash_component(effective_selector(selector))?,
        check_slash_component(plc)?,
        check_slash_component(tag)?,
    );
    Ok(format!("{ns}/{selector}/{plc}/{tag}"))
}

pub fn mqtt_write_topic(ns: &str, selector: &str, plc: &str, tag: &str) -> Result<String, NamespaceError> {
    Ok(format!("{}/set", mqtt_topic(ns, selector, plc, tag)?))
}

pub fn log_topic(ns: &str, selector: &str, plc: &str, tag: &str) -> Result<String, NamespaceError> {
    let (ns, selector, plc, tag) = (
        check_dot_component(ns)?,
        check_dot_component(effective_selector(selector))?,
        check_dot_component(plc)?,
        check_dot_component(tag)?,
    );
    Ok(format!("{ns}.{selector}.{plc}.{tag}"))
}

pub fn kv_writeback_response(ns: &str, selector: &str) -> Result<String, NamespaceError> {
    let (ns, selector) = (check_slash_component(ns)?, check_slash_component(effective_selector(selector))?);
    Ok(format!("{ns}/{selector}/writeback/response"))
}

pub fn mqtt_writeback_response(ns: &str, selector: &str) -> Result<String, NamespaceError> {
    kv_writeback_response(ns, selector)
}

pub fn log_writeback_response(ns: &str, selector: &str) -> Result<String, NamespaceError> {
    let (ns, selector) = (check_dot_component(ns)?, check_dot_component(effective_selector(selector))?);
    Ok(format!("{ns}.{selector}.writeback.response"))
}

pub fn kv_pack_topic(ns: &str, selector: &str, name: &str) -> Result<String, NamespaceError> {
    let (ns, selector, name) = (
        check_slash_component(ns)?,
        check_slash_component(effective_selector(selector))?,
        check_slash_component(name)?,
    );
    Ok(format!("{ns}/{selector}/pack/{name}"))
}

pub fn mqtt_pack_topic(ns: &str, selector: &str, name: &str) -> Result<String, NamespaceError> {
    kv_pack_topic(ns, selector, name)
}

pub fn log_pack_topic(ns: &str, selector: &str, name: &str) -> Result<String, NamespaceError> {
    let (ns, selector, name) = (
        check_dot_component(ns)?,
        check_dot_component(effective_selector(selector))?,
        check_dot_component(name)?,
    );
    Ok(format!("{ns}.{selector}.pack.{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_tag_key_schema() {
        assert_eq!(
            kv_tag_key("acme", "cell1", "plc1", "temp").unwrap(),
            "acme/cell1/tag/plc1/temp"
        );
    }

    #[test]
    fn empty_selector_defaults_to_plc() {
        assert_eq!(
            kv_tag_key("acme", "", "plc1", "temp").unwrap(),
            "acme/plc/tag/plc1/temp"
        );
    }

    #[test]
    fn log_topic_uses_dots() {
        assert_eq!(log_topic("acme", "cell1", "plc1", "temp").unwrap(), "acme.cell1.plc1.temp");
    }

    #[test]
    fn rejects_reserved_characters() {
        assert!(kv_tag_key("acme/x", "cell1", "plc1", "temp").is_err());
        assert!(kv_tag_key("acme", "cell1", "plc1", "te*mp").is_err());
    }

    #[test]
    fn dotted_namespace_builds_slash_joined_keys() {
        assert_eq!(
            kv_tag_key("acme-plant_1.cell", "cell1", "plc1", "temp").unwrap(),
            "acme-plant_1.cell/cell1/tag/plc1/temp"
        );
        assert_eq!(
            mqtt_topic("acme-plant_1.cell", "cell1", "plc1", "temp").unwrap(),
            "acme-plant_1.cell/cell1/plc1/temp"
        );
    }

    #[test]
    fn log_topic_rejects_dots_but_allows_slashes() {
        assert!(log_topic("acme", "cell1", "plc/1", "temp").is_ok());
        assert!(log_topic("acme.plant", "cell1", "plc1", "temp").is_err());
    }

    #[test]
    fn pure_function_same_inputs_same_output() {
        let a = mqtt_topic("ns", "sel", "p", "t").unwrap();
        let b = mqtt_topic("ns", "sel", "p", "t").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn mqtt_write_topic_suffix() {
        assert_eq!(
            mqtt_write_topic("ns", "sel", "p", "t").unwrap(),
            "ns/sel/p/t/set"
        );
    }

    #[test]
    fn writeback_response_channels_mirror_their_bus_separator() {
        assert_eq!(kv_writeback_response("acme", "cell1").unwrap(), "acme/cell1/writeback/response");
        assert_eq!(log_writeback_response("acme", "cell1").unwrap(), "acme.cell1.writeback.response");
    }
}
