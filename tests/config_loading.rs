//! End-to-end config-file load (spec.md section 6): a real TOML file on
//! disk, parsed into `Settings`, with the same namespace-override path
//! `main` applies from `--namespace`.

use std::io::Write;
use warlink::config::settings::Settings;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn loads_a_full_namespace_with_plcs_and_sinks() {
    let file = write_config(
        r#"
        namespace = "acme"

        [[plcs]]
        name = "plc1"
        address = "mock://"
        family = "mock"
        poll_rate_ms = 250

        [[plcs.tags]]
        name = "temp"
        type = "REAL"
        writable = true

        [[kv]]
        name = "kv1"
        selector = "cell1"
        server_address = "mem://"

        [[mqtt]]
        name = "m1"
        broker_address = "mem://"
        "#,
    );

    let settings = Settings::load(file.path()).unwrap();
    assert_eq!(settings.namespace, "acme");
    assert_eq!(settings.plcs.len(), 1);
    assert_eq!(settings.plcs[0].tags[0].name, "temp");
    assert_eq!(settings.kv.len(), 1);
    assert_eq!(settings.mqtt.len(), 1);
    assert!(settings.log.is_empty());
}

#[test]
fn rejects_a_namespace_with_reserved_characters() {
    let file = write_config(
        r#"
        namespace = "acme/plant"
        "#,
    );
    assert!(Settings::load(file.path()).is_err());
}

#[test]
fn namespace_override_replaces_and_revalidates() {
    let file = write_config(r#"namespace = "acme""#);
    let settings = Settings::load(file.path()).unwrap();

    let overridden = settings.with_namespace("acme-plant_2").unwrap();
    assert_eq!(overridden.namespace, "acme-plant_2");

    let file = write_config(r#"namespace = "acme""#);
    let settings = Settings::load(file.path()).unwrap();
    assert!(settings.with_namespace("bad namespace").is_err());
}
