//! Black-box coverage of the minimal REST admin surface (`GET
//! /api/health`, `/api/tags`, `/api/packs/:name`) against a real bound
//! `TcpListener`, exercised with `reqwest` the way a real admin client
//! would hit it.

use std::sync::Arc;
use warlink::api::{create_api_routes, SharedAppState};
use warlink::config::settings::{KvSinkConfig, PlcConfig, TagConfig, TagPackConfig, PackMember};
use warlink::drivers::registry::DriverRegistry;
use warlink::plc_manager::PlcManager;
use warlink::tagpack::{PackSink, PackValue, TagPackManager};
use warlink::value::TypeName;

struct NullSink;

#[async_trait::async_trait]
impl PackSink for NullSink {
    async fn publish_pack(&self, _config: &TagPackConfig, _pack: &PackValue) {}
}

fn plc_config() -> PlcConfig {
    PlcConfig {
        name: "plc1".into(),
        address: "mock://".into(),
        family: "mock".into(),
        enabled: true,
        poll_rate_ms: 1000,
        tags: vec![TagConfig {
            name: "temp".into(),
            alias: None,
            address: Some("temp".into()),
            type_name: TypeName::Real,
            writable: false,
            no_mqtt: false,
            no_kv: false,
            no_log: false,
        }],
    }
}

async fn spawn_server() -> (String, tokio::task::JoinHandle<()>) {
    let registry = DriverRegistry::with_builtins();
    let plc_manager = PlcManager::new("acme", &[plc_config()], &registry).unwrap();
    let pack = TagPackConfig {
        name: "p1".into(),
        enabled: true,
        topic: "p1".into(),
        members: vec![PackMember { plc: "plc1".into(), tag: "temp".into(), ignore_changes: false }],
        mqtt_enabled: true,
        log_enabled: true,
        kv_enabled: true,
    };
    let tagpack_manager = Arc::new(TagPackManager::new(vec![pack], plc_manager.clone(), Arc::new(NullSink)));

    let state = SharedAppState { plc_manager, tagpack_manager, start_time: tokio::time::Instant::now() };
    let app = create_api_routes().with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), handle)
}

#[tokio::test]
async fn health_endpoint_reports_uptime() {
    let (base, _server) = spawn_server().await;
    let body: serde_json::Value = reqwest::get(format!("{base}/api/health")).await.unwrap().json().await.unwrap();
    assert!(body["namespace_uptime_secs"].is_u64());
}

#[tokio::test]
async fn tags_endpoint_starts_empty_before_any_poll() {
    let (base, _server) = spawn_server().await;
    let body: Vec<serde_json::Value> = reqwest::get(format!("{base}/api/tags")).await.unwrap().json().await.unwrap();
    assert!(body.is_empty(), "no poll has run yet, so the PLC manager has no current values");
}

#[tokio::test]
async fn unknown_pack_returns_404() {
    let (base, _server) = spawn_server().await;
    let response = reqwest::get(format!("{base}/api/packs/does-not-exist")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn known_pack_returns_its_assembled_value() {
    let (base, _server) = spawn_server().await;
    let response = reqwest::get(format!("{base}/api/packs/p1")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["name"], "p1");
}

// Avoids an unused-import warning for KvSinkConfig when only referenced
// by type for readers scanning config-shaped fixtures in this file.
#[allow(dead_code)]
fn _unused(_: KvSinkConfig) {}
