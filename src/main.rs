//! Entry point: loads configuration, wires the PLC manager to every
//! bus publisher and peripheral consumer, and drives the cascade in
//! `shutdown.rs` once a Ctrl-C signal arrives.

use async_trait::async_trait;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use warlink::api::{create_api_routes, SharedAppState};
use warlink::bus::common::{WriteResponse, WriteRequest};
use warlink::bus::kv::KvManager;
use warlink::bus::logbus::LogManager;
use warlink::bus::mqtt::MqttManager;
use warlink::bus::publisher::Publisher;
use warlink::cli::Cli;
use warlink::config::settings::{Settings, TagPackConfig};
use warlink::drivers::registry::DriverRegistry;
use warlink::health::HealthPublisher;
use warlink::logging;
use warlink::namespace;
use warlink::plc_manager::PlcManager;
use warlink::push::Push;
use warlink::shutdown::ShutdownCoordinator;
use warlink::tagpack::{PackSink, PackValue, TagPackManager};
use warlink::trigger::Trigger;
use warlink::warcry::WarcryServer;
use warlink::writeback::{ResponseSink, WritebackRouter};

/// Fans an assembled `PackValue` out to every bus per the pack's
/// per-bus enable flags, and onto warcry if any client is attached.
/// `warcry` is filled in after the server is constructed, since the
/// server itself needs this fanout's `TagPackManager` to answer
/// `list_packs` requests — see `main` for the two-step wiring.
struct PackFanout {
    kv: Arc<KvManager>,
    mqtt: Arc<MqttManager>,
    log: Arc<LogManager>,
    warcry: OnceCell<Arc<WarcryServer>>,
}

#[async_trait]
impl PackSink for PackFanout {
    async fn publish_pack(&self, config: &TagPackConfig, pack: &PackValue) {
        let raw = match serde_json::to_vec(pack) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(pack = %config.name, error = %err, "failed to serialize pack, skipping");
                return;
            }
        };
        if config.kv_enabled {
            self.kv.publish_pack(&config.name, raw.clone()).await;
        }
        if config.mqtt_enabled {
            self.mqtt.publish_pack(&config.name, raw.clone()).await;
        }
        if config.log_enabled {
            self.log.publish_pack(&config.name, raw).await;
        }
        if let Some(warcry) = self.warcry.get() {
            warcry.broadcast_tagpack(pack.clone()).await;
        }
    }
}

/// Publishes a `WriteResponse` back through one bus's `Publisher` on a
/// fixed response channel.
struct PublisherResponseSink {
    publisher: Arc<Publisher>,
    channel: String,
}

#[async_trait]
impl ResponseSink for PublisherResponseSink {
    async fn publish_response(&self, response: &WriteResponse) {
        if let Err(err) = self.publisher.publish_response(&self.channel, response).await {
            warn!(sink = %self.publisher.name, error = %err, "failed to publish writeback response");
        }
    }
}

/// A sink with nowhere to publish a response (no bus configured for
/// the queue a writeback request arrived on); logs and drops it.
struct NullResponseSink;

#[async_trait]
impl ResponseSink for NullResponseSink {
    async fn publish_response(&self, _response: &WriteResponse) {}
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Some(filter) = &cli.log_debug {
        std::env::set_var("RUST_LOG", filter);
    } else if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    logging::init_logging(None);

    let mut settings = match Settings::load(&cli.config) {
        Ok(settings) => settings,
        Err(err) => {
            error!(config = %cli.config.display(), error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    if let Some(namespace) = &cli.namespace {
        settings = match settings.with_namespace(namespace.clone()) {
            Ok(settings) => settings,
            Err(err) => {
                error!(namespace = %namespace, error = %err, "invalid namespace override");
                std::process::exit(1);
            }
        };
    }
    let namespace = settings.namespace.clone();
    info!(namespace = %namespace, plcs = settings.plcs.len(), "warlink starting");

    let registry = DriverRegistry::with_builtins();
    let plc_manager = match PlcManager::new(&namespace, &settings.plcs, &registry) {
        Ok(manager) => manager,
        Err(err) => {
            error!(error = %err, "failed to build plc manager");
            std::process::exit(1);
        }
    };

    let kv = Arc::new(KvManager::new(&namespace, &settings.kv));
    let mqtt = Arc::new(MqttManager::new(&namespace, &settings.mqtt));
    let log = Arc::new(LogManager::new(&namespace, &settings.log));
    kv.start_all(&plc_manager).await;
    mqtt.start_all(&plc_manager).await;
    log.start_all(&plc_manager).await;
    kv.attach_changes(&plc_manager);
    kv.attach_health(&plc_manager);
    mqtt.attach_changes(&plc_manager);
    mqtt.attach_health(&plc_manager);
    log.attach_changes(&plc_manager);
    log.attach_health(&plc_manager);

    let fanout = Arc::new(PackFanout { kv: kv.clone(), mqtt: mqtt.clone(), log: log.clone(), warcry: OnceCell::new() });
    let tagpack_manager = Arc::new(TagPackManager::new(settings.tagpacks.clone(), plc_manager.clone(), fanout.clone()));

    let warcry_server = Arc::new(WarcryServer::new(&namespace, plc_manager.clone(), tagpack_manager.clone(), 0));
    let _ = fanout.warcry.set(warcry_server.clone());

    let mut coordinator = ShutdownCoordinator::new();

    // PLC polling lives in the `buses` stage: nothing downstream may
    // observe a value after the manager disconnects its drivers.
    let polling_shutdown = coordinator.buses.subscribe();
    plc_manager.spawn_polling(coordinator.buses.tasks_mut(), polling_shutdown);

    {
        let mut rx = plc_manager.subscribe_changes();
        let tagpack_manager = tagpack_manager.clone();
        let warcry = warcry_server.clone();
        coordinator.buses.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(batch) => {
                        if let Some(first) = batch.first() {
                            tagpack_manager.on_tag_changes(&first.plc_name, &batch);
                        }
                        for change in batch {
                            warcry.broadcast_tag(change).await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
    {
        let mut rx = plc_manager.subscribe_health();
        let warcry = warcry_server.clone();
        coordinator.buses.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(health) => warcry.broadcast_health(health).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    {
        let tagpack_manager = tagpack_manager.clone();
        let shutdown = coordinator.buses.subscribe();
        coordinator.buses.spawn(async move { tagpack_manager.run(shutdown).await });
    }

    let health_shutdown = coordinator.buses.subscribe();
    HealthPublisher::new(plc_manager.clone()).spawn(coordinator.buses.tasks_mut(), health_shutdown);

    for push_config in settings.pushes.clone() {
        let mut push = Push::new(push_config, plc_manager.clone());
        let shutdown = coordinator.pushes.subscribe();
        coordinator.pushes.spawn(async move { push.run(shutdown).await });
    }

    for trigger_config in settings.triggers.clone() {
        let mut trigger = Trigger::new(trigger_config, plc_manager.clone(), tagpack_manager.clone());
        let shutdown = coordinator.triggers.subscribe();
        coordinator.triggers.spawn(async move { trigger.run(shutdown).await });
    }

    spawn_writeback_routes(&mut coordinator, &plc_manager, &kv, &mqtt, &log, &namespace, &settings).await;

    {
        let warcry_server = warcry_server.clone();
        let addr = format!("0.0.0.0:{}", warcry_port(&settings));
        let shutdown = coordinator.warcry.subscribe();
        coordinator.warcry.spawn(async move {
            if let Err(err) = warcry_server.run(&addr, shutdown).await {
                error!(error = %err, "warcry server exited");
            }
        });
    }

    if !cli.no_api {
        let state = SharedAppState { plc_manager: plc_manager.clone(), tagpack_manager: tagpack_manager.clone(), start_time: tokio::time::Instant::now() };
        let app = create_api_routes().with_state(state);
        let port = cli.port.unwrap_or(8080);
        let host = cli.host.clone().unwrap_or_else(|| "0.0.0.0".to_string());
        tokio::spawn(async move {
            let addr = format!("{host}:{port}");
            match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => {
                    info!(addr = %addr, "rest api listening");
                    if let Err(err) = axum::serve(listener, app).await {
                        error!(error = %err, "rest api server exited");
                    }
                }
                Err(err) => error!(addr = %addr, error = %err, "failed to bind rest api"),
            }
        });
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received, draining");
    coordinator.run(&plc_manager).await;
    info!("shutdown complete");
}

/// Peripheral front ends (SSH, REST) read their ports off `cli`; the
/// warcry TCP port has no CLI flag of its own in spec.md section 6, so
/// it comes from the opaque `web` config block when present, else a
/// fixed default.
fn warcry_port(settings: &Settings) -> u16 {
    settings
        .web
        .as_ref()
        .and_then(|web| web.get("warcryPort"))
        .and_then(|v| v.as_u64())
        .and_then(|v| u16::try_from(v).ok())
        .unwrap_or(7777)
}

async fn spawn_writeback_routes(
    coordinator: &mut ShutdownCoordinator,
    plc_manager: &PlcManager,
    kv: &Arc<KvManager>,
    mqtt: &Arc<MqttManager>,
    log: &Arc<LogManager>,
    namespace: &str,
    settings: &Settings,
) {
    let plc_names: Vec<String> = settings.plcs.iter().map(|p| p.name.clone()).collect();

    if let Some(rx) = kv.writeback_receiver().await {
        let router = WritebackRouter::new(plc_manager.clone());
        let sink = kv_response_sink(kv, namespace);
        let shutdown = coordinator.buses.subscribe();
        coordinator.buses.spawn(async move { router.run(rx, sink.as_ref(), shutdown).await });
    }

    if let Some(rx) = mqtt.writeback_receiver(&settings.plcs).await {
        let router = WritebackRouter::new(plc_manager.clone());
        let sink = mqtt_response_sink(mqtt, namespace);
        let shutdown = coordinator.buses.subscribe();
        coordinator.buses.spawn(async move { router.run(rx, sink.as_ref(), shutdown).await });
    }

    let rx: tokio::sync::mpsc::Receiver<WriteRequest> = log.writeback_receiver(&plc_names).await;
    let router = WritebackRouter::new(plc_manager.clone());
    let sink = log_response_sink(log, namespace);
    let shutdown = coordinator.buses.subscribe();
    coordinator.buses.spawn(async move { router.run(rx, sink.as_ref(), shutdown).await });
}

fn kv_response_sink(kv: &Arc<KvManager>, namespace: &str) -> Box<dyn ResponseSink> {
    match kv.publishers().first() {
        Some(publisher) => match namespace::kv_writeback_response(namespace, &publisher.selector) {
            Ok(channel) => Box::new(PublisherResponseSink { publisher: publisher.clone(), channel }),
            Err(_) => Box::new(NullResponseSink),
        },
        None => Box::new(NullResponseSink),
    }
}

fn mqtt_response_sink(mqtt: &Arc<MqttManager>, namespace: &str) -> Box<dyn ResponseSink> {
    match mqtt.publishers().first() {
        Some(publisher) => match namespace::mqtt_writeback_response(namespace, &publisher.selector) {
            Ok(channel) => Box::new(PublisherResponseSink { publisher: publisher.clone(), channel }),
            Err(_) => Box::new(NullResponseSink),
        },
        None => Box::new(NullResponseSink),
    }
}

fn log_response_sink(log: &Arc<LogManager>, namespace: &str) -> Box<dyn ResponseSink> {
    match log.publishers().first() {
        Some(publisher) => match namespace::log_writeback_response(namespace, &publisher.selector) {
            Ok(channel) => Box::new(PublisherResponseSink { publisher: publisher.clone(), channel }),
            Err(_) => Box::new(NullResponseSink),
        },
        None => Box::new(NullResponseSink),
    }
}
