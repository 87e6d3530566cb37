//! Trigger manager (spec.md section 4.8): same condition engine as the
//! push manager, with tag-write / pack-publish side effects instead of
//! an HTTP call.

use crate::condition::{ConditionEngine, ValueLookup};
use crate::config::settings::{TriggerAction, TriggerConfig};
use crate::plc_manager::PlcManager;
use crate::tagpack::TagPackManager;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

pub struct Trigger {
    config: TriggerConfig,
    engine: ConditionEngine,
    plc_manager: PlcManager,
    tagpack_manager: Arc<TagPackManager>,
}

impl Trigger {
    pub fn new(config: TriggerConfig, plc_manager: PlcManager, tagpack_manager: Arc<TagPackManager>) -> Self {
        let engine = ConditionEngine::new(config.conditions.clone(), config.cooldown_mode, config.cooldown_min);
        Trigger { config, engine, plc_manager, tagpack_manager }
    }

    pub async fn run(&mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        if !self.config.enabled {
            return;
        }
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(Instant::now()).await,
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn tick(&mut self, now: Instant) {
        let lookup = PlcManagerLookup(&self.plc_manager);
        let fired = self.engine.tick(now, &lookup);
        for index in fired {
            self.run_actions().await;
            self.engine.complete_firing(index);
        }
    }

    async fn run_actions(&self) {
        for action in &self.config.actions {
            match action {
                TriggerAction::WriteTag { plc, tag, value } => {
                    if let Err(err) = self.plc_manager.write_tag(plc, tag, value.clone()).await {
                        error!(trigger = %self.config.name, plc = %plc, tag = %tag, error = %err, "trigger write failed");
                    } else {
                        info!(trigger = %self.config.name, plc = %plc, tag = %tag, "trigger wrote tag");
                    }
                }
                TriggerAction::PublishPack { name } => {
                    self.tagpack_manager.publish_pack_immediate(name).await;
                }
            }
        }
    }
}

struct PlcManagerLookup<'a>(&'a PlcManager);

impl<'a> ValueLookup for PlcManagerLookup<'a> {
    fn lookup(&self, plc: &str, tag: &str) -> Option<crate::value::TagValue> {
        self.0.current_value(plc, tag)
    }
}
