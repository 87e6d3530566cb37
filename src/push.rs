//! Push manager (spec.md section 4.7): fires HTTP webhooks off the
//! condition engine, with body-template interpolation.

use crate::config::settings::{PushAuth, PushConfig};
use crate::condition::{ConditionEngine, ValueLookup};
use crate::plc_manager::PlcManager;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

static TEMPLATE_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"#([A-Za-z_]\w*(?:\.\w+)+)").unwrap());

pub struct Push {
    config: PushConfig,
    engine: ConditionEngine,
    client: Client,
    plc_manager: PlcManager,
}

impl Push {
    pub fn new(config: PushConfig, plc_manager: PlcManager) -> Self {
        let engine = ConditionEngine::new(config.conditions.clone(), config.cooldown_mode, config.cooldown_min);
        let client = Client::builder().timeout(Duration::from_secs(config.timeout_secs)).build().unwrap_or_else(|_| Client::new());
        Push { config, engine, client, plc_manager }
    }

    /// Runs the 100ms condition tick until `shutdown` fires, firing the
    /// webhook whenever the engine reports a condition should fire.
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
            self.fire(index).await;
            self.engine.complete_firing(index);
        }
    }

    async fn fire(&self, _condition_index: usize) {
        match self.send().await {
            Ok(status) if status < 400 => info!(push = %self.config.name, status, "webhook fired"),
            Ok(status) => warn!(push = %self.config.name, status, "webhook returned error status"),
            Err(err) => error!(push = %self.config.name, error = %err, "webhook request failed"),
        }
    }

    async fn send(&self) -> Result<u16, reqwest::Error> {
        let body = self.interpolated_body();
        let mut request = self
            .client
            .request(method(&self.config.method), &self.config.url)
            .body(body.clone());

        if !body.is_empty() {
            request = request.header("Content-Type", "application/json");
        }
        request = apply_auth(request, &self.config);
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }

        let response = request.send().await?;
        Ok(response.status().as_u16())
    }

    fn interpolated_body(&self) -> String {
        interpolate(&self.config.body_template, &self.plc_manager)
    }

    /// Bypasses conditions, fires once, and returns an error if the
    /// response status is >= 400.
    pub async fn test_fire(&self) -> Result<(), String> {
        match self.send().await {
            Ok(status) if status < 400 => Ok(()),
            Ok(status) => Err(format!("webhook responded with status {status}")),
            Err(err) => Err(err.to_string()),
        }
    }
}

struct PlcManagerLookup<'a>(&'a PlcManager);

impl<'a> ValueLookup for PlcManagerLookup<'a> {
    fn lookup(&self, plc: &str, tag: &str) -> Option<crate::value::TagValue> {
        self.0.current_value(plc, tag)
    }
}

fn interpolate(template: &str, plc_manager: &PlcManager) -> String {
    TEMPLATE_REF
        .replace_all(template, |caps: &regex::Captures| {
            let path = &caps[1];
            let Some((plc, tag)) = path.split_once('.') else { return caps[0].to_string() };
            match plc_manager.current_value(plc, tag) {
                Some(tag_value) => tag_value.value.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn method(name: &str) -> reqwest::Method {
    name.parse().unwrap_or(reqwest::Method::POST)
}

fn apply_auth(request: reqwest::RequestBuilder, config: &PushConfig) -> reqwest::RequestBuilder {
    match config.auth {
        PushAuth::None => request,
        PushAuth::Bearer | PushAuth::Jwt => match &config.auth_token {
            Some(token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        },
        PushAuth::Basic => request.basic_auth(config.auth_username.clone().unwrap_or_default(), config.auth_password.clone()),
        PushAuth::CustomHeader => match (&config.auth_header_name, &config.auth_token) {
            (Some(name), Some(value)) => request.header(name, value),
            _ => request,
        },
    }
}
