//! Home Assistant REST API client.

use crate::config::HassConfig;
use crate::consts;
use crate::state::EntityState;
use crate::Result;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct ConfigResponse {
    #[serde(default)]
    state: Option<String>,
}

pub struct RestApi {
    base: String,
    token: String,
    http: reqwest::Client,
    /// Set while HA reports `RUNNING`; cleared on WebSocket disconnect.
    running: Arc<AtomicBool>,
}

impl RestApi {
    pub fn new(config: &HassConfig) -> Self {
        Self {
            base: config.api_base(),
            token: config.token.clone(),
            http: reqwest::Client::new(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn mark_stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Single `GET config` liveness probe.
    pub async fn probe(&self) -> Result<bool> {
        let response = self
            .http
            .get(self.url("config"))
            .bearer_auth(&self.token)
            .timeout(consts::HA_PROBE_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        let config: ConfigResponse = response.json().await?;
        Ok(config.state.as_deref() == Some("RUNNING"))
    }

    /// Block until HA reports it is running. Never gives up.
    pub async fn wait_until_running(&self) {
        while !self.is_running() {
            info!("Checking if Home Assistant is running...");
            match self.probe().await {
                Ok(true) => {
                    self.running.store(true, Ordering::SeqCst);
                    break;
                }
                Ok(false) => debug!("Home Assistant is not running yet"),
                Err(err) => debug!("Home Assistant probe failed: {}", err),
            }
            tokio::time::sleep(consts::HA_PROBE_INTERVAL).await;
        }
    }

    /// `POST states/{entity_id}`. Skipped while HA is not running.
    pub async fn post_state(&self, entity: &EntityState) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        self.http
            .post(self.url(&format!("states/{}", entity.entity_id)))
            .bearer_auth(&self.token)
            .json(entity)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// `POST events/{event_type}`.
    pub async fn post_event(&self, event_type: &str, data: &Value) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        self.http
            .post(self.url(&format!("events/{}", event_type)))
            .bearer_auth(&self.token)
            .json(data)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
