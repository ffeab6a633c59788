use super::{drive, Driven, MqttBridge};
use crate::consts;
use crate::homeassistant::discovery::{entity_topic, Component, DeviceId};
use crate::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, warn};

#[async_trait]
pub trait SwitchBackend: Send + Sync + 'static {
    async fn turn_on(&self) -> anyhow::Result<()>;
    async fn turn_off(&self) -> anyhow::Result<()>;

    /// Real state, when the backend can tell. Polled every interval.
    async fn is_on(&self) -> anyhow::Result<Option<bool>> {
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub struct SwitchConfig {
    pub unique_id: String,
    pub name: String,
    pub interval: Duration,
    pub device: Option<DeviceId>,
}

impl SwitchConfig {
    pub fn new(unique_id: &str, name: &str) -> Self {
        Self {
            unique_id: unique_id.to_string(),
            name: name.to_string(),
            interval: consts::DEFAULT_POLL_INTERVAL,
            device: None,
        }
    }
}

pub struct Switch {
    bridge: Arc<MqttBridge>,
    backend: Box<dyn SwitchBackend>,
    state_topic: String,
    on: Mutex<bool>,
}

fn payload(on: bool) -> String {
    let payload = if on { consts::PAYLOAD_ON } else { consts::PAYLOAD_OFF };
    payload.to_string()
}

impl Switch {
    pub async fn create<B: SwitchBackend>(
        bridge: &Arc<MqttBridge>,
        config: SwitchConfig,
        backend: B,
    ) -> Arc<Self> {
        let namespace = bridge.namespace().to_string();
        let component = Component::new_switch(&namespace, &config.name, &config.unique_id)
            .with_device(config.device.clone());
        bridge.register_discovery(&component).await;

        let switch = Arc::new(Self {
            bridge: bridge.clone(),
            backend: Box::new(backend),
            state_topic: entity_topic(&namespace, "switch", &config.unique_id, "state"),
            on: Mutex::new(false),
        });

        match switch.backend.is_on().await {
            Ok(Some(on)) => switch.store(on),
            Ok(None) => {}
            Err(err) => error!("Unable to read initial state of {}: {}", config.unique_id, err),
        }
        switch.publish_state().await;

        let commands = bridge
            .register_command(&entity_topic(&namespace, "switch", &config.unique_id, "set"))
            .await;
        drive(switch.clone(), Some(commands), Some(config.interval));
        switch
    }

    pub fn is_on(&self) -> bool {
        self.on.lock().map(|on| *on).unwrap_or(false)
    }

    fn store(&self, on: bool) {
        if let Ok(mut current) = self.on.lock() {
            *current = on;
        }
    }

    async fn publish_state(&self) {
        self.bridge
            .publish_retained(&self.state_topic, payload(self.is_on()))
            .await;
    }

    /// Drive the backend, then publish the new state.
    pub async fn set(&self, on: bool) -> Result<()> {
        if on {
            self.backend.turn_on().await?;
        } else {
            self.backend.turn_off().await?;
        }
        self.store(on);
        self.publish_state().await;
        Ok(())
    }

    pub async fn toggle(&self) -> Result<()> {
        self.set(!self.is_on()).await
    }
}

#[async_trait]
impl Driven for Switch {
    async fn command(&self, payload: String) {
        let on = match payload.as_str() {
            consts::PAYLOAD_ON => true,
            consts::PAYLOAD_OFF => false,
            _ => {
                warn!("Received invalid switch command: {}", payload);
                return;
            }
        };
        if let Err(err) = self.set(on).await {
            error!("Switch {} failed: {}", self.state_topic, err);
        }
    }

    async fn poll(&self) {
        match self.backend.is_on().await {
            Ok(Some(on)) if on != self.is_on() => {
                self.store(on);
                self.publish_state().await;
            }
            Ok(_) => {}
            Err(err) => error!("Unable to poll {}: {}", self.state_topic, err),
        }
    }
}
