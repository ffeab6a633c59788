use super::{drive, Driven, MqttBridge};
use crate::consts;
use crate::homeassistant::discovery::{entity_topic, Component, DeviceId};
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::error;

#[derive(Debug, Clone, PartialEq)]
pub enum SensorValue {
    Text(String),
    Number(f64),
}

impl fmt::Display for SensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorValue::Text(text) => write!(f, "{}", text),
            SensorValue::Number(number) => write!(f, "{}", number),
        }
    }
}

impl From<&str> for SensorValue {
    fn from(text: &str) -> Self {
        SensorValue::Text(text.to_string())
    }
}

impl From<String> for SensorValue {
    fn from(text: String) -> Self {
        SensorValue::Text(text)
    }
}

impl From<f64> for SensorValue {
    fn from(number: f64) -> Self {
        SensorValue::Number(number)
    }
}

impl From<i64> for SensorValue {
    fn from(number: i64) -> Self {
        SensorValue::Number(number as f64)
    }
}

#[async_trait]
pub trait SensorBackend: Send + Sync + 'static {
    async fn get(&self) -> anyhow::Result<SensorValue>;
}

#[derive(Debug, Clone)]
pub struct SensorConfig {
    pub unique_id: String,
    pub name: String,
    pub device_class: Option<String>,
    pub state_class: Option<String>,
    pub unit_of_measurement: Option<String>,
    pub interval: Duration,
    pub device: Option<DeviceId>,
}

impl SensorConfig {
    pub fn new(unique_id: &str, name: &str) -> Self {
        Self {
            unique_id: unique_id.to_string(),
            name: name.to_string(),
            device_class: None,
            state_class: None,
            unit_of_measurement: None,
            interval: consts::DEFAULT_POLL_INTERVAL,
            device: None,
        }
    }
}

/// Read-only value polled from the backend.
pub struct Sensor {
    bridge: Arc<MqttBridge>,
    backend: Box<dyn SensorBackend>,
    state_topic: String,
    current: Mutex<Option<SensorValue>>,
}

impl Sensor {
    pub async fn create<B: SensorBackend>(
        bridge: &Arc<MqttBridge>,
        config: SensorConfig,
        backend: B,
    ) -> Arc<Self> {
        let namespace = bridge.namespace().to_string();
        let component = Component {
            device_class: config.device_class.clone(),
            state_class: config.state_class.clone(),
            unit_of_measurement: config.unit_of_measurement.clone(),
            ..Component::new_sensor(&namespace, &config.name, &config.unique_id)
        }
        .with_device(config.device.clone());
        bridge.register_discovery(&component).await;

        let sensor = Arc::new(Self {
            bridge: bridge.clone(),
            backend: Box::new(backend),
            state_topic: entity_topic(&namespace, "sensor", &config.unique_id, "state"),
            current: Mutex::new(None),
        });
        sensor.poll().await;
        drive(sensor.clone(), None, Some(config.interval));
        sensor
    }

    pub fn current(&self) -> Option<SensorValue> {
        self.current.lock().ok().and_then(|current| current.clone())
    }

    /// Fresh value from the backend; updates the cached one.
    pub async fn get(&self) -> Result<SensorValue> {
        let value = self.backend.get().await?;
        if let Ok(mut current) = self.current.lock() {
            *current = Some(value.clone());
        }
        Ok(value)
    }
}

#[async_trait]
impl Driven for Sensor {
    async fn command(&self, _payload: String) {}

    async fn poll(&self) {
        let value = match self.backend.get().await {
            Ok(value) => value,
            Err(err) => {
                error!("Failed to get sensor value of {}: {}", self.state_topic, err);
                return;
            }
        };
        if self.current().as_ref() == Some(&value) {
            return;
        }
        if let Ok(mut current) = self.current.lock() {
            *current = Some(value.clone());
        }
        self.bridge
            .publish_retained(&self.state_topic, value.to_string())
            .await;
    }
}
