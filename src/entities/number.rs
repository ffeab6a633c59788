use super::{drive, Driven, MqttBridge};
use crate::consts;
use crate::error::Error;
use crate::homeassistant::discovery::{entity_topic, Component, DeviceId};
use crate::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, warn};

#[async_trait]
pub trait NumberBackend: Send + Sync + 'static {
    async fn get(&self) -> anyhow::Result<f64>;
    async fn set(&self, value: f64) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct NumberConfig {
    pub unique_id: String,
    pub name: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub step: Option<f64>,
    pub unit_of_measurement: Option<String>,
    pub interval: Duration,
    pub device: Option<DeviceId>,
}

impl NumberConfig {
    pub fn new(unique_id: &str, name: &str) -> Self {
        Self {
            unique_id: unique_id.to_string(),
            name: name.to_string(),
            min: None,
            max: None,
            step: None,
            unit_of_measurement: None,
            interval: consts::DEFAULT_POLL_INTERVAL,
            device: None,
        }
    }

    pub fn with_range(mut self, min: f64, max: f64, step: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self.step = Some(step);
        self
    }
}

pub struct Number {
    bridge: Arc<MqttBridge>,
    backend: Box<dyn NumberBackend>,
    min: Option<f64>,
    max: Option<f64>,
    state_topic: String,
    /// Unknown until the first successful read or write.
    current: Mutex<Option<f64>>,
}

impl Number {
    pub async fn create<B: NumberBackend>(
        bridge: &Arc<MqttBridge>,
        config: NumberConfig,
        backend: B,
    ) -> Arc<Self> {
        let namespace = bridge.namespace().to_string();
        let component = Component {
            min: config.min,
            max: config.max,
            step: config.step,
            unit_of_measurement: config.unit_of_measurement.clone(),
            ..Component::new_number(&namespace, &config.name, &config.unique_id)
        }
        .with_device(config.device.clone());
        bridge.register_discovery(&component).await;

        let number = Arc::new(Self {
            bridge: bridge.clone(),
            backend: Box::new(backend),
            min: config.min,
            max: config.max,
            state_topic: entity_topic(&namespace, "number", &config.unique_id, "state"),
            current: Mutex::new(None),
        });
        number.poll().await;

        let commands = bridge
            .register_command(&entity_topic(&namespace, "number", &config.unique_id, "set"))
            .await;
        drive(number.clone(), Some(commands), Some(config.interval));
        number
    }

    /// Last known value.
    pub fn current(&self) -> Option<f64> {
        self.current.lock().ok().and_then(|current| *current)
    }

    fn in_range(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }

    fn store(&self, value: f64) {
        if let Ok(mut current) = self.current.lock() {
            *current = Some(value);
        }
    }

    async fn publish_state(&self) {
        if let Some(value) = self.current() {
            self.bridge
                .publish_retained(&self.state_topic, value.to_string())
                .await;
        }
    }

    pub async fn set(&self, value: f64) -> Result<()> {
        if !self.in_range(value) {
            return Err(Error::OutOfRange {
                value,
                min: self.min,
                max: self.max,
            });
        }
        self.backend.set(value).await?;
        self.store(value);
        self.publish_state().await;
        Ok(())
    }

    /// Fresh value from the backend; updates the cached one.
    pub async fn get(&self) -> Result<f64> {
        let value = self.backend.get().await?;
        self.store(value);
        Ok(value)
    }
}

#[async_trait]
impl Driven for Number {
    async fn command(&self, payload: String) {
        let value = match payload.trim().parse::<f64>() {
            Ok(value) if value.is_finite() => value,
            _ => {
                warn!("Received invalid number payload: {}", payload);
                return;
            }
        };
        match self.set(value).await {
            Ok(()) => {}
            Err(err @ Error::OutOfRange { .. }) => warn!("Received {}", err),
            Err(err) => error!("Failed to set {}: {}", self.state_topic, err),
        }
    }

    async fn poll(&self) {
        match self.backend.get().await {
            Ok(value) if Some(value) != self.current() => {
                self.store(value);
                self.publish_state().await;
            }
            Ok(_) => {}
            Err(err) => error!("Failed to get value of {}: {}", self.state_topic, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::tests::{bridge, settle};

    struct Setpoint(Arc<Mutex<f64>>);

    #[async_trait]
    impl NumberBackend for Setpoint {
        async fn get(&self) -> anyhow::Result<f64> {
            Ok(*self.0.lock().unwrap())
        }

        async fn set(&self, value: f64) -> anyhow::Result<()> {
            *self.0.lock().unwrap() = value;
            Ok(())
        }
    }

    async fn thermostat() -> (Arc<Number>, Arc<Mutex<f64>>, Arc<MqttBridge>, Arc<crate::entities::tests::RecordingPublisher>) {
        let (bridge, publisher) = bridge();
        let value = Arc::new(Mutex::new(20.0));
        let config = NumberConfig {
            unit_of_measurement: Some("°C".into()),
            ..NumberConfig::new("target", "Target").with_range(10.0, 30.0, 0.5)
        };
        let number = Number::create(&bridge, config, Setpoint(value.clone())).await;
        (number, value, bridge, publisher)
    }

    #[tokio::test]
    async fn publishes_initial_value_and_range() {
        let (number, _, _, publisher) = thermostat().await;

        assert_eq!(number.current(), Some(20.0));
        assert_eq!(publisher.to_topic("sk/number/target/state"), vec!["20"]);
        let discoveries = publisher.to_topic("homeassistant/number/sk/target/config");
        let discovery: serde_json::Value = serde_json::from_str(&discoveries[0]).unwrap();
        assert_eq!(discovery["min"], 10.0);
        assert_eq!(discovery["max"], 30.0);
        assert_eq!(discovery["step"], 0.5);
        assert_eq!(discovery["unit_of_measurement"], "°C");
    }

    #[tokio::test]
    async fn invalid_commands_are_dropped() {
        let (number, value, bridge, publisher) = thermostat().await;

        bridge.dispatch("sk/number/target/set", "warm".into());
        bridge.dispatch("sk/number/target/set", "45".into());
        bridge.dispatch("sk/number/target/set", "NaN".into());
        settle().await;

        assert_eq!(*value.lock().unwrap(), 20.0);
        assert_eq!(number.current(), Some(20.0));
        assert_eq!(publisher.to_topic("sk/number/target/state"), vec!["20"]);
    }

    #[tokio::test]
    async fn command_round_trip() {
        let (number, value, bridge, publisher) = thermostat().await;

        bridge.dispatch("sk/number/target/set", "21.5".into());
        settle().await;

        assert_eq!(*value.lock().unwrap(), 21.5);
        assert_eq!(number.current(), Some(21.5));
        let published = publisher.published();
        let last = published.last().unwrap();
        assert_eq!(last, &("sk/number/target/state".to_string(), "21.5".to_string(), true));
    }

    #[tokio::test]
    async fn set_out_of_range_fails() {
        let (number, value, _, _) = thermostat().await;

        let result = number.set(5.0).await;
        assert!(matches!(
            result,
            Err(Error::OutOfRange { value, min: Some(min), max: Some(max) })
                if value == 5.0 && min == 10.0 && max == 30.0
        ));
        assert_eq!(*value.lock().unwrap(), 20.0);

        number.set(30.0).await.unwrap();
        assert_eq!(number.get().await.unwrap(), 30.0);
    }
}
