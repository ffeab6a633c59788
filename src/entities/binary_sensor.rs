use super::{drive, Driven, MqttBridge};
use crate::consts;
use crate::homeassistant::discovery::{entity_topic, Component, DeviceId};
use crate::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::error;

#[async_trait]
pub trait BinarySensorBackend: Send + Sync + 'static {
    async fn get(&self) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone)]
pub struct BinarySensorConfig {
    pub unique_id: String,
    pub name: String,
    pub device_class: Option<String>,
    pub interval: Duration,
    pub device: Option<DeviceId>,
}

impl BinarySensorConfig {
    pub fn new(unique_id: &str, name: &str) -> Self {
        Self {
            unique_id: unique_id.to_string(),
            name: name.to_string(),
            device_class: None,
            interval: consts::DEFAULT_POLL_INTERVAL,
            device: None,
        }
    }
}

pub struct BinarySensor {
    bridge: Arc<MqttBridge>,
    backend: Box<dyn BinarySensorBackend>,
    state_topic: String,
    current: Mutex<Option<bool>>,
}

impl BinarySensor {
    pub async fn create<B: BinarySensorBackend>(
        bridge: &Arc<MqttBridge>,
        config: BinarySensorConfig,
        backend: B,
    ) -> Arc<Self> {
        let namespace = bridge.namespace().to_string();
        let component = Component {
            device_class: config.device_class.clone(),
            ..Component::new_binary_sensor(&namespace, &config.name, &config.unique_id)
        }
        .with_device(config.device.clone());
        bridge.register_discovery(&component).await;

        let sensor = Arc::new(Self {
            bridge: bridge.clone(),
            backend: Box::new(backend),
            state_topic: entity_topic(&namespace, "binary_sensor", &config.unique_id, "state"),
            current: Mutex::new(None),
        });
        sensor.poll().await;
        drive(sensor.clone(), None, Some(config.interval));
        sensor
    }

    pub fn current(&self) -> Option<bool> {
        self.current.lock().ok().and_then(|current| *current)
    }

    pub async fn get(&self) -> Result<bool> {
        let value = self.backend.get().await?;
        if let Ok(mut current) = self.current.lock() {
            *current = Some(value);
        }
        Ok(value)
    }
}

#[async_trait]
impl Driven for BinarySensor {
    async fn command(&self, _payload: String) {}

    async fn poll(&self) {
        let value = match self.backend.get().await {
            Ok(value) => value,
            Err(err) => {
                error!("Failed to get value of {}: {}", self.state_topic, err);
                return;
            }
        };
        if self.current() == Some(value) {
            return;
        }
        if let Ok(mut current) = self.current.lock() {
            *current = Some(value);
        }
        let payload = if value { consts::PAYLOAD_ON } else { consts::PAYLOAD_OFF };
        self.bridge
            .publish_retained(&self.state_topic, payload.to_string())
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::tests::bridge;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Contact(Arc<AtomicBool>);

    #[async_trait]
    impl BinarySensorBackend for Contact {
        async fn get(&self) -> anyhow::Result<bool> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_on_off() {
        let (bridge, publisher) = bridge();
        let open = Arc::new(AtomicBool::new(false));
        let config = BinarySensorConfig {
            device_class: Some("door".into()),
            ..BinarySensorConfig::new("door", "Door")
        };
        let sensor = BinarySensor::create(&bridge, config, Contact(open.clone())).await;
        assert_eq!(sensor.current(), Some(false));

        open.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(publisher.to_topic("sk/binary_sensor/door/state"), vec!["OFF", "ON"]);
        let discoveries = publisher.to_topic("homeassistant/binary_sensor/sk/door/config");
        let discovery: serde_json::Value = serde_json::from_str(&discoveries[0]).unwrap();
        assert_eq!(discovery["device_class"], "door");
        assert_eq!(discovery["payload_on"], "ON");
    }
}
