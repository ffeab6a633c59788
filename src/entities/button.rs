use super::{drive, Driven, MqttBridge};
use crate::consts;
use crate::homeassistant::discovery::{entity_topic, Component, DeviceId};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, warn};

#[async_trait]
pub trait ButtonBackend: Send + Sync + 'static {
    async fn press(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ButtonConfig {
    pub unique_id: String,
    pub name: String,
    pub device: Option<DeviceId>,
}

impl ButtonConfig {
    pub fn new(unique_id: &str, name: &str) -> Self {
        Self {
            unique_id: unique_id.to_string(),
            name: name.to_string(),
            device: None,
        }
    }
}

/// Stateless: HA presses arrive on the trigger topic.
pub struct Button {
    bridge: Arc<MqttBridge>,
    backend: Box<dyn ButtonBackend>,
    command_topic: String,
}

impl Button {
    pub async fn create<B: ButtonBackend>(
        bridge: &Arc<MqttBridge>,
        config: ButtonConfig,
        backend: B,
    ) -> Arc<Self> {
        let namespace = bridge.namespace().to_string();
        let component = Component::new_button(&namespace, &config.name, &config.unique_id)
            .with_device(config.device.clone());
        bridge.register_discovery(&component).await;

        let command_topic = entity_topic(&namespace, "button", &config.unique_id, "trigger");
        let button = Arc::new(Self {
            bridge: bridge.clone(),
            backend: Box::new(backend),
            command_topic: command_topic.clone(),
        });
        let commands = bridge.register_command(&command_topic).await;
        drive(button.clone(), Some(commands), None);
        button
    }

    /// Simulate a press; goes through the broker like one from HA.
    pub async fn press(&self) {
        self.bridge
            .publish(&self.command_topic, consts::PAYLOAD_PRESS.to_string())
            .await;
    }
}

#[async_trait]
impl Driven for Button {
    async fn command(&self, payload: String) {
        if payload != consts::PAYLOAD_PRESS {
            warn!("Received invalid button command: {}", payload);
            return;
        }
        if let Err(err) = self.backend.press().await {
            error!("Button {} failed: {}", self.command_topic, err);
        }
    }

    async fn poll(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::tests::{bridge, settle};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl ButtonBackend for Counter {
        async fn press(&self) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn presses_on_valid_payload_only() {
        let (bridge, publisher) = bridge();
        let presses = Arc::new(AtomicUsize::new(0));
        Button::create(&bridge, ButtonConfig::new("bell", "Bell"), Counter(presses.clone())).await;

        bridge.dispatch("sk/button/bell/trigger", "press".into());
        bridge.dispatch("sk/button/bell/trigger", "PRESS".into());
        settle().await;

        assert_eq!(presses.load(Ordering::SeqCst), 1);
        assert!(publisher.to_topic("sk/button/bell/state").is_empty());
    }

    #[tokio::test]
    async fn own_press_is_not_retained() {
        let (bridge, publisher) = bridge();
        let button = Button::create(
            &bridge,
            ButtonConfig::new("bell", "Bell"),
            Counter(Arc::new(AtomicUsize::new(0))),
        )
        .await;

        button.press().await;
        let published = publisher.published();
        let (topic, payload, retain) = published.last().unwrap();
        assert_eq!(topic, "sk/button/bell/trigger");
        assert_eq!(payload, "PRESS");
        assert!(!retain);
    }
}
