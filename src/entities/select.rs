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
pub trait SelectBackend: Send + Sync + 'static {
    async fn set_option(&self, option: &str) -> anyhow::Result<()>;

    async fn current_option(&self) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub struct SelectConfig {
    pub unique_id: String,
    pub name: String,
    pub options: Vec<String>,
    pub interval: Duration,
    pub device: Option<DeviceId>,
}

impl SelectConfig {
    pub fn new(unique_id: &str, name: &str, options: &[&str]) -> Self {
        Self {
            unique_id: unique_id.to_string(),
            name: name.to_string(),
            options: options.iter().map(|option| option.to_string()).collect(),
            interval: consts::DEFAULT_POLL_INTERVAL,
            device: None,
        }
    }
}

pub struct Select {
    bridge: Arc<MqttBridge>,
    backend: Box<dyn SelectBackend>,
    options: Vec<String>,
    state_topic: String,
    current: Mutex<String>,
}

impl Select {
    /// Fails when `options` is empty.
    pub async fn create<B: SelectBackend>(
        bridge: &Arc<MqttBridge>,
        config: SelectConfig,
        backend: B,
    ) -> Result<Arc<Self>> {
        let first = config
            .options
            .first()
            .cloned()
            .ok_or_else(|| Error::InvalidOption(format!("{} has no options", config.unique_id)))?;

        let namespace = bridge.namespace().to_string();
        let component = Component::new_select(&namespace, &config.name, &config.unique_id, &config.options)
            .with_device(config.device.clone());
        bridge.register_discovery(&component).await;

        let select = Arc::new(Self {
            bridge: bridge.clone(),
            backend: Box::new(backend),
            options: config.options.clone(),
            state_topic: entity_topic(&namespace, "select", &config.unique_id, "state"),
            current: Mutex::new(first),
        });

        match select.backend.current_option().await {
            Ok(Some(option)) => select.store(option),
            Ok(None) => {}
            Err(err) => error!("Unable to read initial option of {}: {}", config.unique_id, err),
        }
        select.publish_state().await;

        let commands = bridge
            .register_command(&entity_topic(&namespace, "select", &config.unique_id, "set"))
            .await;
        drive(select.clone(), Some(commands), Some(config.interval));
        Ok(select)
    }

    pub fn current(&self) -> String {
        self.current
            .lock()
            .map(|current| current.clone())
            .unwrap_or_default()
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    fn store(&self, option: String) {
        if let Ok(mut current) = self.current.lock() {
            *current = option;
        }
    }

    async fn publish_state(&self) {
        self.bridge
            .publish_retained(&self.state_topic, self.current())
            .await;
    }

    pub async fn set_option(&self, option: &str) -> Result<()> {
        if !self.options.iter().any(|known| known == option) {
            return Err(Error::InvalidOption(option.to_string()));
        }
        self.backend.set_option(option).await?;
        self.store(option.to_string());
        self.publish_state().await;
        Ok(())
    }
}

#[async_trait]
impl Driven for Select {
    async fn command(&self, payload: String) {
        match self.set_option(&payload).await {
            Ok(()) => {}
            Err(Error::InvalidOption(option)) => warn!("Received invalid option: {}", option),
            Err(err) => error!("Select {} failed: {}", self.state_topic, err),
        }
    }

    async fn poll(&self) {
        match self.backend.current_option().await {
            Ok(Some(option)) if option != self.current() => {
                self.store(option);
                self.publish_state().await;
            }
            Ok(_) => {}
            Err(err) => error!("Unable to poll {}: {}", self.state_topic, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::tests::{bridge, settle};

    #[derive(Default)]
    struct Mode {
        set: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl SelectBackend for Mode {
        async fn set_option(&self, option: &str) -> anyhow::Result<()> {
            self.set.lock().unwrap().push(option.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn defaults_to_first_option() {
        let (bridge, publisher) = bridge();
        let select = Select::create(
            &bridge,
            SelectConfig::new("mode", "Mode", &["eco", "comfort"]),
            Mode::default(),
        )
        .await
        .unwrap();

        assert_eq!(select.current(), "eco");
        assert_eq!(publisher.to_topic("sk/select/mode/state"), vec!["eco"]);
        let discoveries = publisher.to_topic("homeassistant/select/sk/mode/config");
        let discovery: serde_json::Value = serde_json::from_str(&discoveries[0]).unwrap();
        assert_eq!(discovery["options"], serde_json::json!(["eco", "comfort"]));
    }

    #[tokio::test]
    async fn unknown_options_are_rejected() {
        let (bridge, publisher) = bridge();
        let mode = Mode::default();
        let set = mode.set.clone();
        let select = Select::create(&bridge, SelectConfig::new("mode", "Mode", &["eco", "comfort"]), mode)
            .await
            .unwrap();

        assert!(matches!(select.set_option("turbo").await, Err(Error::InvalidOption(_))));
        bridge.dispatch("sk/select/mode/set", "turbo".into());
        settle().await;
        assert!(set.lock().unwrap().is_empty());
        assert_eq!(select.current(), "eco");

        bridge.dispatch("sk/select/mode/set", "comfort".into());
        settle().await;
        assert_eq!(*set.lock().unwrap(), vec!["comfort".to_string()]);
        assert_eq!(publisher.to_topic("sk/select/mode/state"), vec!["eco", "comfort"]);
    }

    #[tokio::test]
    async fn empty_options_fail() {
        let (bridge, _) = bridge();
        let result = Select::create(&bridge, SelectConfig::new("mode", "Mode", &[]), Mode::default()).await;
        assert!(result.is_err());
    }
}
