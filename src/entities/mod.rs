//! Virtual devices published to Home Assistant over MQTT auto-discovery.
//!
//! Every entity registers its discovery payload with the [`MqttBridge`],
//! which republishes all of them after a broker (re)connect and whenever HA
//! announces it started, so HA never loses them.

mod binary_sensor;
mod button;
mod number;
mod select;
mod sensor;
mod switch;

pub use binary_sensor::{BinarySensor, BinarySensorBackend, BinarySensorConfig};
pub use button::{Button, ButtonBackend, ButtonConfig};
pub use number::{Number, NumberBackend, NumberConfig};
pub use select::{Select, SelectBackend, SelectConfig};
pub use sensor::{Sensor, SensorBackend, SensorConfig, SensorValue};
pub use switch::{Switch, SwitchBackend, SwitchConfig};

use crate::config::MqttConfig;
use crate::consts;
use crate::homeassistant::discovery::Component;
use crate::Result;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Queue depth of commands waiting for a single entity.
const COMMAND_QUEUE: usize = 16;

/// Minimal MQTT client surface used by the bridge.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<()>;
    async fn subscribe(&self, topic: &str) -> Result<()>;
}

#[async_trait]
impl Publisher for AsyncClient {
    async fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<()> {
        AsyncClient::publish(self, topic, QoS::AtLeastOnce, retain, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        AsyncClient::subscribe(self, topic, QoS::AtLeastOnce).await?;
        Ok(())
    }
}

/// Shared MQTT side of all virtual entities.
pub struct MqttBridge {
    namespace: String,
    publisher: Arc<dyn Publisher>,
    /// Retained discovery messages: (topic, payload).
    discoveries: Mutex<Vec<(String, String)>>,
    /// Command topic -> owning entity.
    commands: Mutex<HashMap<String, mpsc::Sender<String>>>,
}

impl MqttBridge {
    pub fn new(namespace: &str, publisher: Arc<dyn Publisher>) -> Arc<Self> {
        Arc::new(Self {
            namespace: namespace.to_string(),
            publisher,
            discoveries: Mutex::new(Vec::new()),
            commands: Mutex::new(HashMap::new()),
        })
    }

    /// Create the broker client and start its event loop.
    pub fn connect(config: &MqttConfig, namespace: &str) -> Arc<Self> {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(5));
        if !config.username.is_empty() {
            options.set_credentials(&config.username, &config.password);
        }

        let (client, event_loop) = AsyncClient::new(options, 64);
        let bridge = Self::new(namespace, Arc::new(client));
        info!("Connecting to MQTT broker at {}:{}", config.host, config.port);
        task::spawn(Self::receiver(event_loop, bridge.clone()));
        bridge
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn receiver(mut event_loop: EventLoop, bridge: Arc<Self>) {
        loop {
            let notification = event_loop.poll().await;
            // Anything that publishes goes through the client whose queue
            // this loop drains, so it must run on its own task.
            match notification {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker");
                    let bridge = bridge.clone();
                    task::spawn(async move { bridge.on_connected().await });
                }
                Ok(Event::Incoming(Packet::Publish(msg))) => {
                    let payload = String::from_utf8_lossy(&msg.payload).to_string();
                    debug!("RX message to {} with payload '{}'", msg.topic, payload);
                    bridge.dispatch(&msg.topic, payload);
                }
                Ok(Event::Outgoing(_))
                | Ok(Event::Incoming(Packet::PingResp))
                | Ok(Event::Incoming(Packet::SubAck(_)))
                | Ok(Event::Incoming(Packet::PubAck(_))) => {
                    // Silence common messages
                }
                Ok(other) => {
                    debug!("Received other MQTT message = {:?}", other);
                }
                Err(err) => {
                    // Next poll reconnects.
                    warn!("MQTT connection error: {}. Retrying", err);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Fresh broker session: restore subscriptions, republish discovery.
    pub async fn on_connected(&self) {
        let mut topics = vec![
            consts::HA_STARTED_TOPIC.to_string(),
            consts::HA_STATUS_TOPIC.to_string(),
        ];
        topics.extend(self.command_topics());
        for topic in topics {
            if let Err(err) = self.publisher.subscribe(&topic).await {
                error!("Unable to subscribe to {}: {}", topic, err);
            }
        }
        self.replay_discovery().await;
    }

    /// Entry point for every inbound publish. Commands are routed inline so
    /// they reach their entity in arrival order; a discovery replay runs on
    /// its own task.
    pub fn dispatch(self: &Arc<Self>, topic: &str, payload: String) {
        if topic == consts::HA_STARTED_TOPIC
            || (topic == consts::HA_STATUS_TOPIC && payload == consts::HA_STATUS_ONLINE)
        {
            info!("Home Assistant (re)started, republishing discovery");
            let bridge = self.clone();
            task::spawn(async move { bridge.replay_discovery().await });
            return;
        }
        self.route_command(topic, payload);
    }

    fn route_command(&self, topic: &str, payload: String) {
        let target = self
            .commands
            .lock()
            .ok()
            .and_then(|commands| commands.get(topic).cloned());
        match target {
            Some(sender) => {
                if let Err(err) = sender.try_send(payload) {
                    warn!("Dropping command for {}: {}", topic, err);
                }
            }
            None => debug!("Unknown topic {} - ignoring", topic),
        }
    }

    fn command_topics(&self) -> Vec<String> {
        self.commands
            .lock()
            .map(|commands| commands.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Remember and publish a discovery message.
    pub async fn register_discovery(&self, component: &Component) {
        let topic = component.discovery_topic(&self.namespace);
        let payload = component.serialize();
        if let Ok(mut discoveries) = self.discoveries.lock() {
            discoveries.retain(|(known, _)| known != &topic);
            discoveries.push((topic.clone(), payload.clone()));
        }
        self.publish_retained(&topic, payload).await;
    }

    /// Publish every known discovery message again, byte for byte.
    pub async fn replay_discovery(&self) {
        let discoveries = self
            .discoveries
            .lock()
            .map(|discoveries| discoveries.clone())
            .unwrap_or_default();
        debug!("Replaying {} discovery messages", discoveries.len());
        for (topic, payload) in discoveries {
            self.publish_retained(&topic, payload).await;
        }
    }

    /// Route payloads of `topic` to the returned receiver.
    pub async fn register_command(&self, topic: &str) -> mpsc::Receiver<String> {
        let (sender, receiver) = mpsc::channel(COMMAND_QUEUE);
        if let Ok(mut commands) = self.commands.lock() {
            commands.insert(topic.to_string(), sender);
        }
        if let Err(err) = self.publisher.subscribe(topic).await {
            error!("Unable to subscribe to {}: {}", topic, err);
        }
        receiver
    }

    /// Publish retained; errors are logged.
    pub async fn publish_retained(&self, topic: &str, payload: String) {
        if let Err(err) = self.publisher.publish(topic, payload, true).await {
            error!("Failed to publish to {}: {}", topic, err);
        }
    }

    /// Fire-and-forget, not retained.
    pub async fn publish(&self, topic: &str, payload: String) {
        if let Err(err) = self.publisher.publish(topic, payload, false).await {
            error!("Failed to publish to {}: {}", topic, err);
        }
    }
}

/// Entity side of the command/poll loop.
#[async_trait]
trait Driven: Send + Sync + 'static {
    async fn command(&self, payload: String);
    async fn poll(&self);
}

async fn next_command(commands: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match commands {
        Some(receiver) => receiver.recv().await,
        None => None,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    if let Some(ticker) = ticker {
        ticker.tick().await;
    }
}

/// Run commands and periodic polls of one entity, strictly one at a time.
fn drive<D: Driven>(
    entity: Arc<D>,
    mut commands: Option<mpsc::Receiver<String>>,
    interval: Option<Duration>,
) -> JoinHandle<()> {
    task::spawn(async move {
        let mut ticker = interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        loop {
            tokio::select! {
                payload = next_command(&mut commands), if commands.is_some() => match payload {
                    Some(payload) => entity.command(payload).await,
                    None => commands = None,
                },
                _ = next_tick(&mut ticker), if ticker.is_some() => entity.poll().await,
                else => break,
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::homeassistant::discovery::Component;

    /// Records (topic, payload, retain) of everything published.
    #[derive(Default)]
    pub(crate) struct RecordingPublisher {
        pub published: Mutex<Vec<(String, String, bool)>>,
        pub subscribed: Mutex<Vec<String>>,
    }

    impl RecordingPublisher {
        pub fn published(&self) -> Vec<(String, String, bool)> {
            self.published.lock().unwrap().clone()
        }

        pub fn to_topic(&self, topic: &str) -> Vec<String> {
            self.published()
                .into_iter()
                .filter(|(published, _, _)| published == topic)
                .map(|(_, payload, _)| payload)
                .collect()
        }

        pub fn clear(&self) {
            self.published.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<()> {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload, retain));
            Ok(())
        }

        async fn subscribe(&self, topic: &str) -> Result<()> {
            self.subscribed.lock().unwrap().push(topic.to_string());
            Ok(())
        }
    }

    pub(crate) fn bridge() -> (Arc<MqttBridge>, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::default());
        (MqttBridge::new("sk", publisher.clone()), publisher)
    }

    pub(crate) async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn replays_identical_discovery() {
        let (bridge, publisher) = bridge();
        bridge
            .register_discovery(&Component::new_switch("sk", "Heater", "heater"))
            .await;
        bridge
            .register_discovery(&Component::new_button("sk", "Bell", "bell"))
            .await;
        let first = publisher.published();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|(_, _, retain)| *retain));

        publisher.clear();
        bridge.on_connected().await;
        assert_eq!(publisher.published(), first);

        let subscribed = publisher.subscribed.lock().unwrap().clone();
        assert!(subscribed.contains(&"homeassistant/started".to_string()));
        assert!(subscribed.contains(&"homeassistant/status".to_string()));
    }

    #[tokio::test]
    async fn replays_on_ha_signals_only() {
        let (bridge, publisher) = bridge();
        bridge
            .register_discovery(&Component::new_sensor("sk", "Temp", "temp"))
            .await;
        publisher.clear();

        bridge.dispatch("homeassistant/status", "offline".into());
        settle().await;
        assert!(publisher.published().is_empty());

        bridge.dispatch("homeassistant/status", "online".into());
        bridge.dispatch("homeassistant/started", "".into());
        settle().await;
        assert_eq!(
            publisher.to_topic("homeassistant/sensor/sk/temp/config").len(),
            2
        );
    }

    #[tokio::test]
    async fn reregistering_replaces_discovery() {
        let (bridge, publisher) = bridge();
        let mut component = Component::new_sensor("sk", "Temp", "temp");
        bridge.register_discovery(&component).await;
        component.name = "Temperature".into();
        bridge.register_discovery(&component).await;
        publisher.clear();

        bridge.replay_discovery().await;
        let replayed = publisher.published();
        assert_eq!(replayed.len(), 1);
        assert!(replayed[0].1.contains("Temperature"));
    }

    #[tokio::test]
    async fn routes_commands_by_topic() {
        let (bridge, publisher) = bridge();
        let mut commands = bridge.register_command("sk/switch/a/set").await;
        assert_eq!(
            *publisher.subscribed.lock().unwrap(),
            vec!["sk/switch/a/set".to_string()]
        );

        bridge.dispatch("sk/switch/a/set", "ON".into());
        bridge.dispatch("sk/switch/b/set", "OFF".into());
        assert_eq!(commands.recv().await.as_deref(), Some("ON"));
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn commands_keep_arrival_order() {
        let (bridge, _) = bridge();
        let mut commands = bridge.register_command("sk/switch/a/set").await;

        for _ in 0..200 {
            bridge.dispatch("sk/switch/a/set", "ON".into());
            bridge.dispatch("sk/switch/a/set", "OFF".into());
            assert_eq!(commands.recv().await.as_deref(), Some("ON"));
            assert_eq!(commands.recv().await.as_deref(), Some("OFF"));
        }
    }
}
