//! Everything wired together: the handle automations are written against.

use crate::automation::Tracker;
use crate::config::Config;
use crate::consts;
use crate::entities::MqttBridge;
use crate::error::Error;
use crate::homeassistant::{Connection, MessageSender, RestApi};
use crate::props::EntityProps;
use crate::provision::{HelperRequest, Provisioned, Provisioner};
use crate::service::{ServiceCaller, ServiceTarget};
use crate::state::{EntityState, Snapshot, StateCache};
use crate::utils;
use crate::webhook::{self, WebhookMethod, WebhookRequest, WebhookResult, Webhooks};
use crate::Result;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Sidekick {
    config: Config,
    cache: Arc<StateCache>,
    rest: Arc<RestApi>,
    connection: Arc<Connection>,
    tracker: Tracker,
    services: ServiceCaller,
    provisioner: Arc<Provisioner>,
    mqtt: Option<Arc<MqttBridge>>,
    webhooks: Webhooks,
}

impl Sidekick {
    /// Wait for Home Assistant, connect, and load the first entity snapshot.
    /// The MQTT bridge is started too when configured.
    pub async fn connect(config: Config) -> Result<Arc<Self>> {
        if config.namespace.is_empty() {
            return Err(Error::Namespace(config.namespace));
        }

        let cache = Arc::new(StateCache::new());
        let rest = Arc::new(RestApi::new(&config.hass));
        let mut first_snapshot = cache.subscribe();
        let connection = Arc::new(Connection::start(&config.hass, rest.clone(), cache.clone()));

        info!("Waiting for Home Assistant at {}", config.hass.host);
        connection.wait_connected().await;
        match tokio::time::timeout(consts::INITIAL_ENTITIES_TIMEOUT, first_snapshot.recv()).await {
            Ok(_) => info!("Loaded {} entities", cache.snapshot().len()),
            Err(_) => warn!("No entities received from Home Assistant yet"),
        }

        let sender: Arc<dyn MessageSender> = connection.clone();
        let tracker = Tracker::new(connection.events(), cache.clone());
        let services = ServiceCaller::new(sender.clone());
        let provisioner = Arc::new(Provisioner::new(&config.namespace, sender, cache.clone()));

        let mqtt = config
            .mqtt
            .as_ref()
            .map(|mqtt| MqttBridge::connect(mqtt, &config.namespace));
        if let Some(bridge) = &mqtt {
            let bridge = bridge.clone();
            tracker.started(move |_| {
                let bridge = bridge.clone();
                tokio::spawn(async move { bridge.replay_discovery().await });
            });
        }

        Ok(Arc::new(Self {
            config,
            cache,
            rest,
            connection,
            tracker,
            services,
            provisioner,
            mqtt,
            webhooks: Webhooks::new(),
        }))
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// HA answered `RUNNING` and the WebSocket session is up.
    pub fn is_running(&self) -> bool {
        self.rest.is_running() && self.connection.is_connected()
    }

    pub fn track(&self) -> &Tracker {
        &self.tracker
    }

    pub fn cache(&self) -> &Arc<StateCache> {
        &self.cache
    }

    /// MQTT bridge for virtual entities; `None` without an `mqtt` config.
    pub fn mqtt(&self) -> Option<&Arc<MqttBridge>> {
        self.mqtt.as_ref()
    }

    /// Raw WebSocket command, eg. for registry queries.
    pub async fn send_message(&self, message: crate::homeassistant::Outgoing) -> Result<Value> {
        self.connection.send_message(message).await
    }

    pub async fn service(&self, domain_and_service: &str, target: impl Into<ServiceTarget>) {
        self.services.service(domain_and_service, target).await
    }

    pub async fn press(&self, target: impl Into<ServiceTarget>) {
        self.services.press(target).await
    }

    pub async fn turn_on(&self, target: impl Into<ServiceTarget>) {
        self.services.turn_on(target).await
    }

    pub async fn turn_off(&self, target: impl Into<ServiceTarget>) {
        self.services.turn_off(target).await
    }

    pub async fn provision(&self, request: HelperRequest) -> Result<Provisioned> {
        self.provisioner.provision(request).await
    }

    pub fn input_button<H>(
        &self,
        entity_id: &str,
        friendly_name: &str,
        handler: H,
    ) -> Result<JoinHandle<Result<Provisioned>>>
    where
        H: Fn() + Send + Sync + 'static,
    {
        self.provisioner
            .input_button(&self.tracker, entity_id, friendly_name, handler)
    }

    pub fn input_boolean<H>(
        &self,
        entity_id: &str,
        friendly_name: &str,
        handler: H,
    ) -> Result<JoinHandle<Result<Provisioned>>>
    where
        H: Fn(bool) + Send + Sync + 'static,
    {
        self.provisioner
            .input_boolean(&self.tracker, entity_id, friendly_name, handler)
    }

    pub fn input_select<H>(
        &self,
        entity_id: &str,
        friendly_name: &str,
        options: &[&str],
        handler: H,
    ) -> Result<JoinHandle<Result<Provisioned>>>
    where
        H: Fn(String) + Send + Sync + 'static,
    {
        self.provisioner
            .input_select(&self.tracker, entity_id, friendly_name, options, handler)
    }

    pub fn webhook<F, Fut>(&self, method: WebhookMethod, id: &str, handler: F)
    where
        F: Fn(WebhookRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WebhookResult> + Send + 'static,
    {
        self.webhooks.register(method, id, handler)
    }

    /// Overwrite the state of an entity as seen by HA, keeping its
    /// attributes. Skipped while HA is down.
    pub async fn set_entity_state(&self, entity_id: &str, state: &str) -> Result<()> {
        let mut entity = self
            .cache
            .get(entity_id)
            .unwrap_or_else(|| EntityState::new(entity_id, state));
        entity.state = state.to_string();
        self.rest.post_state(&entity).await
    }

    /// Overwrite one (dotted path) attribute. The entity must be known.
    pub async fn set_entity_attribute(&self, entity_id: &str, attribute: &str, value: Value) -> Result<()> {
        let mut entity = self
            .cache
            .get(entity_id)
            .ok_or_else(|| Error::InvalidEntityId(entity_id.to_string()))?;
        entity.set_attribute(attribute, value);
        self.rest.post_state(&entity).await
    }

    /// Fire an event on the HA bus.
    pub async fn fire_event(&self, event_type: &str, data: Value) -> Result<()> {
        self.rest.post_event(event_type, &data).await
    }

    pub fn sync_states(&self, entity_a: &str, entity_b: &str) -> [JoinHandle<()>; 2] {
        utils::sync_states(&self.tracker, &self.services, self.cache.clone(), entity_a, entity_b)
    }

    pub async fn is_state_stable(&self, entity_id: &str, state: &str, window: Duration) -> bool {
        utils::is_state_stable(&self.cache, entity_id, state, window).await
    }

    /// Run the HTTP server until it fails.
    pub async fn serve(&self, port: u16) -> Result<()> {
        let router = webhook::router(self.namespace(), self.webhooks.clone(), self.rest.running_flag());
        webhook::serve(port, router).await?;
        Ok(())
    }
}

impl EntityProps for Sidekick {
    fn entity(&self, entity_id: &str) -> Option<EntityState> {
        self.cache.get(entity_id)
    }

    fn entities(&self) -> Snapshot {
        self.cache.snapshot()
    }
}
