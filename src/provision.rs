//! Home Assistant side helper entities (`input_boolean`, `input_button`,
//! `input_select`) owned by this process.
//!
//! A helper is created under a random temporary name, renamed to the
//! requested entity id through the entity registry and then updated by its
//! `unique_id`, which survives further renames. Registry mutations from all
//! callers go through one [`RateLimitedQueue`].

use crate::automation::Tracker;
use crate::consts;
use crate::error::Error;
use crate::homeassistant::{MessageSender, Outgoing, RegistryEntry};
use crate::state::StateCache;
use crate::Result;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperKind {
    InputBoolean,
    InputButton,
    InputSelect,
}

impl HelperKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HelperKind::InputBoolean => "input_boolean",
            HelperKind::InputButton => "input_button",
            HelperKind::InputSelect => "input_select",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HelperRequest {
    pub kind: HelperKind,
    /// Object id without domain; must start with the namespace.
    pub entity_id: String,
    pub friendly_name: String,
    /// Domain specific fields sent on create and update, eg. `options`.
    pub extra: Map<String, Value>,
}

impl HelperRequest {
    pub fn new(kind: HelperKind, entity_id: &str, friendly_name: &str) -> Self {
        Self {
            kind,
            entity_id: entity_id.to_string(),
            friendly_name: friendly_name.to_string(),
            extra: Map::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Provisioned {
    pub entity_id: String,
    pub unique_id: String,
    pub friendly_name: String,
}

/// One call at a time, at least `interval` between the end of one call and
/// the start of the next.
pub struct RateLimitedQueue {
    interval: Duration,
    last: tokio::sync::Mutex<Option<Instant>>,
}

impl RateLimitedQueue {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn run<F, T>(&self, job: F) -> T
    where
        F: Future<Output = T>,
    {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            tokio::time::sleep_until(previous + self.interval).await;
        }
        let result = job.await;
        *last = Some(Instant::now());
        result
    }
}

pub struct Provisioner {
    namespace: String,
    sender: Arc<dyn MessageSender>,
    cache: Arc<StateCache>,
    managed: Mutex<HashSet<String>>,
    queue: RateLimitedQueue,
}

fn temporary_name() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", consts::TEMP_ENTITY_PREFIX, &uuid[..10])
}

impl Provisioner {
    pub fn new(namespace: &str, sender: Arc<dyn MessageSender>, cache: Arc<StateCache>) -> Self {
        Self {
            namespace: namespace.to_string(),
            sender,
            cache,
            managed: Mutex::new(HashSet::new()),
            queue: RateLimitedQueue::new(consts::REGISTRY_QUEUE_INTERVAL),
        }
    }

    pub fn is_managed(&self, full_entity_id: &str) -> bool {
        self.managed
            .lock()
            .map(|managed| managed.contains(full_entity_id))
            .unwrap_or(false)
    }

    /// Validate and reserve the id. Returns `domain.object_id`.
    pub fn claim(&self, kind: HelperKind, entity_id: &str) -> Result<String> {
        if !entity_id.starts_with(&self.namespace) {
            return Err(Error::Namespace(self.namespace.clone()));
        }
        let full = format!("{}.{}", kind.as_str(), entity_id);

        let mut managed = match self.managed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !managed.insert(full.clone()) {
            return Err(Error::DuplicateEntity(full));
        }
        Ok(full)
    }

    /// Claim the id and create/update the helper.
    pub async fn provision(&self, request: HelperRequest) -> Result<Provisioned> {
        let full = self.claim(request.kind, &request.entity_id)?;
        self.ensure(&full, &request).await
    }

    /// Claim now, finish in the background. The returned id can be used to
    /// set up triggers right away.
    pub fn start(self: &Arc<Self>, request: HelperRequest) -> Result<(String, JoinHandle<Result<Provisioned>>)> {
        let full = self.claim(request.kind, &request.entity_id)?;
        let this = self.clone();
        let entity_id = full.clone();
        let handle = tokio::spawn(async move {
            let result = this.ensure(&entity_id, &request).await;
            match &result {
                Ok(done) => info!("Helper {} ready (unique_id {})", done.entity_id, done.unique_id),
                Err(err) => error!("Unable to provision {}: {}", entity_id, err),
            }
            result
        });
        Ok((full, handle))
    }

    async fn send(&self, message: Value) -> Result<Value> {
        self.sender.send_message(Outgoing::Raw(message)).await
    }

    async fn ensure(&self, full: &str, request: &HelperRequest) -> Result<Provisioned> {
        let domain = request.kind.as_str();

        if self.cache.get(full).is_none() {
            let temporary = temporary_name();
            debug!("Creating {} as {}.{}", full, domain, temporary);

            let mut create = request.extra.clone();
            create.insert("type".into(), format!("{}/create", domain).into());
            create.insert("name".into(), temporary.clone().into());
            self.queue.run(self.send(Value::Object(create))).await?;

            let rename = json!({
                "type": "config/entity_registry/update",
                "entity_id": format!("{}.{}", domain, temporary),
                "new_entity_id": full,
            });
            self.queue.run(self.send(rename)).await?;
        }

        let unique_id = self.unique_id(full).await?;

        let mut update = request.extra.clone();
        update.insert("type".into(), format!("{}/update", domain).into());
        update.insert(format!("{}_id", domain), unique_id.clone().into());
        update.insert("name".into(), request.friendly_name.clone().into());
        self.queue.run(self.send(Value::Object(update))).await?;

        Ok(Provisioned {
            entity_id: full.to_string(),
            unique_id,
            friendly_name: request.friendly_name.clone(),
        })
    }

    async fn unique_id(&self, full: &str) -> Result<String> {
        let registry = self
            .send(json!({"type": "config/entity_registry/list"}))
            .await?;
        let entries: Vec<RegistryEntry> = serde_json::from_value(registry)?;
        entries
            .into_iter()
            .find(|entry| entry.entity_id == full)
            .and_then(|entry| entry.unique_id)
            .ok_or_else(|| Error::NotFound(full.to_string()))
    }

    /// Helper button; `handler` runs on every press from HA.
    pub fn input_button<H>(
        self: &Arc<Self>,
        tracker: &Tracker,
        entity_id: &str,
        friendly_name: &str,
        handler: H,
    ) -> Result<JoinHandle<Result<Provisioned>>>
    where
        H: Fn() + Send + Sync + 'static,
    {
        let request = HelperRequest::new(HelperKind::InputButton, entity_id, friendly_name);
        let (full, handle) = self.start(request)?;
        tracker.event("call_service", move |data| {
            let event = crate::homeassistant::HassEvent::new("call_service", data);
            if event.is_service_call("input_button", &["press"], &full) {
                handler();
            }
        });
        Ok(handle)
    }

    /// Helper toggle; `handler` receives the requested new state. Commands
    /// that would not change anything (`turn_on` while on) are dropped.
    pub fn input_boolean<H>(
        self: &Arc<Self>,
        tracker: &Tracker,
        entity_id: &str,
        friendly_name: &str,
        handler: H,
    ) -> Result<JoinHandle<Result<Provisioned>>>
    where
        H: Fn(bool) + Send + Sync + 'static,
    {
        let request = HelperRequest::new(HelperKind::InputBoolean, entity_id, friendly_name);
        let (full, handle) = self.start(request)?;
        let cache = self.cache.clone();
        tracker.event("call_service", move |data| {
            let event = crate::homeassistant::HassEvent::new("call_service", data);
            if !event.is_service_call("input_boolean", &["turn_on", "turn_off", "toggle"], &full) {
                return;
            }
            let is_on = cache.get(&full).map(|e| e.state == "on").unwrap_or(false);
            match event.data["service"].as_str() {
                Some("turn_on") if is_on => {}
                Some("turn_off") if !is_on => {}
                _ => handler(!is_on),
            }
        });
        Ok(handle)
    }

    /// Helper dropdown; `handler` receives each newly selected option.
    pub fn input_select<H>(
        self: &Arc<Self>,
        tracker: &Tracker,
        entity_id: &str,
        friendly_name: &str,
        options: &[&str],
        handler: H,
    ) -> Result<JoinHandle<Result<Provisioned>>>
    where
        H: Fn(String) + Send + Sync + 'static,
    {
        let request = HelperRequest::new(HelperKind::InputSelect, entity_id, friendly_name)
            .with_extra("options", json!(options));
        let (full, handle) = self.start(request)?;
        tracker.state(&full, move |change| handler(change.next.state));
        Ok(handle)
    }
}
