//! Best-effort service calls: failures are logged, never returned.

use crate::homeassistant::{MessageSender, Outgoing};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error};

/// What a service call targets.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceTarget {
    None,
    Entities(Vec<String>),
    /// Arbitrary `service_data`.
    Data(Value),
}

impl ServiceTarget {
    pub fn service_data(&self) -> Value {
        match self {
            ServiceTarget::None => Value::Null,
            ServiceTarget::Entities(ids) => json!({ "entity_id": ids }),
            ServiceTarget::Data(data) => data.clone(),
        }
    }
}

impl From<&str> for ServiceTarget {
    fn from(entity_id: &str) -> Self {
        ServiceTarget::Entities(vec![entity_id.to_string()])
    }
}

impl From<String> for ServiceTarget {
    fn from(entity_id: String) -> Self {
        ServiceTarget::Entities(vec![entity_id])
    }
}

impl From<Vec<String>> for ServiceTarget {
    fn from(entity_ids: Vec<String>) -> Self {
        ServiceTarget::Entities(entity_ids)
    }
}

impl From<&[&str]> for ServiceTarget {
    fn from(entity_ids: &[&str]) -> Self {
        ServiceTarget::Entities(entity_ids.iter().map(|id| id.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for ServiceTarget {
    fn from(entity_ids: [&str; N]) -> Self {
        ServiceTarget::Entities(entity_ids.iter().map(|id| id.to_string()).collect())
    }
}

impl From<Value> for ServiceTarget {
    fn from(data: Value) -> Self {
        ServiceTarget::Data(data)
    }
}

#[derive(Clone)]
pub struct ServiceCaller {
    sender: Arc<dyn MessageSender>,
}

impl ServiceCaller {
    pub fn new(sender: Arc<dyn MessageSender>) -> Self {
        Self { sender }
    }

    /// Call `domain.service`.
    pub async fn service(&self, domain_and_service: &str, target: impl Into<ServiceTarget>) {
        let (domain, service) = match domain_and_service.split_once('.') {
            Some(parts) => parts,
            None => {
                error!("Invalid service name '{}', expected domain.service", domain_and_service);
                return;
            }
        };
        let target = target.into();
        debug!("Calling {} with {:?}", domain_and_service, target);

        let message = Outgoing::call_service(domain, service, target.service_data());
        if let Err(err) = self.sender.send_message(message).await {
            error!("Error calling service {}: {}", domain_and_service, err);
        }
    }

    /// Press buttons. `input_button.*` and `button.*` ids go to their own
    /// domain's `press` service.
    pub async fn press(&self, target: impl Into<ServiceTarget>) {
        let ids = match target.into() {
            ServiceTarget::Entities(ids) => ids,
            other => {
                error!("press() needs entity ids, got {:?}", other);
                return;
            }
        };
        let (input_buttons, buttons): (Vec<String>, Vec<String>) = ids
            .into_iter()
            .filter(|id| id.starts_with("input_button.") || id.starts_with("button."))
            .partition(|id| id.starts_with("input_button."));

        if !input_buttons.is_empty() {
            self.service("input_button.press", input_buttons).await;
        }
        if !buttons.is_empty() {
            self.service("button.press", buttons).await;
        }
    }

    pub async fn turn_on(&self, target: impl Into<ServiceTarget>) {
        self.service("homeassistant.turn_on", target).await;
    }

    pub async fn turn_off(&self, target: impl Into<ServiceTarget>) {
        self.service("homeassistant.turn_off", target).await;
    }
}
