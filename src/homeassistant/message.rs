use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Things HA sends to us over the WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Incoming {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    /// Response to a command we sent.
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<ErrorInfo>,
    },
    /// Push for a subscription identified by `id`.
    Event { id: u64, event: Value },
    Pong { id: u64 },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Single event from the HA bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HassEvent {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_fired: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,
}

impl HassEvent {
    pub fn new(event_type: &str, data: Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
            origin: None,
            time_fired: None,
            context: Value::Null,
        }
    }

    /// For `call_service` events: is this a `domain.service` call
    /// targeting `entity_id`?
    pub fn is_service_call(&self, domain: &str, services: &[&str], entity_id: &str) -> bool {
        if self.event_type != "call_service" || self.data["domain"] != domain {
            return false;
        }
        let service = match self.data["service"].as_str() {
            Some(service) => service,
            None => return false,
        };
        services.contains(&service)
            && includes_entity_id(entity_id, &self.data["service_data"]["entity_id"])
    }
}

/// `entity_id` in service data may be a single id or a list of ids.
pub fn includes_entity_id(entity_id: &str, target: &Value) -> bool {
    match target {
        Value::String(id) => id == entity_id,
        Value::Array(ids) => ids.iter().any(|id| id.as_str() == Some(entity_id)),
        _ => false,
    }
}

/// Registry record from `config/entity_registry/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryEntry {
    pub entity_id: String,
    #[serde(default)]
    pub unique_id: Option<String>,
}

/// Things we send to HA. `id` is added by the connection.
#[derive(Debug)]
pub enum Outgoing {
    Auth { access_token: String },
    SubscribeEvents,
    SubscribeEntities,
    Ping,
    /// Any other command; must contain `type`.
    Raw(Value),
}

impl Outgoing {
    pub fn to_json(&self, id: Option<u64>) -> Value {
        let mut msg = match self {
            Outgoing::Auth { access_token } => {
                return json!({"type": "auth", "access_token": access_token});
            }
            Outgoing::SubscribeEvents => json!({"type": "subscribe_events"}),
            Outgoing::SubscribeEntities => json!({"type": "subscribe_entities"}),
            Outgoing::Ping => json!({"type": "ping"}),
            Outgoing::Raw(value) => value.clone(),
        };
        if let (Some(id), Value::Object(map)) = (id, &mut msg) {
            map.insert("id".into(), id.into());
        }
        msg
    }

    pub fn call_service(domain: &str, service: &str, data: Value) -> Self {
        let mut msg = Map::new();
        msg.insert("type".into(), "call_service".into());
        msg.insert("domain".into(), domain.into());
        msg.insert("service".into(), service.into());
        if !data.is_null() {
            msg.insert("service_data".into(), data);
        }
        Outgoing::Raw(Value::Object(msg))
    }
}
