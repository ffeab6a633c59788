use crate::consts;
use serde::Serialize;
use serde_json;

/// Device grouping of virtual entities.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct DeviceId {
    pub name: String,
    pub identifiers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
}

impl DeviceId {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            identifiers: vec![id.to_string()],
            manufacturer: None,
        }
    }
}

/// Discovery origin - this software identifier.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Origin {
    name: String,
    sw_version: String,
    support_url: String,
}

impl Default for Origin {
    fn default() -> Self {
        Self {
            name: consts::SIDEKICK_NAME.to_string(),
            sw_version: consts::SIDEKICK_VERSION.to_string(),
            support_url: consts::SIDEKICK_URL.to_string(),
        }
    }
}

/// Single entity discovery config. Fields not relevant to a platform stay
/// `None` and are not serialized.
// config topic: homeassistant/<component>/<node_id>/<object_id>/config
// node_id == namespace, object_id == unique_id
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Component {
    /// Not serialized: part of the topic.
    #[serde(skip)]
    pub domain: String,

    pub name: String,
    pub unique_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_on: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_off: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_press: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceId>,
    pub origin: Origin,
}

/// `<namespace>/<domain>/<unique_id>/<suffix>`
pub fn entity_topic(namespace: &str, domain: &str, unique_id: &str, suffix: &str) -> String {
    format!("{}/{}/{}/{}", namespace, domain, unique_id, suffix)
}

impl Component {
    fn new(domain: &str, name: &str, unique_id: &str) -> Self {
        Self {
            domain: domain.to_string(),
            name: name.to_string(),
            unique_id: unique_id.to_string(),
            platform: None,
            device_class: None,
            state_class: None,
            unit_of_measurement: None,
            state_topic: None,
            command_topic: None,
            payload_on: None,
            payload_off: None,
            payload_press: None,
            options: None,
            min: None,
            max: None,
            step: None,
            device: None,
            origin: Origin::default(),
        }
    }

    pub fn new_switch(namespace: &str, name: &str, unique_id: &str) -> Self {
        Self {
            device_class: Some("switch".to_string()),
            state_topic: Some(entity_topic(namespace, "switch", unique_id, "state")),
            command_topic: Some(entity_topic(namespace, "switch", unique_id, "set")),
            payload_on: Some(consts::PAYLOAD_ON.to_string()),
            payload_off: Some(consts::PAYLOAD_OFF.to_string()),
            ..Self::new("switch", name, unique_id)
        }
    }

    pub fn new_button(namespace: &str, name: &str, unique_id: &str) -> Self {
        Self {
            platform: Some("button".to_string()),
            command_topic: Some(entity_topic(namespace, "button", unique_id, "trigger")),
            payload_press: Some(consts::PAYLOAD_PRESS.to_string()),
            ..Self::new("button", name, unique_id)
        }
    }

    pub fn new_select(namespace: &str, name: &str, unique_id: &str, options: &[String]) -> Self {
        Self {
            platform: Some("select".to_string()),
            state_topic: Some(entity_topic(namespace, "select", unique_id, "state")),
            command_topic: Some(entity_topic(namespace, "select", unique_id, "set")),
            options: Some(options.to_vec()),
            ..Self::new("select", name, unique_id)
        }
    }

    pub fn new_number(namespace: &str, name: &str, unique_id: &str) -> Self {
        Self {
            state_topic: Some(entity_topic(namespace, "number", unique_id, "state")),
            command_topic: Some(entity_topic(namespace, "number", unique_id, "set")),
            ..Self::new("number", name, unique_id)
        }
    }

    pub fn new_sensor(namespace: &str, name: &str, unique_id: &str) -> Self {
        Self {
            state_topic: Some(entity_topic(namespace, "sensor", unique_id, "state")),
            ..Self::new("sensor", name, unique_id)
        }
    }

    pub fn new_binary_sensor(namespace: &str, name: &str, unique_id: &str) -> Self {
        Self {
            state_topic: Some(entity_topic(namespace, "binary_sensor", unique_id, "state")),
            payload_on: Some(consts::PAYLOAD_ON.to_string()),
            payload_off: Some(consts::PAYLOAD_OFF.to_string()),
            ..Self::new("binary_sensor", name, unique_id)
        }
    }

    pub fn with_device(mut self, device: Option<DeviceId>) -> Self {
        self.device = device;
        self
    }

    /// `homeassistant/<domain>/<namespace>/<unique_id>/config`
    pub fn discovery_topic(&self, namespace: &str) -> String {
        format!(
            "{}/{}/{}/{}/config",
            consts::HA_DISCOVERY_TOPIC,
            self.domain,
            namespace,
            self.unique_id
        )
    }

    pub fn serialize(&self) -> String {
        serde_json::to_string(self).expect("All should be serializable")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn switch_discovery_payload() {
        let component = Component::new_switch("sk", "Heater", "heater");
        assert_eq!(component.discovery_topic("sk"), "homeassistant/switch/sk/heater/config");

        let payload: Value = serde_json::from_str(&component.serialize()).unwrap();
        assert_eq!(payload["command_topic"], "sk/switch/heater/set");
        assert_eq!(payload["state_topic"], "sk/switch/heater/state");
        assert_eq!(payload["payload_on"], "ON");
        assert_eq!(payload["origin"]["name"], "ha-sidekick");
        assert!(payload.get("domain").is_none());
        assert!(payload.get("options").is_none());
        assert!(payload.get("device").is_none());
    }

    #[test]
    fn button_uses_trigger_topic() {
        let component = Component::new_button("sk", "Doorbell", "bell")
            .with_device(Some(DeviceId::new("dev1", "Porch")));
        let payload: Value = serde_json::from_str(&component.serialize()).unwrap();
        assert_eq!(payload["command_topic"], "sk/button/bell/trigger");
        assert_eq!(payload["platform"], "button");
        assert_eq!(payload["device"]["identifiers"][0], "dev1");
        assert!(payload.get("state_topic").is_none());
    }
}
