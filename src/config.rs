use serde::Deserialize;
use std::fs::File;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HassConfig {
    /// Base URL, eg. `http://homeassistant.local:8123`
    pub host: String,
    /// Long-lived access token.
    pub token: String,
}

impl HassConfig {
    pub fn api_base(&self) -> String {
        format!("{}/api", self.host.trim_end_matches('/'))
    }

    pub fn websocket_url(&self) -> String {
        let host = self
            .host
            .trim_end_matches('/')
            .replacen("http://", "ws://", 1)
            .replacen("https://", "wss://", 1);
        format!("{}/api/websocket", host)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Prefix of everything we create: helper entity ids, MQTT topics.
    pub namespace: String,
    pub hass: HassConfig,
    /// Virtual MQTT devices are disabled without a broker.
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub server: ServerConfig,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_server_port() -> u16 {
    8080
}

fn default_client_id() -> String {
    crate::consts::SIDEKICK_NAME.to_string()
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(filename: P) -> anyhow::Result<Self> {
        let handle = File::open(filename)?;
        let data: Config = serde_yaml::from_reader(handle)?;

        Ok(data)
    }

    pub fn from_yaml(data: &str) -> crate::Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }
}
