use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Entities created by sidekick must start with \"{0}\"")]
    Namespace(String),

    #[error("Entity id \"{0}\" is already in use")]
    DuplicateEntity(String),

    #[error("Entity {0} not found in registry")]
    NotFound(String),

    #[error("Invalid entity id: {0}")]
    InvalidEntityId(String),

    #[error("Value {value} out of range [{min:?}, {max:?}]")]
    OutOfRange {
        value: f64,
        min: Option<f64>,
        max: Option<f64>,
    },

    #[error("Invalid option: {0}")]
    InvalidOption(String),

    /// HA answered a command with `success: false`.
    #[error("Home Assistant rejected request: {code}: {message}")]
    Remote { code: String, message: String },

    #[error("Not connected to Home Assistant")]
    Disconnected,

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Invalid cron expression: {0}")]
    Cron(#[from] cron::error::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] serde_yaml::Error),

    /// Failure reported by user supplied backends.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
