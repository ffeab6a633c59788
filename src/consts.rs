use std::time::Duration;

/// Software version
pub const SIDEKICK_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SIDEKICK_NAME: &str = "ha-sidekick";
pub const SIDEKICK_URL: &str = env!("CARGO_PKG_HOMEPAGE");

/// Discovery prefix configured in Home Assistant MQTT integration.
pub const HA_DISCOVERY_TOPIC: &str = "homeassistant";
/// Legacy "started" signal some setups publish on HA boot.
pub const HA_STARTED_TOPIC: &str = "homeassistant/started";
/// HA birth/last will topic; `online` means discovery state was wiped.
pub const HA_STATUS_TOPIC: &str = "homeassistant/status";
pub const HA_STATUS_ONLINE: &str = "online";

/// Event fired on the HA bus once startup is complete.
pub const HA_STARTED_EVENT: &str = "homeassistant_started";

pub const PAYLOAD_ON: &str = "ON";
pub const PAYLOAD_OFF: &str = "OFF";
pub const PAYLOAD_PRESS: &str = "PRESS";

/// Temporary name prefix of freshly created helpers, before rename.
pub const TEMP_ENTITY_PREFIX: &str = "sidekick_temp_";

/// Minimum spacing between registry mutations.
pub const REGISTRY_QUEUE_INTERVAL: Duration = Duration::from_millis(50);

/// How often we ask HA whether it is running.
pub const HA_PROBE_INTERVAL: Duration = Duration::from_secs(1);
pub const HA_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default poll interval for virtual MQTT entities.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How long `sync_states` ignores changes after mirroring.
pub const SYNC_LOCK_TIME: Duration = Duration::from_millis(900);

/// Broadcast channel depth for events and state diffs.
pub const CHANNEL_CAPACITY: usize = 256;

/// How long startup waits for the first entity snapshot.
pub const INITIAL_ENTITIES_TIMEOUT: Duration = Duration::from_secs(5);
