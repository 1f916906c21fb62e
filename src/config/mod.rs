//! # Configuration Management Module
//!
//! Loads and validates the relay configuration from a YAML file. The
//! configuration is read once in `main` and passed down to every component;
//! nothing in this crate reads configuration from globals.
//!
//! ## Configuration Structure
//!
//! - [`MatrixConfig`] - Homeserver, legacy inline auth, prefix template, E2EE
//! - [`RoomMapping`] - Matrix room ↔ Meshtastic channel pairs
//! - [`MeshtasticConfig`] - Transport selection and radio-side behaviour
//! - [`DatabaseConfig`] - Message-map retention
//! - [`LoggingConfig`] - Level and optional rotating file output
//!
//! ## Configuration File Format
//!
//! ```yaml
//! matrix:
//!   homeserver: https://example.org
//!   access_token: mytoken
//!   bot_user_id: "@bot:example.org"
//! matrix_rooms:
//!   - id: "!room:example.org"
//!     meshtastic_channel: 0
//! meshtastic:
//!   connection_type: serial
//!   serial_port: /dev/ttyUSB0
//!   meshnet_name: MyMesh
//!   broadcast_enabled: true
//! ```
//!
//! ## Legacy keys
//!
//! Three legacy spellings are still accepted, each with a deprecation
//! warning: `connection_type: network` (now `tcp`),
//! `meshtastic.relay_reactions` (now `meshtastic.message_interactions`) and
//! the top-level `db:` section (now `database:`).

use anyhow::{anyhow, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Default minimum delay between mesh sends in seconds.
pub const DEFAULT_MESSAGE_DELAY: f64 = 2.2;
/// Firmware-imposed lower bound for the message delay.
pub const FIRMWARE_MIN_MESSAGE_DELAY: f64 = 2.0;
/// Default number of message-map rows to retain.
pub const DEFAULT_MSGS_TO_KEEP: u32 = 500;
/// Default seconds between connection health probes.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub matrix: MatrixConfig,
    pub matrix_rooms: Vec<RoomMapping>,
    pub meshtastic: MeshtasticConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    /// Legacy spelling of `database`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db: Option<DatabaseConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixConfig {
    pub homeserver: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub bot_user_id: Option<String>,
    #[serde(default = "default_true")]
    pub prefix_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_format: Option<String>,
    #[serde(default)]
    pub e2ee: E2eeConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct E2eeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMapping {
    pub id: String,
    pub meshtastic_channel: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshtasticConfig {
    pub connection_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ble_address: Option<String>,
    pub meshnet_name: String,
    #[serde(default = "default_true")]
    pub broadcast_enabled: bool,
    #[serde(default)]
    pub detection_sensor: bool,
    #[serde(default = "default_true")]
    pub prefix_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_format: Option<String>,
    #[serde(default = "default_message_delay")]
    pub message_delay: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_interactions: Option<InteractionConfig>,
    /// Legacy single flag, superseded by `message_interactions`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_reactions: Option<bool>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// Legacy flat heartbeat interval, overrides `health_check.heartbeat_interval`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct InteractionConfig {
    #[serde(default)]
    pub reactions: bool,
    #[serde(default)]
    pub replies: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self { enabled: true, heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub msg_map: Option<MsgMapConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MsgMapConfig {
    #[serde(default = "default_msgs_to_keep")]
    pub msgs_to_keep: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub log_to_file: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default = "default_max_log_size")]
    pub max_log_size: u64,
    #[serde(default = "default_backup_count")]
    pub backup_count: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_to_file: false,
            filename: None,
            max_log_size: default_max_log_size(),
            backup_count: default_backup_count(),
        }
    }
}

fn default_true() -> bool { true }
fn default_message_delay() -> f64 { DEFAULT_MESSAGE_DELAY }
fn default_msgs_to_keep() -> u32 { DEFAULT_MSGS_TO_KEEP }
fn default_heartbeat_interval() -> u64 { DEFAULT_HEARTBEAT_INTERVAL }
fn default_log_level() -> String { "info".to_string() }
fn default_max_log_size() -> u64 { 10 * 1024 * 1024 }
fn default_backup_count() -> u32 { 2 }

/// Normalized transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Serial,
    Tcp,
    Ble,
}

/// Which message interactions are bridged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InteractionSettings {
    pub reactions: bool,
    pub replies: bool,
}

impl InteractionSettings {
    /// Message-map rows are only worth storing when some interaction can use them.
    pub fn storage_enabled(&self) -> bool {
        self.reactions || self.replies
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Write a commented sample configuration file.
    pub async fn create_default(path: &str) -> Result<()> {
        fs::write(path, SAMPLE_CONFIG)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;
        Ok(())
    }

    /// Validate the configuration, returning the first hard error.
    ///
    /// Soft problems (legacy keys) are logged as warnings by the accessors
    /// below rather than failing validation.
    pub fn validate(&self) -> Result<()> {
        if self.matrix.homeserver.trim().is_empty() {
            return Err(anyhow!("matrix.homeserver must not be empty"));
        }
        if self.meshtastic.meshnet_name.trim().is_empty() {
            return Err(anyhow!("meshtastic.meshnet_name must not be empty"));
        }
        if self.matrix_rooms.is_empty() {
            return Err(anyhow!("matrix_rooms must contain at least one mapping"));
        }
        let mut seen_rooms = std::collections::HashSet::new();
        let mut seen_channels = std::collections::HashSet::new();
        for room in &self.matrix_rooms {
            if !seen_rooms.insert(room.id.as_str()) {
                return Err(anyhow!("duplicate room id in matrix_rooms: {}", room.id));
            }
            if !seen_channels.insert(room.meshtastic_channel) {
                return Err(anyhow!(
                    "duplicate meshtastic_channel in matrix_rooms: {}",
                    room.meshtastic_channel
                ));
            }
        }
        let conn = self.connection_type()?;
        match conn {
            ConnectionType::Serial if self.meshtastic.serial_port.is_none() => {
                return Err(anyhow!("meshtastic.serial_port required for serial connection"));
            }
            ConnectionType::Tcp if self.meshtastic.host.is_none() => {
                return Err(anyhow!("meshtastic.host required for tcp connection"));
            }
            ConnectionType::Ble if self.meshtastic.ble_address.is_none() => {
                return Err(anyhow!("meshtastic.ble_address required for ble connection"));
            }
            _ => {}
        }
        Ok(())
    }

    /// Resolve the transport type, mapping the legacy `network` alias to tcp.
    pub fn connection_type(&self) -> Result<ConnectionType> {
        match self.meshtastic.connection_type.as_str() {
            "serial" => Ok(ConnectionType::Serial),
            "tcp" => Ok(ConnectionType::Tcp),
            "network" => {
                warn!(
                    "Using 'network' connection type (legacy). 'tcp' is now the preferred \
                     name and 'network' will be removed in a future version."
                );
                Ok(ConnectionType::Tcp)
            }
            "ble" => Ok(ConnectionType::Ble),
            other => Err(anyhow!("Unknown connection type: {}", other)),
        }
    }

    /// Resolve reaction/reply bridging, honouring the legacy `relay_reactions` flag.
    pub fn interaction_settings(&self) -> InteractionSettings {
        if let Some(interactions) = self.meshtastic.message_interactions {
            return InteractionSettings {
                reactions: interactions.reactions,
                replies: interactions.replies,
            };
        }
        if let Some(enabled) = self.meshtastic.relay_reactions {
            warn!(
                "Configuration setting 'relay_reactions' is deprecated. Please use \
                 'message_interactions: {{reactions: bool, replies: bool}}' instead. \
                 Legacy mode: enabling reactions only."
            );
            return InteractionSettings { reactions: enabled, replies: false };
        }
        // Privacy-first default: neither direction bridges interactions.
        InteractionSettings::default()
    }

    /// Message-map retention, honouring the legacy top-level `db:` section.
    /// Zero disables pruning.
    pub fn msgs_to_keep(&self) -> u32 {
        if let Some(db) = &self.database {
            if let Some(map) = db.msg_map {
                return map.msgs_to_keep;
            }
        }
        if let Some(db) = &self.db {
            if let Some(map) = db.msg_map {
                warn!(
                    "Using 'db.msg_map' configuration (legacy). 'database.msg_map' is now \
                     the preferred format and 'db.msg_map' will be deprecated in a future version."
                );
                return map.msgs_to_keep;
            }
        }
        DEFAULT_MSGS_TO_KEEP
    }

    /// Health probe interval in seconds; the legacy flat key wins when present.
    pub fn heartbeat_interval(&self) -> u64 {
        if let Some(interval) = self.meshtastic.heartbeat_interval {
            return interval;
        }
        self.meshtastic.health_check.heartbeat_interval
    }

    /// Message delay clamped to the firmware minimum, with a warning when clamped.
    pub fn message_delay(&self) -> f64 {
        let configured = self.meshtastic.message_delay;
        if configured < FIRMWARE_MIN_MESSAGE_DELAY {
            warn!(
                "Message delay {}s below firmware minimum ({}s), using {}s",
                configured, FIRMWARE_MIN_MESSAGE_DELAY, FIRMWARE_MIN_MESSAGE_DELAY
            );
            FIRMWARE_MIN_MESSAGE_DELAY
        } else {
            configured
        }
    }

    /// Path of the sqlite identity/map store.
    pub fn database_path(&self) -> String {
        if let Some(db) = &self.database {
            if let Some(path) = &db.path {
                return path.clone();
            }
        }
        "meshtastic.sqlite".to_string()
    }

    /// Directory of the Matrix state + crypto store.
    pub fn e2ee_store_path(&self) -> String {
        if let Some(path) = &self.matrix.e2ee.store_path {
            return path.clone();
        }
        let base = dirs::data_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        base.join("mmrelay").join("store").to_string_lossy().into_owned()
    }
}

/// Sample configuration written by `--generate-config`.
pub const SAMPLE_CONFIG: &str = r#"# MMRelay configuration

matrix:
  homeserver: https://example.org
  # Legacy inline auth. Prefer a credentials.json written by the login tool;
  # when that file exists these two keys are ignored.
  access_token: reaalllllyloooooongsecretttttcode
  bot_user_id: "@botuser:example.org"
  # Prefix attached to messages relayed mesh -> Matrix.
  prefix_enabled: true
  # prefix_format: "[{long}/{mesh}]: "
  e2ee:
    enabled: false
    # store_path: ~/.local/share/mmrelay/store

matrix_rooms:
  - id: "!someroomid:example.org"
    meshtastic_channel: 0

meshtastic:
  connection_type: serial   # serial, tcp, or ble
  serial_port: /dev/ttyUSB0
  # host: meshtastic.local  # for tcp
  # ble_address: AA:BB:CC:DD:EE:FF
  meshnet_name: MyMesh
  broadcast_enabled: true
  detection_sensor: false
  # Prefix attached to messages relayed Matrix -> mesh.
  prefix_enabled: true
  # prefix_format: "{display5}[M]: "
  # Seconds between radio sends; the firmware rejects anything under 2.0.
  message_delay: 2.2
  message_interactions:
    reactions: false
    replies: false
  health_check:
    enabled: true
    heartbeat_interval: 60

database:
  msg_map:
    msgs_to_keep: 500

logging:
  level: info
  log_to_file: false
  # filename: mmrelay.log
  # max_log_size: 10485760
  # backup_count: 2
"#;
