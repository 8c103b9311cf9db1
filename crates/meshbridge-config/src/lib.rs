//! Settings for the meshbridge coordinator bridge.
//!
//! TOML file + `MESHBRIDGE_` env + the legacy `ZIGBEE_*` / `MQTT_*` /
//! `DEVICE_*` variables, MQTT credential resolution (env + keyring +
//! plaintext), and translation to `meshbridge_core::BridgeConfig`.

pub mod logging;

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use meshbridge_core::BridgeConfig;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub use logging::{LogFormat, LogSettings, init_tracing};

const KEYRING_SERVICE: &str = "meshbridge";

/// Legacy deployment variables and the settings keys they feed.
const LEGACY_ENV: [(&str, &str); 13] = [
    ("ZIGBEE_CONNECTION_IP", "coordinator.connection"),
    ("ZIGBEE_CONNECTION_PATH", "coordinator.serial_path"),
    ("ZIGBEE_CONNECTION_PORT", "coordinator.port"),
    ("ZIGBEE_CHANNEL", "coordinator.channel"),
    ("MQTT_USER", "mqtt.username"),
    ("MQTT_PASS", "mqtt.password"),
    ("MQTT_URI", "mqtt.uri"),
    ("DEVICE_ID", "device.id"),
    ("DEVICE_NAME", "device.name"),
    ("DEVICE_IMPLEMENTATION", "device.implementation"),
    ("DEVICE_MAC", "device.mac"),
    ("DEVICE_FIRMWARE_VERSION", "device.firmware_version"),
    ("DEVICE_FIRMWARE_NAME", "device.firmware_name"),
];

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no credentials configured for {what}")]
    NoCredentials { what: String },

    #[error("failed to serialize settings: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("settings loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("could not install log subscriber: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── Settings ────────────────────────────────────────────────────────

/// Everything the bridge process reads at startup.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub coordinator: CoordinatorSettings,

    #[serde(default)]
    pub bridge: BridgeSettings,

    #[serde(default)]
    pub device: DeviceSettings,

    #[serde(default)]
    pub mqtt: MqttSettings,

    #[serde(default)]
    pub paths: PathSettings,

    #[serde(default)]
    pub logging: LogSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoordinatorSettings {
    /// Hostname, IP or serial device, as entered by the user.
    pub connection: Option<String>,

    /// Explicit serial device. Wins over `connection`.
    pub serial_path: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_channel")]
    pub channel: u8,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            connection: None,
            serial_path: None,
            port: default_port(),
            channel: default_channel(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_port() -> u16 {
    1775
}
fn default_channel() -> u8 {
    11
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./etc/herdsman")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeSettings {
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_configure_timeout")]
    pub configure_timeout_secs: u64,

    #[serde(default = "default_coordinator_endpoint")]
    pub coordinator_endpoint: u8,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            retry_interval_secs: default_retry_interval(),
            idle_timeout_secs: default_idle_timeout(),
            configure_timeout_secs: default_configure_timeout(),
            coordinator_endpoint: default_coordinator_endpoint(),
        }
    }
}

fn default_retry_interval() -> u64 {
    5
}
fn default_idle_timeout() -> u64 {
    600
}
fn default_configure_timeout() -> u64 {
    60
}
fn default_coordinator_endpoint() -> u8 {
    1
}

/// How the bridge device presents itself to the device model.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DeviceSettings {
    pub id: Option<String>,
    pub name: Option<String>,
    pub implementation: Option<String>,
    pub mac: Option<String>,
    pub firmware_version: Option<String>,
    pub firmware_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MqttSettings {
    pub uri: Option<String>,

    pub username: Option<String>,

    /// Plaintext password. Prefer the keyring or `password_env`.
    #[serde(skip_serializing)]
    pub password: Option<String>,

    /// Environment variable holding the password.
    pub password_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathSettings {
    /// Per-node overrides and configured markers.
    #[serde(default = "default_overrides_path")]
    pub overrides: PathBuf,

    /// Node schema catalog. Without one every model uses computed presentation.
    pub schema: Option<PathBuf>,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            overrides: default_overrides_path(),
            schema: None,
        }
    }
}

fn default_overrides_path() -> PathBuf {
    PathBuf::from("./etc/herdsman/overrides.json")
}

// ── Coordinator port ────────────────────────────────────────────────

/// Where the coordinator radio is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorPort {
    Serial(PathBuf),
    Tcp(Url),
}

fn looks_serial(connection: &str) -> bool {
    connection.starts_with("COM") || connection.starts_with("/dev")
}

impl CoordinatorSettings {
    fn connection(&self) -> Option<&str> {
        self.connection.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }

    /// Network host of a TCP-attached coordinator.
    pub fn connection_ip(&self) -> Option<String> {
        self.connection().filter(|c| !looks_serial(c)).map(str::to_owned)
    }

    /// Resolve the port the coordinator driver should open.
    pub fn port(&self) -> Result<Option<CoordinatorPort>, ConfigError> {
        let serial = self
            .serial_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .or_else(|| self.connection().filter(|c| looks_serial(c)));
        if let Some(path) = serial {
            return Ok(Some(CoordinatorPort::Serial(PathBuf::from(path))));
        }
        let Some(host) = self.connection_ip() else {
            return Ok(None);
        };
        let url = Url::parse(&format!("tcp://{host}:{}", self.port)).map_err(|e| ConfigError::Validation {
            field: "coordinator.connection".into(),
            reason: format!("'{host}' is not a usable host: {e}"),
        })?;
        Ok(Some(CoordinatorPort::Tcp(url)))
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("database.db")
    }

    pub fn database_backup_path(&self) -> PathBuf {
        self.data_dir.join("database.db.backup")
    }

    pub fn coordinator_backup_path(&self) -> PathBuf {
        self.data_dir.join("coordinator_backup.json")
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the settings file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "meshbridge", "meshbridge").map_or_else(
        || PathBuf::from("./etc/meshbridge.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Loading ─────────────────────────────────────────────────────────

impl Settings {
    /// Defaults, then `path`, then `MESHBRIDGE_*`, then the legacy variables.
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("MESHBRIDGE_").split("__"))
            .merge(legacy_env())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let settings: Settings = Self::figment(path).extract()?;
        settings.validate()?;
        debug!(path = %path.display(), "settings loaded");
        Ok(settings)
    }

    /// Load from the platform settings file and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_path())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(11..=26).contains(&self.coordinator.channel) {
            return Err(ConfigError::Validation {
                field: "coordinator.channel".into(),
                reason: format!("expected 11..=26, got {}", self.coordinator.channel),
            });
        }
        if self.bridge.retry_interval_secs == 0 {
            return Err(ConfigError::Validation {
                field: "bridge.retry_interval_secs".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Effective settings as TOML. The MQTT password is never written.
    pub fn render(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Core runtime configuration.
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            retry_interval: Duration::from_secs(self.bridge.retry_interval_secs),
            idle_timeout: Duration::from_secs(self.bridge.idle_timeout_secs),
            configure_timeout: Duration::from_secs(self.bridge.configure_timeout_secs),
            coordinator_endpoint: self.bridge.coordinator_endpoint,
            connection_ip: self.coordinator.connection_ip(),
        }
    }

    /// Bridge device id. Falls back to the MQTT username.
    pub fn device_id(&self) -> Option<&str> {
        self.device.id.as_deref().or(self.mqtt.username.as_deref())
    }
}

fn legacy_env() -> Env {
    Env::raw()
        .only(&LEGACY_ENV.map(|(var, _)| var))
        .map(|key| {
            LEGACY_ENV
                .iter()
                .find(|(var, _)| key == *var)
                .map_or_else(|| key.as_str().to_owned(), |(_, target)| (*target).to_owned())
                .into()
        })
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve the MQTT password: env var, system keyring, then plaintext.
pub fn resolve_mqtt_password(mqtt: &MqttSettings) -> Result<SecretString, ConfigError> {
    let env_name = mqtt.password_env.as_deref().unwrap_or("MQTT_PASS");
    if let Ok(value) = std::env::var(env_name) {
        if !value.is_empty() {
            return Ok(SecretString::from(value));
        }
    }

    let account = format!("mqtt/{}", mqtt.username.as_deref().unwrap_or("default"));
    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, &account) {
        if let Ok(secret) = entry.get_password() {
            return Ok(SecretString::from(secret));
        }
    }

    if let Some(password) = &mqtt.password {
        return Ok(SecretString::from(password.clone()));
    }

    Err(ConfigError::NoCredentials { what: "mqtt".into() })
}
