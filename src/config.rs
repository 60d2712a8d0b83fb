//! Device configuration loaded from TOML
//!
//! Credentials never live in the file itself: the `*_env` fields name the
//! environment variables that hold them, and they are resolved at runtime.

use crate::protocol::{validate_passenger_id, GeoPoint, VehicleId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level device configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusLinkConfig {
    pub device: DeviceSection,
    pub mqtt: MqttSection,
    pub backend: BackendSection,
    #[serde(default)]
    pub handshake: HandshakeSection,
    #[serde(default)]
    pub poller: PollerSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub geofence: GeofenceSection,
    #[serde(default)]
    pub fleet: FleetSection,
}

/// Which app this device runs as
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Commuter,
    Operator,
    Manager,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    pub role: DeviceRole,
    /// Vehicle this device is mounted on (operators)
    pub vehicle_id: Option<String>,
    /// Passenger identity (commuters)
    pub passenger_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL, `mqtt://` or `mqtts://`
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_keep_alive() -> u64 {
    30
}

impl MqttSection {
    /// Broker credentials, `None` when no `username_env` is configured.
    ///
    /// Once a variable is named it must be set; the password defaults to
    /// empty only when `password_env` itself is absent.
    pub fn credentials(&self) -> Result<Option<(String, String)>, ConfigError> {
        let Some(username_env) = self.username_env.as_deref() else {
            return Ok(None);
        };
        let username = required_env(username_env)?;
        let password = self
            .password_env
            .as_deref()
            .map(required_env)
            .transpose()?
            .unwrap_or_default();
        Ok(Some((username, password)))
    }
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::EnvVarNotFound(name.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendSection {
    pub base_url: String,
    /// Environment variable containing the bearer token
    pub token_env: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5000
}

/// Live-location handshake tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeSection {
    #[serde(default = "default_share_minutes")]
    pub default_minutes: u32,
    #[serde(default = "default_countdown_tick")]
    pub countdown_tick_secs: u64,
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,
    #[serde(default = "default_still_threshold")]
    pub still_threshold_m: f64,
    #[serde(default = "default_still_ticks")]
    pub still_ticks_limit: u32,
}

fn default_share_minutes() -> u32 {
    10
}

fn default_countdown_tick() -> u64 {
    60
}

fn default_sample_interval() -> u64 {
    10
}

fn default_still_threshold() -> f64 {
    10.0
}

fn default_still_ticks() -> u32 {
    3
}

impl Default for HandshakeSection {
    fn default() -> Self {
        Self {
            default_minutes: default_share_minutes(),
            countdown_tick_secs: default_countdown_tick(),
            sample_interval_secs: default_sample_interval(),
            still_threshold_m: default_still_threshold(),
            still_ticks_limit: default_still_ticks(),
        }
    }
}

impl HandshakeSection {
    pub fn countdown_tick(&self) -> Duration {
        Duration::from_secs(self.countdown_tick_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerSection {
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
    /// Defaults to on for operators and managers
    pub enabled: Option<bool>,
}

fn default_poll_interval() -> u64 {
    15
}

impl Default for PollerSection {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            enabled: None,
        }
    }
}

impl PollerSection {
    pub fn is_enabled_for(&self, role: DeviceRole) -> bool {
        self.enabled
            .unwrap_or(matches!(role, DeviceRole::Operator | DeviceRole::Manager))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreSection {
    /// SQLite file; `:memory:` for an ephemeral store
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String {
    "buslink.db".to_string()
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GeofenceSection {
    #[serde(default)]
    pub regions: Vec<GeofenceRegion>,
}

impl GeofenceSection {
    pub fn region(&self, identifier: &str) -> Option<&GeofenceRegion> {
        self.regions.iter().find(|r| r.identifier == identifier)
    }
}

/// A named circular region; read-only to this crate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeofenceRegion {
    pub identifier: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
}

impl GeofenceRegion {
    pub fn center(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetSection {
    /// Seconds without an update before a vehicle is shown as offline
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

fn default_stale_after() -> u64 {
    120
}

impl Default for FleetSection {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid vehicle ID: {0}")]
    InvalidVehicleId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BusLinkConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BusLinkConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(vehicle) = &self.device.vehicle_id {
            VehicleId::parse(vehicle)
                .map_err(|e| ConfigError::InvalidVehicleId(format!("'{vehicle}': {e}")))?;
        }

        match self.device.role {
            DeviceRole::Operator if self.device.vehicle_id.is_none() => {
                return Err(ConfigError::InvalidConfig(
                    "operator devices require [device].vehicle_id".to_string(),
                ));
            }
            DeviceRole::Commuter
                if self
                    .device
                    .passenger_id
                    .as_deref()
                    .map_or(true, |p| p.trim().is_empty()) =>
            {
                return Err(ConfigError::InvalidConfig(
                    "commuter devices require [device].passenger_id".to_string(),
                ));
            }
            _ => {}
        }

        if let Some(passenger) = &self.device.passenger_id {
            if let Err(e) = validate_passenger_id(passenger) {
                return Err(ConfigError::InvalidConfig(format!(
                    "passenger_id '{passenger}': {e}"
                )));
            }
        }

        let handshake = &self.handshake;
        if handshake.default_minutes == 0
            || handshake.countdown_tick_secs == 0
            || handshake.sample_interval_secs == 0
            || handshake.still_ticks_limit == 0
        {
            return Err(ConfigError::InvalidConfig(
                "[handshake] values must be greater than zero".to_string(),
            ));
        }
        if !(handshake.still_threshold_m.is_finite() && handshake.still_threshold_m > 0.0) {
            return Err(ConfigError::InvalidConfig(
                "[handshake].still_threshold_m must be a positive distance".to_string(),
            ));
        }

        if self.poller.interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "[poller].interval_secs must be greater than zero".to_string(),
            ));
        }

        for region in &self.geofence.regions {
            if region.identifier.is_empty() || region.radius_m <= 0.0 || !region.center().is_valid()
            {
                return Err(ConfigError::InvalidConfig(format!(
                    "geofence region '{}' needs an identifier, a valid center and a positive radius",
                    region.identifier
                )));
            }
        }

        url::Url::parse(&self.backend.base_url).map_err(|e| {
            ConfigError::InvalidConfig(format!(
                "[backend].base_url '{}' is not a URL: {e}",
                self.backend.base_url
            ))
        })?;

        Ok(())
    }

    /// The vehicle this device is assigned to, canonicalized
    pub fn assigned_vehicle(&self) -> Option<VehicleId> {
        self.device
            .vehicle_id
            .as_deref()
            .and_then(|v| VehicleId::parse(v).ok())
    }

    pub fn passenger_id(&self) -> Option<&str> {
        self.device.passenger_id.as_deref()
    }

    /// Get the backend bearer token; required once `token_env` is configured
    pub fn get_backend_token(&self) -> Result<Option<String>, ConfigError> {
        self.backend.token_env.as_deref().map(required_env).transpose()
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
role = "operator"
vehicle_id = "bus-03"

[mqtt]
broker_url = "mqtt://localhost:1883"

[backend]
base_url = "http://localhost:5000"

[store]
path = ":memory:"

[[geofence.regions]]
identifier = "terminal-north"
latitude = 14.1
longitude = 121.0
radius_m = 150.0
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[device]
role = "commuter"
passenger_id = "p-42"

[mqtt]
broker_url = "mqtts://broker.example.com:8883"
username_env = "BUSLINK_MQTT_USER"
password_env = "BUSLINK_MQTT_PASS"
keep_alive_secs = 45

[backend]
base_url = "https://api.example.com"
token_env = "BUSLINK_TOKEN"
timeout_ms = 3000

[handshake]
default_minutes = 15
still_threshold_m = 12.5

[poller]
interval_secs = 30
enabled = false

[store]
path = "/var/lib/buslink/state.db"

[fleet]
stale_after_secs = 300
"#;

        let config: BusLinkConfig = toml::from_str(toml_content).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.device.role, DeviceRole::Commuter);
        assert_eq!(config.passenger_id(), Some("p-42"));
        assert_eq!(config.mqtt.keep_alive_secs, 45);
        assert_eq!(config.backend.timeout_ms, 3000);
        assert_eq!(config.handshake.default_minutes, 15);
        assert_eq!(config.handshake.countdown_tick_secs, 60);
        assert_eq!(config.handshake.still_threshold_m, 12.5);
        assert!(!config.poller.is_enabled_for(DeviceRole::Commuter));
        assert_eq!(config.fleet.stale_after_secs, 300);
    }

    #[test]
    fn test_defaults() {
        let config = BusLinkConfig::test_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.mqtt.keep_alive_secs, 30);
        assert_eq!(config.backend.timeout_ms, 5000);
        assert_eq!(config.handshake, HandshakeSection::default());
        assert_eq!(config.poller.interval_secs, 15);
        assert!(config.poller.is_enabled_for(DeviceRole::Operator));
        assert_eq!(config.fleet.stale_after_secs, 120);
        assert_eq!(config.assigned_vehicle().unwrap().as_str(), "03");
        assert!(config.geofence.region("terminal-north").is_some());
        assert!(config.geofence.region("nowhere").is_none());
    }

    #[test]
    fn test_operator_requires_vehicle() {
        let mut config = BusLinkConfig::test_config();
        config.device.vehicle_id = None;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_commuter_requires_passenger() {
        let mut config = BusLinkConfig::test_config();
        config.device.role = DeviceRole::Commuter;
        config.device.passenger_id = Some("  ".to_string());
        assert!(config.validate().is_err());

        config.device.passenger_id = Some("p/1".to_string());
        assert!(config.validate().is_err());

        config.device.passenger_id = Some("p-1".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_vehicle_id() {
        let mut config = BusLinkConfig::test_config();
        config.device.vehicle_id = Some("bus/03".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidVehicleId(_))
        ));
    }

    #[test]
    fn test_invalid_geofence_region() {
        let mut config = BusLinkConfig::test_config();
        config.geofence.regions[0].radius_m = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let mut config = BusLinkConfig::test_config();
        config.handshake.sample_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = BusLinkConfig::test_config();
        config.poller.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_backend_token_env() {
        let mut config = BusLinkConfig::test_config();
        config.backend.token_env = Some("BUSLINK_TEST_TOKEN_THAT_IS_NEVER_SET".to_string());
        assert!(matches!(
            config.get_backend_token(),
            Err(ConfigError::EnvVarNotFound(_))
        ));

        config.backend.token_env = None;
        assert_eq!(config.get_backend_token().unwrap(), None);
    }

    #[test]
    fn test_mqtt_credentials_require_named_env() {
        let mut config = BusLinkConfig::test_config();
        assert_eq!(config.mqtt.credentials().unwrap(), None);

        config.mqtt.username_env = Some("BUSLINK_TEST_MQTT_USER_NEVER_SET".to_string());
        assert!(matches!(
            config.mqtt.credentials(),
            Err(ConfigError::EnvVarNotFound(name)) if name == "BUSLINK_TEST_MQTT_USER_NEVER_SET"
        ));
    }
}
