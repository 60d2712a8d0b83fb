//! Pure connection state management for the MQTT client
//!
//! This module contains pure functions for connection state management,
//! backoff calculation and broker option construction.

use crate::config::{ConfigError, MqttSection};
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Connection state for MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Gave up: credentials rejected or max attempts exceeded
    PermanentlyDisconnected(String),
}

impl ConnectionState {
    /// Short label for health endpoints and logs
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected(_) => "disconnected",
            ConnectionState::Reconnecting(_) => "reconnecting",
            ConnectionState::PermanentlyDisconnected(_) => "permanently_disconnected",
        }
    }
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Ceiling for the exponential backoff
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    /// Calculate the maximum total time for all reconnection attempts
    /// Returns None if unlimited retries are configured
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Backoff for the given 1-based attempt: `min(base * 2^(attempt-1), max)`
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms)
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Serialization error")]
    SerializationError(#[source] serde_json::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Broker rejected credentials: {0}")]
    AuthenticationFailed(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("MQTT configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Pure function to configure MQTT options from config
///
/// Each call produces a fresh client id so a reconnecting device never
/// collides with its own stale session on the broker.
pub fn configure_mqtt_options(
    client_label: &str,
    config: &MqttSection,
) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;

    if !matches!(url.scheme(), "mqtt" | "mqtts" | "tcp" | "ssl") {
        return Err(MqttError::InvalidBrokerUrl(config.broker_url.clone()));
    }

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let tls = matches!(url.scheme(), "mqtts" | "ssl");
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    let client_id = format!("buslink-{client_label}-{}", uuid::Uuid::new_v4().simple());
    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some((username, password)) = config.credentials()? {
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.base_delay_ms, 2_000);
        assert_eq!(config.max_delay_ms, 30_000);
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let config = ReconnectConfig::default();

        assert_eq!(config.calculate_backoff_delay(1), 2_000);
        assert_eq!(config.calculate_backoff_delay(2), 4_000);
        assert_eq!(config.calculate_backoff_delay(3), 8_000);
        assert_eq!(config.calculate_backoff_delay(4), 16_000);

        // Capped after that
        assert_eq!(config.calculate_backoff_delay(5), 30_000);
        assert_eq!(config.calculate_backoff_delay(40), 30_000);
        assert_eq!(config.calculate_backoff_delay(u32::MAX), 30_000);
    }

    #[test]
    fn test_calculate_max_total_time() {
        let config = ReconnectConfig {
            max_attempts: Some(3),
            ..ReconnectConfig::default()
        };
        assert_eq!(config.calculate_max_total_time(), Some(14_000));
        assert_eq!(ReconnectConfig::default().calculate_max_total_time(), None);
    }

    #[test]
    fn test_connection_state_labels() {
        assert_eq!(ConnectionState::Connected.label(), "connected");
        assert_eq!(ConnectionState::Reconnecting(3).label(), "reconnecting");
        assert_ne!(
            ConnectionState::Connected,
            ConnectionState::Disconnected("test".to_string())
        );
    }

    fn test_mqtt_config() -> MqttSection {
        MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            keep_alive_secs: 30,
        }
    }

    #[test]
    fn test_configure_mqtt_options() {
        let options = configure_mqtt_options("operator", &test_mqtt_config()).unwrap();
        assert!(options.client_id().starts_with("buslink-operator-"));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
    }

    #[test]
    fn test_client_ids_are_unique() {
        let config = test_mqtt_config();
        let a = configure_mqtt_options("manager", &config).unwrap();
        let b = configure_mqtt_options("manager", &config).unwrap();
        assert_ne!(a.client_id(), b.client_id());
    }

    #[test]
    fn test_invalid_broker_url() {
        let mut config = test_mqtt_config();
        config.broker_url = "invalid-url".to_string();
        assert!(matches!(
            configure_mqtt_options("operator", &config),
            Err(MqttError::InvalidBrokerUrl(_))
        ));

        config.broker_url = "http://localhost:1883".to_string();
        assert!(matches!(
            configure_mqtt_options("operator", &config),
            Err(MqttError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_unset_credential_env_fails_options() {
        let mut config = test_mqtt_config();
        config.username_env = Some("BUSLINK_TEST_BROKER_USER_NEVER_SET".to_string());
        assert!(matches!(
            configure_mqtt_options("operator", &config),
            Err(MqttError::Config(ConfigError::EnvVarNotFound(_)))
        ));
    }

    #[test]
    fn test_mqtt_error_display() {
        let errors = vec![
            MqttError::ConnectionFailed("test".to_string().into()),
            MqttError::PublishFailed("test".to_string().into()),
            MqttError::SubscriptionFailed("test".to_string().into()),
            MqttError::InvalidBrokerUrl("test".to_string()),
            MqttError::NotConnected {
                state: ConnectionState::Disconnected("test".to_string()),
            },
            MqttError::AuthenticationFailed("bad password".to_string()),
            MqttError::Network("reset".to_string()),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
