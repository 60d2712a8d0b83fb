//! MQTT client for the fleet broker
//!
//! This module provides a decomposed MQTT client implementation that
//! separates pure functions from I/O operations for better testability.
//!
//! # Architecture
//!
//! The module is split into four focused sub-modules:
//!
//! - [`connection`] - Pure connection state management and configuration
//! - [`message_handler`] - Pure message routing and processing logic
//! - [`health_monitor`] - Pure health monitoring and reconnection logic
//! - [`client`] - Impure I/O operations and coordination
//!
//! # Usage
//!
//! ```rust,no_run
//! use buslink::transport::mqtt::MqttClient;
//! use buslink::config::MqttSection;
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     username_env: None,
//!     password_env: None,
//!     keep_alive_secs: 30,
//! };
//!
//! let mut client = MqttClient::new("operator", config).await?;
//! client.connect().await?;
//! client.subscribe(&["device/bus-03/telemetry".to_string()]).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{ConnectionState, MqttError, ReconnectConfig};
pub use health_monitor::{
    ConnectionEvent, ConnectionQuality, HealthMetrics, HealthMonitor, ReconnectionDecision,
};
pub use message_handler::{EventRoute, MessageHandler};
