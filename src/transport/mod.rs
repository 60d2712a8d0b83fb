//! Transport layer for device messaging
//!
//! This module provides the transport abstraction and its MQTT
//! implementation. Everything above this layer talks to [`Transport`], so
//! the dispatcher and the handshake can run against a mock in tests.

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

pub mod mqtt;

/// A publish received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    /// Replayed by the broker from its retained store
    pub retained: bool,
}

/// Transport trait for device communication
///
/// This trait provides an abstraction over different transport mechanisms
/// (primarily MQTT) to enable dependency injection and testing.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Connect to the transport broker/server
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Disconnect from the transport broker/server
    async fn disconnect(&mut self) -> Result<(), Self::Error>;

    /// Add topic filters to the subscription set
    ///
    /// Filters are remembered and re-issued after every reconnect. When the
    /// link is down they are only recorded.
    async fn subscribe(&self, topics: &[String]) -> Result<(), Self::Error>;

    /// Remove topic filters from the subscription set
    async fn unsubscribe(&self, topics: &[String]) -> Result<(), Self::Error>;

    /// Publish a payload at QoS 1
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool)
    -> Result<(), Self::Error>;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;

    /// Get current connection state
    fn connection_state(&self) -> Option<mqtt::ConnectionState>;

    /// Check if the connection is permanently disconnected
    fn is_permanently_disconnected(&self) -> bool;

    /// Set the sender that receives every inbound publish
    fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>);

    /// Watch connection state changes, once connected at least once
    fn state_receiver(&self) -> Option<watch::Receiver<mqtt::ConnectionState>>;
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttClient;
