//! Pure message routing and processing logic for MQTT events
//!
//! This module contains pure functions for handling MQTT events
//! and deciding what to do with them.

use crate::transport::InboundMessage;
use bytes::Bytes;
use rumqttc::v5::{mqttbytes::QoS, Event};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Determine if a received publish should reach the dispatcher (pure function)
    ///
    /// Retained messages are kept: a device that subscribes after a vehicle
    /// last reported still needs its latest telemetry.
    pub fn should_process_message(topic: &str, payload: &[u8]) -> bool {
        if topic.is_empty() {
            debug!("Ignoring publish with empty topic");
            return false;
        }

        if payload.is_empty() {
            debug!("Ignoring empty payload on topic: {}", topic);
            return false;
        }

        true
    }

    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => {
                use rumqttc::v5::mqttbytes::v5::Packet;
                match incoming {
                    Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                    Packet::Publish(publish) => EventRoute::MessageReceived {
                        topic: String::from_utf8_lossy(&publish.topic).to_string(),
                        payload: publish.payload.clone(),
                        retain: publish.retain,
                    },
                    Packet::Disconnect(_) => EventRoute::Disconnected,
                    Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                        packet_id: suback.pkid,
                        filters: suback.return_codes.len(),
                    },
                    other => EventRoute::InfrastructureEvent(format!("{other:?}")),
                }
            }
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// QoS used for every publish and subscription (pure function)
    pub fn determine_qos_level() -> QoS {
        QoS::AtLeastOnce
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on subscribed topic
    MessageReceived {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    /// MQTT broker disconnected
    Disconnected,
    /// Subscription confirmed for a number of filters
    SubscriptionConfirmed { packet_id: u16, filters: usize },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Message forwarding operations (impure I/O)
pub struct MessageForwarder {
    message_sender: Option<mpsc::Sender<InboundMessage>>,
}

impl MessageForwarder {
    pub fn new() -> Self {
        Self {
            message_sender: None,
        }
    }

    pub fn set_message_sender(&mut self, sender: mpsc::Sender<InboundMessage>) {
        self.message_sender = Some(sender);
    }

    /// Hand a received publish to the dispatcher (impure I/O)
    pub async fn forward_message(&self, message: InboundMessage) -> Result<(), String> {
        if let Some(ref sender) = self.message_sender {
            debug!("Forwarding message on {} to dispatcher", message.topic);

            sender
                .send(message)
                .await
                .map_err(|e| format!("Failed to forward message to dispatcher: {e}"))?;
            Ok(())
        } else {
            warn!("Received MQTT message but no message sender configured - message dropped");
            Err("No message sender configured".to_string())
        }
    }
}

impl Default for MessageForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::Publish;

    #[test]
    fn test_should_process_message() {
        assert!(MessageHandler::should_process_message(
            "device/bus-03/telemetry",
            br#"{"lat":1.0,"lng":2.0}"#
        ));
        assert!(!MessageHandler::should_process_message(
            "device/bus-03/telemetry",
            b""
        ));
        assert!(!MessageHandler::should_process_message("", b"{}"));
    }

    #[test]
    fn test_route_mqtt_event() {
        use rumqttc::v5::mqttbytes::v5::{ConnAck, ConnectReturnCode, Disconnect, Packet};

        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        ));

        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: rumqttc::v5::mqttbytes::v5::DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected
        ));

        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: Bytes::from("device/bus-03/fare"),
            pkid: 1,
            payload: Bytes::from(r#"{"paid":4}"#),
            properties: None,
        }));

        if let EventRoute::MessageReceived {
            topic,
            payload,
            retain,
        } = MessageHandler::route_mqtt_event(&publish)
        {
            assert_eq!(topic, "device/bus-03/fare");
            assert_eq!(payload.as_ref(), br#"{"paid":4}"#);
            assert!(retain);
        } else {
            panic!("Expected MessageReceived route");
        }
    }

    #[test]
    fn test_determine_qos_level() {
        assert_eq!(MessageHandler::determine_qos_level(), QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_message_forwarder() {
        let mut forwarder = MessageForwarder::new();
        let message = InboundMessage {
            topic: "device/bus-03/fare".to_string(),
            payload: Bytes::from_static(br#"{"paid":4}"#),
            retained: false,
        };

        // Should fail without sender
        assert!(forwarder.forward_message(message.clone()).await.is_err());

        let (tx, mut rx) = mpsc::channel(1);
        forwarder.set_message_sender(tx);

        assert!(forwarder.forward_message(message.clone()).await.is_ok());

        let received = rx.recv().await.unwrap();
        assert_eq!(received, message);
    }
}
