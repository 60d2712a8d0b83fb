//! Topic router
//!
//! Turns a raw `(topic, payload)` pair into a typed [`RoutedMessage`] scoped
//! to exactly one vehicle. Generic topics (no vehicle segment) resolve to the
//! vehicle this device is assigned to; a device with no assignment drops them.
//!
//! The router is pure: it never touches state and never publishes. Callers
//! treat every `Err` as "log and drop".

use crate::fleet::VehiclePatch;
use crate::observability::metrics::metrics;
use crate::protocol::{
    parse_topic, ChannelMessage, DecodeError, OccupancyDelta, ParsedTopic, PassengerUpdate,
    VehicleId,
};

/// A decoded inbound message and the vehicle it belongs to
#[derive(Debug, Clone, PartialEq)]
pub enum RoutedMessage {
    /// Telemetry or fare update for the reconciler
    Vehicle {
        vehicle: VehicleId,
        patch: VehiclePatch,
    },
    /// Occupancy delta; merged into vehicle state and fed to the trip aggregator
    Occupancy {
        vehicle: VehicleId,
        delta: OccupancyDelta,
    },
    /// Passenger request or location, heard by operators
    PassengerUpdate {
        vehicle: VehicleId,
        update: PassengerUpdate,
    },
    /// Operator accepted a pickup; `passenger` is `None` when neither the
    /// topic nor the payload names one
    Acknowledgment {
        vehicle: VehicleId,
        passenger: Option<String>,
    },
}

impl RoutedMessage {
    pub fn vehicle(&self) -> &VehicleId {
        match self {
            Self::Vehicle { vehicle, .. }
            | Self::Occupancy { vehicle, .. }
            | Self::PassengerUpdate { vehicle, .. }
            | Self::Acknowledgment { vehicle, .. } => vehicle,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TopicRouter {
    assigned_vehicle: Option<VehicleId>,
}

impl TopicRouter {
    pub fn new(assigned_vehicle: Option<VehicleId>) -> Self {
        Self { assigned_vehicle }
    }

    pub fn assigned_vehicle(&self) -> Option<&VehicleId> {
        self.assigned_vehicle.as_ref()
    }

    /// Parse the topic, decode the payload and attach the owning vehicle
    pub fn route(&self, topic: &str, payload: &[u8]) -> Result<RoutedMessage, DecodeError> {
        let ParsedTopic {
            channel,
            vehicle,
            passenger,
        } = parse_topic(topic)?;

        let vehicle = match vehicle.or_else(|| self.assigned_vehicle.clone()) {
            Some(vehicle) => vehicle,
            None => return Err(DecodeError::UnassignedVehicle(topic.to_string())),
        };

        let routed = match ChannelMessage::decode(channel, payload)? {
            ChannelMessage::Telemetry(telemetry) => RoutedMessage::Vehicle {
                vehicle,
                patch: VehiclePatch::Telemetry {
                    position: telemetry.position(),
                    occupancy: telemetry.people,
                    reported_paid: telemetry.paid,
                },
            },
            ChannelMessage::OccupancyDelta(delta) => RoutedMessage::Occupancy { vehicle, delta },
            ChannelMessage::Fare(fare) => RoutedMessage::Vehicle {
                vehicle,
                patch: VehiclePatch::Fare {
                    paid_count: fare.paid,
                },
            },
            ChannelMessage::PassengerUpdate(update) => {
                RoutedMessage::PassengerUpdate { vehicle, update }
            }
            ChannelMessage::Acknowledgment(ack) => RoutedMessage::Acknowledgment {
                vehicle,
                passenger: passenger.or(ack.id),
            },
        };

        metrics().message_routed(&channel.to_string());
        Ok(routed)
    }
}
