//! Topic schema and vehicle identifier canonicalization
//!
//! Every inbound topic is parsed into a logical [`Channel`] plus the vehicle
//! (and, for acknowledgments, the passenger) it is scoped to. Outbound topics
//! are built through [`TopicBuilder`] so both directions share one schema.

use crate::config::DeviceRole;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Prefix used by devices when a numeric vehicle id appears in a topic
const VEHICLE_TOPIC_PREFIX: &str = "bus-";

/// Logical message channel, independent of the topic string it arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Telemetry,
    OccupancyDelta,
    Fare,
    PassengerUpdate,
    Acknowledgment,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Telemetry => "telemetry",
            Channel::OccupancyDelta => "occupancy-delta",
            Channel::Fare => "fare",
            Channel::PassengerUpdate => "passenger-update",
            Channel::Acknowledgment => "acknowledgment",
        };
        f.write_str(name)
    }
}

/// Canonical vehicle identifier
///
/// Numeric ids are zero-padded to two digits regardless of how the sender
/// spelled them (`"3"`, `"03"`, `"bus-3"` and `"bus-03"` are all `"03"`).
/// Anything else is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VehicleId(String);

impl VehicleId {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ValidationError::EmptyVehicleId);
        }

        for ch in raw.chars() {
            if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
                return Err(ValidationError::InvalidVehicleIdChar(ch));
            }
        }

        let unprefixed = strip_vehicle_prefix(raw);
        if !unprefixed.is_empty() && unprefixed.chars().all(|c| c.is_ascii_digit()) {
            let significant = unprefixed.trim_start_matches('0');
            return Ok(Self(format!("{significant:0>2}")));
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id came from a numeric fleet number
    pub fn is_numeric(&self) -> bool {
        self.0.chars().all(|c| c.is_ascii_digit())
    }

    /// Topic segment used on the wire: `bus-NN` for numeric ids, raw otherwise
    pub fn topic_segment(&self) -> String {
        if self.is_numeric() {
            format!("{VEHICLE_TOPIC_PREFIX}{}", self.0)
        } else {
            self.0.clone()
        }
    }
}

fn strip_vehicle_prefix(raw: &str) -> &str {
    match raw.get(..VEHICLE_TOPIC_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(VEHICLE_TOPIC_PREFIX) => {
            &raw[VEHICLE_TOPIC_PREFIX.len()..]
        }
        _ => raw,
    }
}

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VehicleId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for VehicleId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<VehicleId> for String {
    fn from(value: VehicleId) -> Self {
        value.0
    }
}

/// Result of parsing an inbound topic
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTopic {
    pub channel: Channel,
    /// `None` for generic topics that carry no vehicle segment
    pub vehicle: Option<VehicleId>,
    /// Passenger segment of acknowledgment topics
    pub passenger: Option<String>,
}

/// Check a passenger id before it is placed into a topic segment
pub fn validate_passenger_id(id: &str) -> Result<(), ValidationError> {
    if id.trim().is_empty() {
        return Err(ValidationError::EmptyPassengerId);
    }
    match id.chars().find(|c| matches!(c, '/' | '+' | '#') || c.is_control()) {
        Some(ch) => Err(ValidationError::InvalidPassengerIdChar(ch)),
        None => Ok(()),
    }
}

/// Parse a topic string against the fixed schema
pub fn parse_topic(topic: &str) -> Result<ParsedTopic, ValidationError> {
    let segments: Vec<&str> = topic.split('/').collect();

    let (channel, vehicle, passenger) = match segments.as_slice() {
        ["device", "telemetry"] => (Channel::Telemetry, None, None),
        ["device", vehicle, "telemetry"] => (Channel::Telemetry, Some(*vehicle), None),
        ["device", vehicle, "people"] => (Channel::OccupancyDelta, Some(*vehicle), None),
        ["device", vehicle, "fare"] => (Channel::Fare, Some(*vehicle), None),
        ["pao", "passenger", "updates"] => (Channel::PassengerUpdate, None, None),
        ["pao", vehicle, "passenger", "updates"] => {
            (Channel::PassengerUpdate, Some(*vehicle), None)
        }
        ["commuter", vehicle, "livestream", "ack"] => {
            (Channel::Acknowledgment, Some(*vehicle), None)
        }
        ["commuter", vehicle, "livestream", "ack", passenger] => {
            (Channel::Acknowledgment, Some(*vehicle), Some(*passenger))
        }
        _ => return Err(ValidationError::UnknownTopic(topic.to_string())),
    };

    let vehicle = vehicle.map(VehicleId::parse).transpose()?;
    let passenger = match passenger {
        Some(p) => {
            validate_passenger_id(p)?;
            Some(p.to_string())
        }
        None => None,
    };

    Ok(ParsedTopic {
        channel,
        vehicle,
        passenger,
    })
}

/// Outbound topic construction and per-role subscription sets
pub struct TopicBuilder;

impl TopicBuilder {
    /// `device/{vehicle}/telemetry`
    pub fn telemetry(vehicle: &VehicleId) -> String {
        format!("device/{}/telemetry", vehicle.topic_segment())
    }

    /// `device/{vehicle}/people`
    pub fn occupancy(vehicle: &VehicleId) -> String {
        format!("device/{}/people", vehicle.topic_segment())
    }

    /// `device/{vehicle}/fare`
    pub fn fare(vehicle: &VehicleId) -> String {
        format!("device/{}/fare", vehicle.topic_segment())
    }

    /// `pao/{vehicle}/passenger/updates`
    pub fn passenger_updates(vehicle: &VehicleId) -> String {
        format!("pao/{}/passenger/updates", vehicle.topic_segment())
    }

    /// Broadcast request topic heard by every operator
    pub fn passenger_updates_broadcast() -> String {
        "pao/passenger/updates".to_string()
    }

    /// `commuter/{vehicle}/livestream/ack/{passenger}`
    pub fn acknowledgment(vehicle: &VehicleId, passenger_id: &str) -> String {
        format!(
            "commuter/{}/livestream/ack/{passenger_id}",
            vehicle.topic_segment()
        )
    }

    /// Topic filters a device subscribes to for its role
    pub fn subscriptions(
        role: DeviceRole,
        vehicle: Option<&VehicleId>,
        passenger_id: Option<&str>,
    ) -> Vec<String> {
        let fleet_wide = || {
            vec![
                "device/+/telemetry".to_string(),
                "device/+/people".to_string(),
                "device/+/fare".to_string(),
            ]
        };

        match role {
            DeviceRole::Manager => fleet_wide(),
            DeviceRole::Commuter => {
                let mut topics = fleet_wide();
                if let Some(passenger) = passenger_id {
                    topics.push(format!("commuter/+/livestream/ack/{passenger}"));
                }
                topics.push("commuter/+/livestream/ack".to_string());
                topics
            }
            DeviceRole::Operator => match vehicle {
                Some(vehicle) => vec![
                    Self::telemetry(vehicle),
                    Self::occupancy(vehicle),
                    Self::fare(vehicle),
                    "device/telemetry".to_string(),
                    Self::passenger_updates(vehicle),
                    Self::passenger_updates_broadcast(),
                ],
                None => fleet_wide(),
            },
        }
    }
}

/// Validation errors for topics and identifiers
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Vehicle ID cannot be empty")]
    EmptyVehicleId,
    #[error("Vehicle ID contains invalid character: '{0}'")]
    InvalidVehicleIdChar(char),
    #[error("Passenger ID cannot be empty")]
    EmptyPassengerId,
    #[error("Passenger ID contains invalid character: '{0}'")]
    InvalidPassengerIdChar(char),
    #[error("Topic does not match any known channel: {0}")]
    UnknownTopic(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn numeric_ids_are_canonical_regardless_of_spelling(n in 0u32..10_000) {
            let plain = VehicleId::parse(&n.to_string()).unwrap();
            let padded = VehicleId::parse(&format!("{n:02}")).unwrap();
            let prefixed = VehicleId::parse(&format!("bus-{n}")).unwrap();
            let prefixed_padded = VehicleId::parse(&format!("bus-{n:02}")).unwrap();

            prop_assert_eq!(&plain, &padded);
            prop_assert_eq!(&plain, &prefixed);
            prop_assert_eq!(&plain, &prefixed_padded);
            prop_assert!(plain.as_str().len() >= 2);
        }

        #[test]
        fn canonicalization_is_idempotent(raw in "[a-zA-Z0-9._-]{1,16}") {
            let first = VehicleId::parse(&raw).unwrap();
            let second = VehicleId::parse(first.as_str()).unwrap();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn built_topics_parse_back_to_the_same_vehicle(raw in "[a-z0-9]{1,8}") {
            let vehicle = VehicleId::parse(&raw).unwrap();
            let parsed = parse_topic(&TopicBuilder::fare(&vehicle)).unwrap();
            prop_assert_eq!(parsed.channel, Channel::Fare);
            prop_assert_eq!(parsed.vehicle, Some(vehicle));
        }
    }

    #[test]
    fn test_vehicle_id_examples() {
        assert_eq!(VehicleId::parse("3").unwrap().as_str(), "03");
        assert_eq!(VehicleId::parse("bus-03").unwrap().as_str(), "03");
        assert_eq!(VehicleId::parse("BUS-12").unwrap().as_str(), "12");
        assert_eq!(VehicleId::parse("0").unwrap().as_str(), "00");
        assert_eq!(VehicleId::parse("117").unwrap().as_str(), "117");
        assert_eq!(VehicleId::parse("shuttle-a").unwrap().as_str(), "shuttle-a");
        assert_eq!(VehicleId::parse("bus-").unwrap().as_str(), "bus-");
    }

    #[test]
    fn test_vehicle_id_rejects_wildcards_and_separators() {
        assert_eq!(VehicleId::parse(""), Err(ValidationError::EmptyVehicleId));
        assert_eq!(VehicleId::parse("  "), Err(ValidationError::EmptyVehicleId));
        assert_eq!(
            VehicleId::parse("bus/03"),
            Err(ValidationError::InvalidVehicleIdChar('/'))
        );
        assert_eq!(
            VehicleId::parse("+"),
            Err(ValidationError::InvalidVehicleIdChar('+'))
        );
        assert_eq!(
            VehicleId::parse("#"),
            Err(ValidationError::InvalidVehicleIdChar('#'))
        );
    }

    #[test]
    fn test_topic_segment() {
        assert_eq!(VehicleId::parse("3").unwrap().topic_segment(), "bus-03");
        assert_eq!(
            VehicleId::parse("shuttle-a").unwrap().topic_segment(),
            "shuttle-a"
        );
    }

    #[test]
    fn test_parse_device_topics() {
        let parsed = parse_topic("device/bus-03/telemetry").unwrap();
        assert_eq!(parsed.channel, Channel::Telemetry);
        assert_eq!(parsed.vehicle, Some(VehicleId::parse("03").unwrap()));

        let parsed = parse_topic("device/telemetry").unwrap();
        assert_eq!(parsed.channel, Channel::Telemetry);
        assert_eq!(parsed.vehicle, None);

        let parsed = parse_topic("device/7/people").unwrap();
        assert_eq!(parsed.channel, Channel::OccupancyDelta);
        assert_eq!(parsed.vehicle.unwrap().as_str(), "07");

        assert_eq!(
            parse_topic("device/bus-01/fare").unwrap().channel,
            Channel::Fare
        );
    }

    #[test]
    fn test_parse_passenger_and_ack_topics() {
        let parsed = parse_topic("pao/bus-02/passenger/updates").unwrap();
        assert_eq!(parsed.channel, Channel::PassengerUpdate);
        assert_eq!(parsed.vehicle.unwrap().as_str(), "02");

        let parsed = parse_topic("pao/passenger/updates").unwrap();
        assert_eq!(parsed.channel, Channel::PassengerUpdate);
        assert!(parsed.vehicle.is_none());

        let parsed = parse_topic("commuter/bus-02/livestream/ack/p-17").unwrap();
        assert_eq!(parsed.channel, Channel::Acknowledgment);
        assert_eq!(parsed.passenger.as_deref(), Some("p-17"));

        let legacy = parse_topic("commuter/bus-02/livestream/ack").unwrap();
        assert_eq!(legacy.channel, Channel::Acknowledgment);
        assert!(legacy.passenger.is_none());
    }

    #[test]
    fn test_parse_unknown_topics() {
        assert!(matches!(
            parse_topic("device/bus-01/unknown"),
            Err(ValidationError::UnknownTopic(_))
        ));
        assert!(parse_topic("").is_err());
        assert!(parse_topic("/device/bus-01/fare").is_err());
        assert_eq!(
            parse_topic("commuter/bus-01/livestream/ack/"),
            Err(ValidationError::EmptyPassengerId)
        );
    }

    #[test]
    fn test_passenger_id_rejects_topic_characters() {
        assert!(validate_passenger_id("p-42").is_ok());
        assert_eq!(
            validate_passenger_id("a/+"),
            Err(ValidationError::InvalidPassengerIdChar('/'))
        );
        assert_eq!(
            validate_passenger_id("rider#1"),
            Err(ValidationError::InvalidPassengerIdChar('#'))
        );
        assert_eq!(validate_passenger_id(" "), Err(ValidationError::EmptyPassengerId));
    }

    #[test]
    fn test_builder_topics() {
        let vehicle = VehicleId::parse("3").unwrap();
        assert_eq!(TopicBuilder::telemetry(&vehicle), "device/bus-03/telemetry");
        assert_eq!(TopicBuilder::occupancy(&vehicle), "device/bus-03/people");
        assert_eq!(
            TopicBuilder::passenger_updates(&vehicle),
            "pao/bus-03/passenger/updates"
        );
        assert_eq!(
            TopicBuilder::acknowledgment(&vehicle, "p-1"),
            "commuter/bus-03/livestream/ack/p-1"
        );
    }

    #[test]
    fn test_role_subscriptions() {
        let vehicle = VehicleId::parse("3").unwrap();

        let operator = TopicBuilder::subscriptions(DeviceRole::Operator, Some(&vehicle), None);
        assert!(operator.contains(&"device/bus-03/telemetry".to_string()));
        assert!(operator.contains(&"pao/passenger/updates".to_string()));
        assert!(!operator.iter().any(|t| t.contains('+')));

        let commuter = TopicBuilder::subscriptions(DeviceRole::Commuter, None, Some("p-1"));
        assert!(commuter.contains(&"commuter/+/livestream/ack/p-1".to_string()));

        let manager = TopicBuilder::subscriptions(DeviceRole::Manager, None, None);
        assert_eq!(manager.len(), 3);
    }
}
