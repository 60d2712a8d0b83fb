//! Wire payloads for every message channel
//!
//! Payloads from devices are loosely typed on the wire (counters arrive as
//! integers or floats, identifiers as strings or numbers). Decoding happens
//! once, here, into a tagged [`ChannelMessage`]; nothing past the router sees
//! untyped JSON.

use super::topics::{validate_passenger_id, Channel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Kilometres per degree of latitude, used for short planar displacements
pub const KM_PER_DEGREE: f64 = 111.0;

/// A latitude/longitude pair in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Approximate planar displacement in metres.
    ///
    /// Treats a degree of longitude like a degree of latitude, which is close
    /// enough at the fleet's operating latitudes and cheap enough to run on
    /// every sample.
    pub fn planar_distance_m(&self, other: &GeoPoint) -> f64 {
        let d_lat = self.lat - other.lat;
        let d_lng = self.lng - other.lng;
        (d_lat * d_lat + d_lng * d_lng).sqrt() * KM_PER_DEGREE * 1000.0
    }
}

/// `{lat, lng, people?, paid?}` on the telemetry channel
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TelemetryPayload {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, deserialize_with = "optional_count")]
    pub people: Option<u32>,
    #[serde(default, deserialize_with = "optional_count")]
    pub paid: Option<u32>,
}

impl TelemetryPayload {
    pub fn position(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }
}

/// `{in, out, total}` on the occupancy-delta channel; every field optional
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OccupancyDelta {
    #[serde(rename = "in", default, deserialize_with = "optional_count")]
    pub entered: Option<u32>,
    #[serde(rename = "out", default, deserialize_with = "optional_count")]
    pub exited: Option<u32>,
    #[serde(default, deserialize_with = "optional_count")]
    pub total: Option<u32>,
}

impl OccupancyDelta {
    /// True when none of `in`, `out` or `total` was present
    pub fn is_empty(&self) -> bool {
        self.entered.is_none() && self.exited.is_none() && self.total.is_none()
    }

    pub fn new(entered: u32, exited: u32, total: Option<u32>) -> Self {
        Self {
            entered: Some(entered),
            exited: Some(exited),
            total,
        }
    }
}

/// `{paid}` on the fare channel
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct FarePayload {
    #[serde(deserialize_with = "count")]
    pub paid: u32,
}

/// Passenger-update channel payload, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PassengerUpdate {
    Location {
        #[serde(deserialize_with = "identifier")]
        id: String,
        lat: f64,
        lng: f64,
    },
    Request {
        #[serde(deserialize_with = "identifier")]
        id: String,
        #[serde(deserialize_with = "count")]
        minutes: u32,
        /// Milliseconds since the Unix epoch
        #[serde(default)]
        timestamp: i64,
    },
}

impl PassengerUpdate {
    pub fn location(passenger_id: &str, point: GeoPoint) -> Self {
        Self::Location {
            id: passenger_id.to_string(),
            lat: point.lat,
            lng: point.lng,
        }
    }

    pub fn request(passenger_id: &str, minutes: u32, at: DateTime<Utc>) -> Self {
        Self::Request {
            id: passenger_id.to_string(),
            minutes,
            timestamp: at.timestamp_millis(),
        }
    }

    pub fn passenger_id(&self) -> &str {
        match self {
            Self::Location { id, .. } | Self::Request { id, .. } => id,
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// `{ok: true, id?, ts?}` on the acknowledgment channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub ok: bool,
    #[serde(default, deserialize_with = "optional_identifier")]
    pub id: Option<String>,
    /// Milliseconds since the Unix epoch
    #[serde(default)]
    pub ts: Option<i64>,
}

impl AckPayload {
    pub fn accept(passenger_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            ok: true,
            id: Some(passenger_id.to_string()),
            ts: Some(at.timestamp_millis()),
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// A decoded message, one variant per channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Telemetry(TelemetryPayload),
    OccupancyDelta(OccupancyDelta),
    Fare(FarePayload),
    PassengerUpdate(PassengerUpdate),
    Acknowledgment(AckPayload),
}

impl ChannelMessage {
    /// Decode a raw payload for the given channel
    pub fn decode(channel: Channel, payload: &[u8]) -> Result<Self, DecodeError> {
        let malformed = |source| DecodeError::Malformed { channel, source };

        let message = match channel {
            Channel::Telemetry => {
                let telemetry: TelemetryPayload =
                    serde_json::from_slice(payload).map_err(malformed)?;
                if !telemetry.position().is_valid() {
                    return Err(DecodeError::rejected(channel, "coordinates out of range"));
                }
                Self::Telemetry(telemetry)
            }
            Channel::OccupancyDelta => {
                let delta: OccupancyDelta = serde_json::from_slice(payload).map_err(malformed)?;
                if delta.is_empty() {
                    return Err(DecodeError::rejected(channel, "no occupancy fields"));
                }
                Self::OccupancyDelta(delta)
            }
            Channel::Fare => Self::Fare(serde_json::from_slice(payload).map_err(malformed)?),
            Channel::PassengerUpdate => {
                let update: PassengerUpdate =
                    serde_json::from_slice(payload).map_err(malformed)?;
                if let Err(e) = validate_passenger_id(update.passenger_id()) {
                    return Err(DecodeError::rejected(channel, e.to_string()));
                }
                if let PassengerUpdate::Location { lat, lng, .. } = update {
                    if !GeoPoint::new(lat, lng).is_valid() {
                        return Err(DecodeError::rejected(channel, "coordinates out of range"));
                    }
                }
                Self::PassengerUpdate(update)
            }
            Channel::Acknowledgment => {
                let ack: AckPayload = serde_json::from_slice(payload).map_err(malformed)?;
                if !ack.ok {
                    return Err(DecodeError::rejected(channel, "acknowledgment not ok"));
                }
                if let Some(Err(e)) = ack.id.as_deref().map(validate_passenger_id) {
                    return Err(DecodeError::rejected(channel, e.to_string()));
                }
                Self::Acknowledgment(ack)
            }
        };

        Ok(message)
    }
}

/// Payload decoding failures; always dropped at the router boundary
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Unroutable topic: {0}")]
    Topic(#[from] super::topics::ValidationError),
    #[error("Generic topic {0} received but no vehicle is assigned to this device")]
    UnassignedVehicle(String),
    #[error("Malformed {channel} payload: {source}")]
    Malformed {
        channel: Channel,
        #[source]
        source: serde_json::Error,
    },
    #[error("Rejected {channel} payload: {reason}")]
    Rejected { channel: Channel, reason: String },
}

impl DecodeError {
    pub fn rejected<S: Into<String>>(channel: Channel, reason: S) -> Self {
        Self::Rejected {
            channel,
            reason: reason.into(),
        }
    }
}

/// Clamp a JSON number into a counter: truncated toward zero, negatives to 0
fn clamp_count(value: f64) -> Option<u32> {
    if !value.is_finite() {
        return None;
    }
    Some(value.trunc().clamp(0.0, u32::MAX as f64) as u32)
}

fn count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    clamp_count(value).ok_or_else(|| serde::de::Error::custom("counter is not a finite number"))
}

fn optional_count<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<f64>::deserialize(deserializer)? {
        Some(value) => clamp_count(value)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("counter is not a finite number")),
        None => Ok(None),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdentifierRepr {
    Text(String),
    Number(i64),
}

impl From<IdentifierRepr> for String {
    fn from(value: IdentifierRepr) -> Self {
        match value {
            IdentifierRepr::Text(text) => text,
            IdentifierRepr::Number(number) => number.to_string(),
        }
    }
}

fn identifier<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    IdentifierRepr::deserialize(deserializer).map(String::from)
}

fn optional_identifier<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<IdentifierRepr>::deserialize(deserializer)?.map(String::from))
}
