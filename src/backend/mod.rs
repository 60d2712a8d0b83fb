//! Backend HTTP collaborators
//!
//! The backend owns ticketing and trip history. This core only reads paid
//! ticket counts (for the poller) and writes trip summaries and sensor
//! readings (for the trip aggregator). [`BackendApi`] is the seam; the
//! production implementation is [`HttpBackend`].

pub mod client;
pub mod poller;

pub use client::HttpBackend;
pub use poller::{BackendPoller, PollResult};

use crate::protocol::VehicleId;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[async_trait]
pub trait BackendApi: Send + Sync {
    /// Ticket records issued on `date`
    async fn fetch_tickets(&self, date: NaiveDate) -> Result<Vec<TicketRecord>, BackendError>;

    /// Submit one closed trip
    async fn submit_trip_summary(&self, summary: &TripSummary) -> Result<(), BackendError>;

    /// Forward one occupancy reading taken while a trip is open
    async fn post_sensor_reading(&self, reading: &SensorReading) -> Result<(), BackendError>;
}

/// Which backend call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendOperation {
    TicketPoll,
    TripSummary,
    SensorReading,
}

impl fmt::Display for BackendOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TicketPoll => "ticket poll",
            Self::TripSummary => "trip summary",
            Self::SensorReading => "sensor reading",
        })
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend client could not be built: {0}")]
    Client(String),

    #[error("{operation} request failed: {message}")]
    Request {
        operation: BackendOperation,
        message: String,
    },

    #[error("{operation} returned HTTP {status}: {body}")]
    Status {
        operation: BackendOperation,
        status: u16,
        body: String,
    },

    #[error("{operation} response could not be decoded: {message}")]
    Decode {
        operation: BackendOperation,
        message: String,
    },
}

impl BackendError {
    pub fn operation(&self) -> Option<BackendOperation> {
        match self {
            Self::Client(_) => None,
            Self::Request { operation, .. }
            | Self::Status { operation, .. }
            | Self::Decode { operation, .. } => Some(*operation),
        }
    }
}

/// Body of `POST manager/trip-summary`; timestamps in epoch milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripSummary {
    pub route_id: String,
    pub started_at: i64,
    pub ended_at: i64,
    #[serde(rename = "in")]
    pub entries: u32,
    #[serde(rename = "out")]
    pub exits: u32,
    pub net: u32,
    pub paid: u32,
}

/// Body of `POST manager/sensor-readings`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "in")]
    pub entered: u32,
    #[serde(rename = "out")]
    pub exited: u32,
    pub total: u32,
}

/// Bus reference on a ticket row: a fleet number or a label
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum BusRef {
    Number(i64),
    Text(String),
}

impl BusRef {
    pub fn vehicle_id(&self) -> Option<VehicleId> {
        match self {
            Self::Number(n) => VehicleId::parse(&n.to_string()).ok(),
            Self::Text(text) => VehicleId::parse(text).ok(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TicketRecord {
    #[serde(default)]
    pub bus: Option<BusRef>,
    /// Missing on older records
    #[serde(default)]
    pub paid: Option<bool>,
}

impl TicketRecord {
    pub fn new(bus: Option<&str>, paid: Option<bool>) -> Self {
        Self {
            bus: bus.map(|b| BusRef::Text(b.to_string())),
            paid,
        }
    }

    /// Only an explicit `paid: false` excludes a ticket
    pub fn counts_as_paid(&self) -> bool {
        self.paid != Some(false)
    }
}

/// `GET manager/tickets` answers either a bare list or `{tickets: [...]}`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TicketsResponse {
    List(Vec<TicketRecord>),
    Wrapped { tickets: Vec<TicketRecord> },
}

impl TicketsResponse {
    pub fn into_records(self) -> Vec<TicketRecord> {
        match self {
            Self::List(records) | Self::Wrapped { tickets: records } => records,
        }
    }
}

/// Paid tickets per vehicle.
///
/// Every vehicle that appears in the response gets an entry, even when all
/// of its tickets are unpaid. Rows whose bus can't be identified are skipped.
pub fn count_paid(records: &[TicketRecord]) -> BTreeMap<VehicleId, u32> {
    let mut counts = BTreeMap::new();

    for record in records {
        let Some(vehicle) = record.bus.as_ref().and_then(BusRef::vehicle_id) else {
            continue;
        };
        let count = counts.entry(vehicle).or_insert(0u32);
        if record.counts_as_paid() {
            *count += 1;
        }
    }

    counts
}
