//! buslink - device core for a bus-transit fleet
//!
//! Runs on commuter, operator and manager devices. It keeps an MQTT link to
//! the fleet broker, routes every inbound message to the vehicle it belongs
//! to, reconciles per-vehicle state from several partial sources, drives the
//! passenger live-location handshake, turns geofence crossings into trip
//! summaries and periodically pulls authoritative fare counts from the
//! backend.
//!
//! # Overview
//!
//! - [`protocol`]: topic schema, vehicle id canonicalization, wire payloads
//! - [`transport`]: MQTT client with reconnect and resubscribe
//! - [`routing`]: topic + payload to typed, vehicle-scoped messages
//! - [`fleet`]: field-owned merge of vehicle state
//! - [`handshake`]: live-location sessions and the operator request board
//! - [`trips`]: geofence-driven trip aggregation
//! - [`backend`]: HTTP backend client and the reconciliation poller
//! - [`pipeline`]: the single-task dispatcher and service lifecycle
//!
//! # Quick Start
//!
//! ```rust
//! use buslink::fleet::{VehiclePatch, VehicleState};
//! use buslink::protocol::{GeoPoint, VehicleId};
//! use chrono::Utc;
//!
//! let id = VehicleId::parse("bus-3").unwrap();
//! assert_eq!(id.as_str(), "03");
//!
//! let now = Utc::now();
//! let mut state = VehicleState::new(id, now);
//! state.apply(
//!     &VehiclePatch::Telemetry {
//!         position: GeoPoint::new(14.1, 121.0),
//!         occupancy: Some(12),
//!         reported_paid: None,
//!     },
//!     now,
//! );
//! state.apply(&VehiclePatch::Fare { paid_count: 4 }, now);
//!
//! assert_eq!(state.occupancy, 12);
//! assert_eq!(state.paid_count, 4);
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod fleet;
pub mod handshake;
pub mod notify;
pub mod observability;
pub mod pipeline;
pub mod protocol;
pub mod routing;
pub mod store;
pub mod testing;
pub mod timers;
pub mod transport;
pub mod trips;

pub use config::*;
pub use error::{BusLinkError, BusLinkResult};
pub use pipeline::{BusLinkService, PipelineHandle, RunningService};
pub use protocol::*;
pub use transport::mqtt::MqttClient;
