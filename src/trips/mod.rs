//! Geofence trip aggregation
//!
//! An Exit from a terminal region opens a trip, occupancy deltas accumulate
//! while it is open, and the next Enter closes it and submits one summary.

pub mod aggregator;

pub use aggregator::{GeofenceEvent, GeofenceTransition, TripAggregate, TripAggregator};
