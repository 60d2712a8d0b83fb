//! Per-vehicle record and the field-ownership merge rules
//!
//! Each channel writes a disjoint subset of [`VehicleState`]:
//!
//! | patch       | fields written                         |
//! |-------------|----------------------------------------|
//! | telemetry   | `position`, `occupancy`, `reported_paid` |
//! | occupancy   | `entries`, `exits`, `inside`           |
//! | fare / poll | `paid_count`                           |
//!
//! `last_updated` is touched by every patch. Because no patch reads or
//! writes another channel's fields, patches from different channels commute.

use crate::protocol::{GeoPoint, OccupancyDelta, VehicleId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconciled view of one vehicle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub id: VehicleId,
    /// Absent until the first telemetry message
    pub position: Option<GeoPoint>,
    /// Passenger count as last reported by telemetry
    pub occupancy: u32,
    /// Paid counter carried on telemetry, if the device reports one
    pub reported_paid: Option<u32>,
    pub entries: u32,
    pub exits: u32,
    pub inside: u32,
    pub paid_count: u32,
    pub last_updated: DateTime<Utc>,
}

impl VehicleState {
    /// Fresh record with defaults for every field
    pub fn new(id: VehicleId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            position: None,
            occupancy: 0,
            reported_paid: None,
            entries: 0,
            exits: 0,
            inside: 0,
            paid_count: 0,
            last_updated: now,
        }
    }

    /// Merge a partial update, touching only the fields the patch owns
    pub fn apply(&mut self, patch: &VehiclePatch, now: DateTime<Utc>) {
        match patch {
            VehiclePatch::Telemetry {
                position,
                occupancy,
                reported_paid,
            } => {
                self.position = Some(*position);
                if let Some(people) = occupancy {
                    self.occupancy = *people;
                }
                if reported_paid.is_some() {
                    self.reported_paid = *reported_paid;
                }
            }
            VehiclePatch::Occupancy(delta) => {
                let entered = delta.entered.unwrap_or(0);
                let exited = delta.exited.unwrap_or(0);
                self.entries = self.entries.saturating_add(entered);
                self.exits = self.exits.saturating_add(exited);
                self.inside = match delta.total {
                    Some(total) => total,
                    None => self.inside.saturating_add(entered).saturating_sub(exited),
                };
            }
            VehiclePatch::Fare { paid_count } | VehiclePatch::Poll { paid_count } => {
                self.paid_count = *paid_count;
            }
        }

        self.last_updated = now;
    }

    /// Whether the record has gone unrefreshed for longer than `threshold`
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let age = now.signed_duration_since(self.last_updated);
        age.num_milliseconds() > threshold.as_millis() as i64
    }
}

/// A partial update from one channel
#[derive(Debug, Clone, PartialEq)]
pub enum VehiclePatch {
    Telemetry {
        position: GeoPoint,
        occupancy: Option<u32>,
        reported_paid: Option<u32>,
    },
    Occupancy(OccupancyDelta),
    Fare {
        paid_count: u32,
    },
    /// Authoritative paid count pulled from the backend
    Poll {
        paid_count: u32,
    },
}

impl VehiclePatch {
    /// Short label for logs and metrics
    pub fn source(&self) -> &'static str {
        match self {
            Self::Telemetry { .. } => "telemetry",
            Self::Occupancy(_) => "occupancy-delta",
            Self::Fare { .. } => "fare",
            Self::Poll { .. } => "poll",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_714_550_400 + secs, 0).unwrap()
    }

    fn bus(raw: &str) -> VehicleId {
        VehicleId::parse(raw).unwrap()
    }

    #[test]
    fn test_telemetry_then_fare_scenario() {
        let mut state = VehicleState::new(bus("03"), t(0));

        state.apply(
            &VehiclePatch::Telemetry {
                position: GeoPoint::new(14.1, 121.0),
                occupancy: Some(12),
                reported_paid: None,
            },
            t(1),
        );
        assert_eq!(state.id.as_str(), "03");
        assert_eq!(state.position, Some(GeoPoint::new(14.1, 121.0)));
        assert_eq!(state.occupancy, 12);
        assert_eq!(state.paid_count, 0);

        state.apply(&VehiclePatch::Fare { paid_count: 4 }, t(2));
        assert_eq!(state.paid_count, 4);
        assert_eq!(state.position, Some(GeoPoint::new(14.1, 121.0)));
        assert_eq!(state.occupancy, 12);
        assert_eq!(state.last_updated, t(2));
    }

    #[test]
    fn test_telemetry_never_touches_paid_count() {
        let mut state = VehicleState::new(bus("03"), t(0));
        state.apply(&VehiclePatch::Fare { paid_count: 9 }, t(1));

        state.apply(
            &VehiclePatch::Telemetry {
                position: GeoPoint::new(14.0, 121.0),
                occupancy: None,
                reported_paid: Some(2),
            },
            t(2),
        );

        assert_eq!(state.paid_count, 9);
        assert_eq!(state.reported_paid, Some(2));
    }

    #[test]
    fn test_telemetry_without_people_keeps_occupancy() {
        let mut state = VehicleState::new(bus("03"), t(0));
        let with_people = VehiclePatch::Telemetry {
            position: GeoPoint::new(14.0, 121.0),
            occupancy: Some(7),
            reported_paid: Some(1),
        };
        let without_people = VehiclePatch::Telemetry {
            position: GeoPoint::new(14.2, 121.1),
            occupancy: None,
            reported_paid: None,
        };

        state.apply(&with_people, t(1));
        state.apply(&without_people, t(2));

        assert_eq!(state.occupancy, 7);
        assert_eq!(state.reported_paid, Some(1));
        assert_eq!(state.position, Some(GeoPoint::new(14.2, 121.1)));
    }

    #[test]
    fn test_occupancy_accumulates_and_tracks_inside() {
        let mut state = VehicleState::new(bus("03"), t(0));

        state.apply(&VehiclePatch::Occupancy(OccupancyDelta::new(5, 2, None)), t(1));
        assert_eq!((state.entries, state.exits, state.inside), (5, 2, 3));

        state.apply(&VehiclePatch::Occupancy(OccupancyDelta::new(1, 0, Some(10))), t(2));
        assert_eq!((state.entries, state.exits, state.inside), (6, 2, 10));

        state.apply(&VehiclePatch::Occupancy(OccupancyDelta::new(0, 20, None)), t(3));
        assert_eq!(state.inside, 0);
    }

    #[test]
    fn test_poll_writes_only_paid_count() {
        let mut state = VehicleState::new(bus("07"), t(0));
        state.apply(
            &VehiclePatch::Telemetry {
                position: GeoPoint::new(14.0, 121.0),
                occupancy: Some(3),
                reported_paid: None,
            },
            t(1),
        );
        let before = state.clone();

        state.apply(&VehiclePatch::Poll { paid_count: 11 }, t(2));

        assert_eq!(state.paid_count, 11);
        assert_eq!(state.position, before.position);
        assert_eq!(state.occupancy, before.occupancy);
    }

    #[test]
    fn test_staleness() {
        let state = VehicleState::new(bus("03"), t(0));
        assert!(!state.is_stale(t(60), Duration::from_secs(120)));
        assert!(state.is_stale(t(121), Duration::from_secs(120)));
    }

    fn telemetry_patch() -> impl Strategy<Value = VehiclePatch> {
        (
            -90.0f64..90.0,
            -180.0f64..180.0,
            proptest::option::of(0u32..200),
            proptest::option::of(0u32..200),
        )
            .prop_map(|(lat, lng, occupancy, reported_paid)| VehiclePatch::Telemetry {
                position: GeoPoint::new(lat, lng),
                occupancy,
                reported_paid,
            })
    }

    proptest! {
        #[test]
        fn telemetry_merge_is_idempotent(patch in telemetry_patch()) {
            let mut once = VehicleState::new(bus("03"), t(0));
            once.apply(&patch, t(1));

            let mut twice = once.clone();
            twice.apply(&patch, t(2));
            twice.last_updated = once.last_updated;

            prop_assert_eq!(once, twice);
        }

        #[test]
        fn fare_and_telemetry_commute(patch in telemetry_patch(), paid in 0u32..500) {
            let fare = VehiclePatch::Fare { paid_count: paid };

            let mut a = VehicleState::new(bus("03"), t(0));
            a.apply(&patch, t(1));
            a.apply(&fare, t(2));

            let mut b = VehicleState::new(bus("03"), t(0));
            b.apply(&fare, t(1));
            b.apply(&patch, t(2));

            prop_assert_eq!(a, b);
        }
    }
}
