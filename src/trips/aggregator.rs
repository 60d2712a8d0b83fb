use crate::backend::{BackendApi, SensorReading, TripSummary};
use crate::error::sanitize_error_message;
use crate::observability::metrics::metrics;
use crate::protocol::{OccupancyDelta, VehicleId};
use crate::store::{Store, StoreResult};
use crate::trip_span;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeofenceTransition {
    Enter,
    Exit,
}

impl fmt::Display for GeofenceTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Enter => "enter",
            Self::Exit => "exit",
        })
    }
}

impl FromStr for GeofenceTransition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "enter" => Ok(Self::Enter),
            "exit" => Ok(Self::Exit),
            other => Err(format!("unknown geofence transition: {other}")),
        }
    }
}

/// A crossing reported by the location-monitoring collaborator
#[derive(Debug, Clone, PartialEq)]
pub struct GeofenceEvent {
    pub transition: GeofenceTransition,
    pub region: String,
    pub vehicle: VehicleId,
    pub at: DateTime<Utc>,
}

/// One closed Exit→Enter cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TripAggregate {
    pub vehicle_id: VehicleId,
    /// Region whose Enter closed the trip
    pub route_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub entries_delta: u32,
    pub exits_delta: u32,
    pub net_delta: u32,
    pub paid_at_close: u32,
}

impl TripAggregate {
    pub fn summary(&self) -> TripSummary {
        TripSummary {
            route_id: self.route_id.clone(),
            started_at: self.started_at.timestamp_millis(),
            ended_at: self.ended_at.timestamp_millis(),
            entries: self.entries_delta,
            exits: self.exits_delta,
            net: self.net_delta,
            paid: self.paid_at_close,
        }
    }
}

/// Geofence-driven trip boundaries.
///
/// All trip state lives in the store so a geofence event handled in another
/// process sees the same flag and accumulators as the dispatcher.
pub struct TripAggregator {
    store: Store,
    backend: Arc<dyn BackendApi>,
}

impl TripAggregator {
    pub fn new(store: Store, backend: Arc<dyn BackendApi>) -> Self {
        Self { store, backend }
    }

    pub async fn handle(&self, event: &GeofenceEvent) -> StoreResult<Option<TripAggregate>> {
        let span = trip_span!(
            vehicle = %event.vehicle,
            region = %event.region,
            transition = %event.transition
        );

        async {
            match event.transition {
                GeofenceTransition::Exit => {
                    self.on_exit(&event.vehicle, event.at).await?;
                    Ok(None)
                }
                GeofenceTransition::Enter => {
                    self.on_enter(&event.vehicle, &event.region, event.at).await
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Leaving a terminal: start counting from zero
    pub async fn on_exit(&self, vehicle: &VehicleId, at: DateTime<Utc>) -> StoreResult<()> {
        self.store.begin_trip(vehicle, at).await?;
        metrics().trip_started();
        info!(vehicle = %vehicle, started_at = %at, "Trip started");
        Ok(())
    }

    /// Occupancy reading: accumulate it if a trip is open and forward it to
    /// the backend. Returns whether a trip was open.
    pub async fn on_delta(&self, vehicle: &VehicleId, delta: &OccupancyDelta) -> StoreResult<bool> {
        let entered = delta.entered.unwrap_or(0);
        let exited = delta.exited.unwrap_or(0);

        let counting = self
            .store
            .accumulate_trip(vehicle, entered, exited, delta.total)
            .await?;
        if !counting {
            return Ok(false);
        }

        let reading = SensorReading {
            device_id: vehicle.topic_segment(),
            entered,
            exited,
            total: delta.total.unwrap_or(0),
        };
        let backend = self.backend.clone();
        tokio::spawn(async move {
            match backend.post_sensor_reading(&reading).await {
                Ok(()) => metrics().sensor_reading_posted(),
                Err(e) => {
                    metrics().sensor_reading_failed();
                    debug!(
                        error = %sanitize_error_message(&e.to_string()),
                        "Sensor reading not delivered"
                    );
                }
            }
        });

        Ok(true)
    }

    /// Arriving at a terminal: close the open trip and submit its summary
    /// once. No open trip means nothing to do. Without a vehicle snapshot the
    /// trip is still closed but no summary goes out.
    pub async fn on_enter(
        &self,
        vehicle: &VehicleId,
        region: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<TripAggregate>> {
        let Some(trip) = self.store.close_trip(vehicle).await? else {
            debug!(vehicle = %vehicle, "Enter without an open trip; nothing to submit");
            return Ok(None);
        };

        let paid_at_close = match self.store.load_snapshot(vehicle).await {
            Ok(Some(snapshot)) => snapshot.paid_count,
            Ok(None) => {
                warn!(
                    vehicle = %vehicle,
                    "No vehicle snapshot at trip close; summary not submitted"
                );
                return Ok(None);
            }
            Err(e) => {
                warn!(
                    vehicle = %vehicle,
                    error = %e,
                    "Vehicle snapshot unreadable at trip close; summary not submitted"
                );
                return Ok(None);
            }
        };

        let aggregate = TripAggregate {
            vehicle_id: vehicle.clone(),
            route_id: region.to_string(),
            started_at: trip.started_at,
            ended_at: at,
            entries_delta: trip.entries,
            exits_delta: trip.exits,
            net_delta: trip.inside,
            paid_at_close,
        };

        match self.backend.submit_trip_summary(&aggregate.summary()).await {
            Ok(()) => {
                metrics().trip_completed();
                info!(
                    vehicle = %vehicle,
                    route = %region,
                    entries = aggregate.entries_delta,
                    exits = aggregate.exits_delta,
                    paid = aggregate.paid_at_close,
                    "Trip summary submitted"
                );
            }
            Err(e) => {
                // Not retried; the trip is closed either way
                metrics().trip_submit_failed();
                warn!(
                    vehicle = %vehicle,
                    error = %sanitize_error_message(&e.to_string()),
                    "Trip summary submission failed"
                );
            }
        }

        Ok(Some(aggregate))
    }

    pub async fn is_counting(&self, vehicle: &VehicleId) -> StoreResult<bool> {
        self.store.is_counting(vehicle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::{VehiclePatch, VehicleState};
    use crate::testing::mocks::MockBackend;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_714_550_400 + secs, 0).unwrap()
    }

    fn bus() -> VehicleId {
        VehicleId::parse("03").unwrap()
    }

    async fn setup(backend: MockBackend) -> (TripAggregator, Store, Arc<MockBackend>) {
        let store = Store::in_memory().await.unwrap();
        let backend = Arc::new(backend);
        (
            TripAggregator::new(store.clone(), backend.clone()),
            store,
            backend,
        )
    }

    async fn seed_snapshot(store: &Store, paid_count: u32) {
        let mut snapshot = VehicleState::new(bus(), at(0));
        snapshot.apply(&VehiclePatch::Fare { paid_count }, at(0));
        store.save_snapshot(&snapshot).await.unwrap();
    }

    #[test]
    fn test_transition_parsing() {
        assert_eq!("ENTER".parse::<GeofenceTransition>(), Ok(GeofenceTransition::Enter));
        assert_eq!("exit".parse::<GeofenceTransition>(), Ok(GeofenceTransition::Exit));
        assert!("leave".parse::<GeofenceTransition>().is_err());
    }

    #[tokio::test]
    async fn test_exit_deltas_enter_submits_once() {
        let (aggregator, store, backend) = setup(MockBackend::new()).await;
        seed_snapshot(&store, 4).await;

        aggregator.on_exit(&bus(), at(0)).await.unwrap();
        assert!(aggregator.on_delta(&bus(), &OccupancyDelta::new(5, 2, None)).await.unwrap());
        assert!(aggregator.on_delta(&bus(), &OccupancyDelta::new(1, 0, None)).await.unwrap());
        let trip = aggregator
            .on_enter(&bus(), "terminal-north", at(1800))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(trip.entries_delta, 6);
        assert_eq!(trip.exits_delta, 2);
        assert_eq!(trip.net_delta, 4);
        assert_eq!(trip.paid_at_close, 4);

        let summaries = backend.summaries().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].route_id, "terminal-north");
        assert_eq!(summaries[0].started_at, at(0).timestamp_millis());
        assert_eq!(summaries[0].ended_at, at(1800).timestamp_millis());

        assert!(aggregator.on_enter(&bus(), "terminal-north", at(1900)).await.unwrap().is_none());
        assert_eq!(backend.summaries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_enter_without_exit_is_noop() {
        let (aggregator, _store, backend) = setup(MockBackend::new()).await;

        let result = aggregator.on_enter(&bus(), "terminal-north", at(0)).await.unwrap();

        assert!(result.is_none());
        assert!(backend.summaries().await.is_empty());
    }

    #[tokio::test]
    async fn test_deltas_outside_trip_ignored() {
        let (aggregator, store, _backend) = setup(MockBackend::new()).await;

        assert!(!aggregator.on_delta(&bus(), &OccupancyDelta::new(3, 0, None)).await.unwrap());
        aggregator.on_exit(&bus(), at(0)).await.unwrap();
        aggregator.on_enter(&bus(), "depot", at(60)).await.unwrap();
        assert!(!aggregator.on_delta(&bus(), &OccupancyDelta::new(3, 0, None)).await.unwrap());

        let state = store.trip_state(&bus()).await.unwrap().unwrap();
        assert!(!state.counting_active);
        assert_eq!(state.trip.entries, 0);
    }

    #[tokio::test]
    async fn test_missing_snapshot_closes_trip_without_summary() {
        let (aggregator, store, backend) = setup(MockBackend::new()).await;
        aggregator.on_exit(&bus(), at(0)).await.unwrap();

        let trip = aggregator.on_enter(&bus(), "depot", at(60)).await.unwrap();

        assert!(trip.is_none());
        assert_eq!(backend.summary_attempts().await, 0);
        assert!(!store.is_counting(&bus()).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_submission_not_retried() {
        let (aggregator, store, backend) = setup(MockBackend::failing()).await;
        seed_snapshot(&store, 2).await;
        aggregator.on_exit(&bus(), at(0)).await.unwrap();

        let trip = aggregator.on_enter(&bus(), "depot", at(60)).await.unwrap();

        assert!(trip.is_some());
        assert_eq!(backend.summary_attempts().await, 1);
        assert!(!store.is_counting(&bus()).await.unwrap());
    }

    #[tokio::test]
    async fn test_sensor_readings_forwarded_while_counting() {
        let (aggregator, _store, backend) = setup(MockBackend::new()).await;
        aggregator.on_exit(&bus(), at(0)).await.unwrap();

        aggregator
            .on_delta(&bus(), &OccupancyDelta::new(2, 1, Some(11)))
            .await
            .unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let readings = backend.sensor_readings().await;
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].device_id, "bus-03");
        assert_eq!(readings[0].total, 11);
    }

    #[tokio::test]
    async fn test_handle_dispatches_by_transition() {
        let (aggregator, store, backend) = setup(MockBackend::new()).await;
        seed_snapshot(&store, 0).await;
        let exit = GeofenceEvent {
            transition: GeofenceTransition::Exit,
            region: "terminal-north".to_string(),
            vehicle: bus(),
            at: at(0),
        };
        let enter = GeofenceEvent {
            transition: GeofenceTransition::Enter,
            at: at(90),
            ..exit.clone()
        };

        assert!(aggregator.handle(&exit).await.unwrap().is_none());
        assert!(aggregator.is_counting(&bus()).await.unwrap());
        assert!(aggregator.handle(&enter).await.unwrap().is_some());
        assert_eq!(backend.summaries().await.len(), 1);
    }
}
