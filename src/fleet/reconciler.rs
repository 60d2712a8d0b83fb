use super::state::{VehiclePatch, VehicleState};
use crate::observability::metrics::metrics;
use crate::protocol::VehicleId;
use crate::store::{Store, StoreResult};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Owns the in-memory fleet view and keeps the store in step with it.
///
/// Driven from the single dispatch task, so it needs no interior locking.
/// Observers get a copy of every merged record through [`subscribe`].
///
/// [`subscribe`]: VehicleReconciler::subscribe
pub struct VehicleReconciler {
    vehicles: HashMap<VehicleId, VehicleState>,
    store: Store,
    updates: broadcast::Sender<VehicleState>,
}

impl VehicleReconciler {
    pub fn new(store: Store) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            vehicles: HashMap::new(),
            store,
            updates,
        }
    }

    /// Load persisted snapshots so observers see last known state at startup
    pub async fn restore(&mut self) -> StoreResult<usize> {
        let snapshots = self.store.load_snapshots().await?;
        let restored = snapshots.len();

        for snapshot in snapshots {
            self.vehicles.insert(snapshot.id.clone(), snapshot);
        }

        info!(vehicles = restored, "Restored vehicle snapshots");
        Ok(restored)
    }

    /// Apply a partial update to one vehicle.
    ///
    /// Never fails: an unknown id creates a default record, and a snapshot
    /// write failure is logged while the in-memory state still advances.
    pub async fn merge(
        &mut self,
        vehicle: &VehicleId,
        patch: &VehiclePatch,
        now: DateTime<Utc>,
    ) -> VehicleState {
        let state = self
            .vehicles
            .entry(vehicle.clone())
            .or_insert_with(|| VehicleState::new(vehicle.clone(), now));
        state.apply(patch, now);
        let merged = state.clone();

        debug!(
            vehicle = %vehicle,
            source = patch.source(),
            "Merged vehicle update"
        );

        if let Err(e) = self.store.save_snapshot(&merged).await {
            warn!(vehicle = %vehicle, error = %e, "Failed to persist vehicle snapshot");
            metrics().store_write_failed();
        }

        metrics().vehicle_updated(self.vehicles.len());
        // No receivers is fine
        let _ = self.updates.send(merged.clone());

        merged
    }

    /// Merge an authoritative paid count from the backend
    pub async fn merge_from_poll(
        &mut self,
        vehicle: &VehicleId,
        paid_count: u32,
        now: DateTime<Utc>,
    ) -> VehicleState {
        self.merge(vehicle, &VehiclePatch::Poll { paid_count }, now)
            .await
    }

    pub fn get(&self, vehicle: &VehicleId) -> Option<&VehicleState> {
        self.vehicles.get(vehicle)
    }

    /// Every tracked vehicle, ordered by id
    pub fn snapshot_all(&self) -> Vec<VehicleState> {
        let mut all: Vec<VehicleState> = self.vehicles.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VehicleState> {
        self.updates.subscribe()
    }

    /// Vehicles with no update for longer than `threshold`
    pub fn stale_vehicles(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<VehicleId> {
        let mut stale: Vec<VehicleId> = self
            .vehicles
            .values()
            .filter(|state| state.is_stale(now, threshold))
            .map(|state| state.id.clone())
            .collect();
        stale.sort();
        stale
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }
}
