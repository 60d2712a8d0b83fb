//! Vehicle state reconciliation
//!
//! Partial, unordered updates from several channels (and from the backend
//! poller) merge into one record per vehicle. See [`state`] for which fields
//! each channel owns.

pub mod reconciler;
pub mod state;

pub use reconciler::VehicleReconciler;
pub use state::{VehiclePatch, VehicleState};
