//! Single-consumer event dispatch and service lifecycle
//!
//! Everything that changes in-memory state goes through one [`Dispatcher`]
//! task: broker messages, geofence transitions, passenger positions, timer
//! ticks, poll results and operator/commuter commands. Each event runs to
//! completion before the next one is taken.

pub mod dispatcher;
pub mod lifecycle;

pub use dispatcher::{Dispatcher, DispatcherInputs, InboundEvent, PipelineCommand, PipelineHandle};
pub use lifecycle::{BusLinkService, LifecycleError, RunningService};
