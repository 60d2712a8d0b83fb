//! Observability: structured logging, metrics collection and the health
//! check endpoint.

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{HealthCheck, HealthServer};
pub use logging::{LogFormat, init_default_logging, init_logging};
pub use metrics::{MetricsCollector, MetricsSnapshot, metrics};

pub use logging::{handshake_span, lifecycle_span, mqtt_span, routing_span, trip_span};
