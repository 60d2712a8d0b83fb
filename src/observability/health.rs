//! Health check HTTP server
//!
//! Exposes device status for operators and for process supervisors on the
//! vehicle gateway.

use crate::observability::metrics::metrics;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use warp::Filter;
use warp::http::StatusCode;

/// Broker silence after which the message-flow check reports stale
const MESSAGE_STALENESS_THRESHOLD_SECONDS: u64 = 300;

/// HTTP health check server
pub struct HealthServer {
    device_id: String,
    port: u16,
    mqtt_connected: AtomicBool,
    connection_state: RwLock<String>,
    additional_checks: RwLock<HashMap<String, HealthCheck>>,
}

impl HealthServer {
    /// Create new health server
    pub fn new(device_id: String, port: u16) -> Self {
        Self {
            device_id,
            port,
            mqtt_connected: AtomicBool::new(false),
            connection_state: RwLock::new("connecting".to_string()),
            additional_checks: RwLock::new(HashMap::new()),
        }
    }

    /// Update MQTT connection status
    pub async fn set_connection_state(&self, connected: bool, label: &str) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
        *self.connection_state.write().await = label.to_string();
    }

    /// Add or replace a named health check
    pub async fn add_health_check(&self, name: String, check: HealthCheck) {
        let mut checks = self.additional_checks.write().await;
        checks.insert(name, check);
    }

    /// Remove health check
    pub async fn remove_health_check(&self, name: &str) {
        let mut checks = self.additional_checks.write().await;
        checks.remove(name);
    }

    /// Build the warp filter tree
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let health_server = self.clone();
        let ready_server = self;

        // GET /health - overall status with detailed checks
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = health_server.clone();
                async move {
                    let status = server.get_health_status().await;
                    let status_code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(
                        warp::reply::json(&status),
                        status_code,
                    ))
                }
            });

        // GET /metrics - complete metrics export
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().get_metrics()));

        // GET /ready - broker link is up
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || {
                let ready = ready_server.mqtt_connected.load(Ordering::Relaxed);
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let status_code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                warp::reply::with_status(warp::reply::json(&response), status_code)
            });

        // GET /live - process is alive
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        // GET / - endpoint listing
        let root_route = warp::path::end().and(warp::get()).map(|| {
            let endpoints: HashMap<&str, &str> = HashMap::from([
                ("/health", "Overall health status with detailed checks"),
                ("/metrics", "Link, fleet, trip and poller statistics"),
                ("/ready", "Readiness probe: broker connection established"),
                ("/live", "Liveness probe"),
            ]);
            warp::reply::json(&ApiDocumentationResponse { endpoints })
        });

        health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(root_route)
    }

    /// Start the HTTP health server
    pub async fn start(self: Arc<Self>) {
        let port = self.port;
        tracing::info!("Starting health server on port {}", port);
        warp::serve(self.routes()).run(([0, 0, 0, 0], port)).await;
    }

    async fn get_health_status(&self) -> HealthStatus {
        let mut checks = HashMap::new();
        checks.insert("mqtt".to_string(), self.check_mqtt_health().await);
        checks.insert("message_flow".to_string(), Self::check_message_flow());

        for (name, check) in self.additional_checks.read().await.iter() {
            checks.insert(name.clone(), check.clone());
        }

        let overall_healthy = checks.values().all(|check| check.status == "healthy");

        HealthStatus {
            status: if overall_healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: current_timestamp(),
            device_id: self.device_id.clone(),
            uptime_seconds: metrics().get_metrics().lifecycle.uptime_seconds,
            checks,
        }
    }

    async fn check_mqtt_health(&self) -> HealthCheck {
        let state = self.connection_state.read().await.clone();

        if self.mqtt_connected.load(Ordering::Relaxed) {
            HealthCheck::healthy("MQTT connection established")
        } else {
            HealthCheck {
                status: "unhealthy".to_string(),
                message: Some(format!("MQTT connection {state}")),
                last_check: current_timestamp(),
            }
        }
    }

    fn check_message_flow() -> HealthCheck {
        match metrics().seconds_since_last_message() {
            None => HealthCheck::healthy("No messages received yet"),
            Some(age) if age > MESSAGE_STALENESS_THRESHOLD_SECONDS => HealthCheck {
                status: "stale".to_string(),
                message: Some(format!("No broker messages for {age} seconds")),
                last_check: current_timestamp(),
            },
            Some(_) => HealthCheck::healthy("Recent broker messages"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    pub fn healthy(message: &str) -> Self {
        Self {
            status: "healthy".to_string(),
            message: Some(message.to_string()),
            last_check: current_timestamp(),
        }
    }

    pub fn unhealthy(message: &str) -> Self {
        Self {
            status: "unhealthy".to_string(),
            message: Some(message.to_string()),
            last_check: current_timestamp(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    device_id: String,
    uptime_seconds: u64,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct ApiDocumentationResponse {
    endpoints: HashMap<&'static str, &'static str>,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
