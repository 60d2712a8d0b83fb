//! Thread-safe metrics collection system
//!
//! Provides atomic counters and mutex-protected collections for tracking
//! operational statistics across the MQTT link, message routing, vehicle
//! reconciliation, live-location sessions, trips and backend polling.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Bounded history for latency percentiles
const MAX_LATENCY_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // MQTT link
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    reconnect_attempts: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,
    last_message_at: AtomicU64,
    connection_start_time: AtomicU64,

    // Routing
    messages_routed: Mutex<HashMap<String, u64>>,
    messages_dropped: AtomicU64,

    // Fleet
    vehicle_updates: AtomicU64,
    vehicles_tracked: AtomicU64,
    store_write_failures: AtomicU64,

    // Live-location handshake
    shares_requested: AtomicU64,
    shares_acknowledged: AtomicU64,
    shares_ended: Mutex<HashMap<String, u64>>,
    inactivity_prompts: AtomicU64,
    pickup_acknowledgments: AtomicU64,

    // Trips
    trips_started: AtomicU64,
    trips_completed: AtomicU64,
    trip_submit_failures: AtomicU64,
    sensor_readings_posted: AtomicU64,
    sensor_reading_failures: AtomicU64,

    // Backend poller
    polls_completed: AtomicU64,
    poll_failures: AtomicU64,
    poll_latencies: Mutex<Vec<u64>>,

    // Lifecycle
    service_state: Mutex<String>,
    uptime_start: AtomicU64,
    state_transitions: AtomicU64,
    health_status: AtomicBool,
    last_health_check: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let now = current_timestamp();

        Self {
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            last_message_at: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            messages_routed: Mutex::new(HashMap::new()),
            messages_dropped: AtomicU64::new(0),
            vehicle_updates: AtomicU64::new(0),
            vehicles_tracked: AtomicU64::new(0),
            store_write_failures: AtomicU64::new(0),
            shares_requested: AtomicU64::new(0),
            shares_acknowledged: AtomicU64::new(0),
            shares_ended: Mutex::new(HashMap::new()),
            inactivity_prompts: AtomicU64::new(0),
            pickup_acknowledgments: AtomicU64::new(0),
            trips_started: AtomicU64::new(0),
            trips_completed: AtomicU64::new(0),
            trip_submit_failures: AtomicU64::new(0),
            sensor_readings_posted: AtomicU64::new(0),
            sensor_reading_failures: AtomicU64::new(0),
            polls_completed: AtomicU64::new(0),
            poll_failures: AtomicU64::new(0),
            poll_latencies: Mutex::new(Vec::new()),
            service_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(now),
            state_transitions: AtomicU64::new(0),
            health_status: AtomicBool::new(true),
            last_health_check: AtomicU64::new(now),
        }
    }

    // MQTT metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.last_message_at
            .store(current_timestamp(), Ordering::Relaxed);
    }

    // Routing metrics
    pub fn message_routed(&self, channel: &str) {
        if let Ok(mut routed) = self.messages_routed.lock() {
            *routed.entry(channel.to_string()).or_insert(0) += 1;
        }
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Fleet metrics
    pub fn vehicle_updated(&self, vehicles_tracked: usize) {
        self.vehicle_updates.fetch_add(1, Ordering::Relaxed);
        self.vehicles_tracked
            .store(vehicles_tracked as u64, Ordering::Relaxed);
    }

    pub fn store_write_failed(&self) {
        self.store_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Handshake metrics
    pub fn share_requested(&self) {
        self.shares_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn share_acknowledged(&self) {
        self.shares_acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn share_ended(&self, reason: &str) {
        if let Ok(mut ended) = self.shares_ended.lock() {
            *ended.entry(reason.to_string()).or_insert(0) += 1;
        }
    }

    pub fn inactivity_prompted(&self) {
        self.inactivity_prompts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pickup_acknowledged(&self) {
        self.pickup_acknowledgments.fetch_add(1, Ordering::Relaxed);
    }

    // Trip metrics
    pub fn trip_started(&self) {
        self.trips_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn trip_completed(&self) {
        self.trips_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn trip_submit_failed(&self) {
        self.trip_submit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sensor_reading_posted(&self) {
        self.sensor_readings_posted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sensor_reading_failed(&self) {
        self.sensor_reading_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Poller metrics
    pub fn poll_completed(&self, duration: Duration) {
        self.polls_completed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut latencies) = self.poll_latencies.lock() {
            latencies.push(duration.as_millis() as u64);
            if latencies.len() > MAX_LATENCY_SAMPLES {
                latencies.remove(0);
            }
        }
    }

    pub fn poll_failed(&self) {
        self.poll_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle metrics
    pub fn set_service_state(&self, state: &str) {
        if let Ok(mut current_state) = self.service_state.lock() {
            if *current_state != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current_state = state.to_string();
            }
        }
    }

    pub fn update_health_status(&self, healthy: bool) {
        self.health_status.store(healthy, Ordering::Relaxed);
        self.last_health_check
            .store(current_timestamp(), Ordering::Relaxed);
    }

    /// Seconds since the last inbound MQTT message, if any arrived
    pub fn seconds_since_last_message(&self) -> Option<u64> {
        match self.last_message_at.load(Ordering::Relaxed) {
            0 => None,
            at => Some(current_timestamp().saturating_sub(at)),
        }
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        let counters = [
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.reconnect_attempts,
            &self.messages_published,
            &self.publish_failures,
            &self.messages_received,
            &self.last_message_at,
            &self.connection_start_time,
            &self.messages_dropped,
            &self.vehicle_updates,
            &self.vehicles_tracked,
            &self.store_write_failures,
            &self.shares_requested,
            &self.shares_acknowledged,
            &self.inactivity_prompts,
            &self.pickup_acknowledgments,
            &self.trips_started,
            &self.trips_completed,
            &self.trip_submit_failures,
            &self.sensor_readings_posted,
            &self.sensor_reading_failures,
            &self.polls_completed,
            &self.poll_failures,
            &self.state_transitions,
        ];
        for counter in counters {
            counter.store(0, Ordering::Relaxed);
        }

        let now = current_timestamp();
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.uptime_start.store(now, Ordering::Relaxed);
        self.health_status.store(true, Ordering::Relaxed);
        self.last_health_check.store(now, Ordering::Relaxed);

        if let Ok(mut routed) = self.messages_routed.lock() {
            routed.clear();
        }
        if let Ok(mut ended) = self.shares_ended.lock() {
            ended.clear();
        }
        if let Ok(mut latencies) = self.poll_latencies.lock() {
            latencies.clear();
        }
        if let Ok(mut state) = self.service_state.lock() {
            *state = "initializing".to_string();
        }
    }

    /// Calculate poll latency statistics (pure function)
    fn calculate_poll_latency_statistics(&self) -> (f64, f64, f64) {
        let Ok(latencies) = self.poll_latencies.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if latencies.is_empty() {
            return (0.0, 0.0, 0.0);
        }

        let mut sorted = latencies.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (avg, percentile(&sorted, 50.0), percentile(&sorted, 95.0))
    }

    /// Calculate connection duration (pure function)
    fn calculate_connection_duration(&self, now: u64) -> u64 {
        if !self.mqtt_connected.load(Ordering::Relaxed) {
            return 0;
        }
        match self.connection_start_time.load(Ordering::Relaxed) {
            0 => 0,
            start_time => now.saturating_sub(start_time),
        }
    }

    fn snapshot_map(map: &Mutex<HashMap<String, u64>>) -> HashMap<String, u64> {
        map.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_poll_ms, p50, p95) = self.calculate_poll_latency_statistics();

        MetricsSnapshot {
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                last_message_at: self.last_message_at.load(Ordering::Relaxed),
                connection_duration_seconds: self.calculate_connection_duration(now),
            },
            routing: RoutingMetrics {
                routed_by_channel: Self::snapshot_map(&self.messages_routed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
            },
            fleet: FleetMetrics {
                vehicle_updates: self.vehicle_updates.load(Ordering::Relaxed),
                vehicles_tracked: self.vehicles_tracked.load(Ordering::Relaxed),
                store_write_failures: self.store_write_failures.load(Ordering::Relaxed),
            },
            handshake: HandshakeMetrics {
                shares_requested: self.shares_requested.load(Ordering::Relaxed),
                shares_acknowledged: self.shares_acknowledged.load(Ordering::Relaxed),
                shares_ended: Self::snapshot_map(&self.shares_ended),
                inactivity_prompts: self.inactivity_prompts.load(Ordering::Relaxed),
                pickup_acknowledgments: self.pickup_acknowledgments.load(Ordering::Relaxed),
            },
            trips: TripMetrics {
                trips_started: self.trips_started.load(Ordering::Relaxed),
                trips_completed: self.trips_completed.load(Ordering::Relaxed),
                submit_failures: self.trip_submit_failures.load(Ordering::Relaxed),
                sensor_readings_posted: self.sensor_readings_posted.load(Ordering::Relaxed),
                sensor_reading_failures: self.sensor_reading_failures.load(Ordering::Relaxed),
            },
            poller: PollerMetrics {
                polls_completed: self.polls_completed.load(Ordering::Relaxed),
                poll_failures: self.poll_failures.load(Ordering::Relaxed),
                avg_poll_time_ms: avg_poll_ms,
                poll_time_p50_ms: p50,
                poll_time_p95_ms: p95,
            },
            lifecycle: LifecycleMetrics {
                current_state: self
                    .service_state
                    .lock()
                    .map(|s| s.clone())
                    .unwrap_or_else(|_| "unknown".to_string()),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
                healthy: self.health_status.load(Ordering::Relaxed),
                last_health_check: self.last_health_check.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub mqtt: MqttMetrics,
    pub routing: RoutingMetrics,
    pub fleet: FleetMetrics,
    pub handshake: HandshakeMetrics,
    pub trips: TripMetrics,
    pub poller: PollerMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub reconnect_attempts: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
    pub last_message_at: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct RoutingMetrics {
    pub routed_by_channel: HashMap<String, u64>,
    pub dropped: u64,
}

#[derive(Debug, Serialize)]
pub struct FleetMetrics {
    pub vehicle_updates: u64,
    pub vehicles_tracked: u64,
    pub store_write_failures: u64,
}

#[derive(Debug, Serialize)]
pub struct HandshakeMetrics {
    pub shares_requested: u64,
    pub shares_acknowledged: u64,
    pub shares_ended: HashMap<String, u64>,
    pub inactivity_prompts: u64,
    pub pickup_acknowledgments: u64,
}

#[derive(Debug, Serialize)]
pub struct TripMetrics {
    pub trips_started: u64,
    pub trips_completed: u64,
    pub submit_failures: u64,
    pub sensor_readings_posted: u64,
    pub sensor_reading_failures: u64,
}

#[derive(Debug, Serialize)]
pub struct PollerMetrics {
    pub polls_completed: u64,
    pub poll_failures: u64,
    pub avg_poll_time_ms: f64,
    pub poll_time_p50_ms: f64,
    pub poll_time_p95_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
    pub healthy: bool,
    pub last_health_check: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;
        lower_value + (upper_value - lower_value) * index.fract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_mqtt_metrics() {
        let collector = MetricsCollector::new();

        collector.mqtt_connection_attempt();
        collector.mqtt_connection_established();
        collector.mqtt_message_published();
        collector.mqtt_message_received();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.mqtt.connection_attempts, 1);
        assert_eq!(metrics.mqtt.connections_established, 1);
        assert_eq!(metrics.mqtt.messages_published, 1);
        assert!(metrics.mqtt.connected);
        assert_eq!(collector.seconds_since_last_message(), Some(0));

        collector.mqtt_connection_lost();
        assert!(!collector.get_metrics().mqtt.connected);
    }

    #[test]
    fn test_routing_and_fleet_metrics() {
        let collector = MetricsCollector::new();

        collector.message_routed("telemetry");
        collector.message_routed("telemetry");
        collector.message_routed("fare");
        collector.message_dropped();
        collector.vehicle_updated(4);

        let metrics = collector.get_metrics();
        assert_eq!(metrics.routing.routed_by_channel.get("telemetry"), Some(&2));
        assert_eq!(metrics.routing.routed_by_channel.get("fare"), Some(&1));
        assert_eq!(metrics.routing.dropped, 1);
        assert_eq!(metrics.fleet.vehicle_updates, 1);
        assert_eq!(metrics.fleet.vehicles_tracked, 4);
    }

    #[test]
    fn test_handshake_and_trip_metrics() {
        let collector = MetricsCollector::new();

        collector.share_requested();
        collector.share_acknowledged();
        collector.share_ended("expired");
        collector.share_ended("expired");
        collector.trip_started();
        collector.trip_completed();
        collector.trip_submit_failed();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.handshake.shares_requested, 1);
        assert_eq!(metrics.handshake.shares_ended.get("expired"), Some(&2));
        assert_eq!(metrics.trips.trips_started, 1);
        assert_eq!(metrics.trips.submit_failures, 1);
    }

    #[test]
    fn test_poll_latency_statistics() {
        let collector = MetricsCollector::new();

        for ms in 1..=10 {
            collector.poll_completed(Duration::from_millis(ms * 100));
        }

        let metrics = collector.get_metrics();
        assert_eq!(metrics.poller.polls_completed, 10);
        assert!((metrics.poller.avg_poll_time_ms - 550.0).abs() < 0.1);
        assert!((metrics.poller.poll_time_p50_ms - 550.0).abs() < 0.1);
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let collector_clone = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..100 {
                        collector_clone.mqtt_message_received();
                        collector_clone.message_routed("telemetry");
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = collector.get_metrics();
        assert_eq!(metrics.mqtt.messages_received, 1000);
        assert_eq!(metrics.routing.routed_by_channel.get("telemetry"), Some(&1000));
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        assert!((percentile(&data, 50.0) - 5.5).abs() < 0.1);
        assert!((percentile(&data, 95.0) - 9.5).abs() < 0.1);
        assert!((percentile(&data, 0.0) - 1.0).abs() < 0.1);
        assert!((percentile(&data, 100.0) - 10.0).abs() < 0.1);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_service_state_transitions() {
        let collector = MetricsCollector::new();

        collector.set_service_state("running");
        collector.set_service_state("running");
        collector.set_service_state("stopping");

        let metrics = collector.get_metrics();
        assert_eq!(metrics.lifecycle.current_state, "stopping");
        assert_eq!(metrics.lifecycle.state_transitions, 2);
    }

    #[test]
    fn test_reset_functionality() {
        let collector = MetricsCollector::new();

        collector.mqtt_connection_established();
        collector.message_routed("fare");
        collector.trip_started();

        collector.reset();

        let metrics = collector.get_metrics();
        assert!(!metrics.mqtt.connected);
        assert!(metrics.routing.routed_by_channel.is_empty());
        assert_eq!(metrics.trips.trips_started, 0);
        assert_eq!(metrics.lifecycle.current_state, "initializing");
        assert_eq!(collector.seconds_since_last_message(), None);
    }
}
