//! Impure I/O operations for the MQTT client
//!
//! This module handles network communication, the reconnection supervisor
//! and integration with the rumqttc client. Decisions are delegated to the
//! pure [`HealthMonitor`] and [`MessageHandler`].

use super::connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
use super::health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageForwarder, MessageHandler};
use crate::config::MqttSection;
use crate::observability::metrics::metrics;
use crate::transport::{InboundMessage, Transport};
use async_trait::async_trait;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the rumqttc request queue
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// How long `connect()` waits for the first ConnAck
const CONNACK_TIMEOUT: Duration = Duration::from_secs(30);

type SharedInstant = Arc<std::sync::Mutex<Option<Instant>>>;

/// MQTT transport client for the fleet broker
pub struct MqttClient {
    client_label: String,
    config: MqttSection,
    client: Arc<Mutex<AsyncClient>>,
    event_loop: Option<Arc<Mutex<EventLoop>>>,
    event_loop_handle: Option<JoinHandle<()>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    state_tx: Option<watch::Sender<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    reconnect_config: ReconnectConfig,
    subscribed_topics: Arc<Mutex<BTreeSet<String>>>,
    message_forwarder: Arc<Mutex<MessageForwarder>>,
    connect_time: Option<Instant>,
    last_message_time: SharedInstant,
    reconnect_count: Arc<AtomicU32>,
}

impl MqttClient {
    pub async fn new(client_label: &str, config: MqttSection) -> Result<Self, MqttError> {
        let (client, event_loop) = Self::create_connection(client_label, &config)?;

        Ok(MqttClient {
            client_label: client_label.to_string(),
            config,
            client: Arc::new(Mutex::new(client)),
            event_loop: Some(Arc::new(Mutex::new(event_loop))),
            event_loop_handle: None,
            state_rx: None,
            state_tx: None,
            shutdown_tx: None,
            reconnect_config: ReconnectConfig::default(),
            subscribed_topics: Arc::new(Mutex::new(BTreeSet::new())),
            message_forwarder: Arc::new(Mutex::new(MessageForwarder::new())),
            connect_time: None,
            last_message_time: Arc::new(std::sync::Mutex::new(None)),
            reconnect_count: Arc::new(AtomicU32::new(0)),
        })
    }

    /// Override the default reconnection policy
    pub fn with_reconnect_config(mut self, reconnect_config: ReconnectConfig) -> Self {
        self.reconnect_config = reconnect_config;
        self
    }

    /// Set the sender that receives inbound publishes
    pub async fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        let mut forwarder = self.message_forwarder.lock().await;
        forwarder.set_message_sender(sender);
    }

    /// Create a new MQTT connection and event loop
    /// Used for the initial connection and every reconnection attempt
    fn create_connection(
        client_label: &str,
        config: &MqttSection,
    ) -> Result<(AsyncClient, EventLoop), MqttError> {
        let mqtt_options = configure_mqtt_options(client_label, config)?;
        Ok(AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY))
    }

    /// Create connection state and shutdown channels
    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (
            watch::Sender<ConnectionState>,
            watch::Receiver<ConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        let state_channels = watch::channel(ConnectionState::Connecting);
        let shutdown_channels = watch::channel(false);
        (state_channels, shutdown_channels)
    }

    /// Wait for connection confirmation (ConnAck) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::Network("State channel closed".to_string()));
                }
                match *state_rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(ref reason) => {
                        return Err(MqttError::Network(reason.clone()));
                    }
                    ConnectionState::PermanentlyDisconnected(ref reason) => {
                        return Err(MqttError::AuthenticationFailed(reason.clone()));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => continue,
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(MqttError::Network(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Connect to the broker and start the reconnection supervisor
    ///
    /// Returns once the first ConnAck arrives. On failure the supervisor keeps
    /// retrying in the background unless the broker rejected the credentials.
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        let event_loop = self
            .event_loop
            .take()
            .ok_or_else(|| MqttError::Network("Event loop already started".to_string()))?;

        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) =
            Self::setup_connection_channels();
        self.state_rx = Some(state_rx.clone());
        self.state_tx = Some(state_tx.clone());
        self.shutdown_tx = Some(shutdown_tx);

        metrics().mqtt_connection_attempt();

        let supervisor = ReconnectionSupervisor {
            client_label: self.client_label.clone(),
            config: self.config.clone(),
            shared_client: self.client.clone(),
            event_loop,
            state_tx,
            shutdown_rx,
            reconnect_config: self.reconnect_config.clone(),
            subscribed_topics: self.subscribed_topics.clone(),
            message_forwarder: self.message_forwarder.clone(),
            last_message_time: self.last_message_time.clone(),
            reconnect_count: self.reconnect_count.clone(),
            reconnect_attempts: 0,
        };
        self.event_loop_handle = Some(tokio::spawn(supervisor.run()));

        Self::wait_for_connection_confirmation(state_rx, CONNACK_TIMEOUT).await?;

        self.connect_time = Some(Instant::now());
        Ok(())
    }

    /// Disconnect from the broker and stop the supervisor
    pub async fn disconnect(&mut self) -> Result<(), MqttError> {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
            info!("Sent shutdown signal to reconnection supervisor");
        }

        {
            let client = self.client.lock().await;
            client
                .disconnect()
                .await
                .map_err(|e| MqttError::ConnectionFailed(Box::new(e)))?;
        }

        if let Some(state_tx) = &self.state_tx {
            let _ = state_tx.send(ConnectionState::Disconnected(
                "Client disconnected".to_string(),
            ));
        }
        metrics().mqtt_connection_lost();

        if let Some(handle) = self.event_loop_handle.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => info!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!("Event loop task ended with error: {}", e);
                }
                Err(_) => warn!("Event loop task didn't shut down gracefully, forcing abort"),
                _ => {}
            }
        }

        info!("MQTT client disconnected");
        Ok(())
    }

    /// Get current connection state
    /// Returns None if connection hasn't been attempted yet
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    /// Check if the connection is permanently disconnected
    pub fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            Some(ConnectionState::PermanentlyDisconnected(_))
        )
    }

    /// Get health metrics for the connection
    pub fn get_health_metrics(&self) -> HealthMetrics {
        let last_message_time = self
            .last_message_time
            .lock()
            .ok()
            .and_then(|guard| *guard);

        HealthMonitor::calculate_health_metrics(
            self.connect_time,
            last_message_time,
            self.reconnect_count.load(Ordering::Relaxed),
        )
    }

    /// Topic filters currently in the subscription set
    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscribed_topics.lock().await.iter().cloned().collect()
    }

    /// Check connection state before operations
    fn check_connection_state(&self) -> Result<(), MqttError> {
        let Some(state_rx) = self.state_rx.as_ref() else {
            return Err(MqttError::NotConnected {
                state: ConnectionState::Disconnected("never connected".to_string()),
            });
        };

        let current_state = state_rx.borrow().clone();
        if !HealthMonitor::can_publish(&current_state) {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }

        Ok(())
    }

    /// Publish a payload at QoS 1
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), MqttError> {
        if let Err(e) = self.check_connection_state() {
            metrics().mqtt_publish_failed();
            return Err(e);
        }

        let client = self.client.lock().await;
        let result = client
            .publish(topic, MessageHandler::determine_qos_level(), retain, payload)
            .await;

        match result {
            Ok(()) => {
                metrics().mqtt_message_published();
                debug!(target: "mqtt_transport", "Published to {} (retain={})", topic, retain);
                Ok(())
            }
            Err(e) => {
                metrics().mqtt_publish_failed();
                Err(MqttError::PublishFailed(Box::new(e)))
            }
        }
    }

    /// Add filters to the subscription set, issuing them now if connected
    pub async fn subscribe(&self, topics: &[String]) -> Result<(), MqttError> {
        let new_topics: Vec<String> = {
            let mut subscribed = self.subscribed_topics.lock().await;
            topics
                .iter()
                .filter(|topic| subscribed.insert((*topic).clone()))
                .cloned()
                .collect()
        };

        if new_topics.is_empty() {
            return Ok(());
        }

        let connected = self
            .connection_state()
            .is_some_and(|state| HealthMonitor::can_subscribe(&state));
        if !connected {
            info!(
                "Queued {} subscription(s) until the broker acknowledges a connection",
                new_topics.len()
            );
            return Ok(());
        }

        let client = self.client.lock().await;
        for topic in &new_topics {
            client
                .subscribe(topic.as_str(), MessageHandler::determine_qos_level())
                .await
                .map_err(|e| {
                    MqttError::SubscriptionFailed(
                        format!("Failed to subscribe to {topic}: {e}").into(),
                    )
                })?;
            info!("Subscribed to: {}", topic);
        }

        Ok(())
    }

    /// Remove filters from the subscription set
    pub async fn unsubscribe(&self, topics: &[String]) -> Result<(), MqttError> {
        let removed: Vec<String> = {
            let mut subscribed = self.subscribed_topics.lock().await;
            topics
                .iter()
                .filter(|topic| subscribed.remove(topic.as_str()))
                .cloned()
                .collect()
        };

        if removed.is_empty() || self.check_connection_state().is_err() {
            return Ok(());
        }

        let client = self.client.lock().await;
        for topic in &removed {
            client.unsubscribe(topic.as_str()).await.map_err(|e| {
                MqttError::SubscriptionFailed(
                    format!("Failed to unsubscribe from {topic}: {e}").into(),
                )
            })?;
            info!("Unsubscribed from: {}", topic);
        }

        Ok(())
    }
}

/// Background task that drives the rumqttc event loop and reconnects
struct ReconnectionSupervisor {
    client_label: String,
    config: MqttSection,
    shared_client: Arc<Mutex<AsyncClient>>,
    event_loop: Arc<Mutex<EventLoop>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    reconnect_config: ReconnectConfig,
    subscribed_topics: Arc<Mutex<BTreeSet<String>>>,
    message_forwarder: Arc<Mutex<MessageForwarder>>,
    last_message_time: SharedInstant,
    reconnect_count: Arc<AtomicU32>,
    reconnect_attempts: u32,
}

impl ReconnectionSupervisor {
    async fn run(mut self) {
        info!(
            "Starting MQTT event loop with reconnection supervisor for: {}",
            self.client_label
        );

        loop {
            let event_loop = self.event_loop.clone();
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping reconnection supervisor");
                        break;
                    }
                }

                event_result = async move {
                    let mut event_loop_guard = event_loop.lock().await;
                    event_loop_guard.poll().await
                } => {
                    let keep_running = match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            self.process_event_route(route).await
                        }
                        Err(e) => self.handle_event_loop_error(e).await,
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }

        info!("MQTT event loop stopped for: {}", self.client_label);
    }

    fn transition(&self, event: ConnectionEvent) {
        let current = self.state_tx.borrow().clone();
        let next = HealthMonitor::determine_next_state(&current, event);
        HealthMonitor::log_state_transition(&current, &next);
        let _ = self.state_tx.send(next);
    }

    /// Returns true to continue the loop, false to stop
    async fn handle_event_loop_error(&mut self, error: rumqttc::v5::ConnectionError) -> bool {
        let event = HealthMonitor::classify_connection_error(&error.to_string());
        let permanent = matches!(event, ConnectionEvent::AuthenticationRejected(_));

        metrics().mqtt_connection_failed();
        self.transition(event);

        if permanent {
            return false;
        }

        self.attempt_reconnection().await
    }

    /// Returns true to continue the loop, false to stop
    async fn process_event_route(&mut self, route: EventRoute) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                self.transition(ConnectionEvent::ConnAckReceived);
                metrics().mqtt_connection_established();
                self.reconnect_attempts = 0;
                self.resubscribe_to_topics().await;
                true
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                self.handle_message_received(InboundMessage {
                    topic,
                    payload,
                    retained: retain,
                })
                .await;
                true
            }
            EventRoute::Disconnected => {
                metrics().mqtt_connection_lost();
                self.transition(ConnectionEvent::DisconnectedByBroker);
                self.attempt_reconnection().await
            }
            EventRoute::SubscriptionConfirmed { packet_id, filters } => {
                debug!(
                    target: "mqtt_transport",
                    "Subscription {} confirmed for {} filter(s)",
                    packet_id,
                    filters
                );
                true
            }
            EventRoute::InfrastructureEvent(event_str) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    async fn handle_message_received(&self, message: InboundMessage) {
        debug!(target: "mqtt_transport", "Received MQTT message on topic: {}", message.topic);

        if let Ok(mut last) = self.last_message_time.lock() {
            *last = Some(Instant::now());
        }
        metrics().mqtt_message_received();

        if !MessageHandler::should_process_message(&message.topic, &message.payload) {
            return;
        }

        let forwarder = self.message_forwarder.lock().await;
        if let Err(e) = forwarder.forward_message(message).await {
            error!("Failed to forward message: {}", e);
        }
    }

    /// Re-issue the whole subscription set after a ConnAck
    async fn resubscribe_to_topics(&self) {
        let topics: Vec<String> = self.subscribed_topics.lock().await.iter().cloned().collect();
        let client = self.shared_client.lock().await;
        for topic in &topics {
            if let Err(e) = client
                .subscribe(topic.as_str(), MessageHandler::determine_qos_level())
                .await
            {
                error!("Failed to re-subscribe to {}: {}", topic, e);
            } else {
                debug!(target: "mqtt_transport", "Re-subscribed to: {}", topic);
            }
        }
    }

    /// Perform interruptible sleep with shutdown monitoring
    /// Returns true if sleep completed, false if shutdown requested
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Swap in a fresh client and event loop
    async fn apply_new_connection(&mut self) {
        match MqttClient::create_connection(&self.client_label, &self.config) {
            Ok((new_client, new_event_loop)) => {
                self.event_loop = Arc::new(Mutex::new(new_event_loop));
                let mut client_guard = self.shared_client.lock().await;
                *client_guard = new_client;
                debug!(target: "mqtt_transport", "Updated shared client for reconnection");
            }
            Err(e) => {
                error!("Failed to create new connection: {}", e);
            }
        }
    }

    /// Returns true to continue the loop, false to stop
    async fn attempt_reconnection(&mut self) -> bool {
        let decision = HealthMonitor::should_attempt_reconnection(
            self.reconnect_attempts,
            &self.reconnect_config,
            *self.shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.reconnect_attempts = attempt;
                self.reconnect_count.fetch_add(1, Ordering::Relaxed);
                metrics().mqtt_reconnect_attempt();
                self.transition(ConnectionEvent::ReconnectionStarted(attempt));

                info!("Attempting reconnection {} after {}ms delay", attempt, delay_ms);

                if !Self::interruptible_sleep(self.shutdown_rx.clone(), delay_ms).await {
                    return false;
                }

                if *self.shutdown_rx.borrow() {
                    info!("Shutdown signal received, aborting reconnection");
                    return false;
                }

                metrics().mqtt_connection_attempt();
                self.apply_new_connection().await;
                true
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!(
                    "Max reconnection attempts ({}) exceeded",
                    self.reconnect_attempts
                );
                self.transition(ConnectionEvent::PermanentFailure(reason));
                false
            }
        }
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        MqttClient::disconnect(self).await
    }

    async fn subscribe(&self, topics: &[String]) -> Result<(), Self::Error> {
        MqttClient::subscribe(self, topics).await
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), Self::Error> {
        MqttClient::unsubscribe(self, topics).await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), Self::Error> {
        MqttClient::publish(self, topic, payload, retain).await
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        MqttClient::connection_state(self)
    }

    fn is_permanently_disconnected(&self) -> bool {
        MqttClient::is_permanently_disconnected(self)
    }

    fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        let message_forwarder = self.message_forwarder.clone();
        tokio::spawn(async move {
            let mut forwarder = message_forwarder.lock().await;
            forwarder.set_message_sender(sender);
        });
    }

    fn state_receiver(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.state_rx.clone()
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        // No async in Drop; callers wanting a clean DISCONNECT use disconnect()
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}
