//! Mock implementations for testing
//!
//! Provides mock Transport, Notifier and BackendApi implementations so the
//! handshake, trip and pipeline logic can be exercised without a broker or
//! an HTTP backend.

use crate::backend::{
    BackendApi, BackendError, BackendOperation, SensorReading, TicketRecord, TripSummary,
};
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::transport::{mqtt::ConnectionState, mqtt::MqttError, InboundMessage, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDate;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch, Mutex};

pub type PublishedMessage = (String, Vec<u8>);

/// Mock transport for testing
#[derive(Debug, Default)]
pub struct MockTransport {
    pub published_messages: Arc<Mutex<Vec<PublishedMessage>>>,
    pub subscriptions: Arc<Mutex<Vec<String>>>,
    pub should_fail: bool,
    pub message_sender: Arc<Mutex<Option<mpsc::Sender<InboundMessage>>>>,
    connected: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub async fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.published_messages.lock().await.clone()
    }

    /// Published messages on one topic, payloads parsed as JSON
    pub async fn published_on(&self, topic: &str) -> Vec<serde_json::Value> {
        self.published_messages
            .lock()
            .await
            .iter()
            .filter(|(t, _)| t == topic)
            .filter_map(|(_, payload)| serde_json::from_slice(payload).ok())
            .collect()
    }

    pub async fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().await.clone()
    }

    pub async fn clear_history(&self) {
        self.published_messages.lock().await.clear();
    }

    /// Deliver a message as if the broker had pushed it.
    /// Returns false when no sender is registered or the receiver is gone.
    pub async fn inject(&self, topic: &str, payload: &[u8]) -> bool {
        let sender = self.message_sender.lock().await.clone();
        match sender {
            Some(sender) => sender
                .send(InboundMessage {
                    topic: topic.to_string(),
                    payload: Bytes::copy_from_slice(payload),
                    retained: false,
                })
                .await
                .is_ok(),
            None => false,
        }
    }

    fn failure(message: &str) -> MqttError {
        MqttError::Network(message.to_string())
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        if self.should_fail {
            return Err(Self::failure("Mock connection failure"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<(), Self::Error> {
        let mut subscriptions = self.subscriptions.lock().await;
        for topic in topics {
            if !subscriptions.contains(topic) {
                subscriptions.push(topic.clone());
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), Self::Error> {
        self.subscriptions
            .lock()
            .await
            .retain(|topic| !topics.contains(topic));
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        _retain: bool,
    ) -> Result<(), Self::Error> {
        if self.should_fail {
            return Err(Self::failure("Mock publish failure"));
        }

        self.published_messages
            .lock()
            .await
            .push((topic.to_string(), payload));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.should_fail && self.connected.load(Ordering::SeqCst)
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        if self.should_fail {
            Some(ConnectionState::Disconnected(
                "Mock disconnection".to_string(),
            ))
        } else if self.connected.load(Ordering::SeqCst) {
            Some(ConnectionState::Connected)
        } else {
            None
        }
    }

    fn is_permanently_disconnected(&self) -> bool {
        false
    }

    fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        if let Ok(mut message_sender) = self.message_sender.try_lock() {
            *message_sender = Some(sender);
        }
    }

    fn state_receiver(&self) -> Option<watch::Receiver<ConnectionState>> {
        None
    }
}

/// Notifier that keeps every notification for later assertions
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub async fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().await.clone()
    }

    pub async fn kinds(&self) -> Vec<NotificationKind> {
        self.notifications
            .lock()
            .await
            .iter()
            .map(|n| n.kind.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) {
        self.notifications.lock().await.push(notification);
    }
}

/// Backend double: serves a fixed ticket list and records every write
#[derive(Debug, Default)]
pub struct MockBackend {
    tickets: Vec<TicketRecord>,
    should_fail: bool,
    ticket_dates: Mutex<Vec<NaiveDate>>,
    summaries: Mutex<Vec<TripSummary>>,
    summary_attempts: Mutex<usize>,
    readings: Mutex<Vec<SensorReading>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tickets(tickets: Vec<TicketRecord>) -> Self {
        Self {
            tickets,
            ..Default::default()
        }
    }

    /// Every call answers HTTP 503
    pub fn failing() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub async fn ticket_dates(&self) -> Vec<NaiveDate> {
        self.ticket_dates.lock().await.clone()
    }

    /// Successfully submitted trip summaries
    pub async fn summaries(&self) -> Vec<TripSummary> {
        self.summaries.lock().await.clone()
    }

    /// Trip summary submissions, failed ones included
    pub async fn summary_attempts(&self) -> usize {
        *self.summary_attempts.lock().await
    }

    pub async fn sensor_readings(&self) -> Vec<SensorReading> {
        self.readings.lock().await.clone()
    }

    fn unavailable(&self, operation: BackendOperation) -> Result<(), BackendError> {
        if self.should_fail {
            Err(BackendError::Status {
                operation,
                status: 503,
                body: "service unavailable".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BackendApi for MockBackend {
    async fn fetch_tickets(&self, date: NaiveDate) -> Result<Vec<TicketRecord>, BackendError> {
        self.ticket_dates.lock().await.push(date);
        self.unavailable(BackendOperation::TicketPoll)?;
        Ok(self.tickets.clone())
    }

    async fn submit_trip_summary(&self, summary: &TripSummary) -> Result<(), BackendError> {
        *self.summary_attempts.lock().await += 1;
        self.unavailable(BackendOperation::TripSummary)?;
        self.summaries.lock().await.push(summary.clone());
        Ok(())
    }

    async fn post_sensor_reading(&self, reading: &SensorReading) -> Result<(), BackendError> {
        self.unavailable(BackendOperation::SensorReading)?;
        self.readings.lock().await.push(reading.clone());
        Ok(())
    }
}
