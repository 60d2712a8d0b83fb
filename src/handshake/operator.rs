//! Operator side of the handshake
//!
//! [`RequestBoard`] is the pure per-vehicle list of waiting passengers;
//! [`OperatorDesk`] wraps it with the transport so an acknowledgment is only
//! recorded once it has actually been published.

use crate::error::{BusLinkError, BusLinkResult};
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::observability::metrics::metrics;
use crate::protocol::{AckPayload, GeoPoint, PassengerUpdate, TopicBuilder, VehicleId};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Waiting,
    /// Selected by the operator, acknowledgment not yet sent
    AwaitingAcknowledgement,
    Acknowledged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestItem {
    pub passenger_id: String,
    pub minutes: u32,
    pub requested_at: DateTime<Utc>,
    pub status: RequestStatus,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PassengerLocation {
    pub point: GeoPoint,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq)]
pub enum BoardError {
    #[error("No request from passenger {0}")]
    UnknownPassenger(String),
    #[error("Request from passenger {0} is already acknowledged")]
    AlreadyAcknowledged(String),
}

/// Pickup requests for one vehicle, in arrival order
#[derive(Debug, Clone)]
pub struct RequestBoard {
    vehicle: VehicleId,
    items: Vec<RequestItem>,
    locations: HashMap<String, PassengerLocation>,
}

impl RequestBoard {
    pub fn new(vehicle: VehicleId) -> Self {
        Self {
            vehicle,
            items: Vec::new(),
            locations: HashMap::new(),
        }
    }

    pub fn vehicle(&self) -> &VehicleId {
        &self.vehicle
    }

    /// Record a share request. Returns true when it is new to the board
    /// (first request, or a fresh one after the previous was acknowledged).
    pub fn record_request(
        &mut self,
        passenger_id: &str,
        minutes: u32,
        requested_at: DateTime<Utc>,
    ) -> bool {
        match self.items.iter_mut().find(|i| i.passenger_id == passenger_id) {
            Some(item) if item.status == RequestStatus::Acknowledged => {
                if requested_at <= item.requested_at {
                    return false;
                }
                item.minutes = minutes;
                item.requested_at = requested_at;
                item.status = RequestStatus::Waiting;
                item.acknowledged_at = None;
                true
            }
            Some(item) => {
                item.minutes = minutes;
                false
            }
            None => {
                self.items.push(RequestItem {
                    passenger_id: passenger_id.to_string(),
                    minutes,
                    requested_at,
                    status: RequestStatus::Waiting,
                    acknowledged_at: None,
                });
                true
            }
        }
    }

    /// Operator picks a request; any other selected request goes back to waiting
    pub fn select(&mut self, passenger_id: &str) -> Result<(), BoardError> {
        let status = self
            .item(passenger_id)
            .map(|item| item.status)
            .ok_or_else(|| BoardError::UnknownPassenger(passenger_id.to_string()))?;
        if status == RequestStatus::Acknowledged {
            return Err(BoardError::AlreadyAcknowledged(passenger_id.to_string()));
        }

        for item in &mut self.items {
            if item.passenger_id == passenger_id {
                item.status = RequestStatus::AwaitingAcknowledgement;
            } else if item.status == RequestStatus::AwaitingAcknowledgement {
                item.status = RequestStatus::Waiting;
            }
        }
        Ok(())
    }

    pub fn mark_acknowledged(
        &mut self,
        passenger_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), BoardError> {
        let item = self.item_mut(passenger_id)?;
        if item.status == RequestStatus::Acknowledged {
            return Err(BoardError::AlreadyAcknowledged(passenger_id.to_string()));
        }
        item.status = RequestStatus::Acknowledged;
        item.acknowledged_at = Some(at);
        Ok(())
    }

    /// Put a request back to waiting after a failed acknowledgment
    pub fn revert(&mut self, passenger_id: &str) {
        if let Ok(item) = self.item_mut(passenger_id) {
            if item.status != RequestStatus::Acknowledged {
                item.status = RequestStatus::Waiting;
            }
        }
    }

    pub fn record_location(&mut self, passenger_id: &str, point: GeoPoint, seen_at: DateTime<Utc>) {
        self.locations
            .insert(passenger_id.to_string(), PassengerLocation { point, seen_at });
    }

    pub fn location(&self, passenger_id: &str) -> Option<&PassengerLocation> {
        self.locations.get(passenger_id)
    }

    pub fn item(&self, passenger_id: &str) -> Option<&RequestItem> {
        self.items.iter().find(|i| i.passenger_id == passenger_id)
    }

    pub fn items(&self) -> &[RequestItem] {
        &self.items
    }

    pub fn waiting(&self) -> impl Iterator<Item = &RequestItem> {
        self.items
            .iter()
            .filter(|i| i.status != RequestStatus::Acknowledged)
    }

    fn item_mut(&mut self, passenger_id: &str) -> Result<&mut RequestItem, BoardError> {
        self.items
            .iter_mut()
            .find(|i| i.passenger_id == passenger_id)
            .ok_or_else(|| BoardError::UnknownPassenger(passenger_id.to_string()))
    }
}

/// Operator device: request board plus the transport to answer on
pub struct OperatorDesk<T: Transport + 'static> {
    board: RequestBoard,
    transport: Arc<T>,
    notifier: Arc<dyn Notifier>,
}

impl<T: Transport + 'static> OperatorDesk<T> {
    pub fn new(vehicle: VehicleId, transport: Arc<T>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            board: RequestBoard::new(vehicle),
            transport,
            notifier,
        }
    }

    pub fn board(&self) -> &RequestBoard {
        &self.board
    }

    /// Feed a passenger update heard on this vehicle's topics
    pub async fn on_passenger_update(&mut self, update: &PassengerUpdate, now: DateTime<Utc>) {
        match update {
            PassengerUpdate::Request {
                id,
                minutes,
                timestamp,
            } => {
                let requested_at = DateTime::from_timestamp_millis(*timestamp)
                    .filter(|_| *timestamp > 0)
                    .unwrap_or(now);

                if self.board.record_request(id, *minutes, requested_at) {
                    info!(
                        passenger = %id,
                        vehicle = %self.board.vehicle(),
                        minutes,
                        "Pickup request received"
                    );
                    self.notifier
                        .notify(Notification::new(
                            self.board.vehicle().as_str(),
                            self.board.vehicle().clone(),
                            NotificationKind::PickupRequest {
                                passenger_id: id.clone(),
                                minutes: *minutes,
                            },
                        ))
                        .await;
                }
            }
            PassengerUpdate::Location { id, lat, lng } => {
                self.board.record_location(id, GeoPoint::new(*lat, *lng), now);
            }
        }
    }

    pub fn select_request(&mut self, passenger_id: &str) -> BusLinkResult<()> {
        self.board
            .select(passenger_id)
            .map_err(|e| BusLinkError::handshake(e.to_string()))
    }

    /// Publish the acknowledgment and, only once it is out, mark the request.
    ///
    /// On publish failure the request returns to waiting and the operator has
    /// to try again.
    pub async fn acknowledge(
        &mut self,
        passenger_id: &str,
        now: DateTime<Utc>,
    ) -> BusLinkResult<()> {
        self.select_request(passenger_id)?;

        let topic = TopicBuilder::acknowledgment(self.board.vehicle(), passenger_id);
        let payload = AckPayload::accept(passenger_id, now)
            .to_payload()
            .map_err(|e| BusLinkError::internal(format!("encoding acknowledgment: {e}")))?;

        if let Err(e) = self.transport.publish(&topic, payload, false).await {
            warn!(passenger = %passenger_id, error = %e, "Acknowledgment publish failed");
            self.board.revert(passenger_id);
            return Err(BusLinkError::handshake(format!(
                "acknowledgment for {passenger_id} not sent: {e}"
            )));
        }

        self.board
            .mark_acknowledged(passenger_id, now)
            .map_err(|e| BusLinkError::handshake(e.to_string()))?;
        metrics().pickup_acknowledged();
        info!(passenger = %passenger_id, vehicle = %self.board.vehicle(), "Pickup acknowledged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{MockTransport, RecordingNotifier};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_714_550_400 + secs, 0).unwrap()
    }

    fn bus() -> VehicleId {
        VehicleId::parse("03").unwrap()
    }

    fn request(id: &str, minutes: u32, secs: i64) -> PassengerUpdate {
        PassengerUpdate::request(id, minutes, at(secs))
    }

    #[test]
    fn test_duplicate_requests_ignored() {
        let mut board = RequestBoard::new(bus());
        assert!(board.record_request("p-1", 5, at(0)));
        assert!(!board.record_request("p-1", 7, at(1)));

        assert_eq!(board.items().len(), 1);
        assert_eq!(board.item("p-1").unwrap().minutes, 7);
    }

    #[test]
    fn test_selecting_returns_previous_to_waiting() {
        let mut board = RequestBoard::new(bus());
        board.record_request("p-1", 5, at(0));
        board.record_request("p-2", 5, at(1));

        board.select("p-1").unwrap();
        board.select("p-2").unwrap();

        assert_eq!(board.item("p-1").unwrap().status, RequestStatus::Waiting);
        assert_eq!(
            board.item("p-2").unwrap().status,
            RequestStatus::AwaitingAcknowledgement
        );
        assert_eq!(
            board.select("p-9"),
            Err(BoardError::UnknownPassenger("p-9".to_string()))
        );
    }

    #[test]
    fn test_new_request_after_ack_reopens_item() {
        let mut board = RequestBoard::new(bus());
        board.record_request("p-1", 5, at(0));
        board.mark_acknowledged("p-1", at(10)).unwrap();

        assert!(!board.record_request("p-1", 5, at(0)));
        assert!(board.record_request("p-1", 3, at(600)));
        assert_eq!(board.item("p-1").unwrap().status, RequestStatus::Waiting);
        assert_eq!(board.waiting().count(), 1);
    }

    #[tokio::test]
    async fn test_acknowledge_publishes_scoped_ack() {
        let transport = Arc::new(MockTransport::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let mut desk = OperatorDesk::new(bus(), transport.clone(), notifier.clone());

        desk.on_passenger_update(&request("p-1", 5, 0), at(0)).await;
        desk.on_passenger_update(&request("p-2", 5, 1), at(1)).await;
        desk.acknowledge("p-2", at(30)).await.unwrap();

        let published = transport.get_published_messages().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "commuter/bus-03/livestream/ack/p-2");
        let body: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(body["ok"], true);
        assert_eq!(body["id"], "p-2");

        let board = desk.board();
        assert_eq!(board.item("p-1").unwrap().status, RequestStatus::Waiting);
        assert_eq!(board.item("p-2").unwrap().status, RequestStatus::Acknowledged);
        assert_eq!(board.item("p-2").unwrap().acknowledged_at, Some(at(30)));
        assert_eq!(notifier.kinds().await.len(), 2);
    }

    #[tokio::test]
    async fn test_second_acknowledge_rejected() {
        let transport = Arc::new(MockTransport::new());
        let mut desk =
            OperatorDesk::new(bus(), transport.clone(), Arc::new(RecordingNotifier::default()));
        desk.on_passenger_update(&request("p-1", 5, 0), at(0)).await;

        desk.acknowledge("p-1", at(5)).await.unwrap();
        assert!(desk.acknowledge("p-1", at(6)).await.is_err());
        assert_eq!(transport.get_published_messages().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_publish_leaves_request_waiting() {
        let transport = Arc::new(MockTransport::with_failure());
        let mut desk = OperatorDesk::new(bus(), transport, Arc::new(RecordingNotifier::default()));
        desk.on_passenger_update(&request("p-1", 5, 0), at(0)).await;

        let result = desk.acknowledge("p-1", at(5)).await;

        assert!(matches!(result, Err(BusLinkError::Handshake { .. })));
        assert_eq!(
            desk.board().item("p-1").unwrap().status,
            RequestStatus::Waiting
        );
    }

    #[tokio::test]
    async fn test_location_updates_tracked() {
        let mut desk = OperatorDesk::new(
            bus(),
            Arc::new(MockTransport::new()),
            Arc::new(RecordingNotifier::default()),
        );
        let update = PassengerUpdate::location("p-1", GeoPoint::new(14.05, 121.02));

        desk.on_passenger_update(&update, at(3)).await;

        let location = desk.board().location("p-1").unwrap();
        assert_eq!(location.point, GeoPoint::new(14.05, 121.02));
        assert_eq!(location.seen_at, at(3));
        assert!(desk.board().items().is_empty());
    }
}
