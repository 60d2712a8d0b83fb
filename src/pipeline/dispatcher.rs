//! Event dispatcher
//!
//! One task owns the router, the reconciler, the handshake, the operator
//! desk and the trip aggregator. The transport, timers, poller and callers
//! all feed it through channels.

use crate::backend::{BackendApi, PollResult};
use crate::config::BusLinkConfig;
use crate::error::{BusLinkError, BusLinkResult};
use crate::fleet::{VehiclePatch, VehicleReconciler, VehicleState};
use crate::handshake::{HandshakeTick, LiveLocationHandshake, OperatorDesk, SessionStatus};
use crate::notify::Notifier;
use crate::observability::metrics::metrics;
use crate::protocol::{GeoPoint, PassengerUpdate, VehicleId};
use crate::routing::{RoutedMessage, TopicRouter};
use crate::routing_span;
use crate::store::Store;
use crate::transport::{InboundMessage, Transport};
use crate::trips::{GeofenceEvent, TripAggregator};
use chrono::{DateTime, Utc};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of the command/event channel behind a [`PipelineHandle`]
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Marker advanced whenever a new pickup request reaches this device
pub const PICKUP_REQUEST_MARKER: &str = "last_pickup_request";

/// Everything the dispatcher reacts to
#[derive(Debug)]
pub enum InboundEvent {
    Message(InboundMessage),
    Geofence(GeofenceEvent),
    /// Latest fix of the passenger using this device
    PassengerPosition(GeoPoint),
    HandshakeTick(HandshakeTick),
    Poll(PollResult),
    Command(PipelineCommand),
    Shutdown,
}

/// Requests from the UI layer; each carries a reply channel when the caller
/// needs an answer
#[derive(Debug)]
pub enum PipelineCommand {
    RequestShare {
        passenger_id: String,
        vehicle: VehicleId,
        minutes: Option<u32>,
        reply: oneshot::Sender<BusLinkResult<()>>,
    },
    CancelShare {
        passenger_id: String,
        vehicle: VehicleId,
        reply: oneshot::Sender<bool>,
    },
    ConfirmInactivity {
        passenger_id: String,
        vehicle: VehicleId,
        reply: oneshot::Sender<bool>,
    },
    DismissInactivity {
        passenger_id: String,
        vehicle: VehicleId,
    },
    SelectRequest {
        passenger_id: String,
        reply: oneshot::Sender<BusLinkResult<()>>,
    },
    AcknowledgeRequest {
        passenger_id: String,
        reply: oneshot::Sender<BusLinkResult<()>>,
    },
    VehicleStatus {
        vehicle: VehicleId,
        reply: oneshot::Sender<Option<VehicleState>>,
    },
    SessionStatus {
        passenger_id: String,
        vehicle: VehicleId,
        reply: oneshot::Sender<Option<SessionStatus>>,
    },
}

/// Cloneable front door to a running dispatcher
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    events: mpsc::Sender<InboundEvent>,
}

impl PipelineHandle {
    /// Handle plus the receiving end for [`DispatcherInputs::events`]
    pub fn channel() -> (Self, mpsc::Receiver<InboundEvent>) {
        let (events, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self { events }, receiver)
    }

    async fn send(&self, event: InboundEvent) -> BusLinkResult<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| BusLinkError::internal("dispatcher is not running"))
    }

    async fn ask<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> PipelineCommand,
    ) -> BusLinkResult<R> {
        let (reply, answer) = oneshot::channel();
        self.send(InboundEvent::Command(build(reply))).await?;
        answer
            .await
            .map_err(|_| BusLinkError::internal("dispatcher dropped the request"))
    }

    /// Start sharing; `minutes` falls back to the configured default
    pub async fn request_share(
        &self,
        passenger_id: &str,
        vehicle: &VehicleId,
        minutes: Option<u32>,
    ) -> BusLinkResult<()> {
        self.ask(|reply| PipelineCommand::RequestShare {
            passenger_id: passenger_id.to_string(),
            vehicle: vehicle.clone(),
            minutes,
            reply,
        })
        .await?
    }

    pub async fn cancel_share(
        &self,
        passenger_id: &str,
        vehicle: &VehicleId,
    ) -> BusLinkResult<bool> {
        self.ask(|reply| PipelineCommand::CancelShare {
            passenger_id: passenger_id.to_string(),
            vehicle: vehicle.clone(),
            reply,
        })
        .await
    }

    pub async fn confirm_inactivity(
        &self,
        passenger_id: &str,
        vehicle: &VehicleId,
    ) -> BusLinkResult<bool> {
        self.ask(|reply| PipelineCommand::ConfirmInactivity {
            passenger_id: passenger_id.to_string(),
            vehicle: vehicle.clone(),
            reply,
        })
        .await
    }

    pub async fn dismiss_inactivity(
        &self,
        passenger_id: &str,
        vehicle: &VehicleId,
    ) -> BusLinkResult<()> {
        self.send(InboundEvent::Command(PipelineCommand::DismissInactivity {
            passenger_id: passenger_id.to_string(),
            vehicle: vehicle.clone(),
        }))
        .await
    }

    pub async fn select_request(&self, passenger_id: &str) -> BusLinkResult<()> {
        self.ask(|reply| PipelineCommand::SelectRequest {
            passenger_id: passenger_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn acknowledge_request(&self, passenger_id: &str) -> BusLinkResult<()> {
        self.ask(|reply| PipelineCommand::AcknowledgeRequest {
            passenger_id: passenger_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn geofence(&self, event: GeofenceEvent) -> BusLinkResult<()> {
        self.send(InboundEvent::Geofence(event)).await
    }

    pub async fn position(&self, point: GeoPoint) -> BusLinkResult<()> {
        self.send(InboundEvent::PassengerPosition(point)).await
    }

    pub async fn vehicle(&self, vehicle: &VehicleId) -> BusLinkResult<Option<VehicleState>> {
        self.ask(|reply| PipelineCommand::VehicleStatus {
            vehicle: vehicle.clone(),
            reply,
        })
        .await
    }

    pub async fn session_status(
        &self,
        passenger_id: &str,
        vehicle: &VehicleId,
    ) -> BusLinkResult<Option<SessionStatus>> {
        self.ask(|reply| PipelineCommand::SessionStatus {
            passenger_id: passenger_id.to_string(),
            vehicle: vehicle.clone(),
            reply,
        })
        .await
    }

    pub async fn shutdown(&self) -> BusLinkResult<()> {
        self.send(InboundEvent::Shutdown).await
    }
}

/// Receivers the dispatcher drains
pub struct DispatcherInputs {
    pub events: mpsc::Receiver<InboundEvent>,
    pub messages: mpsc::Receiver<InboundMessage>,
    pub ticks: mpsc::Receiver<HandshakeTick>,
    pub polls: mpsc::Receiver<PollResult>,
}

pub struct Dispatcher<T: Transport + 'static> {
    router: TopicRouter,
    reconciler: VehicleReconciler,
    handshake: LiveLocationHandshake<T>,
    desk: Option<OperatorDesk<T>>,
    trips: TripAggregator,
    store: Store,
    default_minutes: u32,
}

impl<T: Transport + 'static> Dispatcher<T> {
    pub fn new(
        config: &BusLinkConfig,
        store: Store,
        transport: Arc<T>,
        notifier: Arc<dyn Notifier>,
        backend: Arc<dyn BackendApi>,
        ticks: mpsc::Sender<HandshakeTick>,
    ) -> Self {
        let assigned = config.assigned_vehicle();
        let desk = assigned
            .clone()
            .map(|vehicle| OperatorDesk::new(vehicle, transport.clone(), notifier.clone()));

        Self {
            router: TopicRouter::new(assigned),
            reconciler: VehicleReconciler::new(store.clone()),
            handshake: LiveLocationHandshake::new(transport, notifier, &config.handshake, ticks),
            desk,
            trips: TripAggregator::new(store.clone(), backend),
            store,
            default_minutes: config.handshake.default_minutes,
        }
    }

    pub fn reconciler(&self) -> &VehicleReconciler {
        &self.reconciler
    }

    pub fn reconciler_mut(&mut self) -> &mut VehicleReconciler {
        &mut self.reconciler
    }

    pub fn handshake(&self) -> &LiveLocationHandshake<T> {
        &self.handshake
    }

    pub fn desk(&self) -> Option<&OperatorDesk<T>> {
        self.desk.as_ref()
    }

    /// Drain every input until shutdown, then stop all timers
    pub async fn run(mut self, inputs: DispatcherInputs) {
        let DispatcherInputs {
            mut events,
            mut messages,
            mut ticks,
            mut polls,
        } = inputs;

        info!("Dispatcher running");

        loop {
            let event = tokio::select! {
                Some(event) = events.recv() => event,
                Some(message) = messages.recv() => InboundEvent::Message(message),
                Some(tick) = ticks.recv() => InboundEvent::HandshakeTick(tick),
                Some(poll) = polls.recv() => InboundEvent::Poll(poll),
                else => break,
            };

            if self.handle(event).await.is_break() {
                break;
            }
        }

        self.handshake.stop_all();
        info!("Dispatcher stopped");
    }

    /// Run one event to completion
    pub async fn handle(&mut self, event: InboundEvent) -> ControlFlow<()> {
        let now = Utc::now();

        match event {
            InboundEvent::Message(message) => {
                let span = routing_span!(topic = %message.topic, retained = message.retained);
                self.on_message(message, now).instrument(span).await;
            }
            InboundEvent::Geofence(event) => {
                if let Err(e) = self.trips.handle(&event).await {
                    error!(vehicle = %event.vehicle, error = %e, "Geofence event not applied");
                }
            }
            InboundEvent::PassengerPosition(point) => self.handshake.record_position(point),
            InboundEvent::HandshakeTick(tick) => self.handshake.on_tick(tick).await,
            InboundEvent::Poll(result) => {
                for (vehicle, paid) in &result.counts {
                    self.reconciler
                        .merge_from_poll(vehicle, *paid, result.polled_at)
                        .await;
                }
                debug!(vehicles = result.counts.len(), "Poll result merged");
            }
            InboundEvent::Command(command) => self.on_command(command, now).await,
            InboundEvent::Shutdown => return ControlFlow::Break(()),
        }

        ControlFlow::Continue(())
    }

    async fn on_message(&mut self, message: InboundMessage, now: DateTime<Utc>) {
        let routed = match self.router.route(&message.topic, &message.payload) {
            Ok(routed) => routed,
            Err(e) => {
                metrics().message_dropped();
                warn!(topic = %message.topic, error = %e, "Dropping message");
                return;
            }
        };

        match routed {
            RoutedMessage::Vehicle { vehicle, patch } => {
                self.reconciler.merge(&vehicle, &patch, now).await;
            }
            RoutedMessage::Occupancy { vehicle, delta } => {
                self.reconciler
                    .merge(&vehicle, &VehiclePatch::Occupancy(delta), now)
                    .await;
                if let Err(e) = self.trips.on_delta(&vehicle, &delta).await {
                    error!(vehicle = %vehicle, error = %e, "Trip accumulator not updated");
                }
            }
            RoutedMessage::PassengerUpdate { vehicle, update } => {
                self.on_passenger_update(&vehicle, &update, now).await;
            }
            RoutedMessage::Acknowledgment { vehicle, passenger } => {
                self.handshake
                    .on_acknowledgment(&vehicle, passenger.as_deref(), now)
                    .await;
            }
        }
    }

    async fn on_passenger_update(
        &mut self,
        vehicle: &VehicleId,
        update: &PassengerUpdate,
        now: DateTime<Utc>,
    ) {
        let Some(desk) = self
            .desk
            .as_mut()
            .filter(|desk| desk.board().vehicle() == vehicle)
        else {
            debug!(
                vehicle = %vehicle,
                "Passenger update for a vehicle this device does not operate"
            );
            return;
        };

        desk.on_passenger_update(update, now).await;

        if let PassengerUpdate::Request { timestamp, .. } = update {
            let seen = if *timestamp > 0 {
                *timestamp
            } else {
                now.timestamp_millis()
            };
            if let Err(e) = self.store.advance_marker(PICKUP_REQUEST_MARKER, seen).await {
                warn!(error = %e, "Pickup request marker not advanced");
            }
        }
    }

    async fn on_command(&mut self, command: PipelineCommand, now: DateTime<Utc>) {
        match command {
            PipelineCommand::RequestShare {
                passenger_id,
                vehicle,
                minutes,
                reply,
            } => {
                let minutes = minutes.unwrap_or(self.default_minutes);
                let result = self
                    .handshake
                    .request_share(&passenger_id, &vehicle, minutes, now)
                    .await;
                let _ = reply.send(result);
            }
            PipelineCommand::CancelShare {
                passenger_id,
                vehicle,
                reply,
            } => {
                let ended = self.handshake.cancel_share(&passenger_id, &vehicle).await;
                let _ = reply.send(ended);
            }
            PipelineCommand::ConfirmInactivity {
                passenger_id,
                vehicle,
                reply,
            } => {
                let ended = self
                    .handshake
                    .confirm_inactivity(&passenger_id, &vehicle)
                    .await;
                let _ = reply.send(ended);
            }
            PipelineCommand::DismissInactivity {
                passenger_id,
                vehicle,
            } => self.handshake.dismiss_inactivity(&passenger_id, &vehicle),
            PipelineCommand::SelectRequest {
                passenger_id,
                reply,
            } => {
                let result = match self.desk.as_mut() {
                    Some(desk) => desk.select_request(&passenger_id),
                    None => Err(no_desk()),
                };
                let _ = reply.send(result);
            }
            PipelineCommand::AcknowledgeRequest {
                passenger_id,
                reply,
            } => {
                let result = match self.desk.as_mut() {
                    Some(desk) => desk.acknowledge(&passenger_id, now).await,
                    None => Err(no_desk()),
                };
                let _ = reply.send(result);
            }
            PipelineCommand::VehicleStatus { vehicle, reply } => {
                let _ = reply.send(self.reconciler.get(&vehicle).cloned());
            }
            PipelineCommand::SessionStatus {
                passenger_id,
                vehicle,
                reply,
            } => {
                let status = self
                    .handshake
                    .session(&passenger_id, &vehicle)
                    .map(|session| session.status());
                let _ = reply.send(status);
            }
        }
    }
}

fn no_desk() -> BusLinkError {
    BusLinkError::handshake("this device has no assigned vehicle to take pickup requests for")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::RequestStatus;
    use crate::protocol::TopicBuilder;
    use crate::testing::mocks::{MockBackend, MockTransport, RecordingNotifier};
    use crate::trips::GeofenceTransition;
    use bytes::Bytes;

    fn bus() -> VehicleId {
        VehicleId::parse("03").unwrap()
    }

    fn message(topic: &str, payload: &str) -> InboundEvent {
        InboundEvent::Message(InboundMessage {
            topic: topic.to_string(),
            payload: Bytes::from(payload.to_string()),
            retained: false,
        })
    }

    async fn dispatcher() -> (
        Dispatcher<MockTransport>,
        Arc<MockTransport>,
        Arc<MockBackend>,
        Store,
    ) {
        let config = BusLinkConfig::test_config();
        let store = Store::in_memory().await.unwrap();
        let transport = Arc::new(MockTransport::new());
        let backend = Arc::new(MockBackend::new());
        let (ticks, _) = mpsc::channel(16);
        let dispatcher = Dispatcher::new(
            &config,
            store.clone(),
            transport.clone(),
            Arc::new(RecordingNotifier::default()),
            backend.clone(),
            ticks,
        );
        (dispatcher, transport, backend, store)
    }

    #[tokio::test]
    async fn test_telemetry_then_fare() {
        let (mut dispatcher, _transport, _backend, _store) = dispatcher().await;

        dispatcher
            .handle(message(
                "device/bus-03/telemetry",
                r#"{"lat":14.1,"lng":121.0,"people":12}"#,
            ))
            .await;
        dispatcher
            .handle(message("device/bus-03/fare", r#"{"paid":4}"#))
            .await;

        let state = dispatcher.reconciler().get(&bus()).unwrap();
        assert_eq!(state.position, Some(GeoPoint::new(14.1, 121.0)));
        assert_eq!(state.occupancy, 12);
        assert_eq!(state.paid_count, 4);
    }

    #[tokio::test]
    async fn test_bad_message_dropped_and_loop_continues() {
        let (mut dispatcher, _transport, _backend, _store) = dispatcher().await;

        let flow = dispatcher.handle(message("device/bus-03/fare", "garbage")).await;

        assert!(flow.is_continue());
        assert!(dispatcher.reconciler().is_empty());
    }

    #[tokio::test]
    async fn test_occupancy_feeds_open_trip() {
        let (mut dispatcher, _transport, backend, store) = dispatcher().await;
        let exit = GeofenceEvent {
            transition: GeofenceTransition::Exit,
            region: "terminal-north".to_string(),
            vehicle: bus(),
            at: Utc::now(),
        };

        dispatcher.handle(InboundEvent::Geofence(exit.clone())).await;
        dispatcher
            .handle(message("device/bus-03/people", r#"{"in":3,"out":1}"#))
            .await;
        dispatcher
            .handle(InboundEvent::Geofence(GeofenceEvent {
                transition: GeofenceTransition::Enter,
                ..exit
            }))
            .await;

        assert_eq!(dispatcher.reconciler().get(&bus()).unwrap().inside, 2);
        let summaries = backend.summaries().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!((summaries[0].entries, summaries[0].exits), (3, 1));
        assert!(!store.is_counting(&bus()).await.unwrap());
    }

    #[tokio::test]
    async fn test_pickup_request_and_acknowledge() {
        let (mut dispatcher, transport, _backend, store) = dispatcher().await;

        dispatcher
            .handle(message(
                "pao/passenger/updates",
                r#"{"type":"request","id":"p-1","minutes":5,"timestamp":1714550400000}"#,
            ))
            .await;
        let (reply, answer) = oneshot::channel();
        dispatcher
            .handle(InboundEvent::Command(PipelineCommand::AcknowledgeRequest {
                passenger_id: "p-1".to_string(),
                reply,
            }))
            .await;

        assert!(answer.await.unwrap().is_ok());
        let desk = dispatcher.desk().unwrap();
        assert_eq!(
            desk.board().item("p-1").unwrap().status,
            RequestStatus::Acknowledged
        );
        assert_eq!(
            transport
                .published_on(&TopicBuilder::acknowledgment(&bus(), "p-1"))
                .await
                .len(),
            1
        );
        assert_eq!(
            store.marker(PICKUP_REQUEST_MARKER).await.unwrap(),
            Some(1_714_550_400_000)
        );
    }

    #[tokio::test]
    async fn test_poll_result_merged() {
        let (mut dispatcher, _transport, _backend, _store) = dispatcher().await;
        let mut counts = std::collections::BTreeMap::new();
        counts.insert(bus(), 7);

        dispatcher
            .handle(InboundEvent::Poll(PollResult {
                counts,
                polled_at: Utc::now(),
            }))
            .await;

        assert_eq!(dispatcher.reconciler().get(&bus()).unwrap().paid_count, 7);
    }

    #[tokio::test]
    async fn test_handle_and_run_until_shutdown() {
        let (dispatcher, _transport, _backend, _store) = dispatcher().await;
        let (handle, events) = PipelineHandle::channel();
        let (_msg_tx, messages) = mpsc::channel(4);
        let (_tick_tx, ticks) = mpsc::channel(4);
        let (_poll_tx, polls) = mpsc::channel(4);

        let task = tokio::spawn(dispatcher.run(DispatcherInputs {
            events,
            messages,
            ticks,
            polls,
        }));

        handle.request_share("p-1", &bus(), None).await.unwrap();
        assert_eq!(
            handle.session_status("p-1", &bus()).await.unwrap(),
            Some(SessionStatus::Requested)
        );
        assert!(handle.cancel_share("p-1", &bus()).await.unwrap());

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(handle.vehicle(&bus()).await.is_err());
    }
}
