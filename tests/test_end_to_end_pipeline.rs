//! End-to-end tests through a started service
//!
//! Each test starts the full service over a mock transport and drives it the
//! way the broker would: by injecting messages on subscribed topics.


use buslink::backend::TicketRecord;
use buslink::config::BusLinkConfig;
use buslink::fleet::VehicleState;
use buslink::handshake::SessionStatus;
use buslink::notify::NotificationKind;
use buslink::pipeline::{BusLinkService, PipelineHandle, RunningService};
use buslink::protocol::{TopicBuilder, VehicleId};
use buslink::testing::{MockBackend, MockTransport, RecordingNotifier};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{bus, commuter_config, config_from_toml, operator_config};

async fn start(
    config: BusLinkConfig,
    backend: Arc<MockBackend>,
) -> (RunningService<MockTransport>, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::default());
    let running = BusLinkService::new(config, MockTransport::new(), backend, notifier.clone())
        .start()
        .await
        .unwrap();
    (running, notifier)
}

/// Poll the dispatcher until `check` accepts the vehicle's state
async fn wait_for_vehicle<F>(handle: &PipelineHandle, vehicle: &VehicleId, check: F) -> VehicleState
where
    F: Fn(&VehicleState) -> bool,
{
    for _ in 0..100 {
        if let Some(state) = handle.vehicle(vehicle).await.unwrap() {
            if check(&state) {
                return state;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("vehicle {vehicle} never reached the expected state");
}

async fn wait_for_session(
    handle: &PipelineHandle,
    passenger_id: &str,
    vehicle: &VehicleId,
    expected: SessionStatus,
) {
    for _ in 0..100 {
        if handle.session_status(passenger_id, vehicle).await.unwrap() == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session for {passenger_id} never reached {expected:?}");
}

#[tokio::test]
async fn test_telemetry_then_fare_on_operator_device() {
    let (running, _notifier) = start(operator_config(), Arc::new(MockBackend::new())).await;
    let transport = running.transport().clone();

    transport
        .inject(
            "device/bus-03/telemetry",
            br#"{"lat": 14.1, "lng": 121.0, "people": 12, "paid": 9}"#,
        )
        .await;
    transport.inject("device/bus-03/fare", br#"{"paid": 4}"#).await;

    let state = wait_for_vehicle(&running.handle(), &bus("03"), |s| s.paid_count == 4).await;
    assert_eq!(state.occupancy, 12);
    assert_eq!(state.reported_paid, Some(9));

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_generic_topics_use_assigned_vehicle() {
    let (running, _notifier) = start(operator_config(), Arc::new(MockBackend::new())).await;
    let transport = running.transport().clone();

    transport
        .inject("device/telemetry", br#"{"lat": 14.2, "lng": 121.1, "people": 6}"#)
        .await;

    let state = wait_for_vehicle(&running.handle(), &bus("03"), |s| s.occupancy == 6).await;
    assert_eq!(state.id, bus("bus-03"));
    assert_eq!(state.reported_paid, None);

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_messages_do_not_stop_the_pipeline() {
    let (running, _notifier) = start(operator_config(), Arc::new(MockBackend::new())).await;
    let transport = running.transport().clone();

    transport.inject("device/bus-03/fare", b"not json").await;
    transport
        .inject("device/bus-03/people", br#"{"in": "three"}"#)
        .await;
    transport.inject("device/bus-03/fare", br#"{"paid": 1}"#).await;

    let state = wait_for_vehicle(&running.handle(), &bus("03"), |s| s.paid_count == 1).await;
    assert_eq!(state.entries, 0);

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_occupancy_inside_a_trip_reaches_backend() {
    let backend = Arc::new(MockBackend::new());
    let (running, _notifier) = start(operator_config(), backend.clone()).await;
    let transport = running.transport().clone();
    let handle = running.handle();
    let store = running.store().clone();

    store
        .begin_trip(&bus("03"), chrono::Utc::now())
        .await
        .unwrap();
    transport
        .inject("device/bus-03/people", br#"{"in": 3, "out": 1, "total": 2}"#)
        .await;

    let state = wait_for_vehicle(&handle, &bus("03"), |s| s.entries == 3).await;
    assert_eq!(state.inside, 2);

    for _ in 0..100 {
        if !backend.sensor_readings().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let readings = backend.sensor_readings().await;
    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].device_id, "bus-03");
    assert_eq!((readings[0].entered, readings[0].exited, readings[0].total), (3, 1, 2));

    let trip = store.trip_state(&bus("03")).await.unwrap().unwrap();
    assert!(trip.counting_active);
    assert_eq!((trip.trip.entries, trip.trip.exits), (3, 1));

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_poller_merges_paid_counts() {
    let backend = Arc::new(MockBackend::with_tickets(vec![
        TicketRecord::new(Some("bus-03"), Some(true)),
        TicketRecord::new(Some("3"), None),
        TicketRecord::new(Some("bus-03"), Some(false)),
        TicketRecord::new(Some("bus-07"), Some(true)),
        TicketRecord::new(None, Some(true)),
    ]));
    let config = config_from_toml(
        r#"
[device]
role = "manager"

[mqtt]
broker_url = "mqtt://localhost:1883"

[backend]
base_url = "http://localhost:5000"

[poller]
interval_secs = 60

[store]
path = ":memory:"
"#,
    );
    let (running, _notifier) = start(config, backend.clone()).await;
    let handle = running.handle();

    let bus_03 = wait_for_vehicle(&handle, &bus("03"), |s| s.paid_count > 0).await;
    let bus_07 = wait_for_vehicle(&handle, &bus("07"), |s| s.paid_count > 0).await;
    assert_eq!(bus_03.paid_count, 2);
    assert_eq!(bus_07.paid_count, 1);
    assert!(!backend.ticket_dates().await.is_empty());

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_commuter_and_operator_complete_a_handshake() {
    let (operator, _operator_notifier) =
        start(operator_config(), Arc::new(MockBackend::new())).await;
    let (commuter, commuter_notifier) =
        start(commuter_config(), Arc::new(MockBackend::new())).await;

    commuter
        .handle()
        .request_share("p-1", &bus("03"), Some(5))
        .await
        .unwrap();

    // Relay the commuter's vehicle-scoped request to the operator device
    let request_topic = TopicBuilder::passenger_updates(&bus("03"));
    let requests = commuter.transport().published_on(&request_topic).await;
    assert_eq!(requests.len(), 1);
    operator
        .transport()
        .inject(&request_topic, &serde_json::to_vec(&requests[0]).unwrap())
        .await;

    // The request is queued on the operator's board once it has been handled
    let mut acknowledged = Err(());
    for _ in 0..100 {
        if operator.handle().acknowledge_request("p-1").await.is_ok() {
            acknowledged = Ok(());
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(acknowledged.is_ok());

    // Relay the operator's acknowledgment back to the commuter
    let ack_topic = TopicBuilder::acknowledgment(&bus("03"), "p-1");
    let acks = operator.transport().published_on(&ack_topic).await;
    assert_eq!(acks.len(), 1);
    commuter
        .transport()
        .inject(&ack_topic, &serde_json::to_vec(&acks[0]).unwrap())
        .await;

    wait_for_session(&commuter.handle(), "p-1", &bus("03"), SessionStatus::Acknowledged).await;
    assert!(
        commuter_notifier
            .kinds()
            .await
            .contains(&NotificationKind::ShareAcknowledged)
    );

    commuter.shutdown().await.unwrap();
    operator.shutdown().await.unwrap();
}
