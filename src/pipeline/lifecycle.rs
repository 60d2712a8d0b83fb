//! Service lifecycle
//!
//! Startup order: open the store, restore snapshots, connect the transport,
//! subscribe the role's topics, start the poller, run the dispatcher.
//! Shutdown reverses it: stop the dispatcher (and with it every handshake
//! timer), stop the poller, disconnect.

use super::dispatcher::{Dispatcher, DispatcherInputs, PipelineHandle};
use crate::backend::{BackendApi, BackendPoller};
use crate::config::BusLinkConfig;
use crate::lifecycle_span;
use crate::notify::Notifier;
use crate::observability::health::HealthServer;
use crate::observability::metrics::metrics;
use crate::protocol::TopicBuilder;
use crate::store::{Store, StoreError};
use crate::transport::Transport;
use crate::transport::mqtt::ConnectionState;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

const MESSAGE_CHANNEL_CAPACITY: usize = 256;
const TICK_CHANNEL_CAPACITY: usize = 64;
const POLL_CHANNEL_CAPACITY: usize = 4;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

/// A device core that has not been started yet
pub struct BusLinkService<T: Transport + 'static> {
    config: BusLinkConfig,
    transport: T,
    backend: Arc<dyn BackendApi>,
    notifier: Arc<dyn Notifier>,
    health_server: Option<Arc<HealthServer>>,
}

/// A started device core
pub struct RunningService<T: Transport + 'static> {
    handle: PipelineHandle,
    transport: Arc<T>,
    store: Store,
    shutdown: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
    poller: Option<JoinHandle<()>>,
    state_monitor: Option<JoinHandle<()>>,
}

impl<T: Transport + 'static> BusLinkService<T> {
    pub fn new(
        config: BusLinkConfig,
        transport: T,
        backend: Arc<dyn BackendApi>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            transport,
            backend,
            notifier,
            health_server: None,
        }
    }

    /// Report connection state to this health server once started
    pub fn set_health_server(&mut self, health_server: Arc<HealthServer>) {
        self.health_server = Some(health_server);
    }

    pub async fn start(self) -> Result<RunningService<T>, LifecycleError> {
        let span = lifecycle_span!(role = ?self.config.device.role);
        self.start_inner().instrument(span).await
    }

    async fn start_inner(self) -> Result<RunningService<T>, LifecycleError> {
        let Self {
            config,
            mut transport,
            backend,
            notifier,
            health_server,
        } = self;
        metrics().set_service_state("starting");

        let store = Store::open(&config.store.path).await?;
        info!(path = %config.store.path, "Store opened");

        let (message_tx, messages) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        transport.set_message_sender(message_tx);
        transport
            .connect()
            .await
            .map_err(|e| LifecycleError::Transport(Box::new(e)))?;
        info!("Transport connected");

        let topics = TopicBuilder::subscriptions(
            config.device.role,
            config.assigned_vehicle().as_ref(),
            config.passenger_id(),
        );
        transport
            .subscribe(&topics)
            .await
            .map_err(|e| LifecycleError::Transport(Box::new(e)))?;
        info!(topics = topics.len(), "Subscribed to role topics");

        let transport = Arc::new(transport);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let (tick_tx, ticks) = mpsc::channel(TICK_CHANNEL_CAPACITY);
        let (poll_tx, polls) = mpsc::channel(POLL_CHANNEL_CAPACITY);
        let (handle, events) = PipelineHandle::channel();

        let mut dispatcher = Dispatcher::new(
            &config,
            store.clone(),
            transport.clone(),
            notifier,
            backend.clone(),
            tick_tx,
        );
        match dispatcher.reconciler_mut().restore().await {
            Ok(restored) => info!(vehicles = restored, "Vehicle snapshots restored"),
            Err(e) => warn!(error = %e, "Vehicle snapshots not restored; starting empty"),
        }

        let poller = if config.poller.is_enabled_for(config.device.role) {
            let poller = BackendPoller::new(backend, config.poller.interval());
            Some(poller.spawn(poll_tx, shutdown_rx.clone()))
        } else {
            info!("Backend poller disabled for this role");
            None
        };

        let state_monitor = health_server.map(|health| {
            spawn_state_monitor(transport.state_receiver(), health, shutdown_rx)
        });

        let dispatcher = tokio::spawn(dispatcher.run(DispatcherInputs {
            events,
            messages,
            ticks,
            polls,
        }));

        metrics().set_service_state("running");
        info!("Service started");

        Ok(RunningService {
            handle,
            transport,
            store,
            shutdown,
            dispatcher,
            poller,
            state_monitor,
        })
    }
}

impl<T: Transport + 'static> RunningService<T> {
    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        self.transport.is_permanently_disconnected()
    }

    pub async fn shutdown(self) -> Result<(), LifecycleError> {
        info!("Service shutdown initiated");
        metrics().set_service_state("stopping");

        let _ = self.shutdown.send(true);
        if self.handle.shutdown().await.is_err() {
            warn!("Dispatcher already stopped");
        }

        if let Err(e) = self.dispatcher.await {
            error!("Dispatcher shutdown error: {}", e);
        }
        if let Some(poller) = self.poller {
            if let Err(e) = poller.await {
                error!("Poller shutdown error: {}", e);
            }
        }
        if let Some(monitor) = self.state_monitor {
            monitor.abort();
        }

        // The dispatcher held the other references; it has exited
        match Arc::try_unwrap(self.transport) {
            Ok(mut transport) => transport
                .disconnect()
                .await
                .map_err(|e| LifecycleError::Shutdown(e.to_string()))?,
            Err(_) => warn!("Transport still shared; leaving disconnect to drop"),
        }

        self.store.close().await;
        metrics().set_service_state("stopped");
        info!("Service shutdown complete");
        Ok(())
    }
}

/// Mirror transport state into the health server and metrics
fn spawn_state_monitor(
    states: Option<watch::Receiver<ConnectionState>>,
    health: Arc<HealthServer>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(mut states) = states else {
            health.set_connection_state(true, "connected").await;
            return;
        };

        loop {
            let state = states.borrow_and_update().clone();
            let connected = matches!(state, ConnectionState::Connected);
            health
                .set_connection_state(connected, &connection_label(&state))
                .await;
            metrics().update_health_status(connected);

            tokio::select! {
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

fn connection_label(state: &ConnectionState) -> String {
    match state {
        ConnectionState::Connecting => "connecting".to_string(),
        ConnectionState::Connected => "connected".to_string(),
        ConnectionState::Disconnected(_) => "disconnected".to_string(),
        ConnectionState::Reconnecting(attempt) => format!("reconnecting (attempt {attempt})"),
        ConnectionState::PermanentlyDisconnected(_) => "permanently disconnected".to_string(),
    }
}
