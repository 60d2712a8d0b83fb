use super::session::{HandshakeSettings, LiveLocationSession, SessionEffect};
use crate::config::HandshakeSection;
use crate::error::{BusLinkError, BusLinkResult};
use crate::handshake_span;
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::observability::metrics::metrics;
use crate::protocol::{GeoPoint, PassengerUpdate, TopicBuilder, VehicleId};
use crate::timers::TimerHandle;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};

/// Identifies one session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub passenger_id: String,
    pub vehicle: VehicleId,
}

impl SessionKey {
    pub fn new(passenger_id: &str, vehicle: &VehicleId) -> Self {
        Self {
            passenger_id: passenger_id.to_string(),
            vehicle: vehicle.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickKind {
    Countdown,
    Sample,
}

/// Timer event, tagged with the session generation it was scheduled for
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeTick {
    pub key: SessionKey,
    pub generation: u64,
    pub kind: TickKind,
}

struct SessionEntry {
    session: LiveLocationSession,
    countdown: TimerHandle,
    sampler: TimerHandle,
}

impl SessionEntry {
    fn stop_timers(&mut self) {
        self.countdown.cancel();
        self.sampler.cancel();
    }
}

/// Passenger-side live-location handshake.
///
/// Owns every session keyed by `(passenger, vehicle)` and carries out the
/// effects the pure session machine asks for. Timer ticks come back through
/// the `ticks` channel and are fed to [`on_tick`](Self::on_tick) by the
/// dispatcher, so all session mutation happens on one task.
pub struct LiveLocationHandshake<T: Transport + 'static> {
    transport: Arc<T>,
    notifier: Arc<dyn Notifier>,
    settings: HandshakeSettings,
    countdown_period: Duration,
    sample_period: Duration,
    ticks: mpsc::Sender<HandshakeTick>,
    sessions: HashMap<SessionKey, SessionEntry>,
    last_fix: Option<GeoPoint>,
}

impl<T: Transport + 'static> LiveLocationHandshake<T> {
    pub fn new(
        transport: Arc<T>,
        notifier: Arc<dyn Notifier>,
        config: &HandshakeSection,
        ticks: mpsc::Sender<HandshakeTick>,
    ) -> Self {
        Self {
            transport,
            notifier,
            settings: HandshakeSettings::from(config),
            countdown_period: config.countdown_tick(),
            sample_period: config.sample_interval(),
            ticks,
            sessions: HashMap::new(),
            last_fix: None,
        }
    }

    /// Passenger starts sharing with a vehicle
    pub async fn request_share(
        &mut self,
        passenger_id: &str,
        vehicle: &VehicleId,
        minutes: u32,
        now: DateTime<Utc>,
    ) -> BusLinkResult<()> {
        let key = SessionKey::new(passenger_id, vehicle);
        let settings = self.settings;
        let entry = self
            .sessions
            .entry(key.clone())
            .or_insert_with(|| SessionEntry {
                session: LiveLocationSession::new(passenger_id, vehicle.clone(), settings),
                countdown: TimerHandle::default(),
                sampler: TimerHandle::default(),
            });

        let effects = entry
            .session
            .request(minutes, now)
            .map_err(|e| BusLinkError::handshake(e.to_string()))?;
        // A passenger standing still reports no new fix after this point
        if let Some(point) = self.last_fix {
            entry.session.record_position(point);
        }

        metrics().share_requested();
        info!(
            passenger = %passenger_id,
            vehicle = %vehicle,
            minutes,
            "Live-location share requested"
        );

        self.run_effects(&key, effects).await;
        Ok(())
    }

    /// Passenger stops sharing. Returns whether an active session ended.
    pub async fn cancel_share(&mut self, passenger_id: &str, vehicle: &VehicleId) -> bool {
        self.transition(&SessionKey::new(passenger_id, vehicle), |s| s.cancel())
            .await
    }

    pub async fn confirm_inactivity(&mut self, passenger_id: &str, vehicle: &VehicleId) -> bool {
        self.transition(&SessionKey::new(passenger_id, vehicle), |s| {
            s.confirm_inactivity()
        })
        .await
    }

    pub fn dismiss_inactivity(&mut self, passenger_id: &str, vehicle: &VehicleId) {
        if let Some(entry) = self.sessions.get_mut(&SessionKey::new(passenger_id, vehicle)) {
            entry.session.dismiss_inactivity();
        }
    }

    /// An acknowledgment arrived for `vehicle`.
    ///
    /// With a passenger id only that passenger's session is considered;
    /// without one (legacy topic, no id in the payload) every session with
    /// this vehicle is. Returns how many sessions moved to acknowledged.
    pub async fn on_acknowledgment(
        &mut self,
        vehicle: &VehicleId,
        passenger_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> usize {
        let keys: Vec<SessionKey> = self
            .sessions
            .keys()
            .filter(|key| &key.vehicle == vehicle)
            .filter(|key| passenger_id.map_or(true, |p| key.passenger_id == p))
            .cloned()
            .collect();

        let mut acknowledged = 0;
        for key in keys {
            if self.transition(&key, |s| s.acknowledge(now)).await {
                acknowledged += 1;
            }
        }

        if acknowledged == 0 {
            debug!(vehicle = %vehicle, "Acknowledgment matched no waiting session");
        }
        acknowledged
    }

    /// Newest position fix for the passenger on this device
    pub fn record_position(&mut self, point: GeoPoint) {
        self.last_fix = Some(point);
        for entry in self.sessions.values_mut() {
            if entry.session.is_active() {
                entry.session.record_position(point);
            }
        }
    }

    pub async fn on_tick(&mut self, tick: HandshakeTick) {
        let generation = tick.generation;
        let applied = match tick.kind {
            TickKind::Countdown => {
                self.transition(&tick.key, |s| s.countdown_tick(generation))
                    .await
            }
            TickKind::Sample => {
                self.transition(&tick.key, |s| s.sample_tick(generation))
                    .await
            }
        };

        if !applied {
            debug!(
                passenger = %tick.key.passenger_id,
                vehicle = %tick.key.vehicle,
                generation,
                "Tick produced no session change"
            );
        }
    }

    pub fn session(&self, passenger_id: &str, vehicle: &VehicleId) -> Option<&LiveLocationSession> {
        self.sessions
            .get(&SessionKey::new(passenger_id, vehicle))
            .map(|entry| &entry.session)
    }

    pub fn active_sessions(&self) -> Vec<&LiveLocationSession> {
        self.sessions
            .values()
            .map(|entry| &entry.session)
            .filter(|session| session.is_active())
            .collect()
    }

    /// Stop every timer; used on shutdown
    pub fn stop_all(&mut self) {
        for entry in self.sessions.values_mut() {
            entry.stop_timers();
        }
    }

    /// Run one session transition and its effects; false when the session
    /// is unknown or the transition produced nothing
    async fn transition<F>(&mut self, key: &SessionKey, step: F) -> bool
    where
        F: FnOnce(&mut LiveLocationSession) -> Vec<SessionEffect>,
    {
        let Some(entry) = self.sessions.get_mut(key) else {
            return false;
        };

        let effects = step(&mut entry.session);
        if effects.is_empty() {
            return false;
        }

        self.run_effects(key, effects).await;
        true
    }

    async fn run_effects(&mut self, key: &SessionKey, effects: Vec<SessionEffect>) {
        let span = handshake_span!(passenger = %key.passenger_id, vehicle = %key.vehicle);

        async {
            for effect in effects {
                match effect {
                    SessionEffect::StopTimers => {
                        if let Some(entry) = self.sessions.get_mut(key) {
                            entry.stop_timers();
                        }
                    }
                    SessionEffect::StartTimers { generation } => {
                        self.start_timers(key, generation);
                    }
                    SessionEffect::PublishRequest { minutes, at } => {
                        let update = PassengerUpdate::request(&key.passenger_id, minutes, at);
                        for topic in [
                            TopicBuilder::passenger_updates(&key.vehicle),
                            TopicBuilder::passenger_updates_broadcast(),
                        ] {
                            self.publish(&topic, &update).await;
                        }
                    }
                    SessionEffect::PublishLocation(point) => {
                        let update = PassengerUpdate::location(&key.passenger_id, point);
                        self.publish(&TopicBuilder::passenger_updates(&key.vehicle), &update)
                            .await;
                    }
                    SessionEffect::Notify(kind) => {
                        record_notification_metrics(&kind);
                        self.notifier
                            .notify(Notification::new(
                                key.passenger_id.clone(),
                                key.vehicle.clone(),
                                kind,
                            ))
                            .await;
                    }
                }
            }
        }
        .instrument(span)
        .await;
    }

    fn start_timers(&mut self, key: &SessionKey, generation: u64) {
        let countdown = self.ticker(key, generation, TickKind::Countdown, self.countdown_period);
        let sampler = self.ticker(key, generation, TickKind::Sample, self.sample_period);

        if let Some(entry) = self.sessions.get_mut(key) {
            entry.stop_timers();
            entry.countdown = countdown;
            entry.sampler = sampler;
        }
    }

    fn ticker(
        &self,
        key: &SessionKey,
        generation: u64,
        kind: TickKind,
        period: Duration,
    ) -> TimerHandle {
        let key = key.clone();
        TimerHandle::spawn_ticker(period, self.ticks.clone(), move || HandshakeTick {
            key: key.clone(),
            generation,
            kind,
        })
    }

    async fn publish(&self, topic: &str, update: &PassengerUpdate) {
        let payload = match update.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Failed to encode passenger update");
                return;
            }
        };

        if let Err(e) = self.transport.publish(topic, payload, false).await {
            warn!(topic = %topic, error = %e, "Failed to publish passenger update");
        }
    }
}

fn record_notification_metrics(kind: &NotificationKind) {
    match kind {
        NotificationKind::ShareAcknowledged => metrics().share_acknowledged(),
        NotificationKind::ShareStopped { reason } => {
            metrics().share_ended(reason.as_str());
            info!(reason = reason.as_str(), "Live-location share ended");
        }
        NotificationKind::InactivityPrompt => metrics().inactivity_prompted(),
        _ => {}
    }
}
