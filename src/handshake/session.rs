//! Pure live-location session state machine
//!
//! [`LiveLocationSession`] does no I/O. Every transition returns the list of
//! [`SessionEffect`]s the owner must carry out (publish, notify, start or stop
//! timers), which keeps the machine testable without a broker or a clock.

use crate::config::HandshakeSection;
use crate::notify::NotificationKind;
use crate::protocol::{GeoPoint, VehicleId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Requested,
    Acknowledged,
    Expired,
    Cancelled,
}

/// Why an active session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    /// Countdown reached zero
    Expired,
    /// Passenger stopped sharing
    Cancelled,
    /// Passenger confirmed the inactivity prompt
    Inactivity,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
            Self::Inactivity => "inactivity",
        }
    }
}

/// Tunables shared by every session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandshakeSettings {
    pub default_minutes: u32,
    pub still_threshold_m: f64,
    pub still_ticks_limit: u32,
}

impl From<&HandshakeSection> for HandshakeSettings {
    fn from(section: &HandshakeSection) -> Self {
        Self {
            default_minutes: section.default_minutes,
            still_threshold_m: section.still_threshold_m,
            still_ticks_limit: section.still_ticks_limit,
        }
    }
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self::from(&HandshakeSection::default())
    }
}

/// Work the owner performs after a transition, in order
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEffect {
    /// Publish a share request to the vehicle and broadcast topics
    PublishRequest { minutes: u32, at: DateTime<Utc> },
    /// Publish the passenger's position to the vehicle
    PublishLocation(GeoPoint),
    Notify(NotificationKind),
    /// Start countdown and sampling timers tagged with `generation`
    StartTimers { generation: u64 },
    StopTimers,
}

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("Share duration must be at least one minute")]
    ZeroMinutes,
}

/// One passenger sharing location with one vehicle
#[derive(Debug, Clone, PartialEq)]
pub struct LiveLocationSession {
    passenger_id: String,
    vehicle_id: VehicleId,
    settings: HandshakeSettings,
    status: SessionStatus,
    requested_minutes: u32,
    remaining_minutes: u32,
    ack_timestamp: Option<DateTime<Utc>>,
    /// Anchor for movement detection; only moves when the passenger does
    last_position: Option<GeoPoint>,
    /// Most recent fix, published on every sample tick
    latest_fix: Option<GeoPoint>,
    still_ticks: u32,
    inactivity_prompted: bool,
    /// Bumped on every start and end so ticks from old timers are ignored
    generation: u64,
}

impl LiveLocationSession {
    pub fn new(passenger_id: &str, vehicle_id: VehicleId, settings: HandshakeSettings) -> Self {
        Self {
            passenger_id: passenger_id.to_string(),
            vehicle_id,
            settings,
            status: SessionStatus::Idle,
            requested_minutes: settings.default_minutes,
            remaining_minutes: settings.default_minutes,
            ack_timestamp: None,
            last_position: None,
            latest_fix: None,
            still_ticks: 0,
            inactivity_prompted: false,
            generation: 0,
        }
    }

    pub fn passenger_id(&self) -> &str {
        &self.passenger_id
    }

    pub fn vehicle_id(&self) -> &VehicleId {
        &self.vehicle_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn requested_minutes(&self) -> u32 {
        self.requested_minutes
    }

    pub fn remaining_minutes(&self) -> u32 {
        self.remaining_minutes
    }

    pub fn ack_timestamp(&self) -> Option<DateTime<Utc>> {
        self.ack_timestamp
    }

    pub fn still_ticks(&self) -> u32 {
        self.still_ticks
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn inactivity_pending(&self) -> bool {
        self.inactivity_prompted
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            SessionStatus::Requested | SessionStatus::Acknowledged
        )
    }

    /// Start (or restart) sharing for `minutes`.
    ///
    /// Overwrites whatever state the session was in; an active session is
    /// ended silently first so its timers stop.
    pub fn request(
        &mut self,
        minutes: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionEffect>, SessionError> {
        if minutes == 0 {
            return Err(SessionError::ZeroMinutes);
        }

        let mut effects = Vec::new();
        if self.is_active() {
            effects.push(SessionEffect::StopTimers);
        }

        self.generation += 1;
        self.status = SessionStatus::Requested;
        self.requested_minutes = minutes;
        self.remaining_minutes = minutes;
        self.ack_timestamp = None;
        self.last_position = None;
        self.still_ticks = 0;
        self.inactivity_prompted = false;

        effects.push(SessionEffect::PublishRequest { minutes, at: now });
        effects.push(SessionEffect::Notify(NotificationKind::ShareStarted {
            minutes,
        }));
        effects.push(SessionEffect::StartTimers {
            generation: self.generation,
        });

        Ok(effects)
    }

    /// Honor the first acknowledgment; later ones are no-ops
    pub fn acknowledge(&mut self, now: DateTime<Utc>) -> Vec<SessionEffect> {
        if self.status != SessionStatus::Requested || self.ack_timestamp.is_some() {
            return Vec::new();
        }

        self.status = SessionStatus::Acknowledged;
        self.ack_timestamp = Some(now);
        vec![SessionEffect::Notify(NotificationKind::ShareAcknowledged)]
    }

    /// One countdown interval elapsed
    pub fn countdown_tick(&mut self, generation: u64) -> Vec<SessionEffect> {
        if !self.accepts_tick(generation) {
            return Vec::new();
        }

        self.remaining_minutes = self.remaining_minutes.saturating_sub(1);
        if self.remaining_minutes == 0 {
            return self.end(EndReason::Expired);
        }
        Vec::new()
    }

    /// Remember the newest position fix without evaluating movement
    pub fn record_position(&mut self, point: GeoPoint) {
        self.latest_fix = Some(point);
    }

    /// One sampling interval elapsed: publish the latest fix and run
    /// movement detection against it
    pub fn sample_tick(&mut self, generation: u64) -> Vec<SessionEffect> {
        if !self.accepts_tick(generation) {
            return Vec::new();
        }

        let Some(sample) = self.latest_fix else {
            return Vec::new();
        };

        let mut effects = vec![SessionEffect::PublishLocation(sample)];

        match self.last_position {
            None => {
                self.last_position = Some(sample);
                self.still_ticks = 0;
            }
            Some(anchor) => {
                if anchor.planar_distance_m(&sample) < self.settings.still_threshold_m {
                    self.still_ticks = self.still_ticks.saturating_add(1);
                } else {
                    self.still_ticks = 0;
                    self.last_position = Some(sample);
                }
            }
        }

        if self.still_ticks >= self.settings.still_ticks_limit && !self.inactivity_prompted {
            self.inactivity_prompted = true;
            effects.push(SessionEffect::Notify(NotificationKind::InactivityPrompt));
        }

        effects
    }

    /// Passenger stops sharing
    pub fn cancel(&mut self) -> Vec<SessionEffect> {
        if !self.is_active() {
            return Vec::new();
        }
        self.end(EndReason::Cancelled)
    }

    /// Passenger agreed to stop after the inactivity prompt
    pub fn confirm_inactivity(&mut self) -> Vec<SessionEffect> {
        if !self.is_active() || !self.inactivity_prompted {
            return Vec::new();
        }
        self.end(EndReason::Inactivity)
    }

    /// Passenger chose to keep sharing; the still streak starts over
    pub fn dismiss_inactivity(&mut self) {
        self.inactivity_prompted = false;
        self.still_ticks = 0;
    }

    fn accepts_tick(&self, generation: u64) -> bool {
        self.is_active() && generation == self.generation
    }

    fn end(&mut self, reason: EndReason) -> Vec<SessionEffect> {
        self.status = match reason {
            EndReason::Expired => SessionStatus::Expired,
            EndReason::Cancelled | EndReason::Inactivity => SessionStatus::Cancelled,
        };
        self.remaining_minutes = self.requested_minutes;
        self.ack_timestamp = None;
        self.still_ticks = 0;
        self.inactivity_prompted = false;
        self.generation += 1;

        vec![
            SessionEffect::StopTimers,
            SessionEffect::Notify(NotificationKind::ShareStopped { reason }),
        ]
    }
}
