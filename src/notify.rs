//! User-facing notification decisions
//!
//! The core only decides *that* someone should be told something; delivery
//! (push, local banner, sound) belongs to the embedding application, which
//! plugs in its own [`Notifier`].

use crate::handshake::EndReason;
use crate::protocol::VehicleId;
use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationKind {
    /// Passenger's share request went out
    ShareStarted { minutes: u32 },
    /// Operator accepted the passenger's share
    ShareAcknowledged,
    /// Sharing ended by expiry, cancel or confirmed inactivity
    ShareStopped { reason: EndReason },
    /// Passenger hasn't moved; ask whether to stop sharing
    InactivityPrompt,
    /// Operator side: a passenger is waiting for pickup
    PickupRequest { passenger_id: String, minutes: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    /// Passenger id for commuter notifications, vehicle id for operator ones
    pub recipient: String,
    pub vehicle: VehicleId,
    #[serde(flatten)]
    pub kind: NotificationKind,
}

impl Notification {
    pub fn new(recipient: impl Into<String>, vehicle: VehicleId, kind: NotificationKind) -> Self {
        Self {
            recipient: recipient.into(),
            vehicle,
            kind,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Default notifier: records the decision in the structured log
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: Notification) {
        info!(
            recipient = %notification.recipient,
            vehicle = %notification.vehicle,
            kind = ?notification.kind,
            "Notification"
        );
    }
}
