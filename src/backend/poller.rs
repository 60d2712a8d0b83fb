//! Periodic pull of authoritative paid-fare counts

use super::{count_paid, BackendApi, BackendError};
use crate::error::sanitize_error_message;
use crate::fleet::VehicleReconciler;
use crate::observability::metrics::metrics;
use crate::protocol::VehicleId;
use chrono::{DateTime, Local, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Counts from one successful poll, handed to the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub struct PollResult {
    pub counts: BTreeMap<VehicleId, u32>,
    pub polled_at: DateTime<Utc>,
}

pub struct BackendPoller {
    backend: Arc<dyn BackendApi>,
    interval: Duration,
}

impl BackendPoller {
    pub fn new(backend: Arc<dyn BackendApi>, interval: Duration) -> Self {
        Self { backend, interval }
    }

    /// Fetch `date`'s tickets and count paid ones per vehicle
    pub async fn poll_once(
        &self,
        date: NaiveDate,
    ) -> Result<BTreeMap<VehicleId, u32>, BackendError> {
        let started = Instant::now();

        match self.backend.fetch_tickets(date).await {
            Ok(records) => {
                let counts = count_paid(&records);
                metrics().poll_completed(started.elapsed());
                debug!(
                    date = %date,
                    tickets = records.len(),
                    vehicles = counts.len(),
                    "Ticket poll complete"
                );
                Ok(counts)
            }
            Err(e) => {
                metrics().poll_failed();
                Err(e)
            }
        }
    }

    /// Poll and merge straight into a reconciler; returns what was merged
    pub async fn poll_into(
        &self,
        date: NaiveDate,
        reconciler: &mut VehicleReconciler,
    ) -> Result<BTreeMap<VehicleId, u32>, BackendError> {
        let counts = self.poll_once(date).await?;
        let now = Utc::now();
        for (vehicle, paid) in &counts {
            reconciler.merge_from_poll(vehicle, *paid, now).await;
        }
        Ok(counts)
    }

    /// Poll on a fixed interval until shutdown, sending results to the
    /// dispatcher. Failures are logged and the next tick proceeds as usual.
    pub fn spawn(
        self,
        results: mpsc::Sender<PollResult>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = self.interval.as_secs(), "Backend poller started");

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let today = Local::now().date_naive();
                        match self.poll_once(today).await {
                            Ok(counts) => {
                                let result = PollResult { counts, polled_at: Utc::now() };
                                if results.send(result).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(
                                    error = %sanitize_error_message(&e.to_string()),
                                    "Ticket poll failed; retrying next interval"
                                );
                            }
                        }
                    }
                }
            }

            info!("Backend poller stopped");
        })
    }
}
