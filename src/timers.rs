//! Cancellable periodic timers that feed events into a channel

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Owns one periodic task. Cancelling is idempotent, and dropping the handle
/// cancels the task.
#[derive(Debug, Default)]
pub struct TimerHandle {
    handle: Option<JoinHandle<()>>,
}

impl TimerHandle {
    /// Send `make_event()` every `period`, starting one period from now.
    ///
    /// The task ends on its own once the receiver is gone.
    pub fn spawn_ticker<E, F>(period: Duration, sender: mpsc::Sender<E>, make_event: F) -> Self
    where
        E: Send + 'static,
        F: Fn() -> E + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                if sender.send(make_event()).await.is_err() {
                    break;
                }
            }
        });

        Self {
            handle: Some(handle),
        }
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
