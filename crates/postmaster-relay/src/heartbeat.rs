//! Keepalive loop.
//!
//! Each side that needs to prove liveness owns a [`Keepalive`]. The loop stops
//! on its own the first time a beat cannot be sent, and is aborted when the
//! handle is cancelled or dropped.

use std::{fmt::Display, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

/// Interval between heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Shortest interval a keepalive will tick at.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to a running heartbeat task.
#[derive(Debug)]
pub struct Keepalive {
    task: JoinHandle<()>,
}

impl Keepalive {
    /// Call `beat` every `interval`, starting one interval from now.
    /// Intervals below [`MIN_INTERVAL`] are raised to it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F, E>(interval: Duration, mut beat: F) -> Self
    where
        F: FnMut() -> Result<(), E> + Send + 'static,
        E: Display + Send,
    {
        let interval = interval.max(MIN_INTERVAL);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if let Err(e) = beat() {
                    tracing::debug!(error = %e, "Heartbeat failed, stopping keepalive");
                    break;
                }
                tracing::trace!("Heartbeat sent");
            }
        });

        Self { task }
    }

    /// Stop the loop.
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// Whether the loop has stopped, by failure or cancellation.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        self.task.abort();
    }
}
