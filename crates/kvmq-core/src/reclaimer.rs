//! Background reclamation of expired locks.
//!
//! Receives already sweep their own queue before picking a message. The
//! [`Reclaimer`] covers queues nobody is receiving from, so counters and
//! pending counts stay accurate while consumers are idle.

use crate::client::QueueClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "reclaimer_tests.rs"]
mod tests;

/// Handle to a running sweep task
pub struct Reclaimer {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Reclaimer {
    /// Start sweeping every queue of the client's namespace once per `interval`
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(client: Arc<dyn QueueClient>, interval: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "Starting reclaimer");

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match client.reclaim_all().await {
                            Ok(0) => {}
                            Ok(reclaimed) => debug!(reclaimed, "Sweep requeued expired messages"),
                            Err(err) => warn!(error = %err, "Reclaim sweep failed"),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Reclaimer stopped");
        });

        Self { shutdown, handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal the task to stop and wait for the sweep in progress to finish
    pub async fn shutdown(self) {
        // The receiver only disappears once the task has already exited
        let _ = self.shutdown.send(true);

        if let Err(err) = self.handle.await {
            warn!(error = %err, "Reclaimer task ended abnormally");
        }
    }
}
