//! Lease renewal for the job being processed.
//!
//! The heartbeat is started just before the pipeline runs and stopped as
//! soon as it returns. Dropping it without calling [`LeaseHeartbeat::stop`]
//! aborts the background task, so it never outlives its job.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::message::JobMessage;

/// Periodically extends the lease of one message.
pub struct LeaseHeartbeat {
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<u32>>,
}

impl LeaseHeartbeat {
    /// Spawn the renewal loop. The first renewal fires one `period` from now.
    pub fn start(message: Arc<dyn JobMessage>, period: Duration, run_id: u64) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut renewals = 0u32;

            loop {
                tokio::select! {
                    biased;
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match message.in_progress().await {
                            Ok(()) => {
                                renewals += 1;
                                tracing::debug!(run_id, renewals, "Renewed job lease");
                            }
                            Err(e) => {
                                tracing::warn!(run_id, error = %e, "Failed to renew job lease");
                            }
                        }
                    }
                }
            }
            renewals
        });

        Self {
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Stop renewing and wait for the loop to exit.
    ///
    /// Returns the number of successful renewals. No renewal is issued after
    /// this returns.
    pub async fn stop(mut self) -> u32 {
        let _ = self.shutdown_tx.send(true);
        match self.handle.take() {
            Some(handle) => handle.await.unwrap_or(0),
            None => 0,
        }
    }
}

impl Drop for LeaseHeartbeat {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
