//! Background expiry sweep
//!
//! One long-lived task started with the service:
//! 1. Ticks on a fixed interval (default: 1 minute)
//! 2. Each tick runs one [`LeaseCoordinator::sweep`] under its own deadline
//!    (default: 30 seconds); an overrunning sweep is dropped where it stands
//! 3. Missed ticks are skipped, never queued
//! 4. Errors are logged and the loop carries on
//!
//! Stopped through the [`CancellationToken`] it owns.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::coordinator::LeaseCoordinator;
use crate::config::LeaseConfig;

/// Configuration for the cleanup task.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Interval between sweeps
    pub interval: Duration,
    /// Budget for a single sweep
    pub tick_timeout: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            tick_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&LeaseConfig> for CleanupConfig {
    fn from(config: &LeaseConfig) -> Self {
        Self {
            interval: config.cleanup_interval(),
            tick_timeout: config.cleanup_timeout(),
        }
    }
}

/// Handle to the running cleanup task
#[derive(Debug)]
pub struct CleanupScheduler {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl CleanupScheduler {
    /// Start the sweep loop on the current runtime.
    pub fn spawn(coordinator: Arc<LeaseCoordinator>, config: CleanupConfig) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_cleanup_loop(coordinator, config, cancel.clone()));
        Self { cancel, handle }
    }

    /// Token that stops the loop when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!(error = %e, "Cleanup task ended abnormally");
        }
    }
}

async fn run_cleanup_loop(
    coordinator: Arc<LeaseCoordinator>,
    config: CleanupConfig,
    cancel: CancellationToken,
) {
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        interval_secs = config.interval.as_secs_f64(),
        tick_timeout_secs = config.tick_timeout.as_secs_f64(),
        "Channel cleanup task started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Channel cleanup task shutting down");
                break;
            }
            _ = ticker.tick() => {
                run_cleanup_tick(&coordinator, config.tick_timeout).await;
            }
        }
    }
}

async fn run_cleanup_tick(coordinator: &LeaseCoordinator, tick_timeout: Duration) {
    let sweeps = &coordinator.metrics().sweeps;

    match timeout(tick_timeout, coordinator.sweep()).await {
        Ok(Ok(report)) if report.expired == 0 => {
            sweeps.with_label_values(&["idle"]).inc();
            debug!("No expired channels");
        }
        Ok(Ok(_)) => {
            sweeps.with_label_values(&["ok"]).inc();
        }
        Ok(Err(e)) => {
            sweeps.with_label_values(&["error"]).inc();
            warn!(error = %e, "Channel cleanup sweep failed");
        }
        Err(_) => {
            sweeps.with_label_values(&["timeout"]).inc();
            warn!(
                timeout_secs = tick_timeout.as_secs_f64(),
                "Channel cleanup sweep abandoned after deadline"
            );
        }
    }
}
