//! Periodic fleet status log.
//!
//! Logs the aggregate connection count on a fixed interval so an operator
//! tailing the daemon sees fleet health without subscribing to events.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::pool::InstancePool;

/// Ticks with no connected instance before the loop escalates to `error`.
pub const ESCALATE_AFTER_TICKS: u32 = 3;

/// Tracks how long the fleet has been fully disconnected.
#[derive(Debug, Default)]
pub struct OutageTracker {
    consecutive: u32,
}

/// What a tick should report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetHealth {
    /// Nothing is registered.
    Empty,
    Healthy,
    /// No instance connected, within the grace ticks.
    Degraded { consecutive: u32 },
    /// No instance connected for too long.
    Down { consecutive: u32 },
}

impl OutageTracker {
    pub fn observe(&mut self, connected: usize, total: usize) -> FleetHealth {
        if total == 0 {
            self.consecutive = 0;
            return FleetHealth::Empty;
        }
        if connected > 0 {
            self.consecutive = 0;
            return FleetHealth::Healthy;
        }
        self.consecutive += 1;
        if self.consecutive < ESCALATE_AFTER_TICKS {
            FleetHealth::Degraded {
                consecutive: self.consecutive,
            }
        } else {
            FleetHealth::Down {
                consecutive: self.consecutive,
            }
        }
    }
}

/// Run the status loop until shutdown.
pub async fn run_status_loop(
    pool: Arc<InstancePool>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(interval_secs = interval.as_secs(), "Starting fleet status loop");

    let mut tracker = OutageTracker::default();
    let mut interval_timer = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                let aggregate = pool.get_aggregate_status().await;
                let connected = aggregate.connected_bots;
                let total = aggregate.total_bots;

                match tracker.observe(connected, total) {
                    FleetHealth::Empty => debug!("No instances registered"),
                    FleetHealth::Healthy => info!(connected, total, "Fleet status"),
                    FleetHealth::Degraded { consecutive } => {
                        warn!(connected, total, consecutive, "No instance connected");
                    }
                    FleetHealth::Down { consecutive } => {
                        error!(connected, total, consecutive, "Fleet fully disconnected");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Status loop shutting down");
                    break;
                }
            }
        }
    }

    Ok(())
}
