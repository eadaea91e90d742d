//! Inbound-activity watchdog.
//!
//! The monitor remembers when the connection last produced any event. A
//! periodic ticker posts a check message into the owning actor; the actor
//! asks [`ActivityMonitor::check`] whether the silence exceeded the
//! threshold. A monitor trips at most once per `start`, so one stall
//! produces exactly one repair.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::actors::{ActorHandle, Message};

#[derive(Debug)]
pub struct ActivityMonitor {
    threshold: Duration,
    check_interval: Duration,
    last_activity: Instant,
    last_activity_at: Option<DateTime<Utc>>,
    ticker: Option<JoinHandle<()>>,
    tripped: bool,
}

impl ActivityMonitor {
    pub fn new(threshold: Duration, check_interval: Duration) -> Self {
        Self {
            threshold,
            check_interval,
            last_activity: Instant::now(),
            last_activity_at: None,
            ticker: None,
            tripped: false,
        }
    }

    /// (Re)starts the ticker with a fresh clock. Any previous ticker is
    /// cancelled first.
    pub fn start<M, F>(&mut self, mailbox: &ActorHandle<M>, make: F)
    where
        M: Message,
        F: Fn() -> M + Send + 'static,
    {
        self.stop();
        self.reset();

        let mailbox = mailbox.clone();
        let period = self.check_interval;
        self.ticker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if mailbox.send(make()).await.is_err() {
                    break;
                }
            }
        }));
    }

    /// Cancels the ticker. Safe to call when not running.
    pub fn stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker
            .as_ref()
            .is_some_and(|ticker| !ticker.is_finished())
    }

    /// Any inbound event counts.
    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Some(Utc::now());
    }

    /// Restarts the silence clock and re-arms the trip.
    pub fn reset(&mut self) {
        self.last_activity = Instant::now();
        self.tripped = false;
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn last_activity_at(&self) -> Option<DateTime<Utc>> {
        self.last_activity_at
    }

    /// True exactly once when the silence exceeds the threshold.
    pub fn check(&mut self) -> bool {
        if self.tripped || !self.is_running() {
            return false;
        }
        if self.idle_for() > self.threshold {
            self.tripped = true;
            return true;
        }
        false
    }
}

impl Drop for ActivityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
