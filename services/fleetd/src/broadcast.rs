//! Status broadcaster.
//!
//! Fan-out sink for everything observers may want: per-instance status
//! changes, the fleet aggregate, and log entries. Sending never blocks; a
//! lagging subscriber loses the oldest events and is told so by the
//! broadcast channel. The broadcaster also owns the global log ring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use fleet_events::{AggregateStatus, FleetEvent, LogEntry, LogLevel, StatusSnapshot};
use fleet_id::InstanceId;
use tokio::sync::broadcast;
use tracing::trace;

use crate::logs::{LogRing, GLOBAL_LOG_CAPACITY};

/// Default capacity of the event channel.
pub const EVENT_BUFFER: usize = 1024;

pub struct StatusBroadcaster {
    tx: broadcast::Sender<FleetEvent>,
    logs: Mutex<LogRing>,
    seq: AtomicU64,
    published: AtomicU64,
}

impl StatusBroadcaster {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self {
            tx,
            logs: Mutex::new(LogRing::new(GLOBAL_LOG_CAPACITY)),
            seq: AtomicU64::new(0),
            published: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Events handed to the channel so far.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn publish_status(&self, snapshot: &StatusSnapshot) {
        self.publish(FleetEvent::InstanceStatus {
            instance_id: snapshot.id.clone(),
            status: Box::new(snapshot.clone()),
        });
    }

    pub fn publish_aggregate(&self, status: AggregateStatus) {
        self.publish(FleetEvent::Aggregate { status });
    }

    pub fn publish_removed(&self, instance_id: &InstanceId) {
        self.publish(FleetEvent::InstanceRemoved {
            instance_id: instance_id.clone(),
        });
    }

    /// Builds an entry with the next sequence number, keeps it in the global
    /// ring and publishes it.
    pub fn log(
        &self,
        instance_id: Option<&InstanceId>,
        level: LogLevel,
        message: impl Into<String>,
    ) -> LogEntry {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = LogEntry::new(seq, level, instance_id.cloned(), message);
        self.logs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry.clone());
        self.publish(FleetEvent::Log {
            entry: entry.clone(),
        });
        entry
    }

    /// Newest `limit` global entries, oldest first.
    pub fn recent_logs(&self, limit: usize) -> Vec<LogEntry> {
        self.logs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .recent(limit)
    }

    fn publish(&self, event: FleetEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        // No subscribers is not an error.
        if self.tx.send(event).is_err() {
            trace!("Fleet event dropped, no subscribers");
        }
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new(EVENT_BUFFER)
    }
}
