//! Status projections: per-instance snapshots and the fleet aggregate.

use chrono::{DateTime, Utc};
use fleet_id::InstanceId;
use serde::{Deserialize, Serialize};

use crate::{ConnectionState, InstanceKind, ModeSet, Position, Telemetry};

/// Retry bookkeeping visible to observers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryView {
    /// Consecutive failed attempts since the last successful connect.
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_reason: Option<String>,
    /// Repair cycles entered over the instance's lifetime.
    pub repairs: u64,
    /// The retry policy gave up.
    pub exhausted: bool,
}

/// Periodic restart schedule, if one is configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartScheduleView {
    pub interval_minutes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_restart_at: Option<DateTime<Utc>>,
}

/// Read-only projection of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub id: InstanceId,
    pub display_name: String,
    pub kind: InstanceKind,
    pub state: ConnectionState,
    pub connected: bool,
    /// `host:port` of the remote endpoint.
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub telemetry: Telemetry,
    /// Origin recorded when the session was established.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline: Option<Position>,
    pub modes: ModeSet,
    pub retry: RetryView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_schedule: Option<RestartScheduleView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    /// Initial snapshot of a freshly created instance.
    pub fn initial(
        id: InstanceId,
        display_name: String,
        kind: InstanceKind,
        address: String,
    ) -> Self {
        Self {
            id,
            display_name,
            kind,
            state: ConnectionState::Disconnected,
            connected: false,
            address,
            username: None,
            telemetry: Telemetry::default(),
            baseline: None,
            modes: ModeSet::default(),
            retry: RetryView::default(),
            restart_schedule: None,
            connected_at: None,
            last_activity_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Compares everything except `updated_at`.
    pub fn same_content(&self, other: &StatusSnapshot) -> bool {
        let mut probe = other.clone();
        probe.updated_at = self.updated_at;
        *self == probe
    }

    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            kind: self.kind,
            state: self.state,
            connected: self.connected,
            address: self.address.clone(),
        }
    }
}

/// Per-instance line of the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub display_name: String,
    pub kind: InstanceKind,
    pub state: ConnectionState,
    pub connected: bool,
    pub address: String,
}

/// Telemetry of the instance chosen to stand in for the whole fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepresentativeView {
    pub id: InstanceId,
    pub address: String,
    pub telemetry: Telemetry,
    pub modes: ModeSet,
}

/// Fleet-wide summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStatus {
    /// At least one instance is connected.
    pub connected: bool,
    pub connected_bots: usize,
    pub total_bots: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub representative: Option<RepresentativeView>,
    pub instances: Vec<InstanceSummary>,
}

impl AggregateStatus {
    /// Builds the aggregate from snapshots given in roster order.
    ///
    /// The representative is the first connected snapshot.
    pub fn from_snapshots<'a, I>(snapshots: I) -> Self
    where
        I: IntoIterator<Item = &'a StatusSnapshot>,
    {
        let mut aggregate = AggregateStatus::default();
        for snapshot in snapshots {
            aggregate.total_bots += 1;
            if snapshot.connected {
                aggregate.connected_bots += 1;
                if aggregate.representative.is_none() {
                    aggregate.representative = Some(RepresentativeView {
                        id: snapshot.id.clone(),
                        address: snapshot.address.clone(),
                        telemetry: snapshot.telemetry.clone(),
                        modes: snapshot.modes.clone(),
                    });
                }
            }
            aggregate.instances.push(snapshot.summary());
        }
        aggregate.connected = aggregate.connected_bots > 0;
        aggregate
    }
}

// =============================================================================
// Tests
// =============================================================================
