//! Broadcast event envelope.

use fleet_id::InstanceId;
use serde::{Deserialize, Serialize};

use crate::{AggregateStatus, LogEntry, StatusSnapshot};

/// Everything observers can receive from the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    InstanceStatus {
        instance_id: InstanceId,
        status: Box<StatusSnapshot>,
    },
    Aggregate {
        status: AggregateStatus,
    },
    Log {
        entry: LogEntry,
    },
    InstanceRemoved {
        instance_id: InstanceId,
    },
}

impl FleetEvent {
    /// Event type name as it appears on the wire.
    pub fn event_type(&self) -> &'static str {
        match self {
            FleetEvent::InstanceStatus { .. } => "instance_status",
            FleetEvent::Aggregate { .. } => "aggregate",
            FleetEvent::Log { .. } => "log",
            FleetEvent::InstanceRemoved { .. } => "instance_removed",
        }
    }

    /// The instance this event concerns, if any.
    pub fn instance_id(&self) -> Option<&InstanceId> {
        match self {
            FleetEvent::InstanceStatus { instance_id, .. }
            | FleetEvent::InstanceRemoved { instance_id } => Some(instance_id),
            FleetEvent::Log { entry } => entry.instance_id.as_ref(),
            FleetEvent::Aggregate { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LogLevel;

    #[test]
    fn test_event_is_internally_tagged() {
        let event = FleetEvent::InstanceRemoved {
            instance_id: InstanceId::parse("s1").unwrap(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.event_type());
        assert_eq!(json["instance_id"], "s1");
    }

    #[test]
    fn test_log_event_instance_id() {
        let id = InstanceId::parse("s2").unwrap();
        let event = FleetEvent::Log {
            entry: LogEntry::new(1, LogLevel::Warning, Some(id.clone()), "stuck"),
        };
        assert_eq!(event.instance_id(), Some(&id));
    }
}
