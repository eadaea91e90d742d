//! Errors crossing the supervisor and pool boundaries.

use std::time::Duration;

use fleet_events::{InstanceKind, ModeName};
use fleet_id::InstanceId;
use thiserror::Error;

use crate::connection::ConnectionError;
use crate::remote::RemoteError;
use crate::roster::{ConfigError, RosterError};

/// Failure of an operation on a single instance supervisor.
#[derive(Debug, Error, Clone)]
pub enum SupervisorError {
    /// The instance was disconnected for good; nothing may act on it.
    #[error("instance has been destroyed")]
    Destroyed,

    #[error("instance is not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error("connection did not become ready within {0:?}")]
    Timeout(Duration),

    /// The attempt ended before the connection became ready.
    #[error("connection attempt interrupted: {0}")]
    Interrupted(String),

    #[error("instance has no fixed username")]
    MissingIdentity,

    #[error("retry policy exhausted after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("{operation} is not supported by {kind} instances")]
    Unsupported {
        operation: &'static str,
        kind: InstanceKind,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("mode {mode} failed to activate: {reason}")]
    ModeActivation { mode: ModeName, reason: String },

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl SupervisorError {
    /// Whether the failure is part of normal reconnection churn.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SupervisorError::Connection(_)
                | SupervisorError::Timeout(_)
                | SupervisorError::Interrupted(_)
        )
    }
}

/// Failure at the pool boundary.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("instance not found: {0}")]
    NotFound(InstanceId),

    /// The supervisor stopped before answering.
    #[error("instance {0} is no longer running")]
    Unavailable(InstanceId),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("instance {id}: {source}")]
    Supervisor {
        id: InstanceId,
        #[source]
        source: SupervisorError,
    },

    #[error(transparent)]
    Roster(#[from] RosterError),
}

impl PoolError {
    pub(crate) fn supervisor(id: &InstanceId, source: SupervisorError) -> Self {
        PoolError::Supervisor {
            id: id.clone(),
            source,
        }
    }
}
