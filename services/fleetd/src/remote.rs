//! Remote-management collaborator.
//!
//! The management panel sits beside the connection: it can run console
//! commands and send power signals to the server hosting an instance. The
//! supervisor only uses it as a fallback for side effects (operator grants,
//! scheduled restarts, invincibility), never for its own connection
//! lifecycle.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use fleet_id::InstanceId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Power signal understood by the management panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerSignal {
    Start,
    Stop,
    Restart,
    Kill,
}

impl PowerSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerSignal::Start => "start",
            PowerSignal::Stop => "stop",
            PowerSignal::Restart => "restart",
            PowerSignal::Kill => "kill",
        }
    }
}

impl fmt::Display for PowerSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PowerSignal {
    type Err = RemoteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(PowerSignal::Start),
            "stop" => Ok(PowerSignal::Stop),
            "restart" => Ok(PowerSignal::Restart),
            "kill" => Ok(PowerSignal::Kill),
            other => Err(RemoteError::InvalidSignal(other.to_string())),
        }
    }
}

/// Errors from the management panel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote management is not configured for {0}")]
    NotConfigured(InstanceId),

    #[error("invalid power signal: {0}")]
    InvalidSignal(String),

    #[error("remote management request failed: {0}")]
    Request(String),
}

/// Management panel operations.
#[async_trait]
pub trait RemoteManagement: Send + Sync {
    async fn send_command(&self, instance_id: &InstanceId, text: &str) -> Result<(), RemoteError>;

    async fn send_power_signal(
        &self,
        instance_id: &InstanceId,
        signal: PowerSignal,
    ) -> Result<(), RemoteError>;
}

/// Used when no panel is configured; every call fails with `NotConfigured`.
#[derive(Debug, Default)]
pub struct UnconfiguredRemote;

#[async_trait]
impl RemoteManagement for UnconfiguredRemote {
    async fn send_command(&self, instance_id: &InstanceId, text: &str) -> Result<(), RemoteError> {
        debug!(instance_id = %instance_id, command = text, "No remote management configured");
        Err(RemoteError::NotConfigured(instance_id.clone()))
    }

    async fn send_power_signal(
        &self,
        instance_id: &InstanceId,
        signal: PowerSignal,
    ) -> Result<(), RemoteError> {
        debug!(instance_id = %instance_id, signal = %signal, "No remote management configured");
        Err(RemoteError::NotConfigured(instance_id.clone()))
    }
}
