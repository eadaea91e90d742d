//! Log entries kept in the per-instance and global ring buffers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use fleet_id::InstanceId;
use serde::{Deserialize, Serialize};

use crate::EventError;

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
    /// Chat traffic relayed from a session.
    Chat,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Success => "success",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Chat => "chat",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "success" => Ok(LogLevel::Success),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "chat" => Ok(LogLevel::Chat),
            other => Err(EventError::UnknownLogLevel(other.to_string())),
        }
    }
}

/// One appended log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Process-wide sequence number.
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,
    pub message: String,
}

impl LogEntry {
    pub fn new(
        seq: u64,
        level: LogLevel,
        instance_id: Option<InstanceId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            seq,
            at: Utc::now(),
            level,
            instance_id,
            message: message.into(),
        }
    }
}
