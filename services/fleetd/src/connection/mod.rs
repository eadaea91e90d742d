//! Connection handle contract.
//!
//! The remote protocol client is an external collaborator. The supervisor
//! only sees it through these traits:
//! - [`Connector`] opens a session and returns a [`ConnectionHandle`] plus an
//!   [`EventSubscription`] carrying the session's lifecycle events
//! - [`Prober`] performs a connect-and-close reachability check
//!
//! Dropping the subscription is the unsubscribe: once the supervisor tears a
//! handle down it drops the receiver and no further event of that session
//! can reach it.

mod mock;
mod tcp;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_events::{Position, Telemetry};
use fleet_id::SessionId;
use thiserror::Error;
use tokio::sync::mpsc;

pub use mock::{MockBehavior, MockConnector, MockProber};
pub use tcp::{LineConnector, TcpProber};

/// Capacity of a session's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub credentials: Option<String>,
    pub version: Option<String>,
}

impl ConnectTarget {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Partial telemetry reported by a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryUpdate {
    pub position: Option<Position>,
    pub health: Option<f32>,
    pub food: Option<f32>,
    pub version: Option<String>,
}

impl TelemetryUpdate {
    /// Overwrites the fields this update carries.
    pub fn apply_to(self, telemetry: &mut Telemetry) {
        if let Some(position) = self.position {
            telemetry.position = Some(position);
        }
        if let Some(health) = self.health {
            telemetry.health = Some(health);
        }
        if let Some(food) = self.food {
            telemetry.food = Some(food);
        }
        if let Some(version) = self.version {
            telemetry.version = Some(version);
        }
    }
}

/// Lifecycle events of one session.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Session authenticated and usable.
    Ready,
    /// Session entered the remote world; carries the spawn origin if known.
    Established { origin: Option<Position> },
    Telemetry(TelemetryUpdate),
    PlayerJoined(String),
    PlayerLeft(String),
    Chat { from: String, message: String },
    /// Anything else the session received. Counts as activity only.
    Inbound(String),
    Error(String),
    /// The remote side kicked the session.
    ForcedDisconnect(String),
    Closed,
}

/// Errors from connectors, handles and probers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection refused: {0}")]
    Refused(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("connection closed")]
    Closed,
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => ConnectionError::Refused(err.to_string()),
            _ => ConnectionError::Io(err.to_string()),
        }
    }
}

/// A live session.
#[async_trait]
pub trait ConnectionHandle: Send + Sync + Debug {
    /// Identity of this session. Differs for every successful open.
    fn session_id(&self) -> SessionId;

    /// Send one command line.
    async fn send(&self, command: &str) -> Result<(), ConnectionError>;

    /// Close the session. Calling it twice must be harmless.
    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Receiving side of a session's lifecycle events.
#[derive(Debug)]
pub struct EventSubscription {
    rx: mpsc::Receiver<ConnectionEvent>,
}

impl EventSubscription {
    /// Creates a subscription and the sender a connector feeds it from.
    pub fn channel(capacity: usize) -> (mpsc::Sender<ConnectionEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }

    /// Next event, `None` once the session stops emitting.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.recv().await
    }
}

/// Result of a successful open.
#[derive(Debug)]
pub struct OpenedConnection {
    pub handle: Arc<dyn ConnectionHandle>,
    pub events: EventSubscription,
}

/// Opens sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, target: &ConnectTarget) -> Result<OpenedConnection, ConnectionError>;
}

/// Outcome of a successful reachability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub latency: Duration,
}

/// Lightweight connect-and-close reachability check.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &ConnectTarget) -> Result<ProbeOutcome, ConnectionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_update_only_overwrites_present_fields() {
        let mut telemetry = Telemetry {
            health: Some(20.0),
            food: Some(18.0),
            ..Default::default()
        };

        TelemetryUpdate {
            health: Some(12.5),
            ..Default::default()
        }
        .apply_to(&mut telemetry);

        assert_eq!(telemetry.health, Some(12.5));
        assert_eq!(telemetry.food, Some(18.0));
        assert!(telemetry.position.is_none());
    }

    #[test]
    fn test_io_error_mapping() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(matches!(
            ConnectionError::from(refused),
            ConnectionError::Refused(_)
        ));

        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(matches!(ConnectionError::from(reset), ConnectionError::Io(_)));
    }

    #[test]
    fn test_target_address() {
        let target = ConnectTarget {
            host: "play.example".to_string(),
            port: 25565,
            username: None,
            credentials: None,
            version: None,
        };
        assert_eq!(target.address(), "play.example:25565");
    }
}
