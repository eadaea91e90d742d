//! Fleet connection supervisor.
//!
//! Keeps a fleet of remote sessions connected. Each instance is owned by a
//! supervisor actor that connects, watches for activity, repairs broken
//! connections per its reconnect policy and restores the instance's modes
//! after every reconnect. The pool registers supervisors, routes operations
//! to them and aggregates their status.
//!
//! ## Architecture
//!
//! ```text
//! InstancePool
//! ├── InstanceActor(id)   (Full: session + modes)
//! ├── InstanceActor(id)   (StatusOnly: reachability probes)
//! └── StatusBroadcaster   (status, aggregate and log events)
//! ```
//!
//! ## Modules
//!
//! - `actors`: Actor framework, timers and the instance supervisor
//! - `connection`: Connection, connector and prober contracts plus TCP and mock implementations
//! - `roster`: Instance configs and their SQLite persistence
//! - `pool`: The instance registry

pub mod activity;
pub mod actors;
pub mod broadcast;
pub mod config;
pub mod connection;
pub mod error;
pub mod logs;
pub mod modes;
pub mod pool;
pub mod reconnect;
pub mod remote;
pub mod roster;
pub mod status_loop;

// Re-export commonly used types
pub use broadcast::StatusBroadcaster;
pub use config::{Config, SupervisorTimings};
pub use connection::{MockBehavior, MockConnector, MockProber};
pub use error::{PoolError, SupervisorError};
pub use pool::{InstancePool, PoolDeps, SingleConnectOptions};
pub use reconnect::{ReconnectPolicy, RetryState};
pub use roster::{ConfigPatch, InstanceConfig, MemoryRoster, RosterStore, SqliteRoster};
