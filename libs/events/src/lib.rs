//! # fleet-events
//!
//! Data published by the fleet supervisor to its observers.
//!
//! ## Design Principles
//!
//! - Everything here is a read-only projection; the supervisor owns the
//!   source of truth and rebuilds these values on every change
//! - Wire names are snake_case, except mode names which keep their
//!   historical camelCase spelling (`autoAttack`, `aiView`, ...)
//! - No credentials ever appear in a snapshot
//!
//! ## Event Stream
//!
//! Observers receive [`FleetEvent`]s:
//! - `instance_status` whenever one instance's snapshot changes
//! - `aggregate` whenever the fleet-wide summary is recomputed
//! - `log` for every appended log entry
//! - `instance_removed` after an instance leaves the roster

mod error;
mod event;
mod log;
mod status;
mod types;

pub use error::EventError;
pub use event::FleetEvent;
pub use log::{LogEntry, LogLevel};
pub use status::*;
pub use types::*;
