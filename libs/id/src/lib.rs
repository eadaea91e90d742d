//! # fleet-id
//!
//! Identifier types shared by the fleet supervisor crates.
//!
//! ## Design Principles
//!
//! - Instance ids are stable across process restarts and may be chosen by
//!   the operator (`s1`, `lobby`, `default`)
//! - Generated instance ids use `server_{ulid}` so they sort by creation time
//! - Session ids are system-generated and identify one opened connection
//!
//! ## ID Format
//!
//! Session ids use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `sess_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `server_01hv4z3mxnkpqr9hstz7wcld4e`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
