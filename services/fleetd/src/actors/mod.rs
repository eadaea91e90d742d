//! Actors for the fleet supervisor.
//!
//! Each managed instance is owned by exactly one [`InstanceActor`]. The actor
//! holds the connection handle, timers and retry state; nothing else mutates
//! them. The pool talks to actors only through their mailboxes and reads
//! their state through a watch channel.
//!
//! ## Design Principles
//!
//! - **One actor per instance**: connection lifecycle, mode restoration and
//!   schedules for an instance all run on its task
//! - **Generation tags**: every message produced by a timer or a session pump
//!   carries the generation it belongs to, so work from a torn-down
//!   connection is dropped instead of acted on
//! - **Crash isolation**: a failing instance never affects its siblings

mod framework;
mod instance;
mod restore;
mod timers;

pub use framework::{spawn_actor, Actor, ActorContext, ActorError, ActorHandle, ActorRef, Mailbox, Message};
pub use instance::{
    lock_logs, spawn_instance, InstanceActor, InstanceDeps, InstanceDriver, InstanceMessage,
    SpawnedInstance, INSTANCE_MAILBOX_CAPACITY,
};
pub use restore::{restore_modes, RestoreReport};
pub use timers::{TimerKind, Timers};
