//! Mode restoration after a (re)connect.
//!
//! Enabled modes are re-activated one by one in [`ModeName`] order:
//! observational, movement, combat, chat. Each activation is isolated; a
//! failing mode is reported and the remaining modes still run.

use fleet_events::{ModeName, ModeSet};

use crate::modes::{EffectorContext, EffectorError, ModeEffector};

/// Outcome of one restoration pass.
#[derive(Debug, Default)]
pub struct RestoreReport {
    /// Modes re-activated, in the order they were attempted.
    pub restored: Vec<ModeName>,
    /// Modes whose activation failed; the caller must disable them.
    pub failed: Vec<(ModeName, EffectorError)>,
}

impl RestoreReport {
    pub fn attempted(&self) -> usize {
        self.restored.len() + self.failed.len()
    }
}

/// Re-activates every enabled mode of `modes`.
pub async fn restore_modes<E>(modes: &ModeSet, effector: &E, ctx: &EffectorContext) -> RestoreReport
where
    E: ModeEffector + ?Sized,
{
    let mut report = RestoreReport::default();
    let mut order: Vec<ModeName> = modes.enabled().collect();
    order.sort_by_key(|mode| (mode.group(), *mode));

    for mode in order {
        match effector.activate(mode, ctx).await {
            Ok(()) => report.restored.push(mode),
            Err(e) => report.failed.push((mode, e)),
        }
    }
    report
}
