//! Core vocabulary: instance kinds, connection states, modes and telemetry.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Instance Kind
// =============================================================================

/// Which supervisor variant manages an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
    /// Persistent bidirectional session with modes.
    #[default]
    #[serde(alias = "minecraft")]
    Full,
    /// Reachability probes only.
    #[serde(alias = "panel")]
    StatusOnly,
}

impl InstanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceKind::Full => "full",
            InstanceKind::StatusOnly => "status_only",
        }
    }

    /// Whether this kind supports behavior modes.
    pub fn supports_modes(&self) -> bool {
        matches!(self, InstanceKind::Full)
    }
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" | "minecraft" => Ok(InstanceKind::Full),
            "status_only" | "panel" => Ok(InstanceKind::StatusOnly),
            other => Err(EventError::UnknownKind(other.to_string())),
        }
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Connection lifecycle state of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Repairing,
    /// Retry policy exhausted; waits for an explicit restart.
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Repairing => "repairing",
            ConnectionState::Failed => "failed",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Connecting or Repairing.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Repairing)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Modes
// =============================================================================

/// Restoration group of a mode. Groups restore in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeGroup {
    Observational,
    Movement,
    Combat,
    Chat,
}

/// A named optional behavior.
///
/// Variants are declared in restoration order, so the derived `Ord` is the
/// order in which enabled modes are re-activated after a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModeName {
    AiView,
    Follow,
    Patrol,
    Mining,
    AutoAttack,
    Invincible,
    AutoChat,
}

impl ModeName {
    /// Every mode, in restoration order.
    pub const ALL: [ModeName; 7] = [
        ModeName::AiView,
        ModeName::Follow,
        ModeName::Patrol,
        ModeName::Mining,
        ModeName::AutoAttack,
        ModeName::Invincible,
        ModeName::AutoChat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModeName::AiView => "aiView",
            ModeName::Follow => "follow",
            ModeName::Patrol => "patrol",
            ModeName::Mining => "mining",
            ModeName::AutoAttack => "autoAttack",
            ModeName::Invincible => "invincible",
            ModeName::AutoChat => "autoChat",
        }
    }

    pub fn group(&self) -> ModeGroup {
        match self {
            ModeName::AiView => ModeGroup::Observational,
            ModeName::Follow | ModeName::Patrol | ModeName::Mining => ModeGroup::Movement,
            ModeName::AutoAttack | ModeName::Invincible => ModeGroup::Combat,
            ModeName::AutoChat => ModeGroup::Chat,
        }
    }
}

impl fmt::Display for ModeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModeName {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        ModeName::ALL
            .into_iter()
            .find(|mode| mode.as_str().to_ascii_lowercase() == normalized)
            .ok_or_else(|| EventError::UnknownMode(s.to_string()))
    }
}

/// Which modes are enabled for an instance.
///
/// Entries explicitly set to `false` are kept so persisted records show the
/// operator's last choice, but equality only considers enabled modes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModeSet(BTreeMap<ModeName, bool>);

impl ModeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self, mode: ModeName) -> bool {
        self.0.get(&mode).copied().unwrap_or(false)
    }

    /// Records a mode's flag. Returns true if the effective value changed.
    pub fn set(&mut self, mode: ModeName, enabled: bool) -> bool {
        let before = self.is_enabled(mode);
        self.0.insert(mode, enabled);
        before != enabled
    }

    /// Enabled modes in restoration order.
    pub fn enabled(&self) -> impl Iterator<Item = ModeName> + '_ {
        self.0
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(mode, _)| *mode)
    }

    pub fn any_enabled(&self) -> bool {
        self.enabled().next().is_some()
    }

    /// Disables every mode, returning the ones that were enabled.
    pub fn disable_all(&mut self) -> Vec<ModeName> {
        let was_enabled: Vec<_> = self.enabled().collect();
        for mode in &was_enabled {
            self.0.insert(*mode, false);
        }
        was_enabled
    }
}

impl PartialEq for ModeSet {
    fn eq(&self, other: &Self) -> bool {
        self.enabled().eq(other.enabled())
    }
}

impl FromIterator<ModeName> for ModeSet {
    fn from_iter<I: IntoIterator<Item = ModeName>>(iter: I) -> Self {
        Self(iter.into_iter().map(|mode| (mode, true)).collect())
    }
}

// =============================================================================
// Telemetry
// =============================================================================

/// A point in the remote world.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Last-known telemetry reported by an instance's connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub food: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub players: BTreeSet<String>,
    /// Round-trip time of the last reachability probe.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

// =============================================================================
// Tests
// =============================================================================
