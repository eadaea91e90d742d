//! Instance roster: persisted instance configuration.
//!
//! The roster is the durable list of instances the daemon manages. Each
//! entry is a JSON-shaped [`InstanceConfig`]; the store keeps insertion
//! order so the fleet comes back up in the order it was built.

mod store;

use std::sync::Mutex;
use std::time::Duration;

use fleet_events::{InstanceKind, ModeSet};
use fleet_id::InstanceId;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::ConnectTarget;

pub use store::SqliteRoster;

/// Port used when a config does not name one.
pub const DEFAULT_PORT: u16 = 25565;

/// Errors from roster persistence.
#[derive(Debug, Error)]
pub enum RosterError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid stored config: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("instance not in roster: {0}")]
    NotFound(InstanceId),
}

/// Invalid instance configuration. Never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("instance {0} has no address")]
    MissingAddress(InstanceId),

    #[error("instance {0} has an invalid port")]
    InvalidPort(InstanceId),

    #[error("instance {id} requires credentials for user {username}")]
    MissingCredentials { id: InstanceId, username: String },
}

/// Auto-chat settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoChatConfig {
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default = "default_auto_chat_interval_ms")]
    pub interval_ms: u64,
}

fn default_auto_chat_interval_ms() -> u64 {
    60_000
}

impl Default for AutoChatConfig {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            interval_ms: default_auto_chat_interval_ms(),
        }
    }
}

impl AutoChatConfig {
    /// Interval between messages, never below one second.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1_000))
    }

    /// A random configured message.
    pub fn pick_message(&self) -> Option<&str> {
        if self.messages.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..self.messages.len());
        self.messages.get(index).map(String::as_str)
    }
}

fn default_true() -> bool {
    true
}

/// Persisted configuration of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: InstanceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub kind: InstanceKind,
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Fixed identity. Generated on creation for full instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub modes: ModeSet,
    #[serde(default)]
    pub auto_chat: AutoChatConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_interval_minutes: Option<u32>,
    /// Connect at startup.
    #[serde(default = "default_true")]
    pub auto_connect: bool,
}

impl InstanceConfig {
    pub fn new(id: InstanceId, kind: InstanceKind, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            id,
            display_name: None,
            kind,
            host: host.into(),
            port,
            username: None,
            credentials: None,
            version: None,
            modes: ModeSet::default(),
            auto_chat: AutoChatConfig::default(),
            restart_interval_minutes: None,
            auto_connect: true,
        }
    }

    pub fn display_name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// `host:port`, for display even when invalid.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host.trim(), self.port_or_default())
    }

    /// Validates the config and derives the connection target.
    pub fn target(&self) -> Result<ConnectTarget, ConfigError> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(ConfigError::MissingAddress(self.id.clone()));
        }
        let port = self.port_or_default();
        if port == 0 {
            return Err(ConfigError::InvalidPort(self.id.clone()));
        }
        // An empty secret is a typo, not "no auth".
        if let (Some(username), Some(credentials)) = (&self.username, &self.credentials) {
            if credentials.trim().is_empty() {
                return Err(ConfigError::MissingCredentials {
                    id: self.id.clone(),
                    username: username.clone(),
                });
            }
        }
        Ok(ConnectTarget {
            host: host.to_string(),
            port,
            username: self.username.clone(),
            credentials: self.credentials.clone(),
            version: self.version.clone(),
        })
    }

    /// Fills in a generated username for full instances that lack one.
    /// Returns whether the config changed.
    pub fn ensure_identity(&mut self) -> bool {
        if self.kind == InstanceKind::Full && self.username.is_none() {
            self.username = Some(generate_username());
            return true;
        }
        false
    }

    pub fn apply(&mut self, patch: &ConfigPatch) {
        if let Some(display_name) = &patch.display_name {
            self.display_name = Some(display_name.clone());
        }
        if let Some(kind) = patch.kind {
            self.kind = kind;
        }
        if let Some(host) = &patch.host {
            self.host = host.clone();
        }
        if let Some(port) = patch.port {
            self.port = Some(port);
        }
        if let Some(username) = &patch.username {
            self.username = Some(username.clone());
        }
        if let Some(credentials) = &patch.credentials {
            self.credentials = Some(credentials.clone());
        }
        if let Some(version) = &patch.version {
            self.version = Some(version.clone());
        }
        if let Some(modes) = &patch.modes {
            self.modes = modes.clone();
        }
        if let Some(auto_chat) = &patch.auto_chat {
            self.auto_chat = auto_chat.clone();
        }
        if let Some(restart) = patch.restart_interval_minutes {
            self.restart_interval_minutes = restart;
        }
        if let Some(auto_connect) = patch.auto_connect {
            self.auto_connect = auto_connect;
        }
    }
}

/// Partial update of an [`InstanceConfig`]. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<InstanceKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modes: Option<ModeSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_chat: Option<AutoChatConfig>,
    /// `Some(None)` clears the schedule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_interval_minutes: Option<Option<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_connect: Option<bool>,
}

impl ConfigPatch {
    pub fn modes(modes: ModeSet) -> Self {
        Self {
            modes: Some(modes),
            ..Default::default()
        }
    }

    /// Whether applying the patch changes how the instance connects.
    pub fn affects_connection(&self) -> bool {
        self.kind.is_some()
            || self.host.is_some()
            || self.port.is_some()
            || self.username.is_some()
            || self.credentials.is_some()
            || self.version.is_some()
    }
}

/// Persistence collaborator.
pub trait RosterStore: Send + Sync {
    /// All configs in insertion order.
    fn load_roster(&self) -> Result<Vec<InstanceConfig>, RosterError>;

    /// Inserts a config, or replaces it keeping its position.
    fn upsert_instance(&self, config: &InstanceConfig) -> Result<(), RosterError>;

    /// Applies `patch` to a stored config and returns the result.
    fn save_instance_config(
        &self,
        id: &InstanceId,
        patch: &ConfigPatch,
    ) -> Result<InstanceConfig, RosterError>;

    /// Returns whether something was removed.
    fn remove_instance(&self, id: &InstanceId) -> Result<bool, RosterError>;
}

/// Non-durable roster.
#[derive(Debug, Default)]
pub struct MemoryRoster {
    configs: Mutex<Vec<InstanceConfig>>,
}

impl MemoryRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_configs(configs: Vec<InstanceConfig>) -> Self {
        Self {
            configs: Mutex::new(configs),
        }
    }

    pub fn get(&self, id: &InstanceId) -> Option<InstanceConfig> {
        self.lock().iter().find(|c| &c.id == id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<InstanceConfig>> {
        self.configs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RosterStore for MemoryRoster {
    fn load_roster(&self) -> Result<Vec<InstanceConfig>, RosterError> {
        Ok(self.lock().clone())
    }

    fn upsert_instance(&self, config: &InstanceConfig) -> Result<(), RosterError> {
        let mut configs = self.lock();
        match configs.iter_mut().find(|c| c.id == config.id) {
            Some(existing) => *existing = config.clone(),
            None => configs.push(config.clone()),
        }
        Ok(())
    }

    fn save_instance_config(
        &self,
        id: &InstanceId,
        patch: &ConfigPatch,
    ) -> Result<InstanceConfig, RosterError> {
        let mut configs = self.lock();
        let config = configs
            .iter_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| RosterError::NotFound(id.clone()))?;
        config.apply(patch);
        Ok(config.clone())
    }

    fn remove_instance(&self, id: &InstanceId) -> Result<bool, RosterError> {
        let mut configs = self.lock();
        let before = configs.len();
        configs.retain(|c| &c.id != id);
        Ok(configs.len() != before)
    }
}

const NAME_ADJECTIVES: &[&str] = &[
    "Swift", "Quiet", "Brave", "Lucky", "Clever", "Mighty", "Sneaky", "Happy", "Frosty", "Rusty",
];

const NAME_NOUNS: &[&str] = &[
    "Fox", "Wolf", "Otter", "Falcon", "Badger", "Panda", "Raven", "Tiger", "Koala", "Lynx",
];

/// A human-looking username of at most 16 characters.
pub fn generate_username() -> String {
    let mut rng = rand::rng();
    let adjective = NAME_ADJECTIVES[rng.random_range(0..NAME_ADJECTIVES.len())];
    let noun = NAME_NOUNS[rng.random_range(0..NAME_NOUNS.len())];
    let number: u16 = rng.random_range(10..1000);
    format!("{adjective}{noun}{number}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_events::ModeName;
    use rstest::rstest;

    fn config(host: &str, port: Option<u16>) -> InstanceConfig {
        InstanceConfig::new(InstanceId::parse("s1").unwrap(), InstanceKind::Full, host, port)
    }

    #[test]
    fn test_target_defaults_port() {
        let target = config("play.example", None).target().unwrap();
        assert_eq!(target.port, DEFAULT_PORT);
        assert_eq!(target.host, "play.example");
    }

    #[rstest]
    #[case("", Some(25565))]
    #[case("   ", None)]
    fn test_missing_address(#[case] host: &str, #[case] port: Option<u16>) {
        assert!(matches!(
            config(host, port).target(),
            Err(ConfigError::MissingAddress(_))
        ));
    }

    #[test]
    fn test_invalid_port() {
        assert!(matches!(
            config("play.example", Some(0)).target(),
            Err(ConfigError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_blank_credentials_rejected() {
        let mut cfg = config("play.example", None);
        cfg.username = Some("Steve".to_string());
        cfg.credentials = Some(" ".to_string());
        assert!(matches!(
            cfg.target(),
            Err(ConfigError::MissingCredentials { .. })
        ));
    }

    #[test]
    fn test_json_defaults() {
        let cfg: InstanceConfig =
            serde_json::from_str(r#"{"id":"s1","host":"play.example","kind":"minecraft"}"#).unwrap();
        assert_eq!(cfg.kind, InstanceKind::Full);
        assert!(cfg.auto_connect);
        assert_eq!(cfg.auto_chat.interval_ms, 60_000);
        assert!(!cfg.modes.any_enabled());
    }

    #[test]
    fn test_patch_apply_and_connection_flag() {
        let mut cfg = config("play.example", None);
        let patch = ConfigPatch {
            display_name: Some("Lobby".to_string()),
            restart_interval_minutes: Some(Some(30)),
            ..Default::default()
        };
        assert!(!patch.affects_connection());
        cfg.apply(&patch);
        assert_eq!(cfg.display_name(), "Lobby");
        assert_eq!(cfg.restart_interval_minutes, Some(30));

        let clear = ConfigPatch {
            restart_interval_minutes: Some(None),
            port: Some(25566),
            ..Default::default()
        };
        assert!(clear.affects_connection());
        cfg.apply(&clear);
        assert_eq!(cfg.restart_interval_minutes, None);
        assert_eq!(cfg.port, Some(25566));
    }

    #[test]
    fn test_ensure_identity_only_for_full() {
        let mut full = config("play.example", None);
        assert!(full.ensure_identity());
        assert!(!full.ensure_identity());
        let name = full.username.unwrap();
        assert!(name.len() <= 16, "{name}");

        let mut probe = config("panel.example", None);
        probe.kind = InstanceKind::StatusOnly;
        assert!(!probe.ensure_identity());
    }

    #[test]
    fn test_memory_roster_keeps_order_and_patches() {
        let roster = MemoryRoster::new();
        for id in ["b", "a", "c"] {
            let cfg = InstanceConfig::new(InstanceId::parse(id).unwrap(), InstanceKind::Full, "h", None);
            roster.upsert_instance(&cfg).unwrap();
        }

        let id = InstanceId::parse("a").unwrap();
        let modes: ModeSet = [ModeName::Follow].into_iter().collect();
        let saved = roster
            .save_instance_config(&id, &ConfigPatch::modes(modes.clone()))
            .unwrap();
        assert_eq!(saved.modes, modes);

        let order: Vec<_> = roster
            .load_roster()
            .unwrap()
            .into_iter()
            .map(|c| c.id.to_string())
            .collect();
        assert_eq!(order, vec!["b", "a", "c"]);

        assert!(roster.remove_instance(&id).unwrap());
        assert!(!roster.remove_instance(&id).unwrap());
    }

    #[test]
    fn test_auto_chat_pick() {
        let empty = AutoChatConfig::default();
        assert!(empty.pick_message().is_none());

        let chat = AutoChatConfig {
            messages: vec!["hi".to_string()],
            interval_ms: 10,
        };
        assert_eq!(chat.pick_message(), Some("hi"));
        assert_eq!(chat.interval(), Duration::from_secs(1));
    }
}
