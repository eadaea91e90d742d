//! Identifier definitions.

use std::fmt;
use std::str::FromStr;

use crate::{define_prefixed_id, IdError, Ulid};

// =============================================================================
// Sessions
// =============================================================================

// One per opened connection handle. Never reused across reconnects.
define_prefixed_id!(SessionId, "sess");

// =============================================================================
// Instances
// =============================================================================

/// Stable identifier of a managed instance.
///
/// Unlike session ids these are chosen by the operator (or generated once
/// on creation) and persisted with the roster, so they must survive
/// restarts unchanged. Allowed characters are ASCII alphanumerics, `-`, `_`
/// and `.`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    /// Maximum accepted length.
    pub const MAX_LEN: usize = 64;

    /// Prefix used by [`InstanceId::generate`].
    pub const GENERATED_PREFIX: &'static str = "server";

    /// Id reserved for the legacy single-instance connection path.
    pub const LEGACY_DEFAULT: &'static str = "default";

    /// Validates and wraps an operator-supplied id.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.len() > Self::MAX_LEN {
            return Err(IdError::TooLong {
                len: s.len(),
                max: Self::MAX_LEN,
            });
        }
        if let Some(ch) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(IdError::InvalidChar { ch });
        }
        Ok(Self(s.to_string()))
    }

    /// Generates `server_{ulid}` in lowercase.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!(
            "{}_{}",
            Self::GENERATED_PREFIX,
            Ulid::new().to_string().to_lowercase()
        ))
    }

    /// The id of the legacy single instance.
    #[must_use]
    pub fn legacy_default() -> Self {
        Self(Self::LEGACY_DEFAULT.to_string())
    }

    /// Returns true for the legacy single-instance id.
    pub fn is_legacy_default(&self) -> bool {
        self.0 == Self::LEGACY_DEFAULT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for InstanceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for InstanceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for InstanceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for InstanceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("s1")]
    #[case("default")]
    #[case("lobby-eu.2")]
    #[case("server_01hv4z3mxnkpqr9hstz7wcld4e")]
    fn test_instance_id_accepts(#[case] raw: &str) {
        let id = InstanceId::parse(raw).unwrap();
        assert_eq!(id.as_str(), raw);
    }

    #[rstest]
    #[case("", IdError::Empty)]
    #[case("has space", IdError::InvalidChar { ch: ' ' })]
    #[case("slash/path", IdError::InvalidChar { ch: '/' })]
    fn test_instance_id_rejects(#[case] raw: &str, #[case] expected: IdError) {
        assert_eq!(InstanceId::parse(raw).unwrap_err(), expected);
    }

    #[test]
    fn test_instance_id_too_long() {
        let raw = "a".repeat(InstanceId::MAX_LEN + 1);
        assert!(matches!(
            InstanceId::parse(&raw),
            Err(IdError::TooLong { .. })
        ));
    }

    #[test]
    fn test_generated_instance_id_is_valid() {
        let id = InstanceId::generate();
        assert!(id.as_str().starts_with("server_"));
        assert_eq!(InstanceId::parse(id.as_str()).unwrap(), id);
    }

    #[test]
    fn test_legacy_default() {
        assert!(InstanceId::legacy_default().is_legacy_default());
        assert!(!InstanceId::parse("s1").unwrap().is_legacy_default());
    }

    #[test]
    fn test_instance_id_json_rejects_invalid() {
        let result: Result<InstanceId, _> = serde_json::from_str("\"bad id\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_session_id_prefix() {
        let id = SessionId::generate();
        assert!(id.to_string().starts_with("sess_"));
    }

    #[test]
    fn test_session_id_invalid_prefix() {
        let result: Result<SessionId, _> = "inst_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result, Err(IdError::InvalidPrefix { .. })));
    }

    #[test]
    fn test_session_id_invalid_ulid() {
        let result: Result<SessionId, _> = "sess_invalid".parse();
        assert!(matches!(result, Err(IdError::InvalidUlid(_))));
    }

    #[test]
    fn test_session_ids_sortable() {
        let first = SessionId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = SessionId::generate();
        assert!(first < second);
    }

    proptest! {
        #[test]
        fn prop_valid_charset_always_parses(raw in "[A-Za-z0-9._-]{1,64}") {
            let id = InstanceId::parse(&raw).unwrap();
            prop_assert_eq!(id.to_string(), raw);
        }

        #[test]
        fn prop_parse_never_panics(raw in "\\PC{0,80}") {
            let _ = InstanceId::parse(&raw);
        }
    }
}
