//! Error types for parsing event vocabulary.

use thiserror::Error;

/// Errors that can occur when decoding event values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The mode name is not one of the known modes.
    #[error("unknown mode: {0}")]
    UnknownMode(String),

    /// The instance kind is not recognized.
    #[error("unknown instance kind: {0}")]
    UnknownKind(String),

    /// The log level is not recognized.
    #[error("unknown log level: {0}")]
    UnknownLogLevel(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
