//! Error types shared across the workbench.
//!
//! None of these are fatal. Validation errors are raised at the input boundary
//! before any state changes, connection failures end up as a stored status
//! message on the session, and storage failures are reported back to whoever
//! asked for the save.

use thiserror::Error;

/// Operator input that cannot be translated into a domain value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// QoS outside of {0, 1, 2}
    #[error("{0} is not a valid QoS value (expected 0, 1 or 2)")]
    QosOutOfRange(i64),

    /// QoS input that is not an integer at all
    #[error("QoS must be an integer, got {0:?}")]
    QosNotANumber(String),

    #[error("invalid boolean {0:?} (expected true or false)")]
    InvalidFlag(String),

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Failures of the protocol client adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid endpoint url {url:?}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("invalid client id {0:?}")]
    InvalidClientId(String),

    /// The client refused to queue a request (closed or full request channel)
    #[error("request rejected: {0}")]
    Request(String),
}

/// Session controller misuse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("connection parameters cannot change while a connection is {0}")]
    ConnectionActive(&'static str),
}

/// Durable storage failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o failed for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode contexts: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("invalid storage key {0:?}")]
    InvalidKey(String),

    /// The stored document could not be read or kept aside, so it is not overwritten
    #[error("refusing to overwrite unreadable stored contexts under {0}")]
    Protected(String),
}

/// Configuration file problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The runtime task is gone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("session runtime has stopped")]
    Closed,
}
