//! Error types for world-state, persistence, configuration, and agent
//! decision failures.
//!
//! Each concern gets its own focused enum; the engine crate routes any of
//! them through its error coordinator as an observability side-channel.

use thiserror::Error;

/// Errors raised by [`crate::world::WorldStateStore`] operations.
#[derive(Debug, Error)]
pub enum WorldError {
    /// A dotted path was empty or contained an empty segment.
    #[error("invalid world-state path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// A snapshot id did not match any retained snapshot.
    #[error("unknown snapshot '{0}'")]
    UnknownSnapshot(String),

    /// A lock was poisoned by a panicking writer.
    #[error("world-state lock poisoned: {0}")]
    LockPoisoned(String),

    /// Persisting or loading the state file failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Errors raised while persisting or loading the world-state file.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("world-state file I/O failed at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("world-state serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors an agent's decision procedure can surface.
///
/// These are absorbed at the decision-gathering boundary and never reach
/// the engine's caller directly.
#[derive(Debug, Clone, Error)]
pub enum DecisionError {
    /// The agent's decision procedure failed outright.
    #[error("decision failed: {reason}")]
    Failed { reason: String },

    /// The decision did not complete within the configured bound.
    #[error("decision timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The agent produced a decision the engine cannot use.
    #[error("invalid decision: {reason}")]
    Invalid { reason: String },
}

/// Errors loading or validating [`crate::config::SimulationConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
