//! Simulation configuration.
//!
//! All knobs the turn engine, registry, store, and error coordinator
//! consume. Loadable from TOML; every field has a serde default so partial
//! files work.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Configuration for one orchestrating process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Registry capacity; registrations past this fail.
    pub max_agents: usize,
    /// Gather decisions concurrently when more than one agent is live.
    pub enable_parallel_execution: bool,
    /// Detect and resolve same-action-type conflicts.
    pub enable_conflict_resolution: bool,
    /// Derive narrative events during finalization.
    pub enable_narrative_events: bool,
    /// Per-agent decision time bound, in milliseconds.
    pub decision_timeout_ms: u64,
    /// Per-agent liveness query bound during validation, in milliseconds.
    pub status_timeout_ms: u64,
    /// Ceiling on in-flight decision requests; batches above it.
    pub max_concurrent_agents: usize,
    /// Auto-snapshot the world every this many applied changes.
    pub snapshot_interval: u64,
    /// Retained snapshot count; oldest evicted past this.
    pub max_snapshots: usize,
    /// Retained change-log length; oldest entries dropped past this.
    pub max_change_log: usize,
    /// Retained error-record count in the coordinator.
    pub error_history_limit: usize,
    /// Repeats of one error signature inside this window are coalesced.
    pub suppression_window_secs: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            max_agents: 10,
            enable_parallel_execution: true,
            enable_conflict_resolution: true,
            enable_narrative_events: true,
            decision_timeout_ms: 30_000,
            status_timeout_ms: 5_000,
            max_concurrent_agents: 5,
            snapshot_interval: 50,
            max_snapshots: 10,
            max_change_log: 1_000,
            error_history_limit: 500,
            suppression_window_secs: 300,
        }
    }
}

impl SimulationConfig {
    /// Load from a TOML file.
    pub fn from_toml_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would wedge the engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_agents == 0 {
            return Err(ConfigError::Invalid("max_agents must be at least 1".into()));
        }
        if self.max_concurrent_agents == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_agents must be at least 1".into(),
            ));
        }
        if self.decision_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "decision_timeout_ms must be non-zero".into(),
            ));
        }
        if self.snapshot_interval == 0 {
            return Err(ConfigError::Invalid(
                "snapshot_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn suppression_window(&self) -> Duration {
        Duration::from_secs(self.suppression_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SimulationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_agents, 10);
        assert_eq!(config.snapshot_interval, 50);
        assert_eq!(config.decision_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: SimulationConfig =
            toml::from_str("max_agents = 3\nenable_parallel_execution = false").unwrap();
        assert_eq!(config.max_agents, 3);
        assert!(!config.enable_parallel_execution);
        assert_eq!(config.max_concurrent_agents, 5);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config = SimulationConfig {
            max_agents: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.toml");
        std::fs::write(&path, "snapshot_interval = 5\nmax_snapshots = 2\n").unwrap();
        let config = SimulationConfig::from_toml_path(&path).unwrap();
        assert_eq!(config.snapshot_interval, 5);
        assert_eq!(config.max_snapshots, 2);
    }
}
