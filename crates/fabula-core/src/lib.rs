//! # Fabula Core
//!
//! World state, agent contract, and shared types for the fabula turn
//! orchestrator. This crate provides the building blocks the engine crate
//! coordinates: a versioned path-addressed world tree, the agent decision
//! contract, configuration, and error types.

pub mod agent;
pub mod config;
pub mod error;
pub mod value;
pub mod world;

pub use agent::{Agent, AgentDecision, AgentStatus, DecisionRequest};
pub use config::SimulationConfig;
pub use error::{ConfigError, DecisionError, PersistenceError, WorldError};
pub use value::{ChangeKind, canonical_checksum, get_path, parse_path, set_path};
pub use world::{Snapshot, SnapshotInfo, StateChange, WorldStateStore};
