//! # Fabula Engine
//!
//! Turn orchestration for a multi-agent interactive-narrative simulation.
//! Each turn passes through five ordered phases — preparation, decision
//! gathering, conflict resolution, state update, finalization — while the
//! engine absorbs per-agent failures, keeps the world state versioned and
//! recoverable, and routes every cross-component error through a recovery
//! coordinator.
//!
//! Composition is explicit: the caller constructs the registry, world
//! store, and coordinator, and hands them to [`TurnEngine`] by `Arc`.
//! Nothing in this crate is a process-wide singleton.

pub mod engine;
pub mod events;
pub mod recovery;
pub mod registry;

pub use engine::{
    Conflict, DecisionFailure, RecordedDecision, TurnEngine, TurnMetrics, TurnPhase, TurnReport,
    TurnRequest,
};
pub use events::{NarrativeEvent, NarrativeEventKind};
pub use recovery::{
    ErrorCategory, ErrorContext, ErrorCoordinator, ErrorPattern, ErrorRecord, ErrorSeverity,
    ErrorStatistics, RecoveryFn, RecoveryOutcome, RecoveryStrategy, SystemHealth,
};
pub use registry::{AgentMetrics, AgentRegistry, InvalidAgent, ValidationReport};
