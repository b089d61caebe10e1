//! The agent contract consumed by the turn engine.
//!
//! An agent is an external decision-making unit. The engine never inspects
//! how a decision is produced; it only requires the capability contract
//! below, validated once at registration rather than per call.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecisionError;

/// Liveness answer from an agent's status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Able to take a decision request.
    Ready,
    /// Alive but occupied; still considered valid for the round.
    Busy,
    /// Alive but declining to participate this round.
    Unavailable,
}

/// What the engine hands an agent when asking for a decision.
#[derive(Debug, Clone)]
pub struct DecisionRequest {
    /// Strictly increasing turn number.
    pub turn_number: u64,
    /// A copy of the current world tree; mutating it has no effect.
    pub world_state: Value,
}

/// One agent's declared intent for a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDecision {
    /// Action type used for conflict grouping (e.g. "move", "speak").
    pub action_type: String,
    /// Free-form narrative description of the action.
    pub description: String,
    /// Dotted world-state path to new value; applied during StateUpdate.
    /// Ordered so application is deterministic.
    #[serde(default)]
    pub world_state_changes: Vec<(String, Value)>,
    /// Opaque per-decision annotations, uninterpreted by the engine.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl AgentDecision {
    pub fn new(action_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            description: description.into(),
            world_state_changes: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Declare a world-state change this decision wants applied.
    pub fn with_change(mut self, path: impl Into<String>, value: Value) -> Self {
        self.world_state_changes.push((path.into(), value));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// The capability contract every registered agent must satisfy.
///
/// `decide` and `status` are time-boxed by the engine, not by the agent.
/// `cleanup` is best-effort: the registry logs a failure and moves on.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable unique identifier.
    fn id(&self) -> &str;

    /// Opaque character payload (persona, stats, backstory). Must not be
    /// `Null`; the registry rejects agents without one.
    fn character_data(&self) -> Value;

    /// Produce one decision for the given turn.
    async fn decide(&self, request: DecisionRequest) -> Result<AgentDecision, DecisionError>;

    /// Liveness/readiness query used by registry validation.
    async fn status(&self) -> AgentStatus;

    /// Optional teardown hook invoked at deregistration.
    async fn cleanup(&self) -> Result<(), DecisionError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decision_builder_collects_changes_in_order() {
        let decision = AgentDecision::new("move", "Elara heads north")
            .with_change("characters.elara.location", json!("north_gate"))
            .with_change("statistics.moves", json!(1))
            .with_metadata("mood", json!("wary"));

        assert_eq!(decision.action_type, "move");
        assert_eq!(decision.world_state_changes.len(), 2);
        assert_eq!(decision.world_state_changes[0].0, "characters.elara.location");
        assert_eq!(decision.metadata["mood"], json!("wary"));
    }

    #[test]
    fn decision_round_trips_through_json() {
        let decision = AgentDecision::new("speak", "A greeting")
            .with_change("events.last_spoken", json!("hello"));
        let encoded = serde_json::to_string(&decision).unwrap();
        let decoded: AgentDecision = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.action_type, "speak");
        assert_eq!(decoded.world_state_changes.len(), 1);
    }
}
