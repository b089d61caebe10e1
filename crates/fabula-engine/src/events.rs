//! Narrative events derived during turn finalization.
//!
//! The engine only produces these; a narrative collaborator attached via
//! the engine's sink interprets them. Content is opaque here.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrativeEventKind {
    /// One non-overridden agent decision.
    AgentAction,
    /// One resolved same-action-type conflict.
    ConflictResolved,
}

/// One per-turn narrative beat.
#[derive(Debug, Clone, Serialize)]
pub struct NarrativeEvent {
    pub id: Uuid,
    pub turn_number: u64,
    pub kind: NarrativeEventKind,
    /// The acting agent, or the winner for a resolved conflict.
    pub agent_id: Option<String>,
    pub action_type: Option<String>,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

impl NarrativeEvent {
    pub fn agent_action(
        turn_number: u64,
        agent_id: impl Into<String>,
        action_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            turn_number,
            kind: NarrativeEventKind::AgentAction,
            agent_id: Some(agent_id.into()),
            action_type: Some(action_type.into()),
            description: description.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn conflict_resolved(
        turn_number: u64,
        winner: impl Into<String>,
        action_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            turn_number,
            kind: NarrativeEventKind::ConflictResolved,
            agent_id: Some(winner.into()),
            action_type: Some(action_type.into()),
            description: description.into(),
            timestamp: Utc::now(),
        }
    }
}
