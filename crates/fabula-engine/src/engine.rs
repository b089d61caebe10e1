//! The turn execution engine.
//!
//! One turn = five ordered, non-skippable phases:
//! Preparation → AgentDecisions → ConflictResolution → StateUpdate →
//! Finalization. The engine pulls live agents from the registry, fans out
//! time-boxed decision requests (batched at the configured in-flight
//! ceiling), resolves same-action-type conflicts by registration-order
//! priority, applies the surviving changes to the world store as one
//! batch, and derives narrative events.
//!
//! `execute_turn` is infallible by signature: per-agent failures are
//! absorbed and recorded, Preparation/StateUpdate failures abort the turn
//! with `success = false`, and ConflictResolution/Finalization trouble
//! degrades to warnings. Metrics come back regardless of outcome.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use fabula_core::agent::{Agent, AgentDecision, DecisionRequest};
use fabula_core::config::SimulationConfig;
use fabula_core::error::DecisionError;
use fabula_core::value::parse_path;
use fabula_core::world::WorldStateStore;

use crate::events::NarrativeEvent;
use crate::recovery::{ErrorContext, ErrorCoordinator};
use crate::registry::AgentRegistry;

/// The five turn phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Preparation,
    AgentDecisions,
    ConflictResolution,
    StateUpdate,
    Finalization,
}

impl TurnPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnPhase::Preparation => "preparation",
            TurnPhase::AgentDecisions => "agent_decisions",
            TurnPhase::ConflictResolution => "conflict_resolution",
            TurnPhase::StateUpdate => "state_update",
            TurnPhase::Finalization => "finalization",
        }
    }
}

/// Caller-supplied turn configuration.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    /// World updates seeded during Preparation, applied in StateUpdate
    /// ahead of agent-declared changes.
    pub world_updates: Vec<(String, Value)>,
    /// Opaque annotations; not interpreted by the engine.
    pub metadata: HashMap<String, Value>,
}

/// One agent's decision as kept for the turn report.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedDecision {
    pub decision: AgentDecision,
    /// Lost a conflict; kept for audit, excluded from state changes.
    pub overridden: bool,
    pub response_time: Duration,
}

/// Why an agent produced no decision this turn.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionFailure {
    pub reason: String,
    pub timed_out: bool,
}

/// Two or more agents declaring the same action type in one turn.
#[derive(Debug, Clone, Serialize)]
pub struct Conflict {
    pub action_type: String,
    /// All declaring agents, registration order.
    pub contenders: Vec<String>,
    /// First-listed contender; its changes survive.
    pub winner: String,
}

/// Timing and volume counters, always populated.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TurnMetrics {
    pub total_duration: Duration,
    pub phase_durations: Vec<(TurnPhase, Duration)>,
    pub agents_considered: usize,
    pub agents_succeeded: usize,
    pub agents_failed: usize,
    pub changes_applied: usize,
    pub conflicts_detected: usize,
}

/// Everything a caller learns about one executed turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnReport {
    pub turn_number: u64,
    pub success: bool,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub phases_completed: Vec<TurnPhase>,
    pub decisions: BTreeMap<String, RecordedDecision>,
    pub failures: BTreeMap<String, DecisionFailure>,
    pub conflicts: Vec<Conflict>,
    pub events: Vec<NarrativeEvent>,
    pub metrics: TurnMetrics,
}

/// Transient per-turn state; created at turn start, discarded at end.
struct TurnContext {
    turn_number: u64,
    request: TurnRequest,
    world_view: Value,
    live: Vec<(String, Arc<dyn Agent>)>,
    /// Live agent ids in registration order; the priority order.
    agent_order: Vec<String>,
    decisions: BTreeMap<String, RecordedDecision>,
    failures: BTreeMap<String, DecisionFailure>,
    conflicts: Vec<Conflict>,
    events: Vec<NarrativeEvent>,
    warnings: Vec<String>,
    phases_completed: Vec<TurnPhase>,
    metrics: TurnMetrics,
}

impl TurnContext {
    fn new(turn_number: u64, request: TurnRequest) -> Self {
        Self {
            turn_number,
            request,
            world_view: Value::Null,
            live: Vec::new(),
            agent_order: Vec::new(),
            decisions: BTreeMap::new(),
            failures: BTreeMap::new(),
            conflicts: Vec::new(),
            events: Vec::new(),
            warnings: Vec::new(),
            phases_completed: Vec::new(),
            metrics: TurnMetrics::default(),
        }
    }
}

/// Orchestrates turns over a registry, world store, and error coordinator.
pub struct TurnEngine {
    registry: Arc<AgentRegistry>,
    world: Arc<WorldStateStore>,
    recovery: Arc<ErrorCoordinator>,
    config: SimulationConfig,
    turn_counter: AtomicU64,
    /// Serializes turns; a turn may not start while the prior one runs.
    turn_gate: tokio::sync::Mutex<()>,
    narrative_sink: Option<mpsc::UnboundedSender<NarrativeEvent>>,
}

impl TurnEngine {
    pub fn new(
        registry: Arc<AgentRegistry>,
        world: Arc<WorldStateStore>,
        recovery: Arc<ErrorCoordinator>,
        config: SimulationConfig,
    ) -> Self {
        Self {
            registry,
            world,
            recovery,
            config,
            turn_counter: AtomicU64::new(0),
            turn_gate: tokio::sync::Mutex::new(()),
            narrative_sink: None,
        }
    }

    /// Attach the narrative collaborator's channel.
    pub fn with_narrative_sink(mut self, sink: mpsc::UnboundedSender<NarrativeEvent>) -> Self {
        self.narrative_sink = Some(sink);
        self
    }

    /// Turns executed so far.
    pub fn turns_executed(&self) -> u64 {
        self.turn_counter.load(Ordering::SeqCst)
    }

    /// Run one full turn. Always returns a report; never panics or errors
    /// out of this boundary under normal operation.
    pub async fn execute_turn(&self, request: TurnRequest) -> TurnReport {
        let _gate = self.turn_gate.lock().await;
        let turn_number = self.turn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();
        info!(turn = turn_number, "turn started");

        let mut ctx = TurnContext::new(turn_number, request);

        let phase_start = Instant::now();
        let outcome = self.prepare(&mut ctx).await;
        ctx.metrics
            .phase_durations
            .push((TurnPhase::Preparation, phase_start.elapsed()));
        if let Err(message) = outcome {
            return self.abort(ctx, message, started);
        }
        ctx.phases_completed.push(TurnPhase::Preparation);

        let phase_start = Instant::now();
        let outcome = self.gather_decisions(&mut ctx).await;
        ctx.metrics
            .phase_durations
            .push((TurnPhase::AgentDecisions, phase_start.elapsed()));
        if let Err(message) = outcome {
            return self.abort(ctx, message, started);
        }
        ctx.phases_completed.push(TurnPhase::AgentDecisions);

        let phase_start = Instant::now();
        self.resolve_conflicts(&mut ctx);
        ctx.metrics
            .phase_durations
            .push((TurnPhase::ConflictResolution, phase_start.elapsed()));
        ctx.phases_completed.push(TurnPhase::ConflictResolution);

        let phase_start = Instant::now();
        let outcome = self.apply_state(&mut ctx).await;
        ctx.metrics
            .phase_durations
            .push((TurnPhase::StateUpdate, phase_start.elapsed()));
        if let Err(message) = outcome {
            return self.abort(ctx, message, started);
        }
        ctx.phases_completed.push(TurnPhase::StateUpdate);

        let phase_start = Instant::now();
        self.finalize(&mut ctx);
        ctx.metrics
            .phase_durations
            .push((TurnPhase::Finalization, phase_start.elapsed()));
        ctx.phases_completed.push(TurnPhase::Finalization);

        ctx.metrics.total_duration = started.elapsed();
        info!(
            turn = turn_number,
            agents_succeeded = ctx.metrics.agents_succeeded,
            agents_failed = ctx.metrics.agents_failed,
            changes = ctx.metrics.changes_applied,
            conflicts = ctx.metrics.conflicts_detected,
            elapsed_ms = ctx.metrics.total_duration.as_millis() as u64,
            "turn completed"
        );
        into_report(ctx, true, None)
    }

    /// Validate agents and seed pending updates from the turn request.
    async fn prepare(&self, ctx: &mut TurnContext) -> Result<(), String> {
        for (path, _) in &ctx.request.world_updates {
            if let Err(e) = parse_path(path) {
                self.recovery
                    .handle(&e, ErrorContext::new("turn_engine", "prepare"))
                    .await;
                return Err(format!("invalid world update path '{path}': {e}"));
            }
        }

        let report = self.registry.validate_all().await;
        let valid: HashSet<&String> = report.valid.iter().collect();
        ctx.live = self
            .registry
            .agents_in_order()
            .into_iter()
            .filter(|(id, _)| valid.contains(id))
            .collect();
        ctx.agent_order = ctx.live.iter().map(|(id, _)| id.clone()).collect();

        ctx.world_view = match self.world.read() {
            Ok(tree) => tree,
            Err(e) => {
                self.recovery
                    .handle(&e, ErrorContext::new("world_state", "read"))
                    .await;
                return Err(format!("world read failed: {e}"));
            }
        };

        debug!(
            turn = ctx.turn_number,
            live = ctx.live.len(),
            invalid = report.invalid.len(),
            seeded_updates = ctx.request.world_updates.len(),
            "turn prepared"
        );
        Ok(())
    }

    /// Gather one decision per live agent, absorbing individual failures.
    async fn gather_decisions(&self, ctx: &mut TurnContext) -> Result<(), String> {
        ctx.metrics.agents_considered = ctx.live.len();
        if ctx.live.is_empty() {
            debug!(turn = ctx.turn_number, "no live agents, skipping decisions");
            return Ok(());
        }

        let timeout = self.config.decision_timeout();
        let mut results: Vec<(String, Result<AgentDecision, DecisionError>, Duration)> =
            Vec::with_capacity(ctx.live.len());

        if self.config.enable_parallel_execution && ctx.live.len() > 1 {
            // Bounded fan-out: batches of at most max_concurrent_agents.
            for chunk in ctx.live.chunks(self.config.max_concurrent_agents) {
                let batch = chunk.iter().map(|(id, agent)| {
                    let request = DecisionRequest {
                        turn_number: ctx.turn_number,
                        world_state: ctx.world_view.clone(),
                    };
                    let agent = Arc::clone(agent);
                    let id = id.clone();
                    async move {
                        let (result, elapsed) = request_decision(agent, request, timeout).await;
                        (id, result, elapsed)
                    }
                });
                results.extend(join_all(batch).await);
            }
        } else {
            for (id, agent) in &ctx.live {
                let request = DecisionRequest {
                    turn_number: ctx.turn_number,
                    world_state: ctx.world_view.clone(),
                };
                let (result, elapsed) =
                    request_decision(Arc::clone(agent), request, timeout).await;
                results.push((id.clone(), result, elapsed));
            }
        }

        for (id, result, elapsed) in results {
            let result = result.and_then(|decision| {
                if decision.action_type.trim().is_empty() {
                    Err(DecisionError::Invalid {
                        reason: "empty action type".to_string(),
                    })
                } else {
                    Ok(decision)
                }
            });
            match result {
                Ok(decision) => {
                    self.registry.record_activity(&id, elapsed);
                    debug!(
                        turn = ctx.turn_number,
                        agent = %id,
                        action = %decision.action_type,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "decision gathered"
                    );
                    ctx.decisions.insert(
                        id,
                        RecordedDecision {
                            decision,
                            overridden: false,
                            response_time: elapsed,
                        },
                    );
                }
                Err(e) => {
                    self.registry.record_failure(&id);
                    warn!(turn = ctx.turn_number, agent = %id, error = %e, "decision failed");
                    self.recovery
                        .handle(
                            &e,
                            ErrorContext::new("turn_engine", "agent_decision")
                                .with_detail(id.clone()),
                        )
                        .await;
                    let timed_out = matches!(e, DecisionError::Timeout { .. });
                    ctx.failures.insert(
                        id,
                        DecisionFailure {
                            reason: e.to_string(),
                            timed_out,
                        },
                    );
                }
            }
        }

        ctx.metrics.agents_succeeded = ctx.decisions.len();
        ctx.metrics.agents_failed = ctx.failures.len();

        if ctx.decisions.is_empty() {
            return Err(format!(
                "all {} agent decisions failed this turn",
                ctx.live.len()
            ));
        }
        Ok(())
    }

    /// Group decisions by action type; the first-listed agent wins each
    /// contested type, losers are kept but marked overridden.
    fn resolve_conflicts(&self, ctx: &mut TurnContext) {
        if !self.config.enable_conflict_resolution {
            debug!(turn = ctx.turn_number, "conflict resolution disabled");
            return;
        }

        let mut by_type: Vec<(String, Vec<String>)> = Vec::new();
        for id in &ctx.agent_order {
            let Some(recorded) = ctx.decisions.get(id) else {
                continue;
            };
            let action_type = recorded.decision.action_type.clone();
            match by_type.iter_mut().find(|(t, _)| *t == action_type) {
                Some((_, ids)) => ids.push(id.clone()),
                None => by_type.push((action_type, vec![id.clone()])),
            }
        }

        for (action_type, contenders) in by_type {
            if contenders.len() < 2 {
                continue;
            }
            let winner = contenders[0].clone();
            for loser in &contenders[1..] {
                if let Some(recorded) = ctx.decisions.get_mut(loser) {
                    recorded.overridden = true;
                }
            }
            info!(
                turn = ctx.turn_number,
                action_type = %action_type,
                winner = %winner,
                contenders = contenders.len(),
                "conflict resolved by registration priority"
            );
            ctx.conflicts.push(Conflict {
                action_type,
                contenders,
                winner,
            });
        }
        ctx.metrics.conflicts_detected = ctx.conflicts.len();
    }

    /// Merge prepared updates with surviving decision changes and apply
    /// them as one batch.
    async fn apply_state(&self, ctx: &mut TurnContext) -> Result<(), String> {
        let mut updates: Vec<(String, Value)> = ctx.request.world_updates.clone();
        for id in &ctx.agent_order {
            if let Some(recorded) = ctx.decisions.get(id)
                && !recorded.overridden
            {
                updates.extend(recorded.decision.world_state_changes.iter().cloned());
            }
        }
        if updates.is_empty() {
            debug!(turn = ctx.turn_number, "no state changes this turn");
            return Ok(());
        }

        let source = format!("turn:{}", ctx.turn_number);
        match self.world.apply(updates, &source) {
            Ok(changes) => {
                ctx.metrics.changes_applied = changes.len();
                Ok(())
            }
            Err(e) => {
                self.recovery
                    .handle(&e, ErrorContext::new("world_state", "apply"))
                    .await;
                Err(format!("state update failed: {e}"))
            }
        }
    }

    /// Derive narrative events and push them to the sink, if any. Trouble
    /// here is a warning, never a turn failure.
    fn finalize(&self, ctx: &mut TurnContext) {
        if self.config.enable_narrative_events {
            for id in &ctx.agent_order {
                if let Some(recorded) = ctx.decisions.get(id)
                    && !recorded.overridden
                {
                    ctx.events.push(NarrativeEvent::agent_action(
                        ctx.turn_number,
                        id.clone(),
                        recorded.decision.action_type.clone(),
                        recorded.decision.description.clone(),
                    ));
                }
            }
            for conflict in &ctx.conflicts {
                ctx.events.push(NarrativeEvent::conflict_resolved(
                    ctx.turn_number,
                    conflict.winner.clone(),
                    conflict.action_type.clone(),
                    format!(
                        "{} agents contended for '{}'; {} prevailed",
                        conflict.contenders.len(),
                        conflict.action_type,
                        conflict.winner
                    ),
                ));
            }
        }

        if let Some(sink) = &self.narrative_sink {
            for event in &ctx.events {
                if sink.send(event.clone()).is_err() {
                    warn!(
                        turn = ctx.turn_number,
                        "narrative sink closed, remaining events dropped"
                    );
                    ctx.warnings
                        .push("narrative sink closed; events dropped".to_string());
                    break;
                }
            }
        }
    }

    fn abort(&self, mut ctx: TurnContext, message: String, started: Instant) -> TurnReport {
        ctx.metrics.total_duration = started.elapsed();
        warn!(
            turn = ctx.turn_number,
            phases_completed = ctx.phases_completed.len(),
            error = %message,
            "turn aborted"
        );
        into_report(ctx, false, Some(message))
    }
}

/// One time-boxed decision call.
async fn request_decision(
    agent: Arc<dyn Agent>,
    request: DecisionRequest,
    timeout: Duration,
) -> (Result<AgentDecision, DecisionError>, Duration) {
    let start = Instant::now();
    let result = match tokio::time::timeout(timeout, agent.decide(request)).await {
        Ok(inner) => inner,
        Err(_) => Err(DecisionError::Timeout {
            elapsed_ms: timeout.as_millis() as u64,
        }),
    };
    (result, start.elapsed())
}

fn into_report(ctx: TurnContext, success: bool, error: Option<String>) -> TurnReport {
    TurnReport {
        turn_number: ctx.turn_number,
        success,
        error,
        warnings: ctx.warnings,
        phases_completed: ctx.phases_completed,
        decisions: ctx.decisions,
        failures: ctx.failures,
        conflicts: ctx.conflicts,
        events: ctx.events,
        metrics: ctx.metrics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_have_stable_names() {
        assert_eq!(TurnPhase::Preparation.as_str(), "preparation");
        assert_eq!(TurnPhase::Finalization.as_str(), "finalization");
    }

    #[test]
    fn default_request_is_empty() {
        let request = TurnRequest::default();
        assert!(request.world_updates.is_empty());
        assert!(request.metadata.is_empty());
    }
}
