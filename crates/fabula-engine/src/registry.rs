//! Agent registry: ownership, contract validation, and health metrics for
//! the live agent set.
//!
//! The public surface never panics and never returns `Err`; failures
//! degrade to `false`/empty results plus a log line. The interior lock is
//! never held across a suspension point — handles are cloned out before
//! any agent callback is awaited.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use fabula_core::agent::{Agent, AgentStatus};
use fabula_core::config::SimulationConfig;

const MAX_AGENT_ID_LEN: usize = 128;

/// Per-agent health and activity bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct AgentMetrics {
    pub registered_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Turns in which this agent produced a decision.
    pub turns_completed: u64,
    /// Arithmetic running mean of decision response times, in milliseconds.
    pub avg_response_ms: f64,
    pub error_count: u64,
}

impl AgentMetrics {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            registered_at: now,
            last_activity: now,
            turns_completed: 0,
            avg_response_ms: 0.0,
            error_count: 0,
        }
    }
}

/// An agent judged invalid for the current validation round.
#[derive(Debug, Clone, Serialize)]
pub struct InvalidAgent {
    pub id: String,
    pub reason: String,
}

/// Result of one liveness/contract validation sweep.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub checked: usize,
    /// Valid agent ids, in registration order.
    pub valid: Vec<String>,
    pub invalid: Vec<InvalidAgent>,
}

struct AgentEntry {
    handle: Arc<dyn Agent>,
    metrics: AgentMetrics,
}

struct RegistryInner {
    agents: HashMap<String, AgentEntry>,
    /// Registration order; also the engine's deterministic priority order.
    order: Vec<String>,
}

/// Owns the set of live agent handles.
pub struct AgentRegistry {
    inner: RwLock<RegistryInner>,
    max_agents: usize,
    status_timeout: Duration,
}

impl AgentRegistry {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                agents: HashMap::new(),
                order: Vec::new(),
            }),
            max_agents: config.max_agents,
            status_timeout: config.status_timeout(),
        }
    }

    /// Register an agent, returning `false` if its contract is invalid,
    /// its id is already taken, or the registry is at capacity. Prior
    /// registrations are unaffected by a failed one.
    pub fn register(&self, agent: Arc<dyn Agent>) -> bool {
        if let Err(reason) = check_contract(agent.as_ref()) {
            warn!(agent = %agent.id(), %reason, "registration rejected");
            return false;
        }

        let Ok(mut inner) = self.inner.write() else {
            warn!("registry lock poisoned, registration rejected");
            return false;
        };
        let id = agent.id().to_string();
        if inner.agents.contains_key(&id) {
            warn!(agent = %id, "registration rejected: duplicate id");
            return false;
        }
        if inner.agents.len() >= self.max_agents {
            warn!(
                agent = %id,
                capacity = self.max_agents,
                "registration rejected: registry at capacity"
            );
            return false;
        }

        inner.agents.insert(
            id.clone(),
            AgentEntry {
                handle: agent,
                metrics: AgentMetrics::new(),
            },
        );
        inner.order.push(id.clone());
        info!(agent = %id, total = inner.agents.len(), "agent registered");
        true
    }

    /// Drop an agent, invoking its optional cleanup hook best-effort.
    pub async fn deregister(&self, id: &str) -> bool {
        let removed = {
            let Ok(mut inner) = self.inner.write() else {
                warn!("registry lock poisoned, deregistration failed");
                return false;
            };
            let removed = inner.agents.remove(id);
            if removed.is_some() {
                inner.order.retain(|existing| existing != id);
            }
            removed
        };

        let Some(entry) = removed else {
            debug!(agent = %id, "deregistration of unknown agent ignored");
            return false;
        };

        if let Err(e) = entry.handle.cleanup().await {
            warn!(agent = %id, error = %e, "agent cleanup failed, continuing");
        }
        info!(agent = %id, "agent deregistered");
        true
    }

    /// Look up an agent handle.
    pub fn get(&self, id: &str) -> Option<Arc<dyn Agent>> {
        let inner = self.inner.read().ok()?;
        inner.agents.get(id).map(|e| Arc::clone(&e.handle))
    }

    /// Metrics for one agent.
    pub fn metrics(&self, id: &str) -> Option<AgentMetrics> {
        let inner = self.inner.read().ok()?;
        inner.agents.get(id).map(|e| e.metrics.clone())
    }

    /// Registered agent ids in registration order.
    pub fn list(&self) -> Vec<String> {
        self.inner.read().map(|i| i.order.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.agents.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Agent handles in registration order.
    pub fn agents_in_order(&self) -> Vec<(String, Arc<dyn Agent>)> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        inner
            .order
            .iter()
            .filter_map(|id| {
                inner
                    .agents
                    .get(id)
                    .map(|e| (id.clone(), Arc::clone(&e.handle)))
            })
            .collect()
    }

    /// Re-check each agent's contract and query liveness under a bounded
    /// timeout. A non-responsive or unavailable agent is invalid for this
    /// round only; it is not deregistered.
    pub async fn validate_all(&self) -> ValidationReport {
        let handles = self.agents_in_order();
        let checked = handles.len();

        let queries = handles.into_iter().map(|(id, handle)| async move {
            if let Err(reason) = check_contract(handle.as_ref()) {
                return (id, Err(reason));
            }
            match tokio::time::timeout(self.status_timeout, handle.status()).await {
                Ok(AgentStatus::Ready) | Ok(AgentStatus::Busy) => (id, Ok(())),
                Ok(AgentStatus::Unavailable) => {
                    (id, Err("agent reports unavailable".to_string()))
                }
                Err(_) => (id, Err("status query timed out".to_string())),
            }
        });

        let mut report = ValidationReport {
            checked,
            valid: Vec::new(),
            invalid: Vec::new(),
        };
        for (id, outcome) in join_all(queries).await {
            match outcome {
                Ok(()) => report.valid.push(id),
                Err(reason) => {
                    warn!(agent = %id, %reason, "agent invalid for this round");
                    report.invalid.push(InvalidAgent { id, reason });
                }
            }
        }
        report
    }

    /// Record a successful decision: last-activity, turn counter, and the
    /// running-mean response time.
    pub fn record_activity(&self, id: &str, response_time: Duration) {
        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        if let Some(entry) = inner.agents.get_mut(id) {
            let m = &mut entry.metrics;
            m.last_activity = Utc::now();
            m.turns_completed += 1;
            let sample_ms = response_time.as_secs_f64() * 1_000.0;
            m.avg_response_ms += (sample_ms - m.avg_response_ms) / m.turns_completed as f64;
        }
    }

    /// Record a failed decision attempt.
    pub fn record_failure(&self, id: &str) {
        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        if let Some(entry) = inner.agents.get_mut(id) {
            entry.metrics.error_count += 1;
            entry.metrics.last_activity = Utc::now();
        }
    }
}

fn check_contract(agent: &dyn Agent) -> Result<(), String> {
    let id = agent.id();
    if id.is_empty() {
        return Err("agent id is empty".to_string());
    }
    if id.len() > MAX_AGENT_ID_LEN {
        return Err(format!("agent id exceeds {MAX_AGENT_ID_LEN} bytes"));
    }
    if agent.character_data().is_null() {
        return Err("agent has no character data".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fabula_core::agent::{AgentDecision, DecisionRequest};
    use fabula_core::error::DecisionError;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct TestAgent {
        id: String,
        character: Value,
        status: AgentStatus,
        cleanup_called: AtomicBool,
        fail_cleanup: bool,
    }

    impl TestAgent {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                character: json!({"name": id}),
                status: AgentStatus::Ready,
                cleanup_called: AtomicBool::new(false),
                fail_cleanup: false,
            })
        }

        fn with_status(id: &str, status: AgentStatus) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                character: json!({"name": id}),
                status,
                cleanup_called: AtomicBool::new(false),
                fail_cleanup: false,
            })
        }
    }

    #[async_trait]
    impl Agent for TestAgent {
        fn id(&self) -> &str {
            &self.id
        }

        fn character_data(&self) -> Value {
            self.character.clone()
        }

        async fn decide(
            &self,
            _request: DecisionRequest,
        ) -> Result<AgentDecision, DecisionError> {
            Ok(AgentDecision::new("wait", "stands still"))
        }

        async fn status(&self) -> AgentStatus {
            self.status.clone()
        }

        async fn cleanup(&self) -> Result<(), DecisionError> {
            self.cleanup_called.store(true, Ordering::SeqCst);
            if self.fail_cleanup {
                return Err(DecisionError::Failed {
                    reason: "cleanup exploded".to_string(),
                });
            }
            Ok(())
        }
    }

    fn registry_with_capacity(max_agents: usize) -> AgentRegistry {
        AgentRegistry::new(&SimulationConfig {
            max_agents,
            ..Default::default()
        })
    }

    #[test]
    fn register_and_list_preserve_order() {
        let registry = registry_with_capacity(5);
        assert!(registry.register(TestAgent::new("b")));
        assert!(registry.register(TestAgent::new("a")));
        assert!(registry.register(TestAgent::new("c")));
        assert_eq!(registry.list(), vec!["b", "a", "c"]);
    }

    #[test]
    fn duplicate_and_invalid_registrations_fail() {
        let registry = registry_with_capacity(5);
        assert!(registry.register(TestAgent::new("dup")));
        assert!(!registry.register(TestAgent::new("dup")));
        assert!(!registry.register(TestAgent::new("")));

        let no_character = Arc::new(TestAgent {
            id: "ghost".to_string(),
            character: Value::Null,
            status: AgentStatus::Ready,
            cleanup_called: AtomicBool::new(false),
            fail_cleanup: false,
        });
        assert!(!registry.register(no_character));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn capacity_overflow_fails_only_excess() {
        let registry = registry_with_capacity(2);
        assert!(registry.register(TestAgent::new("one")));
        assert!(registry.register(TestAgent::new("two")));
        assert!(!registry.register(TestAgent::new("three")));
        assert_eq!(registry.list(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn deregister_removes_and_calls_cleanup() {
        let registry = registry_with_capacity(5);
        let agent = TestAgent::new("elara");
        registry.register(Arc::clone(&agent) as Arc<dyn Agent>);

        assert!(registry.deregister("elara").await);
        assert!(agent.cleanup_called.load(Ordering::SeqCst));
        assert!(registry.get("elara").is_none());
        assert!(registry.list().is_empty());

        assert!(!registry.deregister("elara").await);
    }

    #[tokio::test]
    async fn failing_cleanup_does_not_block_deregistration() {
        let registry = registry_with_capacity(5);
        let agent = Arc::new(TestAgent {
            id: "grumpy".to_string(),
            character: json!({}),
            status: AgentStatus::Ready,
            cleanup_called: AtomicBool::new(false),
            fail_cleanup: true,
        });
        registry.register(Arc::clone(&agent) as Arc<dyn Agent>);
        assert!(registry.deregister("grumpy").await);
        assert!(registry.get("grumpy").is_none());
    }

    #[tokio::test]
    async fn validate_all_marks_unavailable_without_deregistering() {
        let registry = registry_with_capacity(5);
        registry.register(TestAgent::new("up"));
        registry.register(TestAgent::with_status("down", AgentStatus::Unavailable));
        registry.register(TestAgent::with_status("busy", AgentStatus::Busy));

        let report = registry.validate_all().await;
        assert_eq!(report.checked, 3);
        assert_eq!(report.valid, vec!["up", "busy"]);
        assert_eq!(report.invalid.len(), 1);
        assert_eq!(report.invalid[0].id, "down");
        // Not deregistered, only invalid for this round.
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn record_activity_updates_running_mean() {
        let registry = registry_with_capacity(5);
        registry.register(TestAgent::new("m"));

        registry.record_activity("m", Duration::from_millis(100));
        registry.record_activity("m", Duration::from_millis(300));
        let metrics = registry.metrics("m").unwrap();
        assert_eq!(metrics.turns_completed, 2);
        assert!((metrics.avg_response_ms - 200.0).abs() < 1e-6);

        registry.record_failure("m");
        assert_eq!(registry.metrics("m").unwrap().error_count, 1);
    }
}
