//! Error coordination: classification, suppression, recovery, escalation.
//!
//! Any component may hand an error plus context to [`ErrorCoordinator::handle`].
//! The coordinator first coalesces repeats of the same error signature
//! inside a suppression window, then classifies the error against a pattern
//! registry (by error type name, secondarily by message keywords), attempts
//! the pattern's recovery strategy, and tracks escalation when one category
//! keeps failing.
//!
//! The coordinator never panics past its boundary: an internal failure
//! while handling an error is caught, logged at the highest severity, and
//! returned as [`RecoveryOutcome::HandlerFailure`].
//!
//! It is explicitly constructed and passed by `Arc` from the composition
//! root; tests build independent instances.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use fabula_core::config::SimulationConfig;

/// Error taxonomy used for classification and escalation tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Validation,
    /// Concurrency trouble, including timeouts and poisoned locks.
    Concurrency,
    Conflict,
    /// Exhausted capacity (registry full, limits hit).
    Resource,
    Persistence,
    /// Unclassified; the default bucket.
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStrategy {
    Retry,
    Fallback,
    Restart,
    Escalate,
    Shutdown,
    Ignore,
}

/// Where an error came from.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub component: String,
    /// Operation name; also the key for retry/fallback handlers.
    pub operation: String,
    pub detail: Option<String>,
}

impl ErrorContext {
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            operation: operation.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// A classification rule. Patterns are checked in registration order;
/// the first match wins.
#[derive(Debug, Clone)]
pub struct ErrorPattern {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub strategy: RecoveryStrategy,
    /// Retry budget when the strategy is `Retry`.
    pub max_attempts: u32,
    /// Same-category errors within the last hour before escalation.
    pub escalation_threshold: usize,
    /// Substrings matched against the error's type name.
    pub type_markers: Vec<&'static str>,
    /// Substrings matched against the lowercased error message.
    pub keywords: Vec<&'static str>,
}

/// One classified error occurrence (repeats coalesced by signature).
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub strategy: RecoveryStrategy,
    pub attempts: u32,
    pub resolved: bool,
    pub escalated: bool,
    pub signature: String,
    pub message: String,
    pub component: String,
    pub operation: String,
    /// Total occurrences including suppressed repeats.
    pub occurrences: u64,
}

/// What `handle` did about an error.
#[derive(Debug, Clone)]
pub enum RecoveryOutcome {
    /// A repeat inside the suppression window; no new record created.
    Suppressed { signature: String },
    Recovered {
        record_id: String,
        strategy: RecoveryStrategy,
        attempts: u32,
    },
    Unresolved {
        record_id: String,
        strategy: RecoveryStrategy,
        escalated: bool,
    },
    /// Pattern said to ignore; recorded for audit only.
    Ignored { record_id: String },
    /// Terminal draining state requested.
    ShuttingDown { record_id: String },
    /// The coordinator itself failed while handling.
    HandlerFailure { message: String },
}

/// Overall health assessment derived from recent error activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemHealth {
    Healthy,
    Degraded,
    Critical,
}

/// Aggregated view over retained error records.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorStatistics {
    pub total: usize,
    pub by_category: HashMap<ErrorCategory, usize>,
    pub by_severity: HashMap<ErrorSeverity, usize>,
    /// Records from the last hour.
    pub recent_count: usize,
    /// Resolved records over total, 1.0 when nothing has failed yet.
    pub recovery_success_ratio: f64,
    pub health: SystemHealth,
}

/// Caller-registered recovery operation.
pub type RecoveryFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> + Send + Sync>;

struct SuppressionEntry {
    last_seen: Instant,
    record_id: String,
}

struct CoordinatorState {
    records: VecDeque<ErrorRecord>,
    suppression: HashMap<String, SuppressionEntry>,
    category_times: HashMap<ErrorCategory, VecDeque<Instant>>,
    degraded: bool,
    shutting_down: bool,
}

#[derive(Default)]
struct Handlers {
    /// Keyed by operation name.
    retry: HashMap<String, RecoveryFn>,
    /// Keyed by operation name.
    fallback: HashMap<String, RecoveryFn>,
    /// Keyed by component name.
    restart: HashMap<String, RecoveryFn>,
}

/// Receives errors with context, classifies them, and attempts recovery.
pub struct ErrorCoordinator {
    patterns: Vec<ErrorPattern>,
    state: Mutex<CoordinatorState>,
    handlers: RwLock<Handlers>,
    history_limit: usize,
    suppression_window: Duration,
    backoff_base: Duration,
}

const RECENT_WINDOW: Duration = Duration::from_secs(3_600);
const DEGRADED_RECENT_THRESHOLD: usize = 25;

impl ErrorCoordinator {
    /// Coordinator with the default pattern registry.
    pub fn new(config: &SimulationConfig) -> Self {
        Self::with_patterns(config, default_patterns())
    }

    pub fn with_patterns(config: &SimulationConfig, patterns: Vec<ErrorPattern>) -> Self {
        Self {
            patterns,
            state: Mutex::new(CoordinatorState {
                records: VecDeque::new(),
                suppression: HashMap::new(),
                category_times: HashMap::new(),
                degraded: false,
                shutting_down: false,
            }),
            handlers: RwLock::new(Handlers::default()),
            history_limit: config.error_history_limit,
            suppression_window: config.suppression_window(),
            backoff_base: Duration::from_millis(100),
        }
    }

    /// Shrink the retry backoff base (tests).
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Register the operation re-executed by the `Retry` strategy.
    pub fn register_retry(&self, operation: impl Into<String>, f: RecoveryFn) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.retry.insert(operation.into(), f);
        }
    }

    /// Register the callback invoked by the `Fallback` strategy.
    pub fn register_fallback(&self, operation: impl Into<String>, f: RecoveryFn) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.fallback.insert(operation.into(), f);
        }
    }

    /// Register the component hook invoked by the `Restart` strategy.
    pub fn register_restart(&self, component: impl Into<String>, f: RecoveryFn) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.restart.insert(component.into(), f);
        }
    }

    /// Classify, record, and attempt recovery for one error.
    pub async fn handle<E>(&self, err: &E, ctx: ErrorContext) -> RecoveryOutcome
    where
        E: std::error::Error + ?Sized,
    {
        let type_name = std::any::type_name::<E>();
        match self.try_handle(type_name, &err.to_string(), &ctx).await {
            Ok(outcome) => outcome,
            Err(internal) => {
                error!(
                    component = %ctx.component,
                    operation = %ctx.operation,
                    %internal,
                    "error coordinator failed while handling an error"
                );
                RecoveryOutcome::HandlerFailure { message: internal }
            }
        }
    }

    async fn try_handle(
        &self,
        type_name: &str,
        message: &str,
        ctx: &ErrorContext,
    ) -> Result<RecoveryOutcome, String> {
        let signature = error_signature(type_name, message, &ctx.operation);

        // Suppression and record creation under one lock, no awaits.
        let (record_id, strategy, max_attempts, escalated) = {
            let mut state = self.state.lock().map_err(|e| e.to_string())?;

            let repeat = if let Some(entry) = state.suppression.get_mut(&signature)
                && entry.last_seen.elapsed() < self.suppression_window
            {
                entry.last_seen = Instant::now();
                Some(entry.record_id.clone())
            } else {
                None
            };
            if let Some(record_id) = repeat {
                if let Some(record) = state.records.iter_mut().find(|r| r.id == record_id) {
                    record.occurrences += 1;
                }
                debug!(%signature, "repeated error suppressed");
                return Ok(RecoveryOutcome::Suppressed { signature });
            }

            let pattern = self.classify(type_name, message);
            let record = self.new_record(&pattern, &signature, message, ctx);
            let record_id = record.id.clone();
            info!(
                record = %record_id,
                category = ?record.category,
                severity = ?record.severity,
                strategy = ?record.strategy,
                component = %ctx.component,
                operation = %ctx.operation,
                %message,
                "error classified"
            );

            if state.suppression.len() >= self.history_limit {
                let window = self.suppression_window;
                state.suppression.retain(|_, e| e.last_seen.elapsed() < window);
            }
            state.suppression.insert(
                signature.clone(),
                SuppressionEntry {
                    last_seen: Instant::now(),
                    record_id: record_id.clone(),
                },
            );
            state.records.push_back(record);
            while state.records.len() > self.history_limit {
                state.records.pop_front();
            }

            let escalated = Self::track_escalation(&mut state, &pattern);

            (record_id, pattern.strategy, pattern.max_attempts, escalated)
        };

        let outcome = self
            .run_strategy(&record_id, strategy, max_attempts, escalated, ctx)
            .await?;

        // Write back what the strategy accomplished.
        {
            let mut state = self.state.lock().map_err(|e| e.to_string())?;
            if let Some(record) = state.records.iter_mut().find(|r| r.id == record_id) {
                record.escalated = escalated;
                match &outcome {
                    RecoveryOutcome::Recovered { attempts, .. } => {
                        record.attempts = *attempts;
                        record.resolved = true;
                    }
                    RecoveryOutcome::Ignored { .. } => record.resolved = true,
                    RecoveryOutcome::Unresolved { .. } => record.attempts = max_attempts,
                    _ => {}
                }
            }
        }

        Ok(outcome)
    }

    fn classify(&self, type_name: &str, message: &str) -> ErrorPattern {
        let message_lower = message.to_lowercase();
        for pattern in &self.patterns {
            let type_hit = pattern.type_markers.iter().any(|m| type_name.contains(m));
            let keyword_hit = pattern.keywords.iter().any(|k| message_lower.contains(k));
            if type_hit || keyword_hit {
                return pattern.clone();
            }
        }
        fallback_pattern()
    }

    fn new_record(
        &self,
        pattern: &ErrorPattern,
        signature: &str,
        message: &str,
        ctx: &ErrorContext,
    ) -> ErrorRecord {
        let timestamp = Utc::now();
        let mut hasher = Sha256::new();
        hasher.update(signature.as_bytes());
        hasher.update(timestamp.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
        let id = hex_prefix(hasher, 16);

        ErrorRecord {
            id,
            timestamp,
            category: pattern.category,
            severity: pattern.severity,
            strategy: pattern.strategy,
            attempts: 0,
            resolved: false,
            escalated: false,
            signature: signature.to_string(),
            message: message.to_string(),
            component: ctx.component.clone(),
            operation: ctx.operation.clone(),
            occurrences: 1,
        }
    }

    /// Returns true when the category crossed its frequency threshold in
    /// the last hour. Flags regardless of the assigned strategy.
    fn track_escalation(state: &mut CoordinatorState, pattern: &ErrorPattern) -> bool {
        let times = state.category_times.entry(pattern.category).or_default();
        let now = Instant::now();
        times.push_back(now);
        while let Some(front) = times.front() {
            if now.duration_since(*front) > RECENT_WINDOW {
                times.pop_front();
            } else {
                break;
            }
        }
        if times.len() >= pattern.escalation_threshold {
            state.degraded = true;
            warn!(
                category = ?pattern.category,
                count = times.len(),
                threshold = pattern.escalation_threshold,
                "error category escalated for operator attention"
            );
            true
        } else {
            false
        }
    }

    async fn run_strategy(
        &self,
        record_id: &str,
        strategy: RecoveryStrategy,
        max_attempts: u32,
        escalated: bool,
        ctx: &ErrorContext,
    ) -> Result<RecoveryOutcome, String> {
        match strategy {
            RecoveryStrategy::Retry => {
                let handler = self
                    .handlers
                    .read()
                    .map_err(|e| e.to_string())?
                    .retry
                    .get(&ctx.operation)
                    .cloned();
                let Some(handler) = handler else {
                    debug!(
                        operation = %ctx.operation,
                        "no retry operation registered, leaving unresolved"
                    );
                    return Ok(RecoveryOutcome::Unresolved {
                        record_id: record_id.to_string(),
                        strategy,
                        escalated,
                    });
                };
                for attempt in 1..=max_attempts {
                    let backoff = self.backoff_base * 2u32.saturating_pow(attempt - 1);
                    tokio::time::sleep(backoff).await;
                    match handler().await {
                        Ok(()) => {
                            info!(record = %record_id, attempt, "retry recovered");
                            return Ok(RecoveryOutcome::Recovered {
                                record_id: record_id.to_string(),
                                strategy,
                                attempts: attempt,
                            });
                        }
                        Err(reason) => {
                            debug!(record = %record_id, attempt, %reason, "retry attempt failed");
                        }
                    }
                }
                Ok(RecoveryOutcome::Unresolved {
                    record_id: record_id.to_string(),
                    strategy,
                    escalated,
                })
            }

            RecoveryStrategy::Fallback => {
                let handler = self
                    .handlers
                    .read()
                    .map_err(|e| e.to_string())?
                    .fallback
                    .get(&ctx.operation)
                    .cloned();
                match handler {
                    Some(handler) => match handler().await {
                        Ok(()) => Ok(RecoveryOutcome::Recovered {
                            record_id: record_id.to_string(),
                            strategy,
                            attempts: 1,
                        }),
                        Err(reason) => {
                            warn!(record = %record_id, %reason, "fallback failed");
                            Ok(RecoveryOutcome::Unresolved {
                                record_id: record_id.to_string(),
                                strategy,
                                escalated,
                            })
                        }
                    },
                    None => Ok(RecoveryOutcome::Unresolved {
                        record_id: record_id.to_string(),
                        strategy,
                        escalated,
                    }),
                }
            }

            RecoveryStrategy::Restart => {
                let handler = self
                    .handlers
                    .read()
                    .map_err(|e| e.to_string())?
                    .restart
                    .get(&ctx.component)
                    .cloned();
                match handler {
                    Some(handler) => match handler().await {
                        Ok(()) => {
                            info!(component = %ctx.component, "component restarted");
                            Ok(RecoveryOutcome::Recovered {
                                record_id: record_id.to_string(),
                                strategy,
                                attempts: 1,
                            })
                        }
                        Err(reason) => {
                            warn!(component = %ctx.component, %reason, "restart failed");
                            Ok(RecoveryOutcome::Unresolved {
                                record_id: record_id.to_string(),
                                strategy,
                                escalated,
                            })
                        }
                    },
                    None => Ok(RecoveryOutcome::Unresolved {
                        record_id: record_id.to_string(),
                        strategy,
                        escalated,
                    }),
                }
            }

            RecoveryStrategy::Escalate => {
                let mut state = self.state.lock().map_err(|e| e.to_string())?;
                state.degraded = true;
                warn!(record = %record_id, "error escalated for operator attention");
                Ok(RecoveryOutcome::Unresolved {
                    record_id: record_id.to_string(),
                    strategy,
                    escalated: true,
                })
            }

            RecoveryStrategy::Shutdown => {
                let mut state = self.state.lock().map_err(|e| e.to_string())?;
                state.shutting_down = true;
                error!(record = %record_id, "shutdown requested, marking terminal draining state");
                Ok(RecoveryOutcome::ShuttingDown {
                    record_id: record_id.to_string(),
                })
            }

            RecoveryStrategy::Ignore => Ok(RecoveryOutcome::Ignored {
                record_id: record_id.to_string(),
            }),
        }
    }

    /// Retained records, oldest first.
    pub fn records(&self) -> Vec<ErrorRecord> {
        self.state
            .lock()
            .map(|s| s.records.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// True once a `Shutdown` strategy has run.
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().map(|s| s.shutting_down).unwrap_or(true)
    }

    /// Aggregate counts, recovery ratio, and a health assessment.
    pub fn statistics(&self) -> ErrorStatistics {
        let Ok(state) = self.state.lock() else {
            return ErrorStatistics {
                total: 0,
                by_category: HashMap::new(),
                by_severity: HashMap::new(),
                recent_count: 0,
                recovery_success_ratio: 0.0,
                health: SystemHealth::Critical,
            };
        };

        let total = state.records.len();
        let mut by_category: HashMap<ErrorCategory, usize> = HashMap::new();
        let mut by_severity: HashMap<ErrorSeverity, usize> = HashMap::new();
        let mut resolved = 0usize;
        let mut recent_count = 0usize;
        let mut unresolved_critical = false;
        let cutoff = Utc::now() - chrono::Duration::hours(1);

        for record in &state.records {
            *by_category.entry(record.category).or_default() += 1;
            *by_severity.entry(record.severity).or_default() += 1;
            if record.resolved {
                resolved += 1;
            } else if record.severity == ErrorSeverity::Critical {
                unresolved_critical = true;
            }
            if record.timestamp >= cutoff {
                recent_count += 1;
            }
        }

        let recovery_success_ratio = if total == 0 {
            1.0
        } else {
            resolved as f64 / total as f64
        };

        let health = if state.shutting_down || unresolved_critical {
            SystemHealth::Critical
        } else if state.degraded || recent_count > DEGRADED_RECENT_THRESHOLD {
            SystemHealth::Degraded
        } else {
            SystemHealth::Healthy
        };

        ErrorStatistics {
            total,
            by_category,
            by_severity,
            recent_count,
            recovery_success_ratio,
            health,
        }
    }
}

/// Derived key coalescing repeats: type name + message prefix + operation.
fn error_signature(type_name: &str, message: &str, operation: &str) -> String {
    let prefix: String = message.chars().take(64).collect();
    let mut hasher = Sha256::new();
    hasher.update(type_name.as_bytes());
    hasher.update(prefix.as_bytes());
    hasher.update(operation.as_bytes());
    hex_prefix(hasher, 16)
}

fn hex_prefix(hasher: Sha256, len: usize) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(len);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
        if out.len() >= len {
            break;
        }
    }
    out.truncate(len);
    out
}

fn default_patterns() -> Vec<ErrorPattern> {
    vec![
        ErrorPattern {
            category: ErrorCategory::Concurrency,
            severity: ErrorSeverity::High,
            strategy: RecoveryStrategy::Retry,
            max_attempts: 3,
            escalation_threshold: 5,
            type_markers: vec!["Timeout", "Elapsed"],
            keywords: vec!["timeout", "timed out", "deadline", "poisoned", "deadlock"],
        },
        ErrorPattern {
            category: ErrorCategory::Persistence,
            severity: ErrorSeverity::High,
            strategy: RecoveryStrategy::Retry,
            max_attempts: 3,
            escalation_threshold: 5,
            type_markers: vec!["Persistence", "Io"],
            keywords: vec!["i/o", "disk", "serialization", "rename", "file"],
        },
        ErrorPattern {
            category: ErrorCategory::Resource,
            severity: ErrorSeverity::High,
            strategy: RecoveryStrategy::Escalate,
            max_attempts: 1,
            escalation_threshold: 3,
            type_markers: vec!["Capacity"],
            keywords: vec!["capacity", "exhausted", "limit reached", "registry full"],
        },
        ErrorPattern {
            category: ErrorCategory::Validation,
            severity: ErrorSeverity::Medium,
            strategy: RecoveryStrategy::Fallback,
            max_attempts: 1,
            escalation_threshold: 10,
            type_markers: vec!["Validation", "Invalid", "Config"],
            keywords: vec!["invalid", "validation", "malformed", "rejected", "missing"],
        },
        ErrorPattern {
            category: ErrorCategory::Conflict,
            severity: ErrorSeverity::Low,
            strategy: RecoveryStrategy::Ignore,
            max_attempts: 1,
            escalation_threshold: 20,
            type_markers: vec!["Conflict"],
            keywords: vec!["conflict", "contention", "overridden"],
        },
    ]
}

/// Unrecognized errors land here.
fn fallback_pattern() -> ErrorPattern {
    ErrorPattern {
        category: ErrorCategory::System,
        severity: ErrorSeverity::Medium,
        strategy: RecoveryStrategy::Retry,
        max_attempts: 3,
        escalation_threshold: 10,
        type_markers: Vec::new(),
        keywords: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabula_core::error::DecisionError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn coordinator() -> ErrorCoordinator {
        ErrorCoordinator::new(&SimulationConfig::default())
            .with_backoff_base(Duration::from_millis(1))
    }

    fn plain_error(message: &str) -> std::io::Error {
        std::io::Error::other(message.to_string())
    }

    #[tokio::test]
    async fn timeout_errors_classify_as_concurrency() {
        let coordinator = coordinator();
        let err = DecisionError::Timeout { elapsed_ms: 500 };
        let outcome = coordinator
            .handle(&err, ErrorContext::new("turn_engine", "agent_decision"))
            .await;
        assert!(matches!(outcome, RecoveryOutcome::Unresolved { .. }));

        let records = coordinator.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].category, ErrorCategory::Concurrency);
        assert_eq!(records[0].severity, ErrorSeverity::High);
    }

    #[tokio::test]
    async fn unrecognized_errors_default_to_system_medium_retry() {
        let coordinator = coordinator();
        let outcome = coordinator
            .handle(
                &plain_error("something entirely novel went sideways"),
                ErrorContext::new("narrator", "compose"),
            )
            .await;
        assert!(matches!(
            outcome,
            RecoveryOutcome::Unresolved {
                strategy: RecoveryStrategy::Retry,
                ..
            }
        ));
        let record = &coordinator.records()[0];
        assert_eq!(record.category, ErrorCategory::System);
        assert_eq!(record.severity, ErrorSeverity::Medium);
    }

    #[tokio::test]
    async fn identical_error_within_window_is_suppressed() {
        let coordinator = coordinator();
        let ctx = ErrorContext::new("world_state", "apply");
        let err = plain_error("disk unavailable");

        let first = coordinator.handle(&err, ctx.clone()).await;
        assert!(!matches!(first, RecoveryOutcome::Suppressed { .. }));

        let second = coordinator.handle(&err, ctx).await;
        assert!(matches!(second, RecoveryOutcome::Suppressed { .. }));

        let records = coordinator.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].occurrences, 2);
    }

    #[tokio::test]
    async fn different_operation_is_a_distinct_signature() {
        let coordinator = coordinator();
        let err = plain_error("disk unavailable");
        coordinator
            .handle(&err, ErrorContext::new("world_state", "apply"))
            .await;
        coordinator
            .handle(&err, ErrorContext::new("world_state", "persist"))
            .await;
        assert_eq!(coordinator.records().len(), 2);
    }

    #[tokio::test]
    async fn retry_recovers_via_registered_operation() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_inner = Arc::clone(&calls);
        coordinator.register_retry(
            "flush",
            Arc::new(move || {
                let calls = Arc::clone(&calls_inner);
                Box::pin(async move {
                    // Succeed on the second attempt.
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err("still broken".to_string())
                    } else {
                        Ok(())
                    }
                })
            }),
        );

        let outcome = coordinator
            .handle(
                &plain_error("disk write failed"),
                ErrorContext::new("world_state", "flush"),
            )
            .await;
        match outcome {
            RecoveryOutcome::Recovered {
                strategy, attempts, ..
            } => {
                assert_eq!(strategy, RecoveryStrategy::Retry);
                assert_eq!(attempts, 2);
            }
            other => panic!("expected recovery, got {other:?}"),
        }
        assert!(coordinator.records()[0].resolved);
    }

    #[tokio::test]
    async fn fallback_runs_registered_callback() {
        let coordinator = coordinator();
        coordinator.register_fallback(
            "parse_decision",
            Arc::new(|| Box::pin(async { Ok(()) })),
        );
        let outcome = coordinator
            .handle(
                &plain_error("malformed decision payload"),
                ErrorContext::new("turn_engine", "parse_decision"),
            )
            .await;
        assert!(matches!(
            outcome,
            RecoveryOutcome::Recovered {
                strategy: RecoveryStrategy::Fallback,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn escalation_threshold_flags_category() {
        let coordinator = coordinator();
        // Distinct messages so nothing is suppressed.
        for i in 0..3 {
            let outcome = coordinator
                .handle(
                    &plain_error(&format!("registry at capacity ({i})")),
                    ErrorContext::new("registry", "register"),
                )
                .await;
            if i == 2 {
                assert!(matches!(
                    outcome,
                    RecoveryOutcome::Unresolved { escalated: true, .. }
                ));
            }
        }
        assert_eq!(coordinator.statistics().health, SystemHealth::Degraded);
    }

    #[tokio::test]
    async fn shutdown_marks_terminal_state() {
        let config = SimulationConfig::default();
        let patterns = vec![ErrorPattern {
            category: ErrorCategory::System,
            severity: ErrorSeverity::Critical,
            strategy: RecoveryStrategy::Shutdown,
            max_attempts: 1,
            escalation_threshold: 100,
            type_markers: vec![],
            keywords: vec!["fatal"],
        }];
        let coordinator = ErrorCoordinator::with_patterns(&config, patterns);
        let outcome = coordinator
            .handle(
                &plain_error("fatal corruption"),
                ErrorContext::new("world_state", "apply"),
            )
            .await;
        assert!(matches!(outcome, RecoveryOutcome::ShuttingDown { .. }));
        assert!(coordinator.is_shutting_down());
        assert_eq!(coordinator.statistics().health, SystemHealth::Critical);
    }

    #[tokio::test]
    async fn statistics_category_counts_sum_to_total() {
        let coordinator = coordinator();
        coordinator
            .handle(
                &DecisionError::Timeout { elapsed_ms: 10 },
                ErrorContext::new("engine", "decide"),
            )
            .await;
        coordinator
            .handle(
                &plain_error("malformed input"),
                ErrorContext::new("engine", "validate"),
            )
            .await;
        coordinator
            .handle(
                &plain_error("some mystery"),
                ErrorContext::new("engine", "other"),
            )
            .await;

        let stats = coordinator.statistics();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_category.values().sum::<usize>(), stats.total);
        assert_eq!(stats.by_severity.values().sum::<usize>(), stats.total);
        assert_eq!(stats.recent_count, 3);
    }

    #[tokio::test]
    async fn healthy_with_no_errors() {
        let coordinator = coordinator();
        let stats = coordinator.statistics();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.health, SystemHealth::Healthy);
        assert!((stats.recovery_success_ratio - 1.0).abs() < f64::EPSILON);
    }
}
