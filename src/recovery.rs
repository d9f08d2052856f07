//! Error Recovery & Rollback (C7): retry/fallback/skip policy, a per-resource
//! circuit breaker registry, a dead-letter queue, and transaction rollback.

use crate::context::ExecutionContext;
use crate::error::{ExecutionError, MappingEngineError, Result, SystemicError, TransactionalError};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// One entry in a transaction's reversible-action journal (spec 3's
/// `RollbackJournal`).
#[derive(Debug, Clone)]
pub struct Action {
    pub kind: ActionKind,
    pub description: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    RestoreState,
    InverseOp,
    DeleteResource,
}

/// Outcome of `handle_error`: whether recovery succeeded, and which
/// strategy was applied.
#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub strategy: RecoveryStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    Retry,
    FallbackValue,
    FallbackFunction,
    SkipAndLog,
    Rollback,
    None,
}

/// Collaborators an error-recovery call may use, provided by the caller per
/// invocation rather than captured ambiently.
pub struct RecoveryOptions<'a> {
    pub stage: &'a str,
    pub fallback_value: Option<serde_json::Value>,
    pub fallback_function: Option<Arc<dyn Fn() -> Result<serde_json::Value> + Send + Sync>>,
    pub rollback_transaction_id: Option<&'a str>,
}

/// Retries `retry_fn` subject to `ctx`'s retry budget, falls back to a value
/// or function, or marks the record skipped, in the order of spec 4.7.
pub struct ErrorRecoveryService {
    dead_letter: Arc<DeadLetterQueue>,
    rollback: Arc<RollbackManager>,
}

impl ErrorRecoveryService {
    pub fn new(dead_letter: Arc<DeadLetterQueue>, rollback: Arc<RollbackManager>) -> Self {
        Self { dead_letter, rollback }
    }

    pub async fn handle_error<F, Fut>(
        &self,
        err: &MappingEngineError,
        ctx: &mut ExecutionContext,
        options: RecoveryOptions<'_>,
        mut retry_fn: Option<F>,
    ) -> Result<RecoveryResult>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<serde_json::Value>>,
    {
        if !err.is_never_retried() && err.is_retryable() {
            if let Some(retry_fn) = retry_fn.as_mut() {
                if ctx.increment_retry() {
                    tokio::time::sleep(ctx.get_retry_delay()).await;
                    if let Ok(result) = retry_fn().await {
                        return Ok(RecoveryResult {
                            success: true,
                            result: Some(result),
                            strategy: RecoveryStrategy::Retry,
                        });
                    }
                }
            }
        }

        if let Some(value) = options.fallback_value {
            return Ok(RecoveryResult {
                success: true,
                result: Some(value),
                strategy: RecoveryStrategy::FallbackValue,
            });
        }

        if let Some(f) = options.fallback_function {
            if let Ok(value) = f() {
                return Ok(RecoveryResult {
                    success: true,
                    result: Some(value),
                    strategy: RecoveryStrategy::FallbackFunction,
                });
            }
        }

        if let Some(transaction_id) = options.rollback_transaction_id {
            let rollback = self.rollback_transaction(transaction_id).await?;
            ctx.add_warning(
                format!("transaction {transaction_id} rolled back (partial={})", rollback.partial),
                None,
            );
            return Ok(RecoveryResult {
                success: false,
                result: None,
                strategy: RecoveryStrategy::Rollback,
            });
        }

        ctx.add_error(err, None);
        self.dead_letter
            .push(DeadLetterEntry {
                stage: options.stage.to_string(),
                message: err.to_string(),
                recorded_at: Instant::now(),
            })
            .await?;
        Ok(RecoveryResult {
            success: true,
            result: None,
            strategy: RecoveryStrategy::SkipAndLog,
        })
    }
}

// ---------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: f64,
    pub volume_threshold: u64,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
    pub rolling_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            volume_threshold: 10,
            success_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            rolling_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CircuitStats {
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_timeouts: u64,
}

/// Per-resource circuit breaker state machine, spec 4.7: CLOSED -> OPEN on
/// failure-rate breach, OPEN -> HALF_OPEN after `reset_timeout`, HALF_OPEN ->
/// CLOSED after `success_threshold` consecutive successes, any HALF_OPEN
/// failure snaps back to OPEN.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

struct CircuitInner {
    state: CircuitState,
    window_start: Instant,
    window_requests: u64,
    window_failures: u64,
    consecutive_successes: u32,
    next_attempt_time: Instant,
    stats: CircuitStats,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                window_start: Instant::now(),
                window_requests: 0,
                window_failures: 0,
                consecutive_successes: 0,
                next_attempt_time: Instant::now(),
                stats: CircuitStats::default(),
            }),
        }
    }

    /// Returns `Err(CircuitOpen)` without running anything if the breaker is
    /// open; transitions to HALF_OPEN if the cooldown has elapsed.
    pub async fn guard(&self, resource: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.roll_window(&mut inner);
        if inner.state == CircuitState::Open {
            if Instant::now() >= inner.next_attempt_time {
                inner.state = CircuitState::HalfOpen;
                inner.consecutive_successes = 0;
            } else {
                return Err(ExecutionError::CircuitOpen { resource: resource.to_string() }.into());
            }
        }
        Ok(())
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.stats.total_requests += 1;
        inner.stats.total_successes += 1;
        inner.window_requests += 1;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.window_failures = 0;
                    inner.window_requests = 0;
                    inner.window_start = Instant::now();
                }
            }
            CircuitState::Closed => {}
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self, timed_out: bool) {
        let mut inner = self.inner.lock().await;
        inner.stats.total_requests += 1;
        inner.stats.total_failures += 1;
        if timed_out {
            inner.stats.total_timeouts += 1;
        }
        inner.window_requests += 1;
        inner.window_failures += 1;

        match inner.state {
            CircuitState::HalfOpen => self.trip(&mut inner),
            CircuitState::Closed => {
                let failure_rate = inner.window_failures as f64 / inner.window_requests.max(1) as f64;
                if inner.window_requests >= self.config.volume_threshold && failure_rate >= self.config.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self, inner: &mut CircuitInner) {
        inner.state = CircuitState::Open;
        inner.next_attempt_time = Instant::now() + self.config.reset_timeout;
        inner.consecutive_successes = 0;
    }

    fn roll_window(&self, inner: &mut CircuitInner) {
        if inner.state == CircuitState::Closed && inner.window_start.elapsed() > self.config.rolling_window {
            inner.window_start = Instant::now();
            inner.window_requests = 0;
            inner.window_failures = 0;
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn stats(&self) -> CircuitStats {
        self.inner.lock().await.stats.clone()
    }
}

/// Process-wide registry of circuit breakers, one per resource name, owned
/// by the engine facade rather than a module-level singleton.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self { breakers: DashMap::new(), default_config }
    }

    pub fn get_or_create(&self, resource: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.default_config)))
            .clone()
    }
}

// ---------------------------------------------------------------------
// Dead-letter queue
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    pub stage: String,
    pub message: String,
    pub recorded_at: Instant,
}

/// Bounded FIFO of irrecoverable items; overflow surfaces
/// `DeadLetterQueueFull` rather than silently dropping entries.
pub struct DeadLetterQueue {
    name: String,
    capacity: usize,
    entries: Mutex<VecDeque<DeadLetterEntry>>,
}

impl DeadLetterQueue {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn push(&self, entry: DeadLetterEntry) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.capacity {
            return Err(SystemicError::DeadLetterQueueFull {
                queue: self.name.clone(),
                capacity: self.capacity,
            }
            .into());
        }
        entries.push_back(entry);
        Ok(())
    }

    pub async fn drain(&self) -> Vec<DeadLetterEntry> {
        let mut entries = self.entries.lock().await;
        entries.drain(..).collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

// ---------------------------------------------------------------------
// Rollback manager
// ---------------------------------------------------------------------

struct Transaction {
    actions: Vec<Action>,
    committed: bool,
}

#[derive(Debug, Clone)]
pub struct RollbackOutcome {
    pub ok: bool,
    pub partial: bool,
    pub failed_actions: usize,
}

/// Tracks in-flight transactions and replays their recorded actions in
/// reverse order on rollback (spec 4.7's `RollbackManager`).
#[derive(Default)]
pub struct RollbackManager {
    transactions: DashMap<String, Transaction>,
}

impl RollbackManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_transaction(&self, id: impl Into<String>) {
        self.transactions.insert(id.into(), Transaction { actions: Vec::new(), committed: false });
    }

    pub fn record_action(&self, id: &str, action: Action) {
        if let Some(mut tx) = self.transactions.get_mut(id) {
            tx.actions.push(action);
        }
    }

    pub fn commit_transaction(&self, id: &str) {
        if let Some(mut tx) = self.transactions.get_mut(id) {
            tx.committed = true;
        }
        self.transactions.remove(id);
    }

    /// Invokes the reverse-of-`action` effect for every recorded action in
    /// reverse order. `undo` performs the actual inverse effect for an
    /// action kind; its failure is recorded but does not stop the replay.
    pub async fn rollback_transaction<F, Fut>(&self, id: &str, mut undo: F) -> Result<RollbackOutcome>
    where
        F: FnMut(&Action) -> Fut,
        Fut: Future<Output = std::result::Result<(), String>>,
    {
        let Some((_, tx)) = self.transactions.remove(id) else {
            return Ok(RollbackOutcome { ok: true, partial: false, failed_actions: 0 });
        };

        let mut failed = 0usize;
        for action in tx.actions.iter().rev() {
            if undo(action).await.is_err() {
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(TransactionalError::PartialRollback {
                transaction_id: id.to_string(),
                failed_actions: failed,
            }
            .into());
        }
        Ok(RollbackOutcome { ok: true, partial: false, failed_actions: 0 })
    }
}

impl ErrorRecoveryService {
    /// Convenience used from `handle_error` when no caller-supplied `undo`
    /// closure is available: actions are treated as best-effort no-ops,
    /// matching the "propagate, don't re-derive the forward effect" stance
    /// a pure rollback journal takes when the inverse isn't separately wired.
    async fn rollback_transaction(&self, id: &str) -> Result<RollbackOutcome> {
        self.rollback.rollback_transaction(id, |_action| async { Ok::<(), String>(()) }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextConfig, ContextMetadata};

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(ContextMetadata::default(), ContextConfig::default())
    }

    #[tokio::test]
    async fn circuit_trips_after_volume_and_failure_rate_breach() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 0.5,
            volume_threshold: 4,
            success_threshold: 2,
            reset_timeout: Duration::from_millis(20),
            rolling_window: Duration::from_secs(60),
        });

        for _ in 0..4 {
            breaker.record_failure(false).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(breaker.guard("pg").await.is_err());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.guard("pg").await.is_ok());
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_circuit() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 0.5,
            volume_threshold: 2,
            success_threshold: 2,
            reset_timeout: Duration::from_millis(10),
            rolling_window: Duration::from_secs(60),
        });
        breaker.record_failure(false).await;
        breaker.record_failure(false).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(15)).await;
        breaker.guard("pg").await.unwrap();
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        breaker.record_failure(false).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn dead_letter_queue_rejects_beyond_capacity() {
        let dlq = DeadLetterQueue::new("stage-failures", 1);
        dlq.push(DeadLetterEntry { stage: "s".into(), message: "m".into(), recorded_at: Instant::now() })
            .await
            .unwrap();
        let result = dlq
            .push(DeadLetterEntry { stage: "s".into(), message: "m2".into(), recorded_at: Instant::now() })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn rollback_replays_actions_in_reverse_order() {
        let manager = RollbackManager::new();
        manager.start_transaction("tx1");
        manager.record_action("tx1", Action { kind: ActionKind::InverseOp, description: "first".into(), data: serde_json::json!(1) });
        manager.record_action("tx1", Action { kind: ActionKind::InverseOp, description: "second".into(), data: serde_json::json!(2) });

        let order = Arc::new(Mutex::new(Vec::new()));
        let order_clone = order.clone();
        manager
            .rollback_transaction("tx1", move |action| {
                let order = order_clone.clone();
                let description = action.description.clone();
                async move {
                    order.lock().await.push(description);
                    Ok::<(), String>(())
                }
            })
            .await
            .unwrap();

        assert_eq!(*order.lock().await, vec!["second".to_string(), "first".to_string()]);
    }

    #[tokio::test]
    async fn handle_error_retries_then_succeeds() {
        let service = ErrorRecoveryService::new(
            Arc::new(DeadLetterQueue::new("dlq", 10)),
            Arc::new(RollbackManager::new()),
        );
        let mut context = ctx();
        let err: MappingEngineError = ExecutionError::Timeout { timeout_ms: 10 }.into();
        let mut attempts = 0;
        let result = service
            .handle_error(
                &err,
                &mut context,
                RecoveryOptions { stage: "FieldMapping", fallback_value: None, fallback_function: None, rollback_transaction_id: None },
                Some(|| {
                    attempts += 1;
                    async move { Ok(serde_json::json!({"ok": true})) }
                }),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.strategy, RecoveryStrategy::Retry);
    }

    #[tokio::test]
    async fn handle_error_skips_and_logs_when_no_recovery_available() {
        let service = ErrorRecoveryService::new(
            Arc::new(DeadLetterQueue::new("dlq", 10)),
            Arc::new(RollbackManager::new()),
        );
        let mut context = ctx();
        let err: MappingEngineError = ExecutionError::Cancelled { reason: "shutdown".into() }.into();
        let result = service
            .handle_error(
                &err,
                &mut context,
                RecoveryOptions { stage: "FieldMapping", fallback_value: None, fallback_function: None, rollback_transaction_id: None },
                None::<fn() -> std::future::Ready<Result<serde_json::Value>>>,
            )
            .await
            .unwrap();
        assert_eq!(result.strategy, RecoveryStrategy::SkipAndLog);
        assert_eq!(context.state.errors.len(), 1);
    }
}
