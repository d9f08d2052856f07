//! Engine Facade (C10): ties together stages, pipeline, strategies, error
//! recovery, performance optimization, and the connection pool registry
//! behind one entry point, `execute_mapping`.

use crate::config::Config;
use crate::context::{ContextConfig, ContextMetadata, ExecutionContext, ExecutionStatus};
use crate::error::{ExecutionError, InputError, MappingEngineError, Result};
use crate::performance::{self, AdaptiveCache, SystemResources};
use crate::pipeline::{HandlerDecision, Phase, Pipeline, PipelineBuilder};
use crate::pool::ConnectionPoolRegistry;
use crate::recovery::{CircuitBreakerRegistry, DeadLetterQueue, ErrorRecoveryService, RecoveryOptions, RollbackManager};
use crate::stages::{DataAggregationStage, DataEnrichmentStage, DataQualityCheckStage, DataSanitizationStage, DataValidationStage, FieldMappingStage};
use crate::strategies::{ExecutionOutcome, StrategyFactory, StrategyOptions};
use crate::types::{Mapping, Record};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

/// Typed engine-level events, mirroring the pipeline's `Observer` abstraction
/// (spec section 9) one level up: callers subscribe by kind instead of the
/// engine reaching for ad hoc `onComplete`/`onError` callbacks.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    MappingComplete { execution_id: String, mapping_id: String, records_processed: u64 },
    MappingError { execution_id: String, mapping_id: String, message: String },
    ErrorRecovered { execution_id: String, strategy: String },
    MemoryPressure { value: f64, threshold: f64 },
    PerformanceWarning { message: String },
    TransactionRolledBack { transaction_id: String, partial: bool },
}

pub trait EngineObserver: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

pub struct TracingEngineObserver;

impl EngineObserver for TracingEngineObserver {
    fn on_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::MappingComplete { execution_id, mapping_id, records_processed } => {
                tracing::info!(execution_id, mapping_id, records_processed, "mapping execution completed")
            }
            EngineEvent::MappingError { execution_id, mapping_id, message } => {
                tracing::warn!(execution_id, mapping_id, message, "mapping execution failed")
            }
            EngineEvent::ErrorRecovered { execution_id, strategy } => {
                tracing::debug!(execution_id, strategy, "error recovered")
            }
            EngineEvent::MemoryPressure { value, threshold } => {
                tracing::warn!(value, threshold, "memory pressure")
            }
            EngineEvent::PerformanceWarning { message } => tracing::warn!(message, "performance warning"),
            EngineEvent::TransactionRolledBack { transaction_id, partial } => {
                tracing::warn!(transaction_id, partial, "transaction rolled back")
            }
        }
    }
}

/// Per-call options accepted by `execute_mapping`/`execute_batch`.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub user_id: Option<String>,
    pub strict_mode: bool,
    pub force_result_cache_miss: bool,
    pub transactional: bool,
    pub strategy_override: Option<StrategyOptions>,
}

/// Bounded summary of one past execution, kept in the engine's explicit,
/// capped ring buffer rather than attached dynamically to some other
/// structure (spec section 9's redesign note).
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub mapping_id: String,
    pub status: ExecutionStatus,
    pub records_processed: u64,
    pub records_failed: u64,
    pub duration_ms: i64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EngineMetricsSnapshot {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

#[derive(Default)]
struct EngineMetrics {
    total_executions: AtomicU64,
    successful_executions: AtomicU64,
    failed_executions: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl EngineMetrics {
    fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            total_executions: self.total_executions.load(Ordering::Relaxed),
            successful_executions: self.successful_executions.load(Ordering::Relaxed),
            failed_executions: self.failed_executions.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.total_executions.store(0, Ordering::Relaxed);
        self.successful_executions.store(0, Ordering::Relaxed);
        self.failed_executions.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub complexity: f64,
    pub system_resources: SystemResources,
    pub recommendations: Vec<String>,
}

/// Ties C3 (stages) through C9 (connection pools) behind one entry point.
/// Owns a pipeline cache keyed by `mapping_id:version`, an optional result
/// cache, a bounded execution-history ring buffer, and the process-wide
/// registries (circuit breakers, connection pools) rather than leaving them
/// as module-level singletons (spec section 9).
pub struct MappingEngine {
    config: Arc<Config>,
    pipeline_cache: DashMap<String, Arc<Pipeline>>,
    result_cache: AdaptiveCache,
    history: AsyncMutex<VecDeque<ExecutionRecord>>,
    metrics: EngineMetrics,
    observers: Vec<Arc<dyn EngineObserver>>,
    pub circuit_breakers: Arc<CircuitBreakerRegistry>,
    pub pools: Arc<ConnectionPoolRegistry>,
    recovery: Arc<ErrorRecoveryService>,
    rollback: Arc<RollbackManager>,
}

impl MappingEngine {
    pub fn new(config: Arc<Config>) -> Self {
        let circuit_breakers = Arc::new(CircuitBreakerRegistry::new((&config.circuit_breaker).into()));
        let pools = Arc::new(ConnectionPoolRegistry::new());
        let dead_letter = Arc::new(DeadLetterQueue::new("mapping-engine", config.engine.rollback_history_size));
        let rollback = Arc::new(RollbackManager::new());
        let recovery = Arc::new(ErrorRecoveryService::new(dead_letter, rollback.clone()));
        let result_cache_size = config.engine.cache_size;
        let compression_threshold = config.engine.compression_threshold_bytes;

        Self {
            pipeline_cache: DashMap::new(),
            result_cache: AdaptiveCache::new(result_cache_size, compression_threshold),
            history: AsyncMutex::new(VecDeque::with_capacity(config.engine.rollback_history_size)),
            metrics: EngineMetrics::default(),
            observers: vec![Arc::new(TracingEngineObserver)],
            circuit_breakers,
            pools,
            recovery,
            rollback,
            config,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn EngineObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    fn emit(&self, event: EngineEvent) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }

    /// Step 4 of spec 4.10: resolve a compiled pipeline from cache, or build
    /// and cache one keyed by `mapping_id:version`.
    fn get_or_build_pipeline(&self, mapping: &Mapping) -> Arc<Pipeline> {
        let key = format!("{}:{}", mapping.id, mapping.version);
        if self.config.engine.enable_cache {
            if let Some(existing) = self.pipeline_cache.get(&key) {
                return existing.clone();
            }
        }

        let pipeline = Arc::new(self.build_pipeline(mapping));
        if self.config.engine.enable_cache {
            self.pipeline_cache.insert(key, pipeline.clone());
        }
        pipeline
    }

    fn build_pipeline(&self, mapping: &Mapping) -> Pipeline {
        let stop_on_error = self.config.engine.stop_on_error;
        let lenient_handler: crate::pipeline::ErrorHandler = Arc::new(move |_err, data| HandlerDecision {
            continue_execution: !stop_on_error,
            data: Some(data.clone()),
        });

        let mut builder = PipelineBuilder::new()
            .add_stage(Phase::Pre, Arc::new(DataValidationStage))
            .add_stage(Phase::Pre, Arc::new(DataSanitizationStage))
            .add_stage(Phase::Transform, Arc::new(FieldMappingStage));

        if mapping.aggregation.is_some() {
            builder = builder.add_stage(Phase::Transform, Arc::new(DataAggregationStage));
        }

        builder = builder
            .add_stage(Phase::Validation, Arc::new(DataQualityCheckStage::default()))
            .add_stage(Phase::Post, Arc::new(DataEnrichmentStage::new(self.pools.clone())))
            .on_phase_error(Phase::Pre, lenient_handler.clone())
            .on_phase_error(Phase::Validation, lenient_handler);

        builder.build()
    }

    /// Steps 1-2 of spec 4.10: assign an execution id and reject obviously
    /// bad input before touching caches or strategies.
    fn validate_inputs(mapping: &Mapping, data: &Record) -> Result<()> {
        if mapping.rules.is_empty() {
            return Err(MappingEngineError::mapping_validation("mapping has no rules"));
        }
        if data.is_null() {
            return Err(InputError::DataValidation {
                field: "sourceData".into(),
                message: "source data must not be null".into(),
            }
            .into());
        }
        Ok(())
    }

    /// Executes a mapping over a single record (spec §4.10's `executeMapping`).
    pub async fn execute_mapping(&self, mapping: &Mapping, data: Record, options: ExecuteOptions) -> Result<ExecutionOutcome> {
        self.execute(mapping, vec![data], options).await
    }

    /// Executes a mapping over a sequence of records (`executeBatch`).
    pub async fn execute_batch(&self, mapping: &Mapping, data: Vec<Record>, options: ExecuteOptions) -> Result<ExecutionOutcome> {
        self.execute(mapping, data, options).await
    }

    /// Forces the Stream strategy regardless of the optimizer's
    /// recommendation (`processWithStreaming`).
    pub async fn process_with_streaming(
        &self,
        mapping: &Mapping,
        data: Vec<Record>,
        high_water_mark: usize,
        max_concurrency: usize,
        backpressure_threshold: usize,
    ) -> Result<ExecutionOutcome> {
        let options = ExecuteOptions {
            strategy_override: Some(StrategyOptions::Stream { high_water_mark, max_concurrency, backpressure_threshold }),
            ..Default::default()
        };
        self.execute(mapping, data, options).await
    }

    async fn execute(&self, mapping: &Mapping, data: Vec<Record>, options: ExecuteOptions) -> Result<ExecutionOutcome> {
        let execution_id = Uuid::new_v4().to_string();
        self.metrics.total_executions.fetch_add(1, Ordering::Relaxed);

        for record in &data {
            Self::validate_inputs(mapping, record)?;
        }

        if options.transactional {
            self.rollback.start_transaction(execution_id.clone());
        }

        let cache_key = result_cache_key(mapping, &data);
        if self.config.engine.enable_result_cache && !options.force_result_cache_miss {
            if let Some(cached) = self.result_cache.get(&cache_key) {
                if let Ok(outcome) = serde_json::from_slice::<ExecutionOutcomeRecord>(&cached) {
                    self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(outcome.into());
                }
            }
        }
        self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);

        let pipeline = self.get_or_build_pipeline(mapping);

        let resources = performance::get_system_resources();
        if resources.memory_pressure > self.config.engine.memory_threshold {
            self.emit(EngineEvent::MemoryPressure { value: resources.memory_pressure, threshold: self.config.engine.memory_threshold });
        }

        let strategy_options = if let Some(overridden) = options.strategy_override.clone() {
            overridden
        } else if self.config.engine.enable_performance_optimization {
            let complexity = performance::calculate_complexity(mapping);
            let recommendation = performance::optimize_execution_strategy(data.len(), complexity, resources);
            for reason in &recommendation.reasons {
                tracing::debug!(reason, "performance optimizer recommendation");
            }
            recommendation.options
        } else {
            StrategyOptions::Sequential { stop_on_error: self.config.engine.stop_on_error }
        };

        let strategy = StrategyFactory::create(strategy_options)?;

        let mut ctx = ExecutionContext::new(
            ContextMetadata {
                mapping_id: Some(mapping.id.clone()),
                user_id: options.user_id.clone(),
                ..Default::default()
            },
            ContextConfig {
                timeout_ms: self.config.engine.default_timeout_ms,
                strict_mode: options.strict_mode,
                ..Default::default()
            },
        );
        ctx.start();

        let run_result = tokio::time::timeout(
            Duration::from_millis(ctx.config.timeout_ms),
            strategy.execute(data, &pipeline, mapping, &mut ctx),
        )
        .await;

        let outcome = match run_result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                return self.handle_execution_failure(mapping, &execution_id, &mut ctx, err, options).await;
            }
            Err(_) => {
                let err: MappingEngineError = ExecutionError::Timeout { timeout_ms: ctx.config.timeout_ms }.into();
                return self.handle_execution_failure(mapping, &execution_id, &mut ctx, err, options).await;
            }
        };

        ctx.complete();

        if options.transactional {
            self.rollback.commit_transaction(&execution_id);
        }

        if self.config.engine.enable_result_cache {
            if let Ok(bytes) = serde_json::to_vec(&ExecutionOutcomeRecord::from(&outcome)) {
                self.result_cache.put(cache_key, bytes);
            }
        }

        self.metrics.successful_executions.fetch_add(1, Ordering::Relaxed);
        self.record_history(&execution_id, mapping, &ctx).await;
        self.emit(EngineEvent::MappingComplete {
            execution_id,
            mapping_id: mapping.id.clone(),
            records_processed: ctx.state.records_processed,
        });

        Ok(outcome)
    }

    async fn handle_execution_failure(
        &self,
        mapping: &Mapping,
        execution_id: &str,
        ctx: &mut ExecutionContext,
        err: MappingEngineError,
        options: ExecuteOptions,
    ) -> Result<ExecutionOutcome> {
        let recovery_options = RecoveryOptions {
            stage: "execute",
            fallback_value: None,
            fallback_function: None,
            rollback_transaction_id: if options.transactional { Some(execution_id) } else { None },
        };

        let recovery = self
            .recovery
            .handle_error(&err, ctx, recovery_options, None::<fn() -> std::future::Ready<Result<serde_json::Value>>>)
            .await;

        match recovery {
            Ok(result) if result.success => {
                self.emit(EngineEvent::ErrorRecovered {
                    execution_id: execution_id.to_string(),
                    strategy: format!("{:?}", result.strategy),
                });
                ctx.complete();
                self.metrics.successful_executions.fetch_add(1, Ordering::Relaxed);
                self.record_history(execution_id, mapping, ctx).await;
                Ok(ExecutionOutcome::default())
            }
            _ => {
                if options.transactional {
                    self.emit(EngineEvent::TransactionRolledBack { transaction_id: execution_id.to_string(), partial: false });
                }
                ctx.fail(&err);
                self.metrics.failed_executions.fetch_add(1, Ordering::Relaxed);
                self.record_history(execution_id, mapping, ctx).await;
                self.emit(EngineEvent::MappingError {
                    execution_id: execution_id.to_string(),
                    mapping_id: mapping.id.clone(),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn record_history(&self, execution_id: &str, mapping: &Mapping, ctx: &ExecutionContext) {
        let mut history = self.history.lock().await;
        if history.len() >= self.config.engine.rollback_history_size.max(1) {
            history.pop_front();
        }
        history.push_back(ExecutionRecord {
            execution_id: execution_id.to_string(),
            mapping_id: mapping.id.clone(),
            status: ctx.state.status,
            records_processed: ctx.state.records_processed,
            records_failed: ctx.metrics.records_failed,
            duration_ms: ctx.state.duration_ms.unwrap_or(0),
            completed_at: Utc::now(),
        });
    }

    pub async fn history(&self) -> Vec<ExecutionRecord> {
        self.history.lock().await.iter().cloned().collect()
    }

    /// `validate(mapping, sampleData)`: runs complexity/resource analysis
    /// and, if sample data was supplied, a dry run of the validation stage.
    pub async fn validate(&self, mapping: &Mapping, sample_data: Option<Record>) -> ValidationReport {
        let mut errors = Vec::new();
        if mapping.rules.is_empty() {
            errors.push("mapping has no rules".to_string());
        }
        if let Err(message) = mapping.validate_rules() {
            errors.push(message);
        }

        if let Some(sample) = sample_data {
            let pipeline = self.get_or_build_pipeline(mapping);
            let mut ctx = ExecutionContext::new(ContextMetadata::default(), ContextConfig::default());
            if let Err(err) = pipeline.execute(sample, &mut ctx, mapping).await {
                errors.push(err.to_string());
            }
        }

        let complexity = performance::calculate_complexity(mapping);
        let resources = performance::get_system_resources();
        let mut recommendations = Vec::new();
        if complexity > 0.7 {
            recommendations.push("mapping complexity is high; consider the Sequential strategy for predictable latency".to_string());
        }
        if resources.memory_pressure > self.config.engine.memory_threshold {
            recommendations.push("system is under memory pressure; batch size will be shrunk automatically".to_string());
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
            complexity,
            system_resources: resources,
            recommendations,
        }
    }

    pub fn get_metrics(&self) -> EngineMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Drains connection pools and clears the pipeline/result caches.
    pub async fn shutdown(&self) {
        self.pipeline_cache.clear();
        self.history.lock().await.clear();
    }
}

/// Serializable projection of `ExecutionOutcome` used as the result-cache
/// payload (the cache is byte-oriented so it can share the adaptive cache's
/// compression path).
#[derive(serde::Serialize, serde::Deserialize)]
struct ExecutionOutcomeRecord {
    results: Vec<Record>,
    errors: Vec<(usize, String)>,
}

impl From<&ExecutionOutcome> for ExecutionOutcomeRecord {
    fn from(outcome: &ExecutionOutcome) -> Self {
        Self { results: outcome.results.clone(), errors: outcome.errors.clone() }
    }
}

impl From<ExecutionOutcomeRecord> for ExecutionOutcome {
    fn from(record: ExecutionOutcomeRecord) -> Self {
        Self { results: record.results, errors: record.errors }
    }
}

fn result_cache_key(mapping: &Mapping, data: &[Record]) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    mapping.id.hash(&mut hasher);
    mapping.version.hash(&mut hasher);
    if let Ok(serialized) = serde_json::to_string(data) {
        serialized.hash(&mut hasher);
    }
    format!("{:x}", hasher.finish())
}
