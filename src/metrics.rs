//! Metrics collection for the mapping engine.
//!
//! Wraps a `prometheus::Registry` with the counters, gauges, and histograms
//! the engine facade, pipeline, error recovery, connection pools, and rate
//! limiter populate, plus ad hoc custom metrics for anything not wired in
//! up front.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use prometheus::{
    Counter, Gauge, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::config::{Config, MonitoringConfig};
use crate::error::{MappingEngineError, Result};

/// Mapping-engine-wide Prometheus metrics, created once and shared behind an
/// `Arc` by the engine facade, the HTTP layer, and the rate limiter.
pub struct MetricsCollector {
    registry: Registry,
    config: Arc<MonitoringConfig>,

    // Engine facade (C10)
    executions_total: IntCounterVec,
    records_processed_total: IntCounter,
    records_failed_total: IntCounter,
    pipeline_cache_hits_total: IntCounter,
    pipeline_cache_misses_total: IntCounter,
    result_cache_hits_total: IntCounter,
    result_cache_misses_total: IntCounter,

    // Pipeline / stages (C3, C4)
    stage_failures_total: IntCounterVec,
    stage_duration_seconds: HistogramVec,

    // Error recovery (C7)
    errors_recovered_total: IntCounterVec,
    dead_letter_entries_total: IntCounter,
    circuit_breaker_trips_total: IntCounterVec,
    circuit_breaker_state: IntGaugeVec,
    rollbacks_total: IntCounterVec,

    // Connection pools (C9)
    pool_acquire_timeouts_total: IntCounterVec,
    pool_in_use: IntGaugeVec,
    pool_errors_total: IntCounterVec,

    // Performance optimizer (C8)
    adaptive_cache_size: IntGauge,
    adaptive_cache_hit_ratio: Gauge,
    execution_strategy_selected_total: IntCounterVec,

    // Brute-force / rate state (C11)
    rate_limit_blocks_total: IntCounterVec,
    rate_limit_escalations_total: IntCounterVec,

    execution_duration_seconds: Histogram,

    custom_counters: Arc<RwLock<HashMap<String, Counter>>>,
    custom_gauges: Arc<RwLock<HashMap<String, Gauge>>>,

    start_time: SystemTime,
    last_reset_time: Arc<RwLock<SystemTime>>,
}

/// Point-in-time snapshot returned by `GET /metrics` alongside the raw
/// Prometheus text exposition, for callers that want structured JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub timestamp: i64,
}

impl MetricsCollector {
    pub fn new(config: &Config) -> Result<Self> {
        let registry = Registry::new();
        let monitoring_config = Arc::new(config.monitoring.clone());

        info!("initializing mapping engine metrics collector");

        let executions_total = IntCounterVec::new(
            Opts::new("mapping_engine_executions_total", "Total mapping executions by outcome"),
            &["mapping_id", "outcome"],
        )?;
        let records_processed_total =
            IntCounter::new("mapping_engine_records_processed_total", "Total records successfully mapped")?;
        let records_failed_total =
            IntCounter::new("mapping_engine_records_failed_total", "Total records that failed mapping")?;
        let pipeline_cache_hits_total =
            IntCounter::new("mapping_engine_pipeline_cache_hits_total", "Pipeline cache hits")?;
        let pipeline_cache_misses_total =
            IntCounter::new("mapping_engine_pipeline_cache_misses_total", "Pipeline cache misses")?;
        let result_cache_hits_total =
            IntCounter::new("mapping_engine_result_cache_hits_total", "Result cache hits")?;
        let result_cache_misses_total =
            IntCounter::new("mapping_engine_result_cache_misses_total", "Result cache misses")?;

        let stage_failures_total = IntCounterVec::new(
            Opts::new("mapping_engine_stage_failures_total", "Stage failures by stage name"),
            &["stage"],
        )?;
        let stage_duration_seconds = HistogramVec::new(
            HistogramOpts::new("mapping_engine_stage_duration_seconds", "Per-stage execution duration")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["stage"],
        )?;

        let errors_recovered_total = IntCounterVec::new(
            Opts::new("mapping_engine_errors_recovered_total", "Errors recovered, by strategy"),
            &["strategy"],
        )?;
        let dead_letter_entries_total =
            IntCounter::new("mapping_engine_dead_letter_entries_total", "Entries pushed to the dead-letter queue")?;
        let circuit_breaker_trips_total = IntCounterVec::new(
            Opts::new("mapping_engine_circuit_breaker_trips_total", "Circuit breaker trips by resource"),
            &["resource"],
        )?;
        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new("mapping_engine_circuit_breaker_state", "0=closed 1=half_open 2=open"),
            &["resource"],
        )?;
        let rollbacks_total = IntCounterVec::new(
            Opts::new("mapping_engine_rollbacks_total", "Transaction rollbacks, partial or full"),
            &["partial"],
        )?;

        let pool_acquire_timeouts_total = IntCounterVec::new(
            Opts::new("mapping_engine_pool_acquire_timeouts_total", "Connection pool acquire timeouts"),
            &["pool"],
        )?;
        let pool_in_use = IntGaugeVec::new(
            Opts::new("mapping_engine_pool_in_use", "Connections currently checked out"),
            &["pool"],
        )?;
        let pool_errors_total = IntCounterVec::new(
            Opts::new("mapping_engine_pool_errors_total", "Connection factory errors"),
            &["pool"],
        )?;

        let adaptive_cache_size =
            IntGauge::new("mapping_engine_adaptive_cache_size", "Entries currently held in the adaptive cache")?;
        let adaptive_cache_hit_ratio =
            Gauge::new("mapping_engine_adaptive_cache_hit_ratio", "Adaptive cache hit ratio in [0, 1]")?;
        let execution_strategy_selected_total = IntCounterVec::new(
            Opts::new("mapping_engine_execution_strategy_selected_total", "Strategy chosen by the optimizer"),
            &["strategy"],
        )?;

        let rate_limit_blocks_total = IntCounterVec::new(
            Opts::new("mapping_engine_rate_limit_blocks_total", "Requests blocked by the rate limiter"),
            &["tier"],
        )?;
        let rate_limit_escalations_total = IntCounterVec::new(
            Opts::new("mapping_engine_rate_limit_escalations_total", "Escalations to a stricter block level"),
            &["tier", "level"],
        )?;

        let execution_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("mapping_engine_execution_duration_seconds", "End-to-end execution duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
        )?;

        registry.register(Box::new(executions_total.clone()))?;
        registry.register(Box::new(records_processed_total.clone()))?;
        registry.register(Box::new(records_failed_total.clone()))?;
        registry.register(Box::new(pipeline_cache_hits_total.clone()))?;
        registry.register(Box::new(pipeline_cache_misses_total.clone()))?;
        registry.register(Box::new(result_cache_hits_total.clone()))?;
        registry.register(Box::new(result_cache_misses_total.clone()))?;
        registry.register(Box::new(stage_failures_total.clone()))?;
        registry.register(Box::new(stage_duration_seconds.clone()))?;
        registry.register(Box::new(errors_recovered_total.clone()))?;
        registry.register(Box::new(dead_letter_entries_total.clone()))?;
        registry.register(Box::new(circuit_breaker_trips_total.clone()))?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;
        registry.register(Box::new(rollbacks_total.clone()))?;
        registry.register(Box::new(pool_acquire_timeouts_total.clone()))?;
        registry.register(Box::new(pool_in_use.clone()))?;
        registry.register(Box::new(pool_errors_total.clone()))?;
        registry.register(Box::new(adaptive_cache_size.clone()))?;
        registry.register(Box::new(adaptive_cache_hit_ratio.clone()))?;
        registry.register(Box::new(execution_strategy_selected_total.clone()))?;
        registry.register(Box::new(rate_limit_blocks_total.clone()))?;
        registry.register(Box::new(rate_limit_escalations_total.clone()))?;
        registry.register(Box::new(execution_duration_seconds.clone()))?;

        let collector = Self {
            registry,
            config: monitoring_config,
            executions_total,
            records_processed_total,
            records_failed_total,
            pipeline_cache_hits_total,
            pipeline_cache_misses_total,
            result_cache_hits_total,
            result_cache_misses_total,
            stage_failures_total,
            stage_duration_seconds,
            errors_recovered_total,
            dead_letter_entries_total,
            circuit_breaker_trips_total,
            circuit_breaker_state,
            rollbacks_total,
            pool_acquire_timeouts_total,
            pool_in_use,
            pool_errors_total,
            adaptive_cache_size,
            adaptive_cache_hit_ratio,
            execution_strategy_selected_total,
            rate_limit_blocks_total,
            rate_limit_escalations_total,
            execution_duration_seconds,
            custom_counters: Arc::new(RwLock::new(HashMap::new())),
            custom_gauges: Arc::new(RwLock::new(HashMap::new())),
            start_time: SystemTime::now(),
            last_reset_time: Arc::new(RwLock::new(SystemTime::now())),
        };

        info!("mapping engine metrics collector initialized");
        Ok(collector)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_execution(&self, mapping_id: &str, success: bool, duration_secs: f64, records: u64, failed: u64) {
        let outcome = if success { "success" } else { "failure" };
        self.executions_total.with_label_values(&[mapping_id, outcome]).inc();
        self.records_processed_total.inc_by(records);
        self.records_failed_total.inc_by(failed);
        self.execution_duration_seconds.observe(duration_secs);
    }

    pub fn record_stage_failure(&self, stage: &str) {
        self.stage_failures_total.with_label_values(&[stage]).inc();
    }

    pub fn record_stage_duration(&self, stage: &str, duration_secs: f64) {
        self.stage_duration_seconds.with_label_values(&[stage]).observe(duration_secs);
    }

    pub fn record_pipeline_cache(&self, hit: bool) {
        if hit {
            self.pipeline_cache_hits_total.inc();
        } else {
            self.pipeline_cache_misses_total.inc();
        }
    }

    pub fn record_result_cache(&self, hit: bool) {
        if hit {
            self.result_cache_hits_total.inc();
        } else {
            self.result_cache_misses_total.inc();
        }
    }

    pub fn record_error_recovered(&self, strategy: &str) {
        self.errors_recovered_total.with_label_values(&[strategy]).inc();
    }

    pub fn record_dead_letter_entry(&self) {
        self.dead_letter_entries_total.inc();
    }

    pub fn record_circuit_trip(&self, resource: &str) {
        self.circuit_breaker_trips_total.with_label_values(&[resource]).inc();
    }

    pub fn set_circuit_state(&self, resource: &str, state: i64) {
        self.circuit_breaker_state.with_label_values(&[resource]).set(state);
    }

    pub fn record_rollback(&self, partial: bool) {
        self.rollbacks_total.with_label_values(&[if partial { "true" } else { "false" }]).inc();
    }

    pub fn record_pool_acquire_timeout(&self, pool: &str) {
        self.pool_acquire_timeouts_total.with_label_values(&[pool]).inc();
    }

    pub fn set_pool_in_use(&self, pool: &str, value: i64) {
        self.pool_in_use.with_label_values(&[pool]).set(value);
    }

    pub fn record_pool_error(&self, pool: &str) {
        self.pool_errors_total.with_label_values(&[pool]).inc();
    }

    pub fn set_adaptive_cache_stats(&self, size: i64, hit_ratio: f64) {
        self.adaptive_cache_size.set(size);
        self.adaptive_cache_hit_ratio.set(hit_ratio);
    }

    pub fn record_strategy_selected(&self, strategy: &str) {
        self.execution_strategy_selected_total.with_label_values(&[strategy]).inc();
    }

    pub fn record_rate_limit_block(&self, tier: &str) {
        self.rate_limit_blocks_total.with_label_values(&[tier]).inc();
    }

    pub fn record_rate_limit_escalation(&self, tier: &str, level: &str) {
        self.rate_limit_escalations_total.with_label_values(&[tier, level]).inc();
    }

    pub async fn create_custom_counter(&self, name: String, help: String) -> Result<()> {
        let counter = Counter::new(name.clone(), help)?;
        self.registry.register(Box::new(counter.clone()))?;
        self.custom_counters.write().await.insert(name, counter);
        Ok(())
    }

    pub async fn increment_custom_counter(&self, name: &str, value: f64) -> Result<()> {
        let counters = self.custom_counters.read().await;
        match counters.get(name) {
            Some(counter) => {
                counter.inc_by(value);
                Ok(())
            }
            None => Err(MappingEngineError::internal(format!("unknown custom counter '{name}'"))),
        }
    }

    pub async fn create_custom_gauge(&self, name: String, help: String) -> Result<()> {
        let gauge = Gauge::new(name.clone(), help)?;
        self.registry.register(Box::new(gauge.clone()))?;
        self.custom_gauges.write().await.insert(name, gauge);
        Ok(())
    }

    pub async fn set_custom_gauge(&self, name: &str, value: f64) -> Result<()> {
        let gauges = self.custom_gauges.read().await;
        match gauges.get(name) {
            Some(gauge) => {
                gauge.set(value);
                Ok(())
            }
            None => Err(MappingEngineError::internal(format!("unknown custom gauge '{name}'"))),
        }
    }

    /// Prometheus scraping cannot reset a running process's counters in
    /// place; this only resets the bookkeeping timestamp exposed via
    /// `GET /metrics/reset`, matching what a counter-based exposition format
    /// can honestly promise.
    pub async fn reset_metrics(&self) -> Result<()> {
        info!("resetting metrics bookkeeping timestamp");
        let mut last_reset = self.last_reset_time.write().await;
        *last_reset = SystemTime::now();
        Ok(())
    }

    pub fn export_prometheus(&self) -> String {
        use prometheus::TextEncoder;
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode_to_string(&metric_families).unwrap_or_else(|err| {
            error!("failed to encode metrics: {err}");
            String::new()
        })
    }

    pub fn get_snapshot(&self) -> MetricsSnapshot {
        let uptime_seconds = self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0);
        MetricsSnapshot {
            uptime_seconds,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn collection_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.collection_interval_secs)
    }
}

impl From<prometheus::Error> for MappingEngineError {
    fn from(err: prometheus::Error) -> Self {
        MappingEngineError::internal(format!("prometheus error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_initializes_and_registers_metrics() {
        let config = Config::default();
        let collector = MetricsCollector::new(&config).unwrap();
        let export = collector.export_prometheus();
        assert!(export.contains("mapping_engine_executions_total"));
    }

    #[test]
    fn records_execution_updates_counters_and_histogram() {
        let config = Config::default();
        let collector = MetricsCollector::new(&config).unwrap();
        collector.record_execution("customer-mapping", true, 0.02, 10, 0);
        let export = collector.export_prometheus();
        assert!(export.contains("mapping_engine_records_processed_total"));
    }

    #[tokio::test]
    async fn custom_counter_round_trips() {
        let config = Config::default();
        let collector = MetricsCollector::new(&config).unwrap();
        collector.create_custom_counter("custom_total".to_string(), "a custom counter".to_string()).await.unwrap();
        collector.increment_custom_counter("custom_total", 3.0).await.unwrap();
        let export = collector.export_prometheus();
        assert!(export.contains("custom_total"));
    }

    #[tokio::test]
    async fn unknown_custom_counter_errors() {
        let config = Config::default();
        let collector = MetricsCollector::new(&config).unwrap();
        let result = collector.increment_custom_counter("does-not-exist", 1.0).await;
        assert!(result.is_err());
    }

    #[test]
    fn snapshot_reports_uptime() {
        let config = Config::default();
        let collector = MetricsCollector::new(&config).unwrap();
        let snapshot = collector.get_snapshot();
        assert!(snapshot.timestamp > 0);
    }
}
