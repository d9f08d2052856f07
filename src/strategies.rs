//! Execution Strategies (C5): Sequential, Batch, Stream, and Parallel drivers
//! of the pipeline over a record or a sequence of records.

use crate::context::ExecutionContext;
use crate::error::{ExecutionError, MappingEngineError, Result};
use crate::pipeline::Pipeline;
use crate::types::{Mapping, Record};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// One record's outcome: the transformed record, or the error that made it
/// fail, tagged with its position so callers can restore input ordering.
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub index: usize,
    pub output: std::result::Result<Record, String>,
}

/// Aggregate result of driving a sequence of records through the pipeline.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub results: Vec<Record>,
    pub errors: Vec<(usize, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct StrategyMetricsSnapshot {
    pub execution_count: u64,
    pub records_processed: u64,
    pub average_execution_time_ms: f64,
    pub error_rate: f64,
}

#[derive(Default)]
struct StrategyMetrics {
    execution_count: AtomicU64,
    records_processed: AtomicU64,
    records_failed: AtomicU64,
    total_time_ms: AtomicU64,
}

impl StrategyMetrics {
    fn record(&self, records: usize, failed: usize, elapsed: Duration) {
        self.execution_count.fetch_add(1, Ordering::Relaxed);
        self.records_processed.fetch_add(records as u64, Ordering::Relaxed);
        self.records_failed.fetch_add(failed as u64, Ordering::Relaxed);
        self.total_time_ms.fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StrategyMetricsSnapshot {
        let count = self.execution_count.load(Ordering::Relaxed);
        let processed = self.records_processed.load(Ordering::Relaxed);
        let failed = self.records_failed.load(Ordering::Relaxed);
        let total_ms = self.total_time_ms.load(Ordering::Relaxed);
        StrategyMetricsSnapshot {
            execution_count: count,
            records_processed: processed,
            average_execution_time_ms: if count > 0 { total_ms as f64 / count as f64 } else { 0.0 },
            error_rate: if processed > 0 { failed as f64 / processed as f64 } else { 0.0 },
        }
    }
}

/// Shared contract for every execution strategy (spec 4.5): drive `records`
/// through `pipeline` under `ctx`, preserving input ordering in the output.
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    async fn execute(
        &self,
        records: Vec<Record>,
        pipeline: &Pipeline,
        mapping: &Mapping,
        ctx: &mut ExecutionContext,
    ) -> Result<ExecutionOutcome>;

    fn metrics(&self) -> StrategyMetricsSnapshot;

    fn name(&self) -> &'static str;
}

async fn run_one(pipeline: &Pipeline, mapping: &Mapping, ctx: &mut ExecutionContext, record: Record) -> Result<Record> {
    pipeline.execute(record, ctx, mapping).await.map(|output| output.data)
}

// ---------------------------------------------------------------------
// Sequential
// ---------------------------------------------------------------------

pub struct SequentialStrategy {
    pub stop_on_error: bool,
    metrics: StrategyMetrics,
}

impl SequentialStrategy {
    pub fn new(stop_on_error: bool) -> Self {
        Self { stop_on_error, metrics: StrategyMetrics::default() }
    }
}

#[async_trait]
impl ExecutionStrategy for SequentialStrategy {
    async fn execute(
        &self,
        records: Vec<Record>,
        pipeline: &Pipeline,
        mapping: &Mapping,
        ctx: &mut ExecutionContext,
    ) -> Result<ExecutionOutcome> {
        let start = Instant::now();
        let total = records.len();
        let mut outcome = ExecutionOutcome::default();

        for (index, record) in records.into_iter().enumerate() {
            match run_one(pipeline, mapping, ctx, record).await {
                Ok(output) => outcome.results.push(output),
                Err(err) => {
                    ctx.add_error(&err, Some(index));
                    outcome.errors.push((index, err.to_string()));
                    if self.stop_on_error {
                        self.metrics.record(outcome.results.len(), outcome.errors.len(), start.elapsed());
                        return Err(err);
                    }
                }
            }
            ctx.update_progress((index + 1) as u64, total as u64, None);
        }

        self.metrics.record(outcome.results.len(), outcome.errors.len(), start.elapsed());
        Ok(outcome)
    }

    fn metrics(&self) -> StrategyMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn name(&self) -> &'static str {
        "sequential"
    }
}

// ---------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------

pub struct BatchStrategy {
    pub batch_size: usize,
    pub max_batches: Option<usize>,
    pub delay_between_batches: Option<Duration>,
    pub stop_on_error: bool,
    metrics: StrategyMetrics,
}

impl BatchStrategy {
    pub fn new(batch_size: usize, stop_on_error: bool) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_batches: None,
            delay_between_batches: None,
            stop_on_error,
            metrics: StrategyMetrics::default(),
        }
    }
}

#[async_trait]
impl ExecutionStrategy for BatchStrategy {
    async fn execute(
        &self,
        records: Vec<Record>,
        pipeline: &Pipeline,
        mapping: &Mapping,
        ctx: &mut ExecutionContext,
    ) -> Result<ExecutionOutcome> {
        let start = Instant::now();
        let total = records.len();
        let mut outcome = ExecutionOutcome::default();
        let mut processed = 0usize;

        let chunks: Vec<Vec<Record>> = records
            .chunks(self.batch_size)
            .take(self.max_batches.unwrap_or(usize::MAX))
            .map(|c| c.to_vec())
            .collect();

        for (batch_index, chunk) in chunks.into_iter().enumerate() {
            for record in chunk {
                let index = processed;
                match run_one(pipeline, mapping, ctx, record).await {
                    Ok(output) => outcome.results.push(output),
                    Err(err) => {
                        ctx.add_error(&err, Some(index));
                        outcome.errors.push((index, err.to_string()));
                        if self.stop_on_error {
                            self.metrics.record(outcome.results.len(), outcome.errors.len(), start.elapsed());
                            return Err(err);
                        }
                    }
                }
                processed += 1;
                ctx.update_progress(processed as u64, total as u64, None);
            }
            if let Some(delay) = self.delay_between_batches {
                if batch_index > 0 {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        self.metrics.record(outcome.results.len(), outcome.errors.len(), start.elapsed());
        Ok(outcome)
    }

    fn metrics(&self) -> StrategyMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn name(&self) -> &'static str {
        "batch"
    }
}

// ---------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------

/// Ingests records into a bounded queue and consumes them with a fixed
/// number of in-flight pipeline invocations. Ordering is restored by
/// index before the final result is returned (a cooperative-task scheduler
/// is the engine's concurrency model; a true unbounded stream API is left
/// to the caller driving `execute` with successive chunks).
///
/// TODO: the "adaptive buffering" policy referenced by
/// `enable_adaptive_buffering` is not implemented -- spec section 9 defers
/// its mechanics and only the backpressure primitives (`high_water_mark`,
/// `backpressure_threshold`, sleep-based signalling) are built here.
pub struct StreamStrategy {
    pub high_water_mark: usize,
    pub max_concurrency: usize,
    pub backpressure_threshold: usize,
    pub enable_adaptive_buffering: bool,
    metrics: StrategyMetrics,
}

impl StreamStrategy {
    pub fn new(high_water_mark: usize, max_concurrency: usize, backpressure_threshold: usize) -> Self {
        Self {
            high_water_mark,
            max_concurrency: max_concurrency.max(1),
            backpressure_threshold,
            enable_adaptive_buffering: false,
            metrics: StrategyMetrics::default(),
        }
    }
}

#[async_trait]
impl ExecutionStrategy for StreamStrategy {
    async fn execute(
        &self,
        records: Vec<Record>,
        pipeline: &Pipeline,
        mapping: &Mapping,
        ctx: &mut ExecutionContext,
    ) -> Result<ExecutionOutcome> {
        let start = Instant::now();
        let total = records.len();
        let high_water_mark = self.high_water_mark.max(1);
        let backpressure_threshold = self.backpressure_threshold;
        let in_flight = AtomicU64::new(0);

        let mut all_results: Vec<RecordOutcome> = stream::iter(records.into_iter().enumerate())
            .map(|(index, record)| {
                let in_flight = &in_flight;
                async move {
                    // Cooperative backpressure signal: once in-flight work
                    // crosses the configured threshold, new work yields once
                    // before starting so the buffered queue can drain.
                    if in_flight.load(Ordering::Relaxed) as usize >= backpressure_threshold {
                        tokio::task::yield_now().await;
                    }
                    in_flight.fetch_add(1, Ordering::Relaxed);
                    let mut local_ctx = ExecutionContext::new(Default::default(), Default::default());
                    let outcome = pipeline.execute(record, &mut local_ctx, mapping).await;
                    in_flight.fetch_sub(1, Ordering::Relaxed);
                    RecordOutcome {
                        index,
                        output: outcome.map(|o| o.data).map_err(|e| e.to_string()),
                    }
                }
            })
            .buffer_unordered(self.max_concurrency.min(high_water_mark))
            .collect()
            .await;

        all_results.sort_by_key(|r| r.index);

        let mut outcome = ExecutionOutcome::default();
        for r in all_results {
            match r.output {
                Ok(value) => outcome.results.push(value),
                Err(message) => {
                    ctx.add_warning(format!("stream record {} failed: {message}", r.index), None);
                    outcome.errors.push((r.index, message));
                }
            }
        }
        ctx.update_progress(total as u64, total as u64, None);
        self.metrics.record(outcome.results.len(), outcome.errors.len(), start.elapsed());
        Ok(outcome)
    }

    fn metrics(&self) -> StrategyMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn name(&self) -> &'static str {
        "stream"
    }
}

// ---------------------------------------------------------------------
// Parallel
// ---------------------------------------------------------------------

pub struct ParallelStrategy {
    pub chunk_size: usize,
    pub max_concurrency: usize,
    pub record_timeout: Duration,
    metrics: StrategyMetrics,
}

impl ParallelStrategy {
    pub fn new(chunk_size: usize, max_concurrency: usize, record_timeout: Duration) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            max_concurrency: max_concurrency.max(1),
            record_timeout,
            metrics: StrategyMetrics::default(),
        }
    }
}

#[async_trait]
impl ExecutionStrategy for ParallelStrategy {
    async fn execute(
        &self,
        records: Vec<Record>,
        pipeline: &Pipeline,
        mapping: &Mapping,
        ctx: &mut ExecutionContext,
    ) -> Result<ExecutionOutcome> {
        let start = Instant::now();
        let total = records.len();
        let timeout = self.record_timeout;
        let mut all_outcomes: Vec<RecordOutcome> = Vec::with_capacity(total);
        let indexed: Vec<(usize, Record)> = records.into_iter().enumerate().collect();

        for chunk in indexed.chunks(self.chunk_size) {
            let chunk_results: Vec<RecordOutcome> = stream::iter(chunk.iter().cloned())
                .map(|(index, record)| async move {
                    let mut local_ctx = ExecutionContext::new(Default::default(), Default::default());
                    let result = tokio::time::timeout(timeout, pipeline.execute(record, &mut local_ctx, mapping)).await;
                    let output = match result {
                        Ok(Ok(output)) => Ok(output.data),
                        Ok(Err(err)) => Err(err.to_string()),
                        Err(_) => Err(
                            MappingEngineError::from(ExecutionError::Timeout { timeout_ms: timeout.as_millis() as u64 })
                                .to_string(),
                        ),
                    };
                    RecordOutcome { index, output }
                })
                .buffer_unordered(self.max_concurrency)
                .collect()
                .await;
            all_outcomes.extend(chunk_results);
        }

        all_outcomes.sort_by_key(|o| o.index);
        let mut outcome = ExecutionOutcome::default();
        for r in all_outcomes {
            match r.output {
                Ok(value) => outcome.results.push(value),
                Err(message) => outcome.errors.push((r.index, message)),
            }
        }
        ctx.update_progress(total as u64, total as u64, None);
        self.metrics.record(outcome.results.len(), outcome.errors.len(), start.elapsed());
        Ok(outcome)
    }

    fn metrics(&self) -> StrategyMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn name(&self) -> &'static str {
        "parallel"
    }
}

// ---------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum StrategyOptions {
    Sequential { stop_on_error: bool },
    Batch { batch_size: usize, max_batches: Option<usize>, delay_between_batches: Option<Duration>, stop_on_error: bool },
    Stream { high_water_mark: usize, max_concurrency: usize, backpressure_threshold: usize },
    Parallel { chunk_size: usize, max_concurrency: usize, record_timeout: Duration },
}

pub struct StrategyFactory;

impl StrategyFactory {
    pub fn create(options: StrategyOptions) -> Result<Box<dyn ExecutionStrategy>> {
        Ok(match options {
            StrategyOptions::Sequential { stop_on_error } => Box::new(SequentialStrategy::new(stop_on_error)),
            StrategyOptions::Batch { batch_size, max_batches, delay_between_batches, stop_on_error } => {
                let mut strategy = BatchStrategy::new(batch_size, stop_on_error);
                strategy.max_batches = max_batches;
                strategy.delay_between_batches = delay_between_batches;
                Box::new(strategy)
            }
            StrategyOptions::Stream { high_water_mark, max_concurrency, backpressure_threshold } => {
                Box::new(StreamStrategy::new(high_water_mark, max_concurrency, backpressure_threshold))
            }
            StrategyOptions::Parallel { chunk_size, max_concurrency, record_timeout } => {
                Box::new(ParallelStrategy::new(chunk_size, max_concurrency, record_timeout))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Phase, Pipeline};
    use crate::stages::FieldMappingStage;
    use crate::types::Rule;
    use std::sync::Arc as StdArc;

    fn direct_mapping() -> Mapping {
        Mapping::new(
            "m",
            1,
            vec![Rule::Direct { source_field: "id".into(), target_field: "id".into() }],
        )
        .unwrap()
    }

    fn pipeline() -> Pipeline {
        Pipeline::builder().add_stage(Phase::Transform, StdArc::new(FieldMappingStage)).build()
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Default::default(), Default::default())
    }

    fn records(n: usize) -> Vec<Record> {
        (0..n).map(|i| serde_json::json!({"id": i})).collect()
    }

    #[tokio::test]
    async fn sequential_preserves_order_and_count() {
        let strategy = SequentialStrategy::new(false);
        let pipeline = pipeline();
        let mapping = direct_mapping();
        let mut context = ctx();
        let outcome = strategy.execute(records(5), &pipeline, &mapping, &mut context).await.unwrap();
        assert_eq!(outcome.results.len(), 5);
        for (i, r) in outcome.results.iter().enumerate() {
            assert_eq!(r["id"], i);
        }
    }

    #[tokio::test]
    async fn batch_of_ten_with_batch_size_five() {
        let strategy = BatchStrategy::new(5, false);
        let pipeline = pipeline();
        let mapping = direct_mapping();
        let mut context = ctx();
        let outcome = strategy.execute(records(10), &pipeline, &mapping, &mut context).await.unwrap();
        assert_eq!(outcome.results.len(), 10);
        assert_eq!(outcome.errors.len(), 0);
    }

    #[tokio::test]
    async fn stream_processes_all_records_with_positive_throughput() {
        let strategy = StreamStrategy::new(16384, 10, 1000);
        let pipeline = pipeline();
        let mapping = direct_mapping();
        let mut context = ctx();
        context.start();
        let outcome = strategy.execute(records(100), &pipeline, &mapping, &mut context).await.unwrap();
        assert_eq!(outcome.results.len() + outcome.errors.len(), 100);
        assert_eq!(outcome.errors.len(), 0);
    }

    #[tokio::test]
    async fn parallel_restores_input_order() {
        let strategy = ParallelStrategy::new(4, 3, Duration::from_secs(5));
        let pipeline = pipeline();
        let mapping = direct_mapping();
        let mut context = ctx();
        let outcome = strategy.execute(records(20), &pipeline, &mapping, &mut context).await.unwrap();
        assert_eq!(outcome.results.len(), 20);
        for (i, r) in outcome.results.iter().enumerate() {
            assert_eq!(r["id"], i);
        }
    }

    #[test]
    fn factory_builds_requested_strategy() {
        let strategy = StrategyFactory::create(StrategyOptions::Sequential { stop_on_error: true }).unwrap();
        assert_eq!(strategy.name(), "sequential");
    }
}
