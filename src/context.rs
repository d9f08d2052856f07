//! Execution Context (C6): per-run bookkeeping for ids, progress, metrics,
//! errors, and retry state.

use crate::error::MappingEngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Initialized,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContextMetadata {
    pub source: Option<String>,
    pub target: Option<String>,
    pub mapping_id: Option<String>,
    pub user_id: Option<String>,
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    pub timeout_ms: u64,
    pub strict_mode: bool,
    pub validate_output: bool,
    pub profiling: bool,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            strict_mode: false,
            validate_output: true,
            profiling: false,
            retry_attempts: 3,
            retry_base_delay_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedError {
    pub message: String,
    pub kind: String,
    pub record_index: Option<usize>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedWarning {
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextState {
    pub status: ExecutionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub progress: f64,
    pub records_processed: u64,
    pub errors: Vec<RecordedError>,
    pub warnings: Vec<RecordedWarning>,
    pub retry_count: u32,
}

impl Default for ContextState {
    fn default() -> Self {
        Self {
            status: ExecutionStatus::Initialized,
            start_time: None,
            end_time: None,
            duration_ms: None,
            progress: 0.0,
            records_processed: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            retry_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContextMetrics {
    pub total_execution_time_ms: i64,
    pub average_record_time_ms: f64,
    pub throughput_per_sec: f64,
    pub peak_memory_bytes: u64,
    pub records_failed: u64,
    pub cache_hits: u64,
}

/// Per-run execution state (C6), created by the engine facade for every
/// `execute_mapping` call and passed down through the pipeline and strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub id: String,
    pub parent_id: Option<String>,
    pub metadata: ContextMetadata,
    pub config: ContextConfig,
    pub state: ContextState,
    pub metrics: ContextMetrics,
}

impl ExecutionContext {
    pub fn new(metadata: ContextMetadata, config: ContextConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            metadata,
            config,
            state: ContextState::default(),
            metrics: ContextMetrics::default(),
        }
    }

    pub fn start(&mut self) {
        self.state.status = ExecutionStatus::Running;
        self.state.start_time = Some(Utc::now());
    }

    /// `progress` is clamped to be monotonically non-decreasing, per the
    /// invariant in spec section 4.6.
    pub fn update_progress(&mut self, current: u64, total: u64, _message: Option<&str>) {
        let pct = if total == 0 {
            100.0
        } else {
            (current as f64 / total as f64) * 100.0
        };
        self.state.progress = pct.max(self.state.progress).min(100.0);
        self.state.records_processed = current;
    }

    pub fn add_error(&mut self, err: &MappingEngineError, record_index: Option<usize>) {
        self.state.errors.push(RecordedError {
            message: err.to_string(),
            kind: err.kind().to_string(),
            record_index,
            occurred_at: Utc::now(),
        });
        self.metrics.records_failed += 1;
    }

    pub fn add_warning(&mut self, message: impl Into<String>, metadata: Option<serde_json::Value>) {
        self.state.warnings.push(RecordedWarning {
            message: message.into(),
            metadata,
            occurred_at: Utc::now(),
        });
    }

    /// Returns whether a retry is still permitted; increments `retry_count`
    /// only when it is.
    pub fn increment_retry(&mut self) -> bool {
        if self.state.retry_count >= self.config.retry_attempts {
            return false;
        }
        self.state.retry_count += 1;
        true
    }

    /// Exponential backoff: `base * 2^(retry_count - 1)`.
    pub fn get_retry_delay(&self) -> std::time::Duration {
        if self.state.retry_count == 0 {
            return std::time::Duration::from_millis(0);
        }
        let exponent = self.state.retry_count - 1;
        let delay_ms = self.config.retry_base_delay_ms.saturating_mul(1u64 << exponent.min(20));
        std::time::Duration::from_millis(delay_ms)
    }

    pub fn complete(&mut self) {
        self.state.status = ExecutionStatus::Completed;
        self.finish();
    }

    pub fn fail(&mut self, err: &MappingEngineError) {
        self.add_error(err, None);
        self.state.status = ExecutionStatus::Failed;
        self.finish();
    }

    pub fn cancel(&mut self, reason: impl Into<String>) {
        self.add_warning(format!("cancelled: {}", reason.into()), None);
        self.state.status = ExecutionStatus::Cancelled;
        self.finish();
    }

    fn finish(&mut self) {
        let end = Utc::now();
        self.state.end_time = Some(end);
        if let Some(start) = self.state.start_time {
            let duration = end - start;
            self.state.duration_ms = Some(duration.num_milliseconds().max(0));
            self.metrics.total_execution_time_ms = self.state.duration_ms.unwrap_or(0);
            if self.state.records_processed > 0 {
                self.metrics.average_record_time_ms =
                    self.metrics.total_execution_time_ms as f64 / self.state.records_processed as f64;
                let seconds = (self.metrics.total_execution_time_ms as f64 / 1000.0).max(0.001);
                self.metrics.throughput_per_sec = self.state.records_processed as f64 / seconds;
            }
        }
    }

    pub fn create_child_context(&self, overrides: Option<ContextMetadata>) -> Self {
        let mut child = Self::new(overrides.unwrap_or_else(|| self.metadata.clone()), self.config.clone());
        child.parent_id = Some(self.id.clone());
        child
    }

    /// Merges a finished child context back into this one: metrics are
    /// summed, errors and warnings concatenated.
    pub fn merge_child_context(&mut self, mut child: ExecutionContext) {
        self.state.records_processed += child.state.records_processed;
        self.state.errors.append(&mut child.state.errors);
        self.state.warnings.append(&mut child.state.warnings);
        self.metrics.total_execution_time_ms += child.metrics.total_execution_time_ms;
        self.metrics.records_failed += child.metrics.records_failed;
        self.metrics.cache_hits += child.metrics.cache_hits;
        self.metrics.peak_memory_bytes = self.metrics.peak_memory_bytes.max(child.metrics.peak_memory_bytes);
    }

    pub fn to_record(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_record(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}
