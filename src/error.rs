//! Error taxonomy for the mapping engine.
//!
//! Errors are grouped the way the engine's callers need to reason about them:
//! bad input, failures during execution, systemic pressure, and failures while
//! unwinding a transaction. Every externally-propagated error carries enough
//! context (`mapping_id`, `execution_id`, `stage`) to correlate with metrics
//! and logs.

use thiserror::Error;

/// Result type alias used throughout the engine.
pub type Result<T> = std::result::Result<T, MappingEngineError>;

/// Top-level error type returned by every public engine operation.
#[derive(Error, Debug)]
pub enum MappingEngineError {
    #[error("input error: {source}")]
    Input {
        #[from]
        source: InputError,
    },

    #[error("execution error: {source}")]
    Execution {
        #[from]
        source: ExecutionError,
    },

    #[error("systemic error: {source}")]
    Systemic {
        #[from]
        source: SystemicError,
    },

    #[error("transactional error: {source}")]
    Transactional {
        #[from]
        source: TransactionalError,
    },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("serialization error: {message}")]
    Serialization { message: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Context carried by every engine error so callers can correlate it with
/// metrics, logs, and a specific execution.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub mapping_id: Option<String>,
    pub execution_id: Option<String>,
    pub stage: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mapping(mut self, mapping_id: impl Into<String>) -> Self {
        self.mapping_id = Some(mapping_id.into());
        self
    }

    pub fn with_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }
}

/// Input errors: the mapping or the data handed to the engine was bad.
#[derive(Error, Debug)]
pub enum InputError {
    #[error("mapping validation failed: {message}")]
    MappingValidation { message: String },

    #[error("data validation failed: {field} - {message}")]
    DataValidation { field: String, message: String },

    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },
}

/// Execution errors: something went wrong while driving the pipeline.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("stage '{stage}' failed: {message}")]
    StageFailure { stage: String, message: String },

    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("execution cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("circuit '{resource}' is open")]
    CircuitOpen { resource: String },

    #[error("timed out acquiring '{resource}' after {timeout_ms}ms")]
    AcquireTimeout { resource: String, timeout_ms: u64 },
}

/// Systemic errors: the engine itself is under pressure.
#[derive(Error, Debug)]
pub enum SystemicError {
    #[error("resource pressure: {resource} at {value:.2}, threshold {threshold:.2}")]
    ResourcePressure {
        resource: String,
        value: f64,
        threshold: f64,
    },

    #[error("dead letter queue '{queue}' is full (capacity {capacity})")]
    DeadLetterQueueFull { queue: String, capacity: usize },

    #[error("pool '{pool}' exhausted: {in_use}/{max} in use")]
    PoolExhausted {
        pool: String,
        in_use: usize,
        max: usize,
    },
}

/// Transactional errors: rollback itself did not fully succeed.
#[derive(Error, Debug)]
pub enum TransactionalError {
    #[error("rollback of transaction '{transaction_id}' failed: {message}")]
    RollbackFailed {
        transaction_id: String,
        message: String,
    },

    #[error("partial rollback of transaction '{transaction_id}': {failed_actions} action(s) failed")]
    PartialRollback {
        transaction_id: String,
        failed_actions: usize,
    },
}

impl MappingEngineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn mapping_validation(message: impl Into<String>) -> Self {
        InputError::MappingValidation {
            message: message.into(),
        }
        .into()
    }

    pub fn stage_failure(stage: impl Into<String>, message: impl Into<String>) -> Self {
        ExecutionError::StageFailure {
            stage: stage.into(),
            message: message.into(),
        }
        .into()
    }

    /// Whether the Error Recovery layer (C7) should consider retrying an
    /// operation that failed with this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Execution { source } => source.is_retryable(),
            Self::Systemic { source } => source.is_retryable(),
            Self::Io { .. } => true,
            _ => false,
        }
    }

    /// Stable category label used for metrics and log fields.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Input { .. } => "input",
            Self::Execution { .. } => "execution",
            Self::Systemic { .. } => "systemic",
            Self::Transactional { .. } => "transactional",
            Self::Configuration { .. } => "configuration",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Internal { .. } => "internal",
        }
    }

    /// Error kind string per spec section 7's user-visible surface:
    /// `{kind, message, mapping_id?, execution_id?, stage?}`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Input {
                source: InputError::MappingValidation { .. },
            } => "MappingValidation",
            Self::Input {
                source: InputError::DataValidation { .. },
            } => "DataValidation",
            Self::Input {
                source: InputError::TypeMismatch { .. },
            } => "TypeMismatch",
            Self::Execution {
                source: ExecutionError::StageFailure { .. },
            } => "StageFailure",
            Self::Execution {
                source: ExecutionError::Timeout { .. },
            } => "Timeout",
            Self::Execution {
                source: ExecutionError::Cancelled { .. },
            } => "Cancelled",
            Self::Execution {
                source: ExecutionError::CircuitOpen { .. },
            } => "CircuitOpen",
            Self::Execution {
                source: ExecutionError::AcquireTimeout { .. },
            } => "AcquireTimeout",
            Self::Systemic {
                source: SystemicError::ResourcePressure { .. },
            } => "ResourcePressure",
            Self::Systemic {
                source: SystemicError::DeadLetterQueueFull { .. },
            } => "DeadLetterQueueFull",
            Self::Systemic {
                source: SystemicError::PoolExhausted { .. },
            } => "PoolExhausted",
            Self::Transactional {
                source: TransactionalError::RollbackFailed { .. },
            } => "RollbackFailed",
            Self::Transactional {
                source: TransactionalError::PartialRollback { .. },
            } => "PartialRollback",
            Self::Configuration { .. } => "Configuration",
            Self::Serialization { .. } => "Serialization",
            Self::Io { .. } => "Io",
            Self::Internal { .. } => "Internal",
        }
    }

    /// `Cancelled` and `CircuitOpen` must never be retried within the same
    /// call, regardless of `is_retryable()`'s general policy.
    pub fn is_never_retried(&self) -> bool {
        matches!(
            self,
            Self::Execution {
                source: ExecutionError::Cancelled { .. } | ExecutionError::CircuitOpen { .. }
            }
        )
    }
}

impl ExecutionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StageFailure { .. } => true,
            Self::Timeout { .. } => true,
            Self::AcquireTimeout { .. } => true,
            Self::Cancelled { .. } => false,
            Self::CircuitOpen { .. } => false,
        }
    }
}

impl SystemicError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ResourcePressure { .. } => true,
            Self::DeadLetterQueueFull { .. } => false,
            Self::PoolExhausted { .. } => true,
        }
    }
}

impl From<serde_json::Error> for MappingEngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<config::ConfigError> for MappingEngineError {
    fn from(err: config::ConfigError) -> Self {
        Self::configuration(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for MappingEngineError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ExecutionError::Timeout { timeout_ms: 0 }.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_and_kind_line_up() {
        let err = MappingEngineError::mapping_validation("missing rules");
        assert_eq!(err.category(), "input");
        assert_eq!(err.kind(), "MappingValidation");
    }

    #[test]
    fn retryable_matches_taxonomy() {
        let timeout: MappingEngineError = ExecutionError::Timeout { timeout_ms: 10 }.into();
        assert!(timeout.is_retryable());

        let cancelled: MappingEngineError = ExecutionError::Cancelled {
            reason: "shutdown".into(),
        }
        .into();
        assert!(!cancelled.is_retryable());
        assert!(cancelled.is_never_retried());
    }

    #[test]
    fn circuit_open_never_retried() {
        let err: MappingEngineError = ExecutionError::CircuitOpen {
            resource: "pg-primary".into(),
        }
        .into();
        assert!(err.is_never_retried());
        assert_eq!(err.kind(), "CircuitOpen");
    }

    #[test]
    fn stage_failure_helper() {
        let err = MappingEngineError::stage_failure("FieldMapping", "missing source field");
        assert_eq!(err.kind(), "StageFailure");
        assert!(err.is_retryable());
    }
}
