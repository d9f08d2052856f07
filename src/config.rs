//! Configuration module for the mapping engine.
//!
//! Provides one sub-struct per component family (server, engine, connection
//! pools, performance, rate limiting, monitoring), each loadable from a file
//! plus environment variables via the `config` crate, each with a concrete
//! default.

use crate::ratelimit::{EscalationLevel as RuntimeEscalationLevel, RateLimitConfig as RuntimeRateLimitConfig};
use crate::recovery::CircuitBreakerConfig as RuntimeCircuitBreakerConfig;
use crate::pool::PoolOptions as RuntimePoolOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Top-level configuration for the mapping engine and its HTTP collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Engine facade and pipeline-level options (spec section 6's
    /// "Configuration options recognized")
    pub engine: EngineConfig,
    /// Connection pool defaults
    pub pools: PoolConfig,
    /// Performance optimizer options
    pub performance: PerformanceConfig,
    /// Circuit breaker defaults
    pub circuit_breaker: CircuitBreakerSettings,
    /// Brute-force / rate-limit state options
    pub rate_limit: RateLimitSettings,
    /// Metrics and monitoring configuration
    pub monitoring: MonitoringConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    /// Server host to bind to
    #[validate(length(min = 1, max = 255))]
    pub host: String,
    /// Server port to bind to
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
    /// Request timeout in seconds
    #[validate(range(min = 1, max = 3600))]
    pub request_timeout_secs: u64,
    /// Enable CORS
    pub cors_enabled: bool,
    /// Allowed origins for CORS
    pub cors_origins: Vec<String>,
}

/// Engine facade and pipeline options. Every knob spec.md section 6 names
/// as "recognized" gets a field here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Enable the pipeline cache keyed by `mapping_id:version`
    pub enable_cache: bool,
    /// Maximum number of cached pipelines
    pub cache_size: usize,
    /// Enable the result cache (disabled by default; never consulted by
    /// the Stream strategy regardless of this flag)
    pub enable_result_cache: bool,
    /// Enable Prometheus metrics collection
    pub enable_metrics: bool,
    /// Default per-execution timeout in milliseconds
    pub default_timeout_ms: u64,
    /// Default max concurrency for parallel/stream strategies
    pub max_concurrency: usize,
    /// Enable the performance optimizer's memory-pressure response
    pub enable_memory_management: bool,
    /// Enable value compression in the adaptive cache
    pub enable_data_compression: bool,
    /// Enable the connection pool manager
    pub enable_connection_pooling: bool,
    /// Enable adaptive batch sizing in the performance optimizer
    pub enable_batch_optimization: bool,
    /// Enable the performance optimizer's strategy recommendation
    pub enable_performance_optimization: bool,
    /// Memory pressure threshold ([0,1]) above which batch size shrinks
    pub memory_threshold: f64,
    /// Value size in bytes above which the adaptive cache compresses
    pub compression_threshold_bytes: usize,
    /// Default batch size for the Batch strategy
    pub batch_size: usize,
    /// Default high water mark for the Stream strategy
    pub stream_high_water_mark: usize,
    /// Default backpressure threshold for the Stream strategy
    pub backpressure_threshold: usize,
    /// Default per-record timeout in milliseconds for the Parallel strategy
    pub record_timeout_ms: u64,
    /// Default chunk size for the Parallel strategy
    pub chunk_size: usize,
    /// Stop a run on the first unrecovered error rather than skip it
    pub stop_on_error: bool,
    /// Count and continue past failed records instead of propagating
    pub skip_failed_records: bool,
    /// Maximum number of entries kept in the execution-history ring buffer
    pub rollback_history_size: usize,
    /// Enable periodic execution-context snapshotting
    pub enable_snapshots: bool,
}

/// Connection pool defaults (spec section 4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min: usize,
    pub max: usize,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

impl From<&PoolConfig> for RuntimePoolOptions {
    fn from(cfg: &PoolConfig) -> Self {
        RuntimePoolOptions {
            min: cfg.min,
            max: cfg.max,
            acquire_timeout: Duration::from_millis(cfg.acquire_timeout_ms),
            idle_timeout: Duration::from_millis(cfg.idle_timeout_ms),
        }
    }
}

/// Performance optimizer options (spec section 4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Maximum number of entries in the adaptive cache
    pub adaptive_cache_size: usize,
    /// Value size in bytes above which the adaptive cache compresses
    pub compression_threshold_bytes: usize,
}

/// Circuit breaker defaults (spec section 4.7), one instance per resource
/// created lazily by `CircuitBreakerRegistry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: f64,
    pub volume_threshold: u64,
    pub success_threshold: u32,
    pub reset_timeout_secs: u64,
    pub rolling_window_secs: u64,
}

impl From<&CircuitBreakerSettings> for RuntimeCircuitBreakerConfig {
    fn from(cfg: &CircuitBreakerSettings) -> Self {
        RuntimeCircuitBreakerConfig {
            failure_threshold: cfg.failure_threshold,
            volume_threshold: cfg.volume_threshold,
            success_threshold: cfg.success_threshold,
            reset_timeout: Duration::from_secs(cfg.reset_timeout_secs),
            rolling_window: Duration::from_secs(cfg.rolling_window_secs),
        }
    }
}

/// Brute-force / rate-limit options (spec section 4.11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub window_secs: u64,
    pub ip_max: u32,
    pub ip_block_duration_secs: u64,
    pub level2_attempts: u32,
    pub level2_block_duration_secs: u64,
    pub level3_attempts: u32,
    pub level3_block_duration_secs: u64,
    pub account_permanent_lock_threshold: u32,
    pub requests_per_second: u32,
    pub burst_capacity: u32,
}

impl From<&RateLimitSettings> for RuntimeRateLimitConfig {
    fn from(cfg: &RateLimitSettings) -> Self {
        RuntimeRateLimitConfig {
            window: Duration::from_secs(cfg.window_secs),
            ip_max: cfg.ip_max,
            ip_block_duration: Duration::from_secs(cfg.ip_block_duration_secs),
            level2: RuntimeEscalationLevel {
                attempts: cfg.level2_attempts,
                block_duration: Duration::from_secs(cfg.level2_block_duration_secs),
            },
            level3: RuntimeEscalationLevel {
                attempts: cfg.level3_attempts,
                block_duration: Duration::from_secs(cfg.level3_block_duration_secs),
            },
            account_permanent_lock_threshold: cfg.account_permanent_lock_threshold,
            requests_per_second: cfg.requests_per_second,
            burst_capacity: cfg.burst_capacity,
        }
    }
}

/// Monitoring and metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub prometheus_enabled: bool,
    pub prometheus_port: u16,
    pub collection_interval_secs: u64,
    pub tracing_enabled: bool,
    pub log_level: String,
    pub log_format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            engine: EngineConfig::default(),
            pools: PoolConfig::default(),
            performance: PerformanceConfig::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            rate_limit: RateLimitSettings::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout_secs: 30,
            cors_enabled: true,
            cors_origins: vec!["*".to_string()],
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_cache: true,
            cache_size: 256,
            enable_result_cache: false,
            enable_metrics: true,
            default_timeout_ms: 30_000,
            max_concurrency: num_cpus::get(),
            enable_memory_management: true,
            enable_data_compression: false,
            enable_connection_pooling: true,
            enable_batch_optimization: true,
            enable_performance_optimization: true,
            memory_threshold: 0.8,
            compression_threshold_bytes: 4096,
            batch_size: 100,
            stream_high_water_mark: 16_384,
            backpressure_threshold: 1000,
            record_timeout_ms: 30_000,
            chunk_size: 100,
            stop_on_error: false,
            skip_failed_records: true,
            rollback_history_size: 1000,
            enable_snapshots: false,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 0,
            max: 10,
            acquire_timeout_ms: 5000,
            idle_timeout_ms: 60_000,
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            adaptive_cache_size: 1000,
            compression_threshold_bytes: 4096,
        }
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            volume_threshold: 10,
            success_threshold: 3,
            reset_timeout_secs: 30,
            rolling_window_secs: 60,
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_secs: 900,
            ip_max: 20,
            ip_block_duration_secs: 900,
            level2_attempts: 50,
            level2_block_duration_secs: 3600,
            level3_attempts: 100,
            level3_block_duration_secs: 86_400,
            account_permanent_lock_threshold: 200,
            requests_per_second: 10,
            burst_capacity: 20,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus_enabled: true,
            prometheus_port: 9090,
            collection_interval_secs: 10,
            tracing_enabled: true,
            log_level: "info".to_string(),
            log_format: "json".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a file (if `MAPPING_ENGINE_CONFIG_FILE` is
    /// set) layered with environment variables prefixed `MAPPING_ENGINE__`.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let mut cfg = config::Config::builder();

        if let Ok(config_file) = std::env::var("MAPPING_ENGINE_CONFIG_FILE") {
            cfg = cfg.add_source(config::File::with_name(&config_file));
        }

        cfg = cfg.add_source(
            config::Environment::with_prefix("MAPPING_ENGINE")
                .separator("__")
                .list_separator(","),
        );

        let config: Self = cfg.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate configuration invariants not already enforced by the type
    /// system. Field-level constraints on `ServerConfig` run through
    /// `validator`; cross-field invariants (pool min/max, threshold ranges)
    /// are checked explicitly below.
    pub fn validate(&self) -> Result<(), String> {
        self.server
            .validate()
            .map_err(|e| e.to_string())?;
        if self.engine.max_concurrency == 0 {
            return Err("Engine max_concurrency must be greater than 0".to_string());
        }
        if self.engine.batch_size == 0 {
            return Err("Engine batch_size must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.engine.memory_threshold) {
            return Err("Engine memory_threshold must be within [0, 1]".to_string());
        }
        if self.pools.min > self.pools.max {
            return Err("Pool min cannot be greater than pool max".to_string());
        }
        if self.circuit_breaker.success_threshold == 0 {
            return Err("Circuit breaker success_threshold must be greater than 0".to_string());
        }
        if self.rate_limit.ip_max == 0 {
            return Err("Rate limit ip_max must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_port_rejected() {
        let mut config = Config::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn pool_min_greater_than_max_rejected() {
        let mut config = Config::default();
        config.pools.min = 10;
        config.pools.max = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rate_limit_config_converts_to_runtime_config() {
        let settings = RateLimitSettings::default();
        let runtime: RuntimeRateLimitConfig = (&settings).into();
        assert_eq!(runtime.ip_max, settings.ip_max);
        assert_eq!(runtime.level2.attempts, settings.level2_attempts);
    }
}
