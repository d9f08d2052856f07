//! Health monitoring for the mapping engine: per-component checks, failure/
//! success-threshold debouncing, and an aggregated overall status.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::metrics::MetricsCollector;
use crate::performance;
use crate::pool::ConnectionPool;
use crate::recovery::{CircuitBreakerRegistry, CircuitState, DeadLetterQueue};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub details: HashMap<String, String>,
    pub last_success: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub response_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    pub components: HashMap<String, ComponentHealth>,
    pub last_check: DateTime<Utc>,
    pub check_duration_ms: u64,
    pub uptime_secs: u64,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealthConfig {
    pub enabled: bool,
    pub check_interval_secs: u64,
    pub timeout_secs: u64,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub critical: bool,
}

impl Default for ComponentHealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: 30,
            timeout_secs: 5,
            failure_threshold: 3,
            success_threshold: 1,
            critical: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub response_time_ms: u64,
    pub message: String,
    pub details: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait ComponentHealthChecker: Send + Sync {
    async fn check_health(&self) -> HealthCheckResult;
    fn name(&self) -> &str;
    fn is_critical(&self) -> bool {
        false
    }
}

struct HealthComponent {
    checker: Arc<dyn ComponentHealthChecker>,
    config: ComponentHealthConfig,
    last_check: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

/// Aggregates one or more `ComponentHealthChecker`s into a single
/// `ServiceHealth`, debouncing flaps via per-component failure/success
/// thresholds before flipping status (spec section 6's `/health` endpoint).
pub struct HealthChecker {
    metrics: Arc<MetricsCollector>,
    components: Arc<RwLock<HashMap<String, HealthComponent>>>,
    overall_health: Arc<RwLock<ServiceHealth>>,
    check_interval: Duration,
    is_running: Arc<RwLock<bool>>,
    started_at: Instant,
}

impl HealthChecker {
    pub fn new(metrics: Arc<MetricsCollector>, components: Vec<(Arc<dyn ComponentHealthChecker>, ComponentHealthConfig)>) -> Self {
        let mut component_map = HashMap::new();
        for (checker, config) in components {
            let name = checker.name().to_string();
            component_map.insert(
                name,
                HealthComponent { checker, config, last_check: None, consecutive_failures: 0, consecutive_successes: 0 },
            );
        }

        let overall_health = ServiceHealth {
            status: HealthStatus::Unknown,
            components: HashMap::new(),
            last_check: Utc::now(),
            check_duration_ms: 0,
            uptime_secs: 0,
            version: env!("CARGO_PKG_VERSION").to_string(),
        };

        Self {
            metrics,
            components: Arc::new(RwLock::new(component_map)),
            overall_health: Arc::new(RwLock::new(overall_health)),
            check_interval: Duration::from_secs(30),
            is_running: Arc::new(RwLock::new(false)),
            started_at: Instant::now(),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        info!("starting health checker");
        *self.is_running.write().await = true;
        self.perform_health_check().await;

        let checker = self.clone();
        tokio::spawn(async move {
            checker.health_check_loop().await;
        });
    }

    pub async fn stop(&self) {
        *self.is_running.write().await = false;
        info!("health checker stopped");
    }

    pub async fn get_health(&self) -> ServiceHealth {
        let mut health = self.overall_health.read().await.clone();
        health.uptime_secs = self.started_at.elapsed().as_secs();
        health
    }

    pub async fn get_component_health(&self, component_name: &str) -> Option<ComponentHealth> {
        self.overall_health.read().await.components.get(component_name).cloned()
    }

    async fn health_check_loop(&self) {
        let mut ticker = interval(self.check_interval);
        while *self.is_running.read().await {
            ticker.tick().await;
            self.perform_health_check().await;
        }
    }

    pub async fn perform_health_check(&self) {
        let start = Instant::now();
        let mut results = HashMap::new();

        debug!("running health check sweep");

        {
            let mut components = self.components.write().await;
            for (name, component) in components.iter_mut() {
                if !component.config.enabled {
                    continue;
                }

                let result = Self::check_component(component).await;

                if result.healthy {
                    component.consecutive_successes += 1;
                    component.consecutive_failures = 0;
                } else {
                    component.consecutive_failures += 1;
                    component.consecutive_successes = 0;
                }
                component.last_check = Some(result.timestamp);

                let status = Self::determine_status(component, &result);
                results.insert(
                    name.clone(),
                    ComponentHealth {
                        status,
                        details: result.details,
                        last_success: result.healthy.then_some(result.timestamp),
                        error_count: component.consecutive_failures,
                        response_time_ms: Some(result.response_time_ms),
                    },
                );
            }
        }

        let critical_components: Vec<String> = {
            let components = self.components.read().await;
            components.iter().filter(|(_, c)| c.config.critical).map(|(n, _)| n.clone()).collect()
        };
        let overall_status = Self::aggregate(&results, &critical_components);
        let check_duration = start.elapsed();

        {
            let mut health = self.overall_health.write().await;
            health.status = overall_status;
            health.components = results;
            health.last_check = Utc::now();
            health.check_duration_ms = check_duration.as_millis() as u64;
        }

        self.metrics.record_stage_duration("health_check", check_duration.as_secs_f64());
        debug!(elapsed_ms = check_duration.as_millis() as u64, "health check completed");
    }

    async fn check_component(component: &HealthComponent) -> HealthCheckResult {
        let start = Instant::now();
        match tokio::time::timeout(Duration::from_secs(component.config.timeout_secs), component.checker.check_health()).await {
            Ok(result) => result,
            Err(_) => HealthCheckResult {
                healthy: false,
                response_time_ms: start.elapsed().as_millis() as u64,
                message: format!("health check timed out after {}s", component.config.timeout_secs),
                details: HashMap::new(),
                timestamp: Utc::now(),
            },
        }
    }

    fn determine_status(component: &HealthComponent, result: &HealthCheckResult) -> HealthStatus {
        if result.healthy {
            if component.consecutive_successes >= component.config.success_threshold {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            }
        } else if component.consecutive_failures >= component.config.failure_threshold {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        }
    }

    fn aggregate(components: &HashMap<String, ComponentHealth>, critical: &[String]) -> HealthStatus {
        if components.is_empty() {
            return HealthStatus::Unknown;
        }

        let mut degraded = 0;
        let mut unhealthy = 0;
        let mut critical_unhealthy = false;

        for (name, health) in components {
            match health.status {
                HealthStatus::Degraded => degraded += 1,
                HealthStatus::Unhealthy => {
                    unhealthy += 1;
                    if critical.iter().any(|c| c == name) {
                        critical_unhealthy = true;
                    }
                }
                HealthStatus::Healthy | HealthStatus::Unknown => {}
            }
        }

        if critical_unhealthy || unhealthy > components.len() / 2 {
            HealthStatus::Unhealthy
        } else if degraded > 0 || unhealthy > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

// ---------------------------------------------------------------------
// Concrete component checkers
// ---------------------------------------------------------------------

/// Reports whether any circuit breaker for a watched resource is currently
/// open.
pub struct CircuitBreakerHealthChecker {
    name: String,
    registry: Arc<CircuitBreakerRegistry>,
    watched_resources: Vec<String>,
}

impl CircuitBreakerHealthChecker {
    pub fn new(name: impl Into<String>, registry: Arc<CircuitBreakerRegistry>, watched_resources: Vec<String>) -> Self {
        Self { name: name.into(), registry, watched_resources }
    }
}

#[async_trait::async_trait]
impl ComponentHealthChecker for CircuitBreakerHealthChecker {
    async fn check_health(&self) -> HealthCheckResult {
        let start = Instant::now();
        let mut details = HashMap::new();
        let mut any_open = false;

        for resource in &self.watched_resources {
            let breaker = self.registry.get_or_create(resource);
            let state = breaker.state().await;
            details.insert(resource.clone(), format!("{state:?}"));
            if state == CircuitState::Open {
                any_open = true;
            }
        }

        HealthCheckResult {
            healthy: !any_open,
            response_time_ms: start.elapsed().as_millis() as u64,
            message: if any_open { "one or more circuits are open".to_string() } else { "all circuits closed or half-open".to_string() },
            details,
            timestamp: Utc::now(),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_critical(&self) -> bool {
        true
    }
}

/// Reports unhealthy once the dead-letter queue crosses a fraction of its
/// capacity, a signal that upstream errors aren't being recovered.
pub struct DeadLetterQueueHealthChecker {
    name: String,
    queue: Arc<DeadLetterQueue>,
    capacity: usize,
    warn_ratio: f64,
}

impl DeadLetterQueueHealthChecker {
    pub fn new(name: impl Into<String>, queue: Arc<DeadLetterQueue>, capacity: usize) -> Self {
        Self { name: name.into(), queue, capacity, warn_ratio: 0.8 }
    }
}

#[async_trait::async_trait]
impl ComponentHealthChecker for DeadLetterQueueHealthChecker {
    async fn check_health(&self) -> HealthCheckResult {
        let start = Instant::now();
        let len = self.queue.len().await;
        let ratio = if self.capacity == 0 { 0.0 } else { len as f64 / self.capacity as f64 };
        let healthy = ratio < self.warn_ratio;

        let mut details = HashMap::new();
        details.insert("entries".to_string(), len.to_string());
        details.insert("capacity".to_string(), self.capacity.to_string());

        HealthCheckResult {
            healthy,
            response_time_ms: start.elapsed().as_millis() as u64,
            message: if healthy {
                "dead letter queue has headroom".to_string()
            } else {
                format!("dead letter queue at {:.0}% capacity", ratio * 100.0)
            },
            details,
            timestamp: Utc::now(),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Reports a named connection pool's saturation.
pub struct ConnectionPoolHealthChecker<T: Send + 'static> {
    name: String,
    pool: Arc<ConnectionPool<T>>,
}

impl<T: Send + 'static> ConnectionPoolHealthChecker<T> {
    pub fn new(name: impl Into<String>, pool: Arc<ConnectionPool<T>>) -> Self {
        Self { name: name.into(), pool }
    }
}

#[async_trait::async_trait]
impl<T: Send + Sync + 'static> ComponentHealthChecker for ConnectionPoolHealthChecker<T> {
    async fn check_health(&self) -> HealthCheckResult {
        let start = Instant::now();
        let in_use = self.pool.in_use();
        let max = self.pool.max();
        let healthy = max == 0 || in_use < max;

        let mut details = HashMap::new();
        details.insert("in_use".to_string(), in_use.to_string());
        details.insert("max".to_string(), max.to_string());
        details.insert("idle".to_string(), self.pool.idle_count().await.to_string());

        HealthCheckResult {
            healthy,
            response_time_ms: start.elapsed().as_millis() as u64,
            message: if healthy { "pool has capacity".to_string() } else { "pool exhausted".to_string() },
            details,
            timestamp: Utc::now(),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Reports the coarse resource-pressure signal the performance optimizer
/// (C8) also consults.
pub struct SystemResourceHealthChecker {
    name: String,
    memory_threshold: f64,
}

impl SystemResourceHealthChecker {
    pub fn new(name: impl Into<String>, memory_threshold: f64) -> Self {
        Self { name: name.into(), memory_threshold }
    }
}

#[async_trait::async_trait]
impl ComponentHealthChecker for SystemResourceHealthChecker {
    async fn check_health(&self) -> HealthCheckResult {
        let start = Instant::now();
        let resources = performance::get_system_resources();
        let healthy = resources.memory_pressure < self.memory_threshold;

        let mut details = HashMap::new();
        details.insert("memory_pressure".to_string(), format!("{:.2}", resources.memory_pressure));
        details.insert("available_memory".to_string(), format!("{:.2}", resources.available_memory));
        details.insert("cpu_usage".to_string(), format!("{:.2}", resources.cpu_usage));

        HealthCheckResult {
            healthy,
            response_time_ms: start.elapsed().as_millis() as u64,
            message: if healthy { "system resources nominal".to_string() } else { "system under memory pressure".to_string() },
            details,
            timestamp: Utc::now(),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::recovery::CircuitBreakerConfig;

    fn metrics() -> Arc<MetricsCollector> {
        Arc::new(MetricsCollector::new(&Config::default()).unwrap())
    }

    #[tokio::test]
    async fn healthy_component_reports_healthy_overall() {
        let registry = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        let checker = Arc::new(CircuitBreakerHealthChecker::new("breakers", registry, vec!["pg".to_string()]));
        let health_checker = HealthChecker::new(metrics(), vec![(checker, ComponentHealthConfig::default())]);
        health_checker.perform_health_check().await;
        let health = health_checker.get_health().await;
        assert_eq!(health.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn open_circuit_marks_component_unhealthy_after_threshold() {
        let registry = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 0.1,
            volume_threshold: 1,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(60),
            rolling_window: Duration::from_secs(60),
        }));
        let breaker = registry.get_or_create("pg");
        breaker.record_failure(false).await;

        let checker = Arc::new(CircuitBreakerHealthChecker::new("breakers", registry, vec!["pg".to_string()]));
        let config = ComponentHealthConfig { failure_threshold: 1, ..Default::default() };
        let health_checker = HealthChecker::new(metrics(), vec![(checker, config)]);
        health_checker.perform_health_check().await;
        let component = health_checker.get_component_health("breakers").await.unwrap();
        assert_eq!(component.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn dead_letter_queue_near_capacity_is_unhealthy() {
        let queue = Arc::new(DeadLetterQueue::new("dlq", 2));
        queue
            .push(crate::recovery::DeadLetterEntry { stage: "s".into(), message: "m".into(), recorded_at: Instant::now() })
            .await
            .unwrap();
        let checker = Arc::new(DeadLetterQueueHealthChecker::new("dlq", queue, 2));
        let config = ComponentHealthConfig { failure_threshold: 1, ..Default::default() };
        let health_checker = HealthChecker::new(metrics(), vec![(checker, config)]);
        health_checker.perform_health_check().await;
        let component = health_checker.get_component_health("dlq").await.unwrap();
        assert_eq!(component.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn aggregate_returns_unknown_for_no_components() {
        let status = HealthChecker::aggregate(&HashMap::new(), &[]);
        assert_eq!(status, HealthStatus::Unknown);
    }
}
