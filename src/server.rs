//! HTTP collaborator for the mapping engine (spec section 6).
//!
//! The engine itself is a library; this module is the thin, test-asserted
//! HTTP contract around it — an `axum::Router` over `/enhanced-mappings/:id/*`
//! plus engine-wide metrics/health/pool endpoints and the schema-discovery
//! collaborator surface (C2), built with the same middleware stack
//! (`TraceLayer`, `CorsLayer`, `CompressionLayer`, `TimeoutLayer`) the
//! teacher's server wires up.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info};

use crate::config::Config;
use crate::discovery::{SampleOptions, SchemaDiscoveryService};
use crate::engine::{ExecuteOptions, MappingEngine};
use crate::error::{MappingEngineError, Result};
use crate::metrics::MetricsCollector;
use crate::strategies::StrategyOptions;
use crate::types::{Mapping, MappingId, Record, UniversalSchema};

/// In-memory collaborator standing in for wherever mappings are actually
/// stored; the engine only ever receives a resolved `Mapping` by value, so
/// any real-world lookup (database, config service, ...) plugs in here
/// without the engine needing to change.
pub struct MappingRepository {
    mappings: DashMap<MappingId, Mapping>,
}

impl MappingRepository {
    pub fn new() -> Self {
        Self {
            mappings: DashMap::new(),
        }
    }

    pub fn insert(&self, mapping: Mapping) {
        self.mappings.insert(mapping.id.clone(), mapping);
    }

    pub fn get(&self, id: &str) -> Option<Mapping> {
        self.mappings.get(id).map(|m| m.clone())
    }
}

impl Default for MappingRepository {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the HTTP layer needs, held behind one `Arc` and passed as
/// `axum` state.
pub struct AppState {
    pub engine: Arc<MappingEngine>,
    pub mappings: Arc<MappingRepository>,
    pub discovery: Arc<SchemaDiscoveryService>,
    pub metrics: Arc<MetricsCollector>,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: String,
    pub timestamp: i64,
}

impl<T> ApiResponse<T> {
    fn ok(data: T, message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp(),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub success: bool,
    pub error: String,
    pub error_code: String,
    pub timestamp: i64,
}

type ApiResult<T> = std::result::Result<Json<ApiResponse<T>>, (StatusCode, Json<ApiError>)>;

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (
        status,
        Json(ApiError {
            success: false,
            error: message.into(),
            error_code: code.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        }),
    )
}

/// Maps an engine error onto spec section 6's `EXECUTION_ERROR` response;
/// the mapping-specific codes (`MISSING_SOURCE_DATA`, `MAPPING_NOT_FOUND`,
/// `MAPPING_INACTIVE`) are decided by the handlers before the engine is ever
/// invoked.
fn execution_error(err: MappingEngineError) -> (StatusCode, Json<ApiError>) {
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "EXECUTION_ERROR", err.to_string())
}

fn resolve_active_mapping(state: &AppState, id: &str) -> std::result::Result<Mapping, (StatusCode, Json<ApiError>)> {
    let mapping = state
        .mappings
        .get(id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "MAPPING_NOT_FOUND", format!("mapping '{id}' not found")))?;
    if !mapping.active {
        return Err(api_error(StatusCode::BAD_REQUEST, "MAPPING_INACTIVE", format!("mapping '{id}' is inactive")));
    }
    Ok(mapping)
}

pub fn build_router(
    engine: Arc<MappingEngine>,
    mappings: Arc<MappingRepository>,
    discovery: Arc<SchemaDiscoveryService>,
    metrics: Arc<MetricsCollector>,
    config: &Config,
) -> Router {
    let state = Arc::new(AppState { engine, mappings, discovery, metrics });

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(Duration::from_secs(config.server.request_timeout_secs)))
        .into_inner();

    Router::new()
        .route("/enhanced-mappings/:id/execute", post(execute_mapping))
        .route("/enhanced-mappings/:id/execute-batch", post(execute_batch))
        .route("/enhanced-mappings/:id/stream", post(execute_stream))
        .route("/enhanced-mappings/:id/validate", post(validate_mapping))
        .route("/metrics", get(get_metrics))
        .route("/metrics/prometheus", get(get_prometheus_metrics))
        .route("/metrics/reset", post(reset_metrics))
        .route("/health", get(get_health))
        .route("/connections/pools", post(register_pool_noop))
        .route("/connections/pools/stats", get(get_pool_stats))
        .route("/discover/:system_id", get(discover_schema))
        .route("/refresh/:schema_id", get(refresh_schema))
        .route("/sample/:schema_id", get(sample_schema))
        .route("/statistics/:schema_id", get(statistics_schema))
        .route("/compare", post(compare_schemas))
        .route("/cache/status", get(cache_status))
        .route("/cache/:system_id", delete(invalidate_cache))
        .layer(middleware)
        .with_state(state)
}

pub async fn serve(
    config: Arc<Config>,
    engine: Arc<MappingEngine>,
    mappings: Arc<MappingRepository>,
    discovery: Arc<SchemaDiscoveryService>,
    metrics: Arc<MetricsCollector>,
) -> Result<()> {
    let app = build_router(engine, mappings, discovery, metrics, &config);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!(addr, "starting mapping engine HTTP server");

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| MappingEngineError::internal(format!("failed to bind to {addr}: {e}")))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| MappingEngineError::internal(format!("server error: {e}")))?;
    Ok(())
}

// ---------------------------------------------------------------------
// `/enhanced-mappings/:id/*`
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(rename = "sourceData")]
    pub source_data: Option<Record>,
    pub options: Option<ExecuteRequestOptions>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ExecuteRequestOptions {
    pub user_id: Option<String>,
    pub strict_mode: Option<bool>,
    pub transactional: Option<bool>,
}

impl From<ExecuteRequestOptions> for ExecuteOptions {
    fn from(opts: ExecuteRequestOptions) -> Self {
        ExecuteOptions {
            user_id: opts.user_id,
            strict_mode: opts.strict_mode.unwrap_or(false),
            transactional: opts.transactional.unwrap_or(false),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExecutionSummary {
    pub mapping_id: String,
    pub execution_time_ms: u128,
    pub records_processed: usize,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub success: bool,
    pub result: Record,
    pub execution: ExecutionSummary,
}

async fn execute_mapping(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<ExecuteRequest>,
) -> ApiResult<ExecuteResponse> {
    let Some(source_data) = request.source_data else {
        return Err(api_error(StatusCode::BAD_REQUEST, "MISSING_SOURCE_DATA", "sourceData is required"));
    };
    let mapping = resolve_active_mapping(&state, &id)?;

    let started = std::time::Instant::now();
    let outcome = state
        .engine
        .execute_mapping(&mapping, source_data, request.options.unwrap_or_default().into())
        .await
        .map_err(execution_error)?;

    let result = outcome.results.into_iter().next().unwrap_or(serde_json::Value::Null);
    Ok(ApiResponse::ok(
        ExecuteResponse {
            success: true,
            result,
            execution: ExecutionSummary {
                mapping_id: mapping.id,
                execution_time_ms: started.elapsed().as_millis(),
                records_processed: 1,
                timestamp: chrono::Utc::now().timestamp(),
            },
        },
        "mapping executed successfully",
    ))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteBatchRequest {
    #[serde(rename = "dataArray")]
    pub data_array: Option<serde_json::Value>,
    pub batch_size: Option<usize>,
    pub continue_on_error: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteBatchResponse {
    pub results: Vec<Record>,
    pub errors: Vec<BatchErrorEntry>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Serialize)]
pub struct BatchErrorEntry {
    pub index: usize,
    pub message: String,
}

async fn execute_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<ExecuteBatchRequest>,
) -> ApiResult<ExecuteBatchResponse> {
    let data_array = match request.data_array {
        Some(serde_json::Value::Array(items)) => items,
        _ => return Err(api_error(StatusCode::BAD_REQUEST, "INVALID_BATCH_DATA", "dataArray must be an array")),
    };
    let mapping = resolve_active_mapping(&state, &id)?;

    let options = ExecuteOptions {
        strategy_override: request.batch_size.map(|batch_size| StrategyOptions::Batch {
            batch_size,
            max_batches: None,
            delay_between_batches: None,
            stop_on_error: !request.continue_on_error.unwrap_or(true),
        }),
        ..Default::default()
    };

    let outcome = state.engine.execute_batch(&mapping, data_array, options).await.map_err(execution_error)?;
    let total = outcome.results.len() + outcome.errors.len();
    let errors: Vec<BatchErrorEntry> = outcome.errors.iter().map(|(index, message)| BatchErrorEntry { index: *index, message: message.clone() }).collect();
    let failed = errors.len();

    Ok(ApiResponse::ok(
        ExecuteBatchResponse {
            succeeded: outcome.results.len(),
            results: outcome.results,
            errors,
            total,
            failed,
        },
        "batch executed",
    ))
}

#[derive(Debug, Deserialize)]
pub struct StreamRequest {
    pub data: Vec<Record>,
    pub options: Option<StreamRequestOptions>,
}

#[derive(Debug, Deserialize, Default)]
pub struct StreamRequestOptions {
    pub high_water_mark: Option<usize>,
    pub max_concurrency: Option<usize>,
    pub backpressure_threshold: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct StreamResultPayload {
    pub results: Vec<Record>,
    pub errors: Vec<BatchErrorEntry>,
    pub processing_time_ms: u128,
    pub throughput: f64,
}

#[derive(Debug, Serialize)]
pub struct StreamResponse {
    pub result: StreamResultPayload,
}

async fn execute_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<StreamRequest>,
) -> ApiResult<StreamResponse> {
    let mapping = resolve_active_mapping(&state, &id)?;
    let opts = request.options.unwrap_or_default();

    let started = std::time::Instant::now();
    let record_count = request.data.len();
    let outcome = state
        .engine
        .process_with_streaming(
            &mapping,
            request.data,
            opts.high_water_mark.unwrap_or(16384),
            opts.max_concurrency.unwrap_or(4),
            opts.backpressure_threshold.unwrap_or(1000),
        )
        .await
        .map_err(execution_error)?;

    let elapsed = started.elapsed();
    let throughput = if elapsed.as_secs_f64() > 0.0 { record_count as f64 / elapsed.as_secs_f64() } else { record_count as f64 };
    let errors: Vec<BatchErrorEntry> = outcome.errors.iter().map(|(index, message)| BatchErrorEntry { index: *index, message: message.clone() }).collect();

    Ok(ApiResponse::ok(
        StreamResponse {
            result: StreamResultPayload {
                results: outcome.results,
                errors,
                processing_time_ms: elapsed.as_millis(),
                throughput,
            },
        },
        "stream processed",
    ))
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub sample_data: Option<Record>,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub validation: ValidationPayload,
    pub analysis: AnalysisPayload,
}

#[derive(Debug, Serialize)]
pub struct ValidationPayload {
    pub valid: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct AnalysisPayload {
    pub complexity: f64,
    pub system_resources: serde_json::Value,
    pub recommendations: Vec<String>,
}

async fn validate_mapping(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<ValidateRequest>,
) -> ApiResult<ValidateResponse> {
    let mapping = resolve_active_mapping(&state, &id)?;
    let report = state.engine.validate(&mapping, request.sample_data).await;

    Ok(ApiResponse::ok(
        ValidateResponse {
            validation: ValidationPayload {
                valid: report.valid,
                errors: report.errors,
            },
            analysis: AnalysisPayload {
                complexity: report.complexity,
                system_resources: serde_json::json!({
                    "available_memory": report.system_resources.available_memory,
                    "cpu_usage": report.system_resources.cpu_usage,
                    "memory_pressure": report.system_resources.memory_pressure,
                }),
                recommendations: report.recommendations,
            },
        },
        "validation complete",
    ))
}

// ---------------------------------------------------------------------
// engine-wide endpoints
// ---------------------------------------------------------------------

async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<ApiResponse<serde_json::Value>> {
    let snapshot = state.engine.get_metrics();
    ApiResponse::ok(serde_json::to_value(&snapshot).unwrap_or_default(), "metrics retrieved")
}

async fn get_prometheus_metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics.export_prometheus()
}

async fn reset_metrics(State(state): State<Arc<AppState>>) -> Json<ApiResponse<String>> {
    state.engine.reset_metrics();
    if let Err(e) = state.metrics.reset_metrics().await {
        error!("failed to reset metrics bookkeeping: {e}");
    }
    ApiResponse::ok("metrics reset".to_string(), "metrics have been reset")
}

async fn get_health(State(state): State<Arc<AppState>>) -> Json<ApiResponse<serde_json::Value>> {
    let metrics = state.engine.get_metrics();
    ApiResponse::ok(
        serde_json::json!({
            "status": "healthy",
            "total_executions": metrics.total_executions,
            "failed_executions": metrics.failed_executions,
        }),
        "service is healthy",
    )
}

async fn register_pool_noop(State(_state): State<Arc<AppState>>) -> ApiResult<String> {
    // Pool registration happens through `ConnectionPoolRegistry::register`,
    // which needs a concrete `ConnectionFactory<T>` the HTTP layer cannot
    // construct generically; this endpoint exists to satisfy the contract
    // and reports pools are managed out-of-band.
    Ok(ApiResponse::ok("pools are registered by the process embedding the engine".to_string(), "acknowledged"))
}

async fn get_pool_stats(State(state): State<Arc<AppState>>) -> Json<ApiResponse<serde_json::Value>> {
    ApiResponse::ok(serde_json::json!({ "pools": state.engine.pools.names() }), "pool stats retrieved")
}

// ---------------------------------------------------------------------
// schema discovery collaborator surface (C2)
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
pub struct DiscoverQuery {
    pub force_refresh: Option<bool>,
}

async fn discover_schema(
    State(state): State<Arc<AppState>>,
    Path(system_id): Path<String>,
    Query(query): Query<DiscoverQuery>,
) -> ApiResult<UniversalSchema> {
    let result = state
        .discovery
        .discover(&system_id, query.force_refresh.unwrap_or(false))
        .await
        .map_err(execution_error)?;
    Ok(ApiResponse::ok(result.schema, "schema discovered"))
}

async fn refresh_schema(State(state): State<Arc<AppState>>, Path(schema_id): Path<String>) -> ApiResult<UniversalSchema> {
    let result = state.discovery.discover(&schema_id, true).await.map_err(execution_error)?;
    Ok(ApiResponse::ok(result.schema, "schema refreshed"))
}

#[derive(Debug, Deserialize)]
pub struct SampleQuery {
    pub schema: String,
    pub table: String,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

async fn sample_schema(
    State(state): State<Arc<AppState>>,
    Path(schema_id): Path<String>,
    Query(query): Query<SampleQuery>,
) -> ApiResult<Vec<Record>> {
    let options = SampleOptions {
        limit: query.limit.unwrap_or(100),
        offset: query.offset.unwrap_or(0),
        order_by: None,
        order_dir: None,
    };
    let rows = state
        .discovery
        .get_sample_rows(&schema_id, &query.schema, &query.table, options)
        .await
        .map_err(execution_error)?;
    Ok(ApiResponse::ok(rows, "sample rows retrieved"))
}

#[derive(Debug, Deserialize)]
pub struct StatisticsQuery {
    pub schema: String,
    pub table: String,
}

async fn statistics_schema(
    State(state): State<Arc<AppState>>,
    Path(schema_id): Path<String>,
    Query(query): Query<StatisticsQuery>,
) -> ApiResult<serde_json::Value> {
    let stats = state.discovery.get_table_stats(&schema_id, &query.schema, &query.table).await.map_err(execution_error)?;
    Ok(ApiResponse::ok(
        stats
            .map(|s| serde_json::json!({ "row_count": s.row_count, "size_bytes": s.size_bytes }))
            .unwrap_or(serde_json::Value::Null),
        "table statistics retrieved",
    ))
}

#[derive(Debug, Deserialize)]
pub struct CompareRequest {
    pub source: UniversalSchema,
    pub target: UniversalSchema,
}

#[derive(Debug, Serialize)]
pub struct CompareResponse {
    pub compatibility_score: i32,
    pub warnings: Vec<String>,
    pub mapping_suggestions: Vec<String>,
}

async fn compare_schemas(State(state): State<Arc<AppState>>, Json(request): Json<CompareRequest>) -> Json<ApiResponse<CompareResponse>> {
    let comparison = state.discovery.compare(&request.source, &request.target);
    ApiResponse::ok(
        CompareResponse {
            compatibility_score: comparison.compatibility_score,
            warnings: comparison.warnings,
            mapping_suggestions: comparison.mapping_suggestions,
        },
        "comparison complete",
    )
}

async fn cache_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<serde_json::Value>> {
    let (size, max) = state.discovery.cache_status();
    ApiResponse::ok(serde_json::json!({ "size": size, "max_size": max }), "cache status retrieved")
}

async fn invalidate_cache(State(state): State<Arc<AppState>>, Path(system_id): Path<String>) -> Json<ApiResponse<String>> {
    state.discovery.invalidate_cache(&system_id);
    ApiResponse::ok(format!("cache invalidated for '{system_id}'"), "cache invalidated")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Rule;
    use axum::http::StatusCode;
    use axum_test::TestServer;

    fn test_app() -> (TestServer, Arc<MappingRepository>) {
        let config = Config::default();
        let engine = Arc::new(MappingEngine::new(Arc::new(config.clone())));
        let mappings = Arc::new(MappingRepository::new());
        let discovery = Arc::new(SchemaDiscoveryService::new());
        let metrics = Arc::new(MetricsCollector::new(&config).unwrap());
        let app = build_router(engine, mappings.clone(), discovery, metrics, &config);
        (TestServer::new(app).unwrap(), mappings)
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let (server, _) = test_app();
        let response = server.get("/health").await;
        assert_eq!(response.status_code(), StatusCode::OK);
    }

    #[tokio::test]
    async fn execute_missing_source_data_is_bad_request() {
        let (server, mappings) = test_app();
        mappings.insert(Mapping::new("m1", 1, vec![Rule::Direct { source_field: "a".into(), target_field: "b".into() }]).unwrap());

        let response = server.post("/enhanced-mappings/m1/execute").json(&serde_json::json!({})).await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
        let body: ApiError = response.json();
        assert_eq!(body.error_code, "MISSING_SOURCE_DATA");
    }

    #[tokio::test]
    async fn execute_unknown_mapping_is_not_found() {
        let (server, _) = test_app();
        let response = server
            .post("/enhanced-mappings/missing/execute")
            .json(&serde_json::json!({ "sourceData": {"a": 1} }))
            .await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn execute_inactive_mapping_is_rejected() {
        let (server, mappings) = test_app();
        let mut mapping = Mapping::new("m1", 1, vec![Rule::Direct { source_field: "a".into(), target_field: "b".into() }]).unwrap();
        mapping.active = false;
        mappings.insert(mapping);

        let response = server
            .post("/enhanced-mappings/m1/execute")
            .json(&serde_json::json!({ "sourceData": {"a": 1} }))
            .await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
        let body: ApiError = response.json();
        assert_eq!(body.error_code, "MAPPING_INACTIVE");
    }

    #[tokio::test]
    async fn execute_simple_direct_mapping_matches_spec_scenario_one() {
        let (server, mappings) = test_app();
        mappings.insert(
            Mapping::new(
                "customer-mapping",
                1,
                vec![
                    Rule::Direct { source_field: "id".into(), target_field: "customerId".into() },
                    Rule::Direct { source_field: "name".into(), target_field: "fullName".into() },
                ],
            )
            .unwrap(),
        );

        let response = server
            .post("/enhanced-mappings/customer-mapping/execute")
            .json(&serde_json::json!({ "sourceData": {"id": 12345, "name": "John Doe"} }))
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: ApiResponse<ExecuteResponse> = response.json();
        let result = body.data.unwrap().result;
        assert_eq!(result["customerId"], 12345);
        assert_eq!(result["fullName"], "John Doe");
    }

    #[tokio::test]
    async fn execute_batch_rejects_non_array_payload() {
        let (server, mappings) = test_app();
        mappings.insert(Mapping::new("m1", 1, vec![Rule::Direct { source_field: "a".into(), target_field: "b".into() }]).unwrap());

        let response = server
            .post("/enhanced-mappings/m1/execute-batch")
            .json(&serde_json::json!({ "dataArray": {"not": "an array"} }))
            .await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
        let body: ApiError = response.json();
        assert_eq!(body.error_code, "INVALID_BATCH_DATA");
    }

    #[tokio::test]
    async fn validate_endpoint_reports_complexity() {
        let (server, mappings) = test_app();
        mappings.insert(Mapping::new("m1", 1, vec![Rule::Direct { source_field: "a".into(), target_field: "b".into() }]).unwrap());

        let response = server.post("/enhanced-mappings/m1/validate").json(&serde_json::json!({})).await;
        assert_eq!(response.status_code(), StatusCode::OK);
    }

    #[tokio::test]
    async fn prometheus_metrics_endpoint_exports_known_series() {
        let (server, _) = test_app();
        let response = server.get("/metrics/prometheus").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body = response.text();
        assert!(body.contains("mapping_engine_executions_total"));
    }

    #[tokio::test]
    async fn cache_status_endpoint_reports_empty_cache() {
        let (server, _) = test_app();
        let response = server.get("/cache/status").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: ApiResponse<serde_json::Value> = response.json();
        assert_eq!(body.data.unwrap()["size"], 0);
    }
}
