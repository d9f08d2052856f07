//! End-to-end tests driving the mapping engine through its HTTP collaborator
//! (spec section 6), covering the literal scenarios from spec section 8.

use std::sync::Arc;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::json;

use mapping_engine::config::Config;
use mapping_engine::discovery::SchemaDiscoveryService;
use mapping_engine::engine::MappingEngine;
use mapping_engine::metrics::MetricsCollector;
use mapping_engine::server::{build_router, ApiError, ApiResponse, MappingRepository};
use mapping_engine::types::{AggregationOp, Mapping, Rule};

fn test_server() -> (TestServer, Arc<MappingRepository>) {
    let config = Config::default();
    let engine = Arc::new(MappingEngine::new(Arc::new(config.clone())));
    let mappings = Arc::new(MappingRepository::new());
    let discovery = Arc::new(SchemaDiscoveryService::new());
    let metrics = Arc::new(MetricsCollector::new(&config).unwrap());
    let app = build_router(engine, mappings.clone(), discovery, metrics, &config);
    (TestServer::new(app).unwrap(), mappings)
}

/// Scenario 1: simple direct mapping (spec section 8).
#[tokio::test]
async fn scenario_simple_direct_mapping() {
    let (server, mappings) = test_server();
    let mut mapping = Mapping::new(
        "customer-mapping",
        1,
        vec![
            Rule::Direct { source_field: "id".into(), target_field: "customerId".into() },
            Rule::Direct { source_field: "name".into(), target_field: "fullName".into() },
        ],
    )
    .unwrap();
    mapping.active = true;
    mappings.insert(mapping);

    let response = server
        .post("/enhanced-mappings/customer-mapping/execute")
        .json(&json!({ "sourceData": {"id": 12345, "name": "John Doe"} }))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: serde_json::Value = response.json();
    let result = &body["data"]["result"];
    assert_eq!(result["customerId"], 12345);
    assert_eq!(result["fullName"], "John Doe");
}

/// Scenario 2: concatenation and aggregation (spec section 8).
#[tokio::test]
async fn scenario_concat_and_aggregation() {
    let (server, mappings) = test_server();
    let mut mapping = Mapping::new(
        "orders-mapping",
        1,
        vec![
            Rule::Concat {
                source_fields: vec!["address.street".into(), "address.city".into(), "address.zipCode".into()],
                separator: ", ".into(),
                target_field: "mailingAddress".into(),
            },
            Rule::Aggregation {
                source: "orders".into(),
                operation: AggregationOp::Sum,
                field: Some("amount".into()),
                target_field: "totalOrderValue".into(),
            },
            Rule::Aggregation {
                source: "orders".into(),
                operation: AggregationOp::Count,
                field: None,
                target_field: "orderCount".into(),
            },
        ],
    )
    .unwrap();
    mapping.active = true;
    mappings.insert(mapping);

    let response = server
        .post("/enhanced-mappings/orders-mapping/execute")
        .json(&json!({
            "sourceData": {
                "address": {"street": "123 Main St", "city": "Anytown", "zipCode": "12345"},
                "orders": [
                    {"amount": 99.99, "date": "2024-03-01"},
                    {"amount": 149.50, "date": "2024-03-05"},
                    {"amount": 75.25, "date": "2024-03-10"},
                ],
            }
        }))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: serde_json::Value = response.json();
    let result = &body["data"]["result"];
    assert_eq!(result["mailingAddress"], "123 Main St, Anytown, 12345");
    let total = result["totalOrderValue"].as_f64().unwrap();
    assert!((total - 324.74).abs() < 0.001, "unexpected total {total}");
    assert_eq!(result["orderCount"], 3);
}

/// Scenario 3: batch of 10 homogeneous records, batch_size=5, preserves
/// input order and reports zero failures.
#[tokio::test]
async fn scenario_batch_of_ten_preserves_order() {
    let (server, mappings) = test_server();
    let mut mapping = Mapping::new(
        "batch-mapping",
        1,
        vec![Rule::Direct { source_field: "id".into(), target_field: "customerId".into() }],
    )
    .unwrap();
    mapping.active = true;
    mappings.insert(mapping);

    let data_array: Vec<serde_json::Value> = (0..10).map(|i| json!({"id": i})).collect();
    let response = server
        .post("/enhanced-mappings/batch-mapping/execute-batch")
        .json(&json!({ "dataArray": data_array, "batch_size": 5, "continue_on_error": false }))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: serde_json::Value = response.json();
    let data = &body["data"];
    assert_eq!(data["total"], 10);
    assert_eq!(data["succeeded"], 10);
    assert_eq!(data["failed"], 0);
    let results = data["results"].as_array().unwrap();
    assert_eq!(results.len(), 10);
    for (i, record) in results.iter().enumerate() {
        assert_eq!(record["customerId"], i as i64);
    }
}

/// Scenario 4: streaming 100 records, none failing, returns 100 results,
/// zero errors, positive throughput.
#[tokio::test]
async fn scenario_streaming_hundred_records() {
    let (server, mappings) = test_server();
    let mut mapping = Mapping::new(
        "stream-mapping",
        1,
        vec![Rule::Direct { source_field: "id".into(), target_field: "id".into() }],
    )
    .unwrap();
    mapping.active = true;
    mappings.insert(mapping);

    let data: Vec<serde_json::Value> = (0..100).map(|i| json!({"id": i})).collect();
    let response = server
        .post("/enhanced-mappings/stream-mapping/stream")
        .json(&json!({
            "data": data,
            "options": {"max_concurrency": 10, "high_water_mark": 16384}
        }))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: serde_json::Value = response.json();
    let result = &body["data"]["result"];
    assert_eq!(result["results"].as_array().unwrap().len(), 100);
    assert_eq!(result["errors"].as_array().unwrap().len(), 0);
    assert!(result["throughput"].as_f64().unwrap() > 0.0);
}

/// Missing source data on /execute returns 400 MISSING_SOURCE_DATA.
#[tokio::test]
async fn execute_rejects_missing_source_data() {
    let (server, mappings) = test_server();
    mappings.insert(
        Mapping::new("m1", 1, vec![Rule::Direct { source_field: "a".into(), target_field: "b".into() }]).unwrap(),
    );

    let response = server.post("/enhanced-mappings/m1/execute").json(&json!({})).await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    let body: ApiError = response.json();
    assert_eq!(body.error_code, "MISSING_SOURCE_DATA");
}

/// Unknown mapping id on /execute returns 404 MAPPING_NOT_FOUND.
#[tokio::test]
async fn execute_rejects_unknown_mapping() {
    let (server, _mappings) = test_server();
    let response = server
        .post("/enhanced-mappings/does-not-exist/execute")
        .json(&json!({"sourceData": {"a": 1}}))
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

/// Idempotence: executing the same mapping over the same data twice produces
/// byte-identical output, since no rule here references wall-clock time.
#[tokio::test]
async fn execution_is_idempotent_for_deterministic_rules() {
    let (server, mappings) = test_server();
    let mut mapping = Mapping::new(
        "idempotent-mapping",
        1,
        vec![
            Rule::Direct { source_field: "id".into(), target_field: "customerId".into() },
            Rule::Concat {
                source_fields: vec!["first".into(), "last".into()],
                separator: " ".into(),
                target_field: "fullName".into(),
            },
        ],
    )
    .unwrap();
    mapping.active = true;
    mappings.insert(mapping);

    let payload = json!({ "sourceData": {"id": 7, "first": "Ada", "last": "Lovelace"} });
    let first = server.post("/enhanced-mappings/idempotent-mapping/execute").json(&payload).await;
    let second = server.post("/enhanced-mappings/idempotent-mapping/execute").json(&payload).await;

    let first_body: serde_json::Value = first.json();
    let second_body: serde_json::Value = second.json();
    assert_eq!(first_body["data"]["result"], second_body["data"]["result"]);
}

/// The /health and /metrics collaborator endpoints respond and the
/// /metrics/reset round-trip leaves the counters at zero.
#[tokio::test]
async fn health_and_metrics_endpoints_respond() {
    let (server, mappings) = test_server();
    let mut mapping =
        Mapping::new("m1", 1, vec![Rule::Direct { source_field: "a".into(), target_field: "b".into() }]).unwrap();
    mapping.active = true;
    mappings.insert(mapping);

    assert_eq!(server.get("/health").await.status_code(), StatusCode::OK);

    server
        .post("/enhanced-mappings/m1/execute")
        .json(&json!({"sourceData": {"a": 1}}))
        .await;

    let metrics_before: serde_json::Value = server.get("/metrics").await.json();
    assert!(metrics_before["data"]["total_executions"].as_u64().unwrap() >= 1);

    assert_eq!(server.post("/metrics/reset").await.status_code(), StatusCode::OK);
    let metrics_after: serde_json::Value = server.get("/metrics").await.json();
    assert_eq!(metrics_after["data"]["total_executions"], 0);
}
