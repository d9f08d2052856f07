use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mapping_engine::config::Config;
use mapping_engine::engine::{ExecuteOptions, MappingEngine};
use mapping_engine::types::{Mapping, Rule};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn direct_mapping(field_count: usize) -> Mapping {
    let rules = (0..field_count)
        .map(|i| Rule::Direct {
            source_field: format!("field_{i}"),
            target_field: format!("mapped_{i}"),
        })
        .collect();
    Mapping::new("bench-direct", 1, rules).unwrap()
}

fn concat_mapping() -> Mapping {
    Mapping::new(
        "bench-concat",
        1,
        vec![Rule::Concat {
            source_fields: vec!["first".into(), "last".into()],
            separator: " ".into(),
            target_field: "fullName".into(),
        }],
    )
    .unwrap()
}

fn sample_record(field_count: usize) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for i in 0..field_count {
        map.insert(format!("field_{i}"), json!(i));
    }
    map.insert("first".to_string(), json!("John"));
    map.insert("last".to_string(), json!("Doe"));
    serde_json::Value::Object(map)
}

fn bench_single_record_execution(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("pipeline_single_record");

    for field_count in [1usize, 10, 50].iter() {
        group.bench_with_input(BenchmarkId::new("direct_fields", field_count), field_count, |b, &field_count| {
            let engine = MappingEngine::new(Arc::new(Config::default()));
            let mapping = direct_mapping(field_count);
            let record = sample_record(field_count);
            b.to_async(&rt).iter(|| async {
                black_box(
                    engine
                        .execute_mapping(&mapping, record.clone(), ExecuteOptions::default())
                        .await
                        .unwrap(),
                )
            });
        });
    }
    group.finish();
}

fn bench_concat_rule(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = MappingEngine::new(Arc::new(Config::default()));
    let mapping = concat_mapping();
    let record = sample_record(0);

    c.bench_function("pipeline_concat_rule", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(
                engine
                    .execute_mapping(&mapping, record.clone(), ExecuteOptions::default())
                    .await
                    .unwrap(),
            )
        });
    });
}

fn bench_batch_execution(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("pipeline_batch");

    for batch_size in [10usize, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("records", batch_size), batch_size, |b, &batch_size| {
            let engine = MappingEngine::new(Arc::new(Config::default()));
            let mapping = direct_mapping(5);
            let records: Vec<_> = (0..batch_size).map(|_| sample_record(5)).collect();
            b.to_async(&rt).iter(|| async {
                black_box(
                    engine
                        .execute_batch(&mapping, records.clone(), ExecuteOptions::default())
                        .await
                        .unwrap(),
                )
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_single_record_execution, bench_concat_rule, bench_batch_execution);
criterion_main!(benches);
