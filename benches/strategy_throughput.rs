use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mapping_engine::config::Config;
use mapping_engine::engine::{ExecuteOptions, MappingEngine};
use mapping_engine::strategies::StrategyOptions;
use mapping_engine::types::{Mapping, Rule};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn throughput_mapping() -> Mapping {
    Mapping::new(
        "bench-strategy",
        1,
        vec![
            Rule::Direct { source_field: "id".into(), target_field: "recordId".into() },
            Rule::Transform { source_field: "name".into(), transform_type: "uppercase".into(), target_field: "displayName".into() },
        ],
    )
    .unwrap()
}

fn records(count: usize) -> Vec<serde_json::Value> {
    (0..count)
        .map(|i| json!({"id": i, "name": format!("record_{i}")}))
        .collect()
}

fn bench_strategies_at_fixed_volume(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("strategy_throughput_1000_records");
    group.sample_size(20);

    let strategies = [
        ("sequential", StrategyOptions::Sequential { stop_on_error: false }),
        ("batch_50", StrategyOptions::Batch { batch_size: 50, max_batches: None, delay_between_batches: None, stop_on_error: false }),
        ("stream", StrategyOptions::Stream { high_water_mark: 100, max_concurrency: 8, backpressure_threshold: 500 }),
        ("parallel", StrategyOptions::Parallel { chunk_size: 50, max_concurrency: 8, record_timeout: Duration::from_secs(5) }),
    ];

    for (label, options) in strategies {
        group.bench_with_input(BenchmarkId::from_parameter(label), &options, |b, options| {
            let engine = MappingEngine::new(Arc::new(Config::default()));
            let mapping = throughput_mapping();
            let data = records(1000);
            b.to_async(&rt).iter(|| async {
                let opts = ExecuteOptions { strategy_override: Some(options.clone()), ..Default::default() };
                black_box(engine.execute_batch(&mapping, data.clone(), opts).await.unwrap())
            });
        });
    }
    group.finish();
}

fn bench_batch_size_scaling(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("batch_strategy_batch_size_scaling");

    for batch_size in [10usize, 50, 200].iter() {
        group.bench_with_input(BenchmarkId::new("batch_size", batch_size), batch_size, |b, &batch_size| {
            let engine = MappingEngine::new(Arc::new(Config::default()));
            let mapping = throughput_mapping();
            let data = records(1000);
            b.to_async(&rt).iter(|| async {
                let opts = ExecuteOptions {
                    strategy_override: Some(StrategyOptions::Batch {
                        batch_size,
                        max_batches: None,
                        delay_between_batches: None,
                        stop_on_error: false,
                    }),
                    ..Default::default()
                };
                black_box(engine.execute_batch(&mapping, data.clone(), opts).await.unwrap())
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_strategies_at_fixed_volume, bench_batch_size_scaling);
criterion_main!(benches);
