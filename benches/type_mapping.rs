use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mapping_engine::typemap::{map_schema, map_type, NativeColumn, NativeTable};

fn native_column(name: &str, native_type: &str) -> NativeColumn {
    NativeColumn {
        name: name.to_string(),
        native_type: native_type.to_string(),
        length: None,
        precision: None,
        scale: None,
        nullable: true,
        default_value: None,
        is_primary_key: false,
        is_foreign_key: false,
        is_unique: false,
        ordinal_position: 0,
        comment: None,
    }
}

fn bench_map_type(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_type");

    let cases = [
        ("postgresql", "integer"),
        ("postgresql", "character varying(255)"),
        ("postgresql", "timestamp without time zone"),
        ("mysql", "tinyint(1)"),
        ("mysql", "varchar(100)"),
        ("mysql", "decimal(10,2)"),
    ];

    for (system, native_type) in cases.iter() {
        group.bench_with_input(BenchmarkId::new(*system, *native_type), native_type, |b, &native_type| {
            b.iter(|| black_box(map_type(native_type, system, None)));
        });
    }
    group.finish();
}

fn bench_map_schema(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_schema");

    for table_count in [1usize, 10, 50].iter() {
        group.bench_with_input(BenchmarkId::new("tables", table_count), table_count, |b, &table_count| {
            let tables: Vec<NativeTable> = (0..table_count)
                .map(|i| NativeTable {
                    name: format!("table_{i}"),
                    columns: vec![
                        native_column("id", "integer"),
                        native_column("name", "character varying(255)"),
                        native_column("created_at", "timestamp without time zone"),
                        native_column("amount", "numeric(10,2)"),
                    ],
                })
                .collect();
            b.iter(|| black_box(map_schema(&tables, "postgresql")));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_map_type, bench_map_schema);
criterion_main!(benches);
