use std::collections::BTreeMap;
use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};

use mailts::partition::{partition, RangeSpec};
use mailts::record::{normalize, Columns, Value};
use mailts::source::metrics::{pivot, series_key, Series};

fn bench_partition_windows(c: &mut Criterion) {
    let range = RangeSpec::new(0, 1_000, 10_000, 8, "lo", "hi").unwrap();
    c.bench_function("partition_10k_windows", |b| {
        b.iter(|| {
            let count = partition(Some(black_box(&range))).unwrap().count();
            black_box(count);
        });
    });
}

fn sample_series(series: usize, samples: usize) -> Vec<Series> {
    (0..series)
        .map(|s| {
            let mut metric = BTreeMap::new();
            metric.insert("job".to_string(), "node".to_string());
            metric.insert("instance".to_string(), format!("host-{:03}:9100", s));
            Series {
                metric,
                values: (0..samples)
                    .map(|i| (1_704_067_200.0 + i as f64 * 60.0, format!("{}.5", i)))
                    .collect(),
            }
        })
        .collect()
}

fn bench_pivot(c: &mut Criterion) {
    let input = sample_series(50, 1_440);
    c.bench_function("pivot_50_series_x_1440", |b| {
        b.iter(|| {
            let table = pivot(black_box(input.clone()));
            black_box(table.rows.len());
        });
    });
}

fn bench_series_key(c: &mut Criterion) {
    let input = sample_series(1, 0);
    let metric = &input[0].metric;
    c.bench_function("series_key", |b| {
        b.iter(|| black_box(series_key(black_box(metric))));
    });
}

fn bench_normalize_row(c: &mut Criterion) {
    let columns: Columns = Arc::from(vec![
        "id".to_string(),
        "label".to_string(),
        "amount".to_string(),
        "flag".to_string(),
        "missing".to_string(),
    ]);
    let row = vec![
        Value::Int(42),
        Value::Text("event-42".into()),
        Value::Float(21.25),
        Value::Bool(true),
        Value::Null,
    ];
    c.bench_function("normalize_row", |b| {
        b.iter(|| black_box(normalize(black_box(row.clone()), &columns).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_partition_windows,
    bench_pivot,
    bench_series_key,
    bench_normalize_row
);
criterion_main!(benches);
