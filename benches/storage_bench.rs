//! Benchmarks for compression, ingestion and aggregation
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use hyperchunk::aggregate::{
    aggregate, AggFunc, AggregateExpr, BucketSpec, ContinuousAggregate, ContinuousAggregateDef,
    QueryOptions,
};
use hyperchunk::storage::*;
use std::sync::Arc;
use tempfile::tempdir;

const HOUR: i64 = 3_600_000;

fn sensor_rows(count: usize) -> Vec<Event> {
    (0..count)
        .map(|i| {
            Event::new(i as i64 * 5_000)
                .tag("device_id", format!("dev-{}", i % 8))
                .tag("status", if i % 97 == 0 { "warning" } else { "normal" })
                .field("temperature", 40.0 + (i % 300) as f64 / 10.0)
                .field("steps", (i % 50) as f64)
                .with_seq(i as u64)
        })
        .collect()
}

fn layout() -> CompressionLayout {
    CompressionLayout {
        segment_by: vec!["device_id".into()],
        order_by: OrderBy::time_desc(),
        bloom_columns: vec!["status".into()],
    }
}

fn table_config() -> TableConfig {
    TableConfig::new("bench")
        .tags(["device_id", "status"])
        .fields(["temperature", "steps"])
        .layout(layout())
        .wal_sync(WalSyncMode::None)
}

fn spec() -> BucketSpec {
    BucketSpec::new(HOUR)
        .group_by(["device_id"])
        .aggregate(AggregateExpr::new(AggFunc::Avg("temperature".into())))
        .aggregate(AggregateExpr::new(AggFunc::Sum("steps".into())))
        .aggregate(AggregateExpr::new(AggFunc::Count(None)))
}

fn bench_compression(c: &mut Criterion) {
    let mut group = c.benchmark_group("compression");

    for size in [1_000, 10_000, 100_000] {
        let rows = sensor_rows(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_function(format!("compress_{}", size), |b| {
            b.iter(|| compress_rows(black_box(&rows), &layout()).unwrap())
        });

        let image = compress_rows(&rows, &layout()).unwrap();
        group.bench_function(format!("decompress_{}", size), |b| {
            b.iter(|| black_box(&image).decompress_all().unwrap())
        });

        let filter = ScanFilter::new().tag("device_id", "dev-3");
        group.bench_function(format!("pruned_scan_{}", size), |b| {
            b.iter(|| {
                let mut out = Vec::new();
                image.scan(&TimeRange::all(), black_box(&filter), &mut out).unwrap();
                out
            })
        });
    }

    group.finish();
}

fn bench_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest");
    group.throughput(Throughput::Elements(10_000));

    group.bench_function("insert_batch_10000", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let table = Hypertable::open(dir.path(), table_config()).unwrap();
                (dir, table, sensor_rows(10_000))
            },
            |(_dir, table, rows)| table.insert_batch(rows).unwrap(),
            BatchSize::PerIteration,
        )
    });

    group.bench_function("wal_append_batch_100", |b| {
        let dir = tempdir().unwrap();
        let mut wal = WriteAheadLog::open(dir.path().join("bench.wal"), WalSyncMode::None).unwrap();
        let rows = sensor_rows(100);
        b.iter(|| wal.append_batch(black_box(&rows)).unwrap())
    });

    group.finish();
}

fn bench_aggregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregation");

    // About 5.5 days of 5 second readings
    let dir = tempdir().unwrap();
    let table = Arc::new(Hypertable::open(dir.path().join("tables"), table_config()).unwrap());
    table.insert_batch(sensor_rows(100_000)).unwrap();
    let now = 100_000 * 5_000;
    table.close_chunks(now).unwrap();
    for id in table.compression_candidates(now, 0).unwrap() {
        table.compress_chunk(id).unwrap();
    }

    group.bench_function("raw_hourly_100000", |b| {
        b.iter(|| aggregate(&table, &TimeRange::all(), &ScanFilter::new(), black_box(&spec())).unwrap())
    });

    let cagg = ContinuousAggregate::open(
        dir.path().join("aggregates"),
        ContinuousAggregateDef::new("hourly", "bench", spec()),
        table.clone(),
    )
    .unwrap();
    cagg.refresh(now).unwrap();

    group.bench_function("materialized_hourly", |b| {
        b.iter(|| cagg.query(&TimeRange::all(), black_box(&QueryOptions::default())).unwrap())
    });

    group.bench_function("materialized_daily_rollup", |b| {
        let options = QueryOptions::default().bucket_width(24 * HOUR);
        b.iter(|| cagg.query(&TimeRange::all(), black_box(&options)).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_compression, bench_ingest, bench_aggregation);
criterion_main!(benches);
