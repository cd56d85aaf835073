//! End-to-end scenarios over hypertables and continuous aggregates

use hyperchunk::aggregate::{
    AggFunc, AggregateError, AggregateExpr, BucketSpec, ContinuousAggregate,
    ContinuousAggregateDef, QueryOptions,
};
use hyperchunk::storage::{
    ChunkState, CompressOutcome, Event, Hypertable, ScanFilter, StorageError, TableConfig,
    TieredReads, TimeRange, WalSyncMode, DAY_MILLIS as DAY,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

const MINUTE: i64 = 60_000;
const HOUR: i64 = 60 * MINUTE;

fn steps_table(dir: &Path) -> Arc<Hypertable> {
    let config = TableConfig::new("activity")
        .tags(["device_id"])
        .fields(["total_steps"])
        .wal_sync(WalSyncMode::None);
    Arc::new(Hypertable::open(dir.join("tables"), config).unwrap())
}

fn daily_steps(table: Arc<Hypertable>, dir: &Path) -> ContinuousAggregate {
    let spec = BucketSpec::new(DAY)
        .group_by(["device_id"])
        .aggregate(AggregateExpr::new(AggFunc::Sum("total_steps".into())).alias("total_steps"))
        .aggregate(AggregateExpr::new(AggFunc::Count(None)).alias("readings"));
    let def = ContinuousAggregateDef::new("daily_steps", "activity", spec);
    ContinuousAggregate::open(dir.join("aggregates"), def, table).unwrap()
}

/// Close every chunk and compress those that ended by `before`
fn compress_until(table: &Hypertable, now: i64, before: i64) -> Vec<u32> {
    table.close_chunks(now).unwrap();
    let ids = table.compression_candidates(now, now - before).unwrap();
    for id in &ids {
        assert!(matches!(
            table.compress_chunk(*id).unwrap(),
            CompressOutcome::Compressed(_)
        ));
    }
    ids
}

fn chunk_at(table: &Hypertable, ts: i64) -> u32 {
    table
        .chunks()
        .unwrap()
        .into_iter()
        .find(|c| c.range.contains(ts))
        .map(|c| c.id)
        .unwrap()
}

fn four_devices_thirty_days(interval: i64) {
    let dir = tempdir().unwrap();
    let table = steps_table(dir.path());

    for day in 0..30 {
        let mut batch = Vec::new();
        let mut ts = day * DAY;
        while ts < (day + 1) * DAY {
            for device in 0..4 {
                batch.push(
                    Event::new(ts)
                        .tag("device_id", format!("device-{}", device))
                        .field("total_steps", ((ts / interval + device) % 17) as f64),
                );
            }
            ts += interval;
        }
        let report = table.insert_batch(batch).unwrap();
        assert!(report.rejected.is_empty());
    }
    // Half the history compressed, half raw
    assert_eq!(compress_until(&table, 30 * DAY, 15 * DAY).len(), 15);

    let cagg = daily_steps(table.clone(), dir.path());
    let report = cagg.refresh(30 * DAY).unwrap().report().cloned().unwrap();
    assert!(report.failures.is_empty());
    assert_eq!(report.rows_written, 120);
    assert_eq!(cagg.watermark(), Some(30 * DAY));
    assert_eq!(cagg.info().unwrap().materialized_rows, 120);

    let materialized = cagg
        .query(&TimeRange::all(), &QueryOptions::default().materialized_only(true))
        .unwrap();
    let raw = cagg.query_raw(&TimeRange::all(), &QueryOptions::default()).unwrap();
    assert_eq!(materialized.len(), 120);
    assert_eq!(materialized, raw);

    let per_day = (DAY / interval) as f64;
    assert!(materialized.iter().all(|r| r.value("readings") == Some(per_day)));
}

#[test]
fn daily_steps_per_device_at_one_minute() {
    four_devices_thirty_days(MINUTE);
}

#[test]
#[ignore = "slow: about two million rows"]
fn daily_steps_per_device_at_five_seconds() {
    four_devices_thirty_days(5_000);
}

#[test]
fn insert_into_compressed_chunk_requires_decompress() {
    let dir = tempdir().unwrap();
    let table = steps_table(dir.path());
    for h in 0..48 {
        table
            .insert(
                Event::new(h * HOUR)
                    .tag("device_id", "device-0")
                    .field("total_steps", 10.0),
            )
            .unwrap();
    }
    let compressed = compress_until(&table, 2 * DAY, DAY);
    let first = chunk_at(&table, 0);
    assert_eq!(compressed, vec![first]);

    let late = Event::new(HOUR + 30 * MINUTE)
        .tag("device_id", "device-0")
        .field("total_steps", 99.0);
    match table.insert(late.clone()) {
        Err(StorageError::ChunkImmutable { chunk_id, state }) => {
            assert_eq!(chunk_id, first);
            assert_eq!(state, ChunkState::Compressed);
        }
        other => panic!("expected ChunkImmutable, got {:?}", other),
    }

    assert_eq!(table.decompress_chunk(first).unwrap(), 24);
    assert_eq!(table.chunk_state(first).unwrap(), ChunkState::Closed);
    assert_eq!(table.insert(late).unwrap(), first);
    assert!(matches!(
        table.compress_chunk(first).unwrap(),
        CompressOutcome::Compressed(_)
    ));

    let rows = table
        .scan(&TimeRange::new(0, DAY), &ScanFilter::new())
        .unwrap();
    assert_eq!(rows.len(), 25);
    assert_eq!(rows[2].timestamp, HOUR + 30 * MINUTE);
    assert_eq!(rows[2].numeric("total_steps"), Some(99.0));
}

#[test]
fn second_refresh_is_a_noop() {
    let dir = tempdir().unwrap();
    let table = steps_table(dir.path());
    for h in 0..72 {
        table
            .insert(
                Event::new(h * HOUR)
                    .tag("device_id", "device-0")
                    .field("total_steps", h as f64),
            )
            .unwrap();
    }
    let cagg = daily_steps(table, dir.path());

    let first = cagg.refresh(3 * DAY).unwrap().report().cloned().unwrap();
    assert!(!first.is_noop());
    let version = cagg.watermark_version();

    let second = cagg.refresh(3 * DAY).unwrap().report().cloned().unwrap();
    assert!(second.is_noop());
    assert_eq!(second.rows_written, 0);
    assert_eq!(cagg.watermark_version(), version);
}

#[test]
fn late_rows_follow_the_lookback_window() {
    let dir = tempdir().unwrap();
    let config = TableConfig::new("sensor_data")
        .tags(["equipment_id"])
        .fields(["temperature"])
        .wal_sync(WalSyncMode::None);
    let table = Arc::new(Hypertable::open(dir.path().join("tables"), config).unwrap());
    let events = (0..10 * 24)
        .map(|h| {
            Event::new(h * HOUR)
                .tag("equipment_id", "PUMP_001")
                .field("temperature", 1.0)
        })
        .collect();
    table.insert_batch(events).unwrap();

    let spec = BucketSpec::new(HOUR)
        .aggregate(AggregateExpr::new(AggFunc::Sum("temperature".into())).alias("total"));
    let def = ContinuousAggregateDef::new("hourly", "sensor_data", spec).start_offset(Some(2 * DAY));
    let cagg = ContinuousAggregate::open(dir.path().join("aggregates"), def, table.clone()).unwrap();
    cagg.refresh(10 * DAY).unwrap();
    assert_eq!(cagg.watermark(), Some(10 * DAY));

    let recent = 9 * DAY;
    let old = DAY;
    for ts in [recent + 30 * MINUTE, old + 30 * MINUTE] {
        table
            .insert(Event::new(ts).tag("equipment_id", "PUMP_001").field("temperature", 5.0))
            .unwrap();
    }
    assert_eq!(cagg.invalidations().pending_buckets(), vec![old, recent]);

    let total_at = |bucket: i64| {
        cagg.query(&TimeRange::new(bucket, bucket + HOUR), &QueryOptions::default())
            .unwrap()
            .first()
            .and_then(|r| r.value("total"))
    };

    let report = cagg.refresh(10 * DAY).unwrap().report().cloned().unwrap();
    assert_eq!(report.ranges, vec![TimeRange::new(recent, recent + HOUR)]);
    assert_eq!(report.pending_invalidations, 1);
    assert_eq!(total_at(recent), Some(6.0));
    // Still the pre-insert value
    assert_eq!(total_at(old), Some(1.0));

    cagg.force_refresh(&TimeRange::new(old, old + HOUR), 10 * DAY)
        .unwrap();
    assert_eq!(total_at(old), Some(6.0));
    assert!(cagg.invalidations().pending_buckets().is_empty());
    assert_eq!(cagg.watermark(), Some(10 * DAY));
}

#[test]
fn tiered_chunks_under_deny_and_fetch() {
    let dir = tempdir().unwrap();
    let config = |tiered_reads: TieredReads| {
        TableConfig::new("activity")
            .tags(["device_id"])
            .fields(["total_steps"])
            .tiered_reads(tiered_reads)
    };
    let range = TimeRange::new(0, 3 * DAY);

    let expected = {
        let table = Arc::new(Hypertable::open(dir.path().join("tables"), config(TieredReads::Deny)).unwrap());
        for h in 0..72 {
            table
                .insert(
                    Event::new(h * HOUR)
                        .tag("device_id", "device-0")
                        .field("total_steps", (h % 5) as f64),
                )
                .unwrap();
        }
        let expected = table.scan(&range, &ScanFilter::new()).unwrap();

        compress_until(&table, 3 * DAY, 3 * DAY);
        let middle = chunk_at(&table, DAY);
        table.tier_chunk(middle).unwrap();
        assert_eq!(table.chunk_state(middle).unwrap(), ChunkState::Tiered);

        assert!(matches!(
            table.scan(&range, &ScanFilter::new()),
            Err(StorageError::TieredUnavailable { chunk_id }) if chunk_id == middle
        ));
        // Chunks on either side still read
        assert_eq!(table.scan(&TimeRange::new(0, DAY), &ScanFilter::new()).unwrap().len(), 24);

        let cagg = daily_steps(table.clone(), dir.path());
        let report = cagg.refresh(3 * DAY).unwrap().report().cloned().unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].range, TimeRange::new(DAY, 2 * DAY));
        assert_eq!(cagg.watermark(), Some(DAY));

        // Retrying does not skip over the tiered chunk
        cagg.refresh(3 * DAY).unwrap();
        assert_eq!(cagg.watermark(), Some(DAY));

        let err = cagg.query_raw(&range, &QueryOptions::default()).unwrap_err();
        assert!(matches!(err, AggregateError::Storage(StorageError::TieredUnavailable { .. })));
        assert_eq!(err.tiered_chunk(), Some(middle));
        expected
    };

    let table = Arc::new(Hypertable::open(dir.path().join("tables"), config(TieredReads::Fetch)).unwrap());
    assert_eq!(table.scan(&range, &ScanFilter::new()).unwrap(), expected);

    let cagg = daily_steps(table, dir.path());
    assert_eq!(cagg.watermark(), Some(DAY));
    let report = cagg.refresh(3 * DAY).unwrap().report().cloned().unwrap();
    assert!(report.failures.is_empty());
    assert_eq!(cagg.watermark(), Some(3 * DAY));
    assert_eq!(
        cagg.query(&range, &QueryOptions::default()).unwrap(),
        cagg.query_raw(&range, &QueryOptions::default()).unwrap()
    );
}

#[test]
fn restart_replays_wal_and_reloads_compressed_chunks() {
    let dir = tempdir().unwrap();
    let config = || {
        TableConfig::new("activity")
            .tags(["device_id"])
            .fields(["total_steps"])
            .wal_sync(WalSyncMode::EveryWrite)
    };

    let before = {
        let table = Hypertable::open(dir.path(), config()).unwrap();
        for h in 0..72 {
            table
                .insert(
                    Event::new(h * HOUR)
                        .tag("device_id", format!("device-{}", h % 3))
                        .field("total_steps", h as f64),
                )
                .unwrap();
        }
        assert_eq!(compress_until(&table, 3 * DAY, 2 * DAY).len(), 2);
        table.sync().unwrap();
        table.scan(&TimeRange::all(), &ScanFilter::new()).unwrap()
    };
    assert_eq!(before.len(), 72);

    let table = Hypertable::open(dir.path(), config()).unwrap();
    assert_eq!(table.scan(&TimeRange::all(), &ScanFilter::new()).unwrap(), before);

    let states: Vec<ChunkState> = table.chunks().unwrap().into_iter().map(|c| c.state).collect();
    assert_eq!(
        states,
        vec![ChunkState::Compressed, ChunkState::Compressed, ChunkState::Closed]
    );

    // New rows keep getting fresh sequence numbers
    let id = table
        .insert(Event::new(3 * DAY).tag("device_id", "device-0").field("total_steps", 1.0))
        .unwrap();
    let rows = table.scan(&TimeRange::new(3 * DAY, 4 * DAY), &ScanFilter::new()).unwrap();
    assert_eq!(table.chunk_state(id).unwrap(), ChunkState::Open);
    assert!(rows[0].seq > before.iter().map(|e| e.seq).max().unwrap());
}
