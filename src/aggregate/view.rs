//! Real-time merge view over a continuous aggregate
//!
//! Buckets below the watermark come from the materialization store, buckets
//! above it are aggregated from raw chunks. Both sides produce partial states,
//! so overlapping keys combine exactly and the result matches a direct raw
//! aggregation over the same (widened) range.

use crate::aggregate::bucket::{finalize, rollup, BucketAggregator, BucketSpec, ResultRow};
use crate::aggregate::continuous::ContinuousAggregate;
use crate::aggregate::error::AggregateResult;
use crate::storage::{Hypertable, ScanFilter, TimeRange};

/// Per-query knobs
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Override the aggregate's `materialized_only` setting
    pub materialized_only: Option<bool>,
    /// Coarser output width, a multiple of the base bucket width
    pub bucket_width: Option<i64>,
}

impl QueryOptions {
    pub fn materialized_only(mut self, enabled: bool) -> Self {
        self.materialized_only = Some(enabled);
        self
    }

    pub fn bucket_width(mut self, width: i64) -> Self {
        self.bucket_width = Some(width);
        self
    }
}

/// Spec whose buckets the output uses
fn output_spec(spec: &BucketSpec, options: &QueryOptions) -> AggregateResult<BucketSpec> {
    match options.bucket_width {
        Some(width) => spec.coarsen(width),
        None => Ok(spec.clone()),
    }
}

impl ContinuousAggregate {
    /// Bucketed rows over `range`, widened to whole buckets
    pub fn query(&self, range: &TimeRange, options: &QueryOptions) -> AggregateResult<Vec<ResultRow>> {
        let spec = &self.definition().spec;
        let widened = output_spec(spec, options)?.widen(range);
        let materialized_only = options
            .materialized_only
            .unwrap_or(self.definition().materialized_only);

        let watermark = self.watermark_raw();
        let mut aggregator = BucketAggregator::new(spec);

        if let Some(below) = TimeRange::try_new(widened.start, watermark.min(widened.end)) {
            for row in self.lock_store()?.read(&below)? {
                aggregator.merge(row)?;
            }
        }
        if !materialized_only {
            if let Some(above) = TimeRange::try_new(watermark.max(widened.start), widened.end) {
                self.table
                    .visit(&above, &ScanFilter::new(), |event| aggregator.accumulate(event))?;
            }
        }

        let rows = match options.bucket_width {
            Some(width) if width != spec.width => rollup(aggregator.finish(), spec, width)?,
            _ => aggregator.finish(),
        };
        tracing::debug!(
            aggregate = %self.name(),
            range = %widened,
            rows = rows.len(),
            materialized_only,
            "Answered view query"
        );
        Ok(finalize(&rows, spec))
    }

    /// The same query answered from raw rows only
    pub fn query_raw(&self, range: &TimeRange, options: &QueryOptions) -> AggregateResult<Vec<ResultRow>> {
        raw_query(&self.table, range, &ScanFilter::new(), &self.definition().spec, options)
    }
}

/// Aggregate raw rows directly, ignoring any materialization
pub fn raw_query(
    table: &Hypertable,
    range: &TimeRange,
    filter: &ScanFilter,
    spec: &BucketSpec,
    options: &QueryOptions,
) -> AggregateResult<Vec<ResultRow>> {
    spec.validate()?;
    let widened = output_spec(spec, options)?.widen(range);
    let rows = crate::aggregate::bucket::aggregate(table, &widened, filter, spec)?;
    let rows = match options.bucket_width {
        Some(width) if width != spec.width => rollup(rows, spec, width)?,
        _ => rows,
    };
    Ok(finalize(&rows, spec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::continuous::ContinuousAggregateDef;
    use crate::aggregate::error::AggregateError;
    use crate::aggregate::function::{AggFunc, AggregateExpr};
    use crate::storage::{Event, TableConfig};
    use std::sync::Arc;
    use tempfile::tempdir;

    const HOUR: i64 = 3_600_000;

    fn setup(dir: &std::path::Path) -> ContinuousAggregate {
        let config = TableConfig::new("sensor_data")
            .tags(["equipment_id"])
            .fields(["temperature"])
            .chunk_interval(6 * HOUR);
        let table = Arc::new(Hypertable::open(dir.join("tables"), config).unwrap());
        for h in 0..12 {
            for (equipment, base) in [("MOTOR_001", 60.0), ("PUMP_001", 40.0)] {
                table
                    .insert(
                        Event::new(h * HOUR + 60_000)
                            .tag("equipment_id", equipment)
                            .field("temperature", base + h as f64),
                    )
                    .unwrap();
            }
        }
        let spec = BucketSpec::new(HOUR)
            .group_by(["equipment_id"])
            .aggregate(AggregateExpr::new(AggFunc::Avg("temperature".into())))
            .aggregate(AggregateExpr::new(AggFunc::Max("temperature".into())))
            .aggregate(AggregateExpr::new(AggFunc::Count(None)));
        let def = ContinuousAggregateDef::new("hourly", "sensor_data", spec);
        ContinuousAggregate::open(dir.join("caggs"), def, table).unwrap()
    }

    #[test]
    fn test_merge_matches_raw_at_any_watermark() {
        let dir = tempdir().unwrap();
        let cagg = setup(dir.path());
        let range = TimeRange::new(30 * 60_000, 11 * HOUR);
        let options = QueryOptions::default();
        let expected = cagg.query_raw(&range, &options).unwrap();
        assert_eq!(expected.len(), 22);

        // Before any refresh, after a partial one, after a full one
        assert_eq!(cagg.query(&range, &options).unwrap(), expected);
        cagg.refresh(5 * HOUR + 10).unwrap();
        assert_eq!(cagg.watermark(), Some(5 * HOUR));
        assert_eq!(cagg.query(&range, &options).unwrap(), expected);
        cagg.refresh(20 * HOUR).unwrap();
        assert_eq!(cagg.query(&range, &options).unwrap(), expected);
    }

    #[test]
    fn test_materialized_only_hides_the_tail() {
        let dir = tempdir().unwrap();
        let cagg = setup(dir.path());
        cagg.refresh(4 * HOUR).unwrap();

        let options = QueryOptions::default().materialized_only(true);
        let rows = cagg.query(&TimeRange::all(), &options).unwrap();
        assert_eq!(rows.len(), 8);
        assert!(rows.iter().all(|r| r.bucket < 4 * HOUR));
    }

    #[test]
    fn test_rollup_to_coarser_width() {
        let dir = tempdir().unwrap();
        let cagg = setup(dir.path());
        cagg.refresh(7 * HOUR).unwrap();

        let options = QueryOptions::default().bucket_width(6 * HOUR);
        let rows = cagg.query(&TimeRange::new(HOUR, 2 * HOUR), &options).unwrap();
        // Widened to the whole first 6h bucket
        assert_eq!(rows.len(), 2);
        let motor = rows
            .iter()
            .find(|r| r.group_value("equipment_id") == Some("MOTOR_001"))
            .unwrap();
        assert_eq!(motor.value("count"), Some(6.0));
        assert_eq!(motor.value("max_temperature"), Some(65.0));
        assert_eq!(motor.value("avg_temperature"), Some(62.5));
        assert_eq!(rows, cagg.query_raw(&TimeRange::new(HOUR, 2 * HOUR), &options).unwrap());

    }

    #[test]
    fn test_unusable_rollup_widths_are_rejected() {
        let dir = tempdir().unwrap();
        let cagg = setup(dir.path());
        cagg.refresh(7 * HOUR).unwrap();

        for width in [0, -HOUR, 90 * 60_000, 30 * 60_000] {
            let options = QueryOptions::default().bucket_width(width);
            for range in [TimeRange::all(), TimeRange::new(HOUR, 2 * HOUR)] {
                assert!(matches!(
                    cagg.query(&range, &options),
                    Err(AggregateError::InvalidBucketWidth(_))
                ));
                assert!(matches!(
                    cagg.query_raw(&range, &options),
                    Err(AggregateError::InvalidBucketWidth(_))
                ));
            }
        }

        // The base width itself is a valid multiple
        let same = QueryOptions::default().bucket_width(HOUR);
        assert_eq!(
            cagg.query(&TimeRange::all(), &same).unwrap(),
            cagg.query(&TimeRange::all(), &QueryOptions::default()).unwrap()
        );
    }
}
