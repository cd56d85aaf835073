//! Time bucketing and the bucket aggregator
//!
//! Rows are assigned to `origin + floor((ts - origin) / width) * width` and
//! grouped by the configured tag columns. Each `(bucket, group)` key holds one
//! partial state per aggregate expression.

use crate::aggregate::error::{AggregateError, AggregateResult};
use crate::aggregate::function::{AggState, AggregateExpr, TieBreak};
use crate::storage::{Event, Hypertable, ScanFilter, TimeRange};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Start of the bucket containing `ts`
pub fn time_bucket(width: i64, origin: i64, ts: i64) -> i64 {
    let offset = (ts as i128 - origin as i128).div_euclid(width as i128) * width as i128;
    (origin as i128 + offset).clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// What to aggregate and how to bucket it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSpec {
    /// Bucket width in milliseconds
    pub width: i64,
    /// Alignment origin in milliseconds
    pub origin: i64,
    /// Tag columns that split buckets into groups
    pub group_by: Vec<String>,
    pub aggregates: Vec<AggregateExpr>,
    pub tie_break: TieBreak,
}

impl BucketSpec {
    pub fn new(width: i64) -> Self {
        Self {
            width,
            origin: 0,
            group_by: Vec::new(),
            aggregates: Vec::new(),
            tie_break: TieBreak::default(),
        }
    }

    pub fn group_by<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.group_by = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn aggregate(mut self, expr: AggregateExpr) -> Self {
        self.aggregates.push(expr);
        self
    }

    pub fn origin(mut self, origin: i64) -> Self {
        self.origin = origin;
        self
    }

    pub fn tie_break(mut self, tie: TieBreak) -> Self {
        self.tie_break = tie;
        self
    }

    pub fn validate(&self) -> AggregateResult<()> {
        if self.width <= 0 {
            return Err(AggregateError::InvalidBucketWidth(format!(
                "bucket width must be positive, got {}ms",
                self.width
            )));
        }
        if self.aggregates.is_empty() {
            return Err(AggregateError::InvalidDefinition(
                "at least one aggregate expression is required".into(),
            ));
        }
        Ok(())
    }

    pub fn bucket_start(&self, ts: i64) -> i64 {
        time_bucket(self.width, self.origin, ts)
    }

    /// Largest bucket boundary at or below `ts`
    pub fn align_down(&self, ts: i64) -> i64 {
        self.bucket_start(ts)
    }

    /// Smallest bucket boundary at or above `ts`
    pub fn align_up(&self, ts: i64) -> i64 {
        let down = self.bucket_start(ts);
        if down == ts {
            ts
        } else {
            down.saturating_add(self.width)
        }
    }

    /// The same spec at a coarser width, which must be a positive multiple of ours
    pub fn coarsen(&self, width: i64) -> AggregateResult<BucketSpec> {
        if width <= 0 || self.width <= 0 || width % self.width != 0 {
            return Err(AggregateError::InvalidBucketWidth(format!(
                "{}ms is not a positive multiple of the base width {}ms",
                width, self.width
            )));
        }
        Ok(BucketSpec {
            width,
            ..self.clone()
        })
    }

    /// Extend a range outward to whole buckets
    pub fn widen(&self, range: &TimeRange) -> TimeRange {
        let start = if range.start == i64::MIN {
            i64::MIN
        } else {
            self.align_down(range.start)
        };
        let end = if range.end == i64::MAX {
            i64::MAX
        } else {
            self.align_up(range.end)
        };
        TimeRange { start, end }
    }

    fn key_for(&self, event: &Event) -> BucketKey {
        BucketKey {
            bucket: self.bucket_start(event.timestamp),
            group: self
                .group_by
                .iter()
                .map(|c| event.tags.get(c).cloned())
                .collect(),
        }
    }

    fn seed(&self) -> Vec<AggState> {
        self.aggregates.iter().map(|a| a.func.seed()).collect()
    }
}

/// Identity of one aggregate row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    pub bucket: i64,
    /// Group-by values, aligned with the bucket spec's `group_by`
    pub group: Vec<Option<String>>,
}

/// Partial aggregates of one `(bucket, group)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketRow {
    pub key: BucketKey,
    /// One state per aggregate expression
    pub states: Vec<AggState>,
}

/// Accumulates rows and partial rows into buckets
pub struct BucketAggregator<'a> {
    spec: &'a BucketSpec,
    buckets: BTreeMap<BucketKey, Vec<AggState>>,
}

impl<'a> BucketAggregator<'a> {
    pub fn new(spec: &'a BucketSpec) -> Self {
        Self {
            spec,
            buckets: BTreeMap::new(),
        }
    }

    /// Fold one raw row into its bucket
    pub fn accumulate(&mut self, event: &Event) {
        let spec = self.spec;
        let states = self
            .buckets
            .entry(spec.key_for(event))
            .or_insert_with(|| spec.seed());
        for (state, expr) in states.iter_mut().zip(&spec.aggregates) {
            state.accumulate(&expr.func, event, spec.tie_break);
        }
    }

    /// Merge an already-aggregated row, re-bucketing it to the bucket spec's width
    pub fn merge(&mut self, row: BucketRow) -> AggregateResult<()> {
        if row.states.len() != self.spec.aggregates.len() {
            return Err(AggregateError::StateMismatch(format!(
                "row has {} states, expected {}",
                row.states.len(),
                self.spec.aggregates.len()
            )));
        }
        let key = BucketKey {
            bucket: self.spec.bucket_start(row.key.bucket),
            group: row.key.group,
        };
        match self.buckets.get_mut(&key) {
            Some(states) => {
                for (state, other) in states.iter_mut().zip(&row.states) {
                    state.combine(other, self.spec.tie_break)?;
                }
            }
            None => {
                self.buckets.insert(key, row.states);
            }
        }
        Ok(())
    }

    /// Rows sorted by bucket, then group
    pub fn finish(self) -> Vec<BucketRow> {
        self.buckets
            .into_iter()
            .map(|(key, states)| BucketRow { key, states })
            .collect()
    }
}

/// Aggregate a table's rows in `range` into buckets
pub fn aggregate(
    table: &Hypertable,
    range: &TimeRange,
    filter: &ScanFilter,
    spec: &BucketSpec,
) -> AggregateResult<Vec<BucketRow>> {
    let mut aggregator = BucketAggregator::new(spec);
    table.visit(range, filter, |event| aggregator.accumulate(event))?;
    Ok(aggregator.finish())
}

/// Re-bucket partial rows to a coarser width
///
/// The width must be a positive multiple of the bucket spec's width.
pub fn rollup(rows: Vec<BucketRow>, spec: &BucketSpec, width: i64) -> AggregateResult<Vec<BucketRow>> {
    let coarse = spec.coarsen(width)?;
    let mut aggregator = BucketAggregator::new(&coarse);
    for row in rows {
        aggregator.merge(row)?;
    }
    Ok(aggregator.finish())
}

/// A finalized aggregate row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRow {
    pub bucket: i64,
    pub group: Vec<(String, Option<String>)>,
    pub values: Vec<(String, Option<f64>)>,
}

impl ResultRow {
    /// Value of an aggregate by its alias
    pub fn value(&self, alias: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(name, _)| name == alias)
            .and_then(|(_, v)| *v)
    }

    /// Group value of a tag column
    pub fn group_value(&self, column: &str) -> Option<&str> {
        self.group
            .iter()
            .find(|(name, _)| name == column)
            .and_then(|(_, v)| v.as_deref())
    }
}

/// Finalize partial rows into result rows
pub fn finalize(rows: &[BucketRow], spec: &BucketSpec) -> Vec<ResultRow> {
    rows.iter()
        .map(|row| ResultRow {
            bucket: row.key.bucket,
            group: spec
                .group_by
                .iter()
                .cloned()
                .zip(row.key.group.iter().cloned())
                .collect(),
            values: spec
                .aggregates
                .iter()
                .zip(&row.states)
                .map(|(expr, state)| (expr.alias.clone(), state.finalize()))
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::function::AggFunc;

    const HOUR: i64 = 3_600_000;

    fn spec() -> BucketSpec {
        BucketSpec::new(HOUR)
            .group_by(["equipment_id"])
            .aggregate(AggregateExpr::new(AggFunc::Avg("temperature".into())))
            .aggregate(AggregateExpr::new(AggFunc::Count(None)))
    }

    fn reading(ts: i64, equipment: &str, temp: f64) -> Event {
        Event::new(ts)
            .tag("equipment_id", equipment)
            .field("temperature", temp)
    }

    #[test]
    fn test_time_bucket_alignment() {
        assert_eq!(time_bucket(HOUR, 0, 0), 0);
        assert_eq!(time_bucket(HOUR, 0, HOUR - 1), 0);
        assert_eq!(time_bucket(HOUR, 0, HOUR), HOUR);
        assert_eq!(time_bucket(HOUR, 0, -1), -HOUR);
        // Shifted origin
        assert_eq!(time_bucket(HOUR, 15 * 60_000, 10 * 60_000), -45 * 60_000);
        assert_eq!(time_bucket(HOUR, 0, i64::MIN), i64::MIN);
    }

    #[test]
    fn test_widen_to_whole_buckets() {
        let s = spec();
        assert_eq!(s.widen(&TimeRange::new(10, HOUR + 10)), TimeRange::new(0, 2 * HOUR));
        assert_eq!(s.widen(&TimeRange::new(0, HOUR)), TimeRange::new(0, HOUR));
        assert_eq!(s.widen(&TimeRange::all()), TimeRange::all());
    }

    #[test]
    fn test_aggregator_groups_and_sorts() {
        let s = spec();
        let mut agg = BucketAggregator::new(&s);
        for event in [
            reading(HOUR + 5, "PUMP_001", 40.0),
            reading(10, "PUMP_001", 42.0),
            reading(20, "MOTOR_001", 60.0),
            reading(30, "MOTOR_001", 62.0),
        ] {
            agg.accumulate(&event);
        }
        let rows = finalize(&agg.finish(), &s);

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].group_value("equipment_id"), Some("MOTOR_001"));
        assert_eq!(rows[0].value("avg_temperature"), Some(61.0));
        assert_eq!(rows[0].value("count"), Some(2.0));
        assert_eq!(rows[1].group_value("equipment_id"), Some("PUMP_001"));
        assert_eq!(rows[2].bucket, HOUR);
    }

    #[test]
    fn test_rollup_combines_partials() {
        let s = spec();
        let mut agg = BucketAggregator::new(&s);
        for h in 0..6 {
            agg.accumulate(&reading(h * HOUR, "MOTOR_001", h as f64));
        }
        let hourly = agg.finish();
        assert_eq!(hourly.len(), 6);

        let rolled = finalize(&rollup(hourly, &s, 3 * HOUR).unwrap(), &s);
        assert_eq!(rolled.len(), 2);
        assert_eq!(rolled[0].value("avg_temperature"), Some(1.0));
        assert_eq!(rolled[1].value("avg_temperature"), Some(4.0));
        assert_eq!(rolled[1].value("count"), Some(3.0));

        assert!(matches!(
            rollup(Vec::new(), &s, 90 * 60_000),
            Err(AggregateError::InvalidBucketWidth(_))
        ));
    }
}
