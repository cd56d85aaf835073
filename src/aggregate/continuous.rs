//! Continuous aggregates - incrementally refreshed bucket materializations
//!
//! A continuous aggregate keeps the bucket rows of a [`BucketSpec`] over one
//! source table in a [`MaterializedStore`]. Everything below the watermark is
//! materialized; the region above it is aggregated from raw chunks at query
//! time (see the `view` module).
//!
//! # Refresh
//!
//! ```text
//! horizon  = align_down(now - end_offset)
//! window   = [align_down(now - start_offset), horizon)
//! advance  = [watermark, horizon)
//! recompute = invalidated buckets inside window and below the watermark
//! ```
//!
//! Work is split into sub-ranges at batch boundaries (chunk width rounded up to
//! a bucket multiple). Each sub-range is aggregated and swapped into the store
//! in one transaction. A failed advance sub-range caps the watermark at its
//! start; failed recomputations go back into the invalidation log.

use crate::aggregate::bucket::{aggregate, time_bucket, BucketSpec};
use crate::aggregate::error::{AggregateError, AggregateResult};
use crate::aggregate::materialized::MaterializedStore;
use crate::storage::{format_millis, Hypertable, InsertObserver, ScanFilter, TableConfig, TimeRange};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Raw watermark value meaning nothing has been materialized yet
const UNSET: i64 = i64::MIN;

/// Definition of a continuous aggregate
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuousAggregateDef {
    pub name: String,
    /// Source hypertable
    pub source: String,
    pub spec: BucketSpec,
    /// Lookback for recomputing invalidated buckets, unbounded when `None`
    pub start_offset: Option<i64>,
    /// Buckets newer than `now - end_offset` are left to the real-time path
    pub end_offset: i64,
    /// How often the refresh job runs
    pub schedule_interval: i64,
    /// Skip the real-time path in queries
    pub materialized_only: bool,
}

impl ContinuousAggregateDef {
    pub fn new(name: impl Into<String>, source: impl Into<String>, spec: BucketSpec) -> Self {
        let schedule_interval = spec.width;
        Self {
            name: name.into(),
            source: source.into(),
            spec,
            start_offset: None,
            end_offset: 0,
            schedule_interval,
            materialized_only: false,
        }
    }

    pub fn start_offset(mut self, offset: Option<i64>) -> Self {
        self.start_offset = offset;
        self
    }

    pub fn end_offset(mut self, offset: i64) -> Self {
        self.end_offset = offset;
        self
    }

    pub fn schedule_interval(mut self, interval: i64) -> Self {
        self.schedule_interval = interval;
        self
    }

    pub fn materialized_only(mut self, enabled: bool) -> Self {
        self.materialized_only = enabled;
        self
    }

    /// Check the definition against the source table's schema
    pub fn validate(&self, table: &TableConfig) -> AggregateResult<()> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(AggregateError::InvalidDefinition(format!(
                "invalid continuous aggregate name '{}'",
                self.name
            )));
        }
        self.spec.validate()?;

        if let Some(column) = self.spec.group_by.iter().find(|c| !table.tags.contains(c)) {
            return Err(AggregateError::SchemaMismatch(format!(
                "{} groups by '{}', which is not a tag of {}",
                self.name, column, table.name
            )));
        }
        for expr in &self.spec.aggregates {
            if let Some(column) = expr.func.column() {
                if !table.fields.iter().any(|f| f == column) {
                    return Err(AggregateError::SchemaMismatch(format!(
                        "{} aggregates '{}', which is not a field of {}",
                        self.name, column, table.name
                    )));
                }
            }
        }
        let mut aliases = BTreeSet::new();
        if let Some(expr) = self.spec.aggregates.iter().find(|e| !aliases.insert(&e.alias)) {
            return Err(AggregateError::InvalidDefinition(format!(
                "duplicate output name '{}'",
                expr.alias
            )));
        }

        if self.end_offset < 0 {
            return Err(AggregateError::InvalidDefinition(
                "end_offset must not be negative".into(),
            ));
        }
        if let Some(start) = self.start_offset {
            if start <= self.end_offset {
                return Err(AggregateError::InvalidDefinition(format!(
                    "start_offset ({}ms) must exceed end_offset ({}ms)",
                    start, self.end_offset
                )));
            }
        }
        if self.schedule_interval <= 0 {
            return Err(AggregateError::InvalidDefinition(
                "schedule_interval must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Identity of the stored rows' shape
    fn fingerprint(&self) -> AggregateResult<String> {
        serde_json::to_string(&self.spec).map_err(|e| AggregateError::Serialization(e.to_string()))
    }
}

/// Materialization boundary with a version counter bumped on every change
#[derive(Debug)]
pub struct Watermark {
    value: AtomicI64,
    version: AtomicU64,
}

impl Watermark {
    fn new(initial: Option<i64>) -> Self {
        Self {
            value: AtomicI64::new(initial.unwrap_or(UNSET)),
            version: AtomicU64::new(0),
        }
    }

    /// Current watermark, `None` before the first refresh
    pub fn get(&self) -> Option<i64> {
        match self.value.load(Ordering::Acquire) {
            UNSET => None,
            value => Some(value),
        }
    }

    /// Split point for reads; `i64::MIN` before the first refresh
    fn raw(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Move from `expected` to `new`; fails if someone else moved it first
    fn advance(&self, expected: i64, new: i64) -> bool {
        let swapped = self
            .value
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.version.fetch_add(1, Ordering::AcqRel);
        }
        swapped
    }
}

/// Records buckets that received rows below the invalidation threshold
#[derive(Debug)]
pub struct InvalidationLog {
    threshold: AtomicI64,
    width: i64,
    origin: i64,
    pending: Mutex<BTreeSet<i64>>,
}

impl InvalidationLog {
    fn new(spec: &BucketSpec, threshold: i64) -> Self {
        Self {
            threshold: AtomicI64::new(threshold),
            width: spec.width,
            origin: spec.origin,
            pending: Mutex::new(BTreeSet::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, BTreeSet<i64>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start capturing rows below `threshold`; never lowers it
    fn raise_threshold(&self, threshold: i64) {
        self.threshold.fetch_max(threshold, Ordering::SeqCst);
    }

    pub fn threshold(&self) -> i64 {
        self.threshold.load(Ordering::SeqCst)
    }

    fn drain(&self) -> BTreeSet<i64> {
        std::mem::take(&mut *self.pending())
    }

    fn requeue(&self, buckets: impl IntoIterator<Item = i64>) {
        self.pending().extend(buckets);
    }

    /// Bucket starts currently awaiting recomputation
    pub fn pending_buckets(&self) -> Vec<i64> {
        self.pending().iter().copied().collect()
    }
}

impl InsertObserver for InvalidationLog {
    fn row_inserted(&self, timestamp: i64) {
        if timestamp < self.threshold.load(Ordering::SeqCst) {
            let bucket = time_bucket(self.width, self.origin, timestamp);
            if self.pending().insert(bucket) {
                tracing::debug!(bucket = %format_millis(bucket), "Invalidated bucket");
            }
        }
    }
}

/// A sub-range that could not be materialized
#[derive(Debug, Clone, Serialize)]
pub struct RefreshFailure {
    pub range: TimeRange,
    pub error: String,
}

/// What one refresh run did
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub aggregate: String,
    pub old_watermark: Option<i64>,
    pub new_watermark: Option<i64>,
    /// Sub-ranges that were recomputed
    pub ranges: Vec<TimeRange>,
    pub failures: Vec<RefreshFailure>,
    pub rows_written: usize,
    /// Invalidated buckets left for a later run
    pub pending_invalidations: usize,
}

impl RefreshReport {
    /// True when nothing was recomputed and the watermark did not move
    pub fn is_noop(&self) -> bool {
        self.ranges.is_empty() && self.failures.is_empty() && self.old_watermark == self.new_watermark
    }
}

/// Result of asking for a refresh
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Ran(RefreshReport),
    AlreadyRunning,
}

impl RefreshOutcome {
    pub fn report(&self) -> Option<&RefreshReport> {
        match self {
            RefreshOutcome::Ran(report) => Some(report),
            RefreshOutcome::AlreadyRunning => None,
        }
    }
}

/// Introspection of one continuous aggregate
#[derive(Debug, Clone, Serialize)]
pub struct AggregateInfo {
    pub name: String,
    pub source: String,
    pub bucket_width: i64,
    pub watermark: Option<i64>,
    pub version: u64,
    pub materialized_rows: u64,
    pub pending_invalidations: usize,
    pub materialized_only: bool,
}

/// Clears the running flag when dropped
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Work {
    /// Extends the materialized region
    Advance,
    /// Rewrites buckets already below the watermark
    Recompute,
}

/// A continuous aggregate bound to its source table and store
pub struct ContinuousAggregate {
    def: ContinuousAggregateDef,
    pub(crate) table: Arc<Hypertable>,
    store: Mutex<MaterializedStore>,
    watermark: Watermark,
    invalidations: Arc<InvalidationLog>,
    running: AtomicBool,
}

impl ContinuousAggregate {
    /// Open the aggregate's store under `dir` and start tracking inserts
    ///
    /// Rows stored under a different definition are discarded and the
    /// watermark starts over.
    pub fn open(
        dir: impl AsRef<Path>,
        def: ContinuousAggregateDef,
        table: Arc<Hypertable>,
    ) -> AggregateResult<Self> {
        if def.source != table.name() {
            return Err(AggregateError::InvalidDefinition(format!(
                "{} reads from {}, but was bound to {}",
                def.name,
                def.source,
                table.name()
            )));
        }
        def.validate(table.config())?;

        let mut store = MaterializedStore::open(dir.as_ref().join(format!("{}.db", def.name)))?;
        let fingerprint = def.fingerprint()?;
        match store.load_definition()? {
            Some(stored) if stored != fingerprint => {
                tracing::warn!(
                    aggregate = %def.name,
                    "Definition changed, discarding materialized rows"
                );
                store.clear()?;
            }
            _ => {}
        }
        store.save_definition(&fingerprint)?;

        let watermark = store.load_watermark()?;
        let invalidations = Arc::new(InvalidationLog::new(&def.spec, watermark.unwrap_or(UNSET)));
        table.register_observer(invalidations.clone())?;

        tracing::info!(
            aggregate = %def.name,
            source = %def.source,
            watermark = ?watermark.map(format_millis),
            "Opened continuous aggregate"
        );

        Ok(Self {
            watermark: Watermark::new(watermark),
            def,
            table,
            store: Mutex::new(store),
            invalidations,
            running: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn definition(&self) -> &ContinuousAggregateDef {
        &self.def
    }

    pub fn source(&self) -> &Arc<Hypertable> {
        &self.table
    }

    pub fn watermark(&self) -> Option<i64> {
        self.watermark.get()
    }

    pub fn watermark_version(&self) -> u64 {
        self.watermark.version()
    }

    pub(crate) fn watermark_raw(&self) -> i64 {
        self.watermark.raw()
    }

    pub fn invalidations(&self) -> &InvalidationLog {
        &self.invalidations
    }

    pub(crate) fn lock_store(&self) -> AggregateResult<MutexGuard<'_, MaterializedStore>> {
        self.store
            .lock()
            .map_err(|e| AggregateError::Lock(format!("Failed to acquire store lock: {}", e)))
    }

    pub fn info(&self) -> AggregateResult<AggregateInfo> {
        Ok(AggregateInfo {
            name: self.def.name.clone(),
            source: self.def.source.clone(),
            bucket_width: self.def.spec.width,
            watermark: self.watermark.get(),
            version: self.watermark.version(),
            materialized_rows: self.lock_store()?.row_count()?,
            pending_invalidations: self.invalidations.pending().len(),
            materialized_only: self.def.materialized_only,
        })
    }

    fn try_begin(&self) -> Option<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(&self.running))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Newest bucket boundary a refresh may materialize up to
    pub fn horizon(&self, now: i64) -> i64 {
        self.def
            .spec
            .align_down(now.saturating_sub(self.def.end_offset))
    }

    /// Batch width: chunk width rounded up to a whole number of buckets
    fn batch_width(&self) -> i64 {
        let width = self.def.spec.width;
        let chunk = self.table.chunk_interval().max(1);
        let buckets = chunk.saturating_add(width - 1) / width;
        buckets.max(1).saturating_mul(width)
    }

    /// Earliest bucket boundary that may hold raw rows
    fn data_floor(&self) -> AggregateResult<Option<i64>> {
        let Some(extent) = self.table.extent()? else {
            return Ok(None);
        };
        let mut floor = self.def.spec.align_down(extent.start);
        if let Some(retention) = self.table.retention_floor()? {
            floor = floor.max(self.def.spec.align_up(retention));
        }
        Ok(Some(floor))
    }

    /// Run one scheduled refresh
    pub fn refresh(&self, now: i64) -> AggregateResult<RefreshOutcome> {
        let Some(_run) = self.try_begin() else {
            tracing::debug!(aggregate = %self.def.name, "Refresh already running");
            return Ok(RefreshOutcome::AlreadyRunning);
        };

        let spec = &self.def.spec;
        let hi = self.horizon(now);
        let lo = match self.def.start_offset {
            Some(offset) => spec.align_down(now.saturating_sub(offset)),
            None => i64::MIN,
        };
        let old = self.watermark.raw();

        // Rows landing below `hi` from here on are invalidations
        self.invalidations.raise_threshold(hi);

        let mut jobs = Vec::new();
        let advance = match old {
            UNSET => self.data_floor()?,
            wm => Some(wm),
        }
        .and_then(|start| TimeRange::try_new(start, hi));
        if let Some(range) = advance {
            jobs.push((range, Work::Advance));
        }

        let window = TimeRange::try_new(lo, old.min(hi));
        let mut recompute = Vec::new();
        let mut keep = Vec::new();
        for bucket in self.invalidations.drain() {
            if advance.map_or(false, |r| r.contains(bucket)) {
                continue;
            }
            match window {
                Some(w) if w.contains(bucket) => recompute.push(bucket),
                _ => keep.push(bucket),
            }
        }
        if !keep.is_empty() {
            tracing::debug!(
                aggregate = %self.def.name,
                buckets = keep.len(),
                "Invalidations outside the refresh window stay pending"
            );
        }
        self.invalidations.requeue(keep);
        jobs.extend(self.bucket_runs(&recompute).into_iter().map(|r| (r, Work::Recompute)));

        let target = if advance.is_some() { hi } else { old };
        self.execute(old, target, jobs).map(RefreshOutcome::Ran)
    }

    /// Recompute the buckets of `range` below the horizon, ignoring the lookback
    /// window
    ///
    /// The watermark moves up to the end of the range when the range starts at
    /// or below it.
    pub fn force_refresh(&self, range: &TimeRange, now: i64) -> AggregateResult<RefreshOutcome> {
        let Some(_run) = self.try_begin() else {
            return Ok(RefreshOutcome::AlreadyRunning);
        };

        let old = self.watermark.raw();
        let widened = self.def.spec.widen(range);
        let target = match self.data_floor()? {
            Some(floor) => TimeRange::try_new(widened.start.max(floor), widened.end.min(self.horizon(now))),
            None => None,
        };
        let Some(target) = target else {
            return self.execute(old, old, Vec::new()).map(RefreshOutcome::Ran);
        };

        self.invalidations.raise_threshold(target.end);
        let keep: Vec<i64> = self
            .invalidations
            .drain()
            .into_iter()
            .filter(|b| !target.contains(*b))
            .collect();
        self.invalidations.requeue(keep);

        let reaches = match old {
            UNSET => self.data_floor()?.map_or(false, |floor| target.start <= floor),
            wm => target.start <= wm,
        };
        let (work, new_target) = if reaches && target.end > old {
            (Work::Advance, target.end)
        } else {
            (Work::Recompute, old)
        };

        tracing::info!(aggregate = %self.def.name, range = %target, "Forced refresh");
        self.execute(old, new_target, vec![(target, work)])
            .map(RefreshOutcome::Ran)
    }

    /// Merge sorted bucket starts into contiguous ranges
    fn bucket_runs(&self, buckets: &[i64]) -> Vec<TimeRange> {
        let width = self.def.spec.width;
        let mut runs: Vec<TimeRange> = Vec::new();
        for &bucket in buckets {
            let end = bucket.saturating_add(width);
            match runs.last_mut() {
                Some(last) if last.end == bucket => last.end = end,
                _ => runs.push(TimeRange { start: bucket, end }),
            }
        }
        runs
    }

    /// Split a range at batch boundaries
    fn split(&self, range: TimeRange) -> Vec<TimeRange> {
        let batch = self.batch_width();
        let mut parts = Vec::new();
        let mut start = range.start;
        while start < range.end {
            let end = time_bucket(batch, self.def.spec.origin, start)
                .saturating_add(batch)
                .min(range.end);
            parts.push(TimeRange { start, end });
            start = end;
        }
        parts
    }

    /// Aggregate one sub-range and swap it into the store
    fn materialize(&self, range: &TimeRange) -> AggregateResult<usize> {
        let rows = aggregate(&self.table, range, &ScanFilter::new(), &self.def.spec)?;
        self.lock_store()?.replace_range(range, &rows)?;
        tracing::debug!(
            aggregate = %self.def.name,
            %range,
            rows = rows.len(),
            "Materialized range"
        );
        Ok(rows.len())
    }

    fn execute(
        &self,
        old: i64,
        target: i64,
        jobs: Vec<(TimeRange, Work)>,
    ) -> AggregateResult<RefreshReport> {
        let mut cap = target;
        let mut ranges = Vec::new();
        let mut failures = Vec::new();
        let mut rows_written = 0;

        for (range, work) in jobs {
            for part in self.split(range) {
                match self.materialize(&part) {
                    Ok(rows) => {
                        rows_written += rows;
                        ranges.push(part);
                    }
                    Err(e) => {
                        tracing::warn!(
                            aggregate = %self.def.name,
                            range = %part,
                            error = %e,
                            "Refresh of sub-range failed"
                        );
                        if part.start < old {
                            let below = part.end.min(old);
                            let width = self.def.spec.width;
                            let buckets = (0..)
                                .map(|i: i64| part.start.saturating_add(i.saturating_mul(width)))
                                .take_while(|b| *b < below);
                            self.invalidations.requeue(buckets);
                        }
                        if work == Work::Advance {
                            cap = cap.min(part.start.max(old));
                        }
                        failures.push(RefreshFailure {
                            range: part,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        let new = if cap > old { cap } else { old };
        if new != old {
            if !self.watermark.advance(old, new) {
                return Err(AggregateError::Lock(format!(
                    "watermark of {} moved during refresh",
                    self.def.name
                )));
            }
            self.lock_store()?.save_watermark(new)?;
        }

        let report = RefreshReport {
            aggregate: self.def.name.clone(),
            old_watermark: (old != UNSET).then_some(old),
            new_watermark: (new != UNSET).then_some(new),
            ranges,
            failures,
            rows_written,
            pending_invalidations: self.invalidations.pending().len(),
        };
        if report.is_noop() {
            tracing::debug!(aggregate = %self.def.name, "Refresh found nothing to do");
        } else {
            tracing::info!(
                aggregate = %self.def.name,
                ranges = report.ranges.len(),
                failures = report.failures.len(),
                rows = report.rows_written,
                watermark = ?report.new_watermark.map(format_millis),
                "Refresh complete"
            );
        }
        Ok(report)
    }
}
