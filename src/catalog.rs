//! Database catalog
//!
//! Owns the hypertables and continuous aggregates under one data directory,
//! together with the job scheduler that runs their policies. Administrative
//! operations (forced compression, tiering, refresh, policy changes) go
//! through here.

use crate::aggregate::{
    AggregateError, AggregateResult, ContinuousAggregate, ContinuousAggregateDef, RefreshOutcome,
};
use crate::jobs::{Job, JobKind, JobRun, JobScheduler};
use crate::storage::{CompressOutcome, Hypertable, TableConfig, TierOutcome, TimeRange};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Intervals for policy jobs that have no schedule of their own
#[derive(Debug, Clone, Copy)]
pub struct PolicyIntervals {
    pub compression: i64,
    pub retention: i64,
}

impl Default for PolicyIntervals {
    fn default() -> Self {
        Self {
            compression: 3_600_000,
            retention: 3_600_000,
        }
    }
}

/// Tables, continuous aggregates and their jobs
pub struct Database {
    data_dir: PathBuf,
    tables: RwLock<BTreeMap<String, Arc<Hypertable>>>,
    aggregates: RwLock<BTreeMap<String, Arc<ContinuousAggregate>>>,
    scheduler: Arc<JobScheduler>,
    intervals: PolicyIntervals,
}

impl Database {
    pub fn open(data_dir: impl AsRef<Path>) -> AggregateResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir).map_err(crate::storage::StorageError::from)?;
        Ok(Self {
            data_dir,
            tables: RwLock::new(BTreeMap::new()),
            aggregates: RwLock::new(BTreeMap::new()),
            scheduler: Arc::new(JobScheduler::new()),
            intervals: PolicyIntervals::default(),
        })
    }

    pub fn with_intervals(mut self, intervals: PolicyIntervals) -> Self {
        self.intervals = intervals;
        self
    }

    /// Open every table and aggregate and schedule the policies they declare
    pub async fn bootstrap(
        data_dir: impl AsRef<Path>,
        intervals: PolicyIntervals,
        tables: Vec<TableConfig>,
        aggregates: Vec<ContinuousAggregateDef>,
    ) -> AggregateResult<Self> {
        let db = Self::open(data_dir)?.with_intervals(intervals);
        for config in tables {
            let retention = config.retention;
            let compress_after = config.compress_after;
            let name = config.name.clone();
            db.create_table(config)?;
            if let Some(drop_after) = retention {
                db.add_retention_policy(&name, drop_after).await?;
            }
            if let Some(after) = compress_after {
                db.add_compression_policy(&name, after).await?;
            }
        }
        for def in aggregates {
            let interval = def.schedule_interval;
            let name = def.name.clone();
            db.create_continuous_aggregate(def)?;
            db.add_refresh_policy(&name, interval).await?;
        }
        Ok(db)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn scheduler(&self) -> Arc<JobScheduler> {
        self.scheduler.clone()
    }

    fn lock_error(e: impl std::fmt::Display) -> AggregateError {
        AggregateError::Lock(format!("Failed to acquire catalog lock: {}", e))
    }

    /// Open (or create) a hypertable
    pub fn create_table(&self, config: TableConfig) -> AggregateResult<Arc<Hypertable>> {
        let mut tables = self.tables.write().map_err(Self::lock_error)?;
        if tables.contains_key(&config.name) {
            return Err(AggregateError::InvalidDefinition(format!(
                "table {} already exists",
                config.name
            )));
        }
        let table = Arc::new(Hypertable::open(self.data_dir.join("tables"), config)?);
        tables.insert(table.name().to_string(), table.clone());
        Ok(table)
    }

    pub fn table(&self, name: &str) -> AggregateResult<Arc<Hypertable>> {
        self.tables
            .read()
            .map_err(Self::lock_error)?
            .get(name)
            .cloned()
            .ok_or_else(|| AggregateError::UnknownTable(name.to_string()))
    }

    pub fn table_names(&self) -> AggregateResult<Vec<String>> {
        Ok(self.tables.read().map_err(Self::lock_error)?.keys().cloned().collect())
    }

    /// Define a continuous aggregate over an existing table
    pub fn create_continuous_aggregate(
        &self,
        def: ContinuousAggregateDef,
    ) -> AggregateResult<Arc<ContinuousAggregate>> {
        let table = self.table(&def.source)?;
        let mut aggregates = self.aggregates.write().map_err(Self::lock_error)?;
        if aggregates.contains_key(&def.name) {
            return Err(AggregateError::InvalidDefinition(format!(
                "continuous aggregate {} already exists",
                def.name
            )));
        }
        let cagg = Arc::new(ContinuousAggregate::open(
            self.data_dir.join("aggregates"),
            def,
            table,
        )?);
        aggregates.insert(cagg.name().to_string(), cagg.clone());
        Ok(cagg)
    }

    pub fn aggregate(&self, name: &str) -> AggregateResult<Arc<ContinuousAggregate>> {
        self.aggregates
            .read()
            .map_err(Self::lock_error)?
            .get(name)
            .cloned()
            .ok_or_else(|| AggregateError::UnknownAggregate(name.to_string()))
    }

    pub fn aggregate_names(&self) -> AggregateResult<Vec<String>> {
        Ok(self
            .aggregates
            .read()
            .map_err(Self::lock_error)?
            .keys()
            .cloned()
            .collect())
    }

    // Forced operations

    pub fn force_compress(&self, table: &str, chunk_id: u32) -> AggregateResult<CompressOutcome> {
        Ok(self.table(table)?.compress_chunk(chunk_id)?)
    }

    /// Returns the number of rows restored
    pub fn force_decompress(&self, table: &str, chunk_id: u32) -> AggregateResult<u64> {
        Ok(self.table(table)?.decompress_chunk(chunk_id)?)
    }

    pub fn force_tier(&self, table: &str, chunk_id: u32) -> AggregateResult<TierOutcome> {
        Ok(self.table(table)?.tier_chunk(chunk_id)?)
    }

    /// Refresh now; over `range` when given, otherwise a regular run
    pub fn force_refresh(
        &self,
        aggregate: &str,
        range: Option<&TimeRange>,
        now: i64,
    ) -> AggregateResult<RefreshOutcome> {
        let cagg = self.aggregate(aggregate)?;
        match range {
            Some(range) => cagg.force_refresh(range, now),
            None => cagg.refresh(now),
        }
    }

    // Policies

    pub async fn add_retention_policy(&self, table: &str, drop_after: i64) -> AggregateResult<String> {
        let table = self.table(table)?;
        Ok(self
            .scheduler
            .add(Job::new(
                JobKind::Retention { table, drop_after },
                self.intervals.retention,
            ))
            .await)
    }

    pub async fn remove_retention_policy(&self, table: &str) -> bool {
        self.scheduler.remove(&format!("retention:{}", table)).await
    }

    pub async fn add_compression_policy(&self, table: &str, after: i64) -> AggregateResult<String> {
        let table = self.table(table)?;
        Ok(self
            .scheduler
            .add(Job::new(
                JobKind::Compression { table, after },
                self.intervals.compression,
            ))
            .await)
    }

    pub async fn remove_compression_policy(&self, table: &str) -> bool {
        self.scheduler.remove(&format!("compression:{}", table)).await
    }

    pub async fn add_refresh_policy(&self, aggregate: &str, interval: i64) -> AggregateResult<String> {
        if interval <= 0 {
            return Err(AggregateError::InvalidDefinition(
                "refresh interval must be positive".into(),
            ));
        }
        let aggregate = self.aggregate(aggregate)?;
        Ok(self
            .scheduler
            .add(Job::new(JobKind::Refresh { aggregate }, interval))
            .await)
    }

    pub async fn remove_refresh_policy(&self, aggregate: &str) -> bool {
        self.scheduler.remove(&format!("refresh:{}", aggregate)).await
    }

    /// Run every due job once
    pub async fn run_jobs(&self, now: i64) -> Vec<JobRun> {
        self.scheduler.run_due(now).await
    }

    /// Flush every table's WAL
    pub fn sync(&self) -> AggregateResult<()> {
        for table in self.tables.read().map_err(Self::lock_error)?.values() {
            table.sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AggFunc, AggregateExpr, BucketSpec};
    use crate::jobs::JobStatus;
    use crate::storage::{Event, DAY_MILLIS};
    use tempfile::tempdir;

    fn sensor_table() -> TableConfig {
        let mut config = TableConfig::new("sensor_data")
            .tags(["equipment_id"])
            .fields(["temperature"]);
        config.retention = Some(30 * DAY_MILLIS);
        config.compress_after = Some(DAY_MILLIS);
        config
    }

    fn daily() -> ContinuousAggregateDef {
        let spec = BucketSpec::new(DAY_MILLIS)
            .group_by(["equipment_id"])
            .aggregate(AggregateExpr::new(AggFunc::Max("temperature".into())));
        ContinuousAggregateDef::new("daily_max", "sensor_data", spec)
    }

    #[tokio::test]
    async fn test_bootstrap_schedules_policies() {
        let dir = tempdir().unwrap();
        let db = Database::bootstrap(dir.path(), PolicyIntervals::default(), vec![sensor_table()], vec![daily()])
            .await
            .unwrap();

        let jobs: Vec<String> = db.scheduler().list().await.into_iter().map(|j| j.id).collect();
        assert_eq!(
            jobs,
            vec!["compression:sensor_data", "refresh:daily_max", "retention:sensor_data"]
        );
        assert_eq!(db.table_names().unwrap(), vec!["sensor_data"]);
        assert_eq!(db.aggregate_names().unwrap(), vec!["daily_max"]);

        assert!(db.remove_retention_policy("sensor_data").await);
        assert!(!db.remove_retention_policy("sensor_data").await);
    }

    #[tokio::test]
    async fn test_run_jobs_compresses_and_refreshes() {
        let dir = tempdir().unwrap();
        let db = Database::bootstrap(dir.path(), PolicyIntervals::default(), vec![sensor_table()], vec![daily()])
            .await
            .unwrap();
        let table = db.table("sensor_data").unwrap();
        for day in 0..3 {
            table
                .insert(
                    Event::new(day * DAY_MILLIS)
                        .tag("equipment_id", "PUMP_001")
                        .field("temperature", 50.0 + day as f64),
                )
                .unwrap();
        }

        let runs = db.run_jobs(3 * DAY_MILLIS).await;
        assert_eq!(runs.len(), 3);
        assert!(runs.iter().all(|r| matches!(r.status, JobStatus::Success { .. })));
        assert_eq!(db.aggregate("daily_max").unwrap().watermark(), Some(3 * DAY_MILLIS));
        assert_eq!(table.stats().unwrap().compressed_chunks, 2);
    }

    #[test]
    fn test_unknown_names_are_typed_errors() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        assert!(matches!(db.table("nope"), Err(AggregateError::UnknownTable(_))));
        assert!(matches!(
            db.force_refresh("nope", None, 0),
            Err(AggregateError::UnknownAggregate(_))
        ));
        assert!(matches!(
            db.create_continuous_aggregate(daily()),
            Err(AggregateError::UnknownTable(_))
        ));

        db.create_table(sensor_table()).unwrap();
        assert!(db.create_table(sensor_table()).is_err());
        assert!(matches!(
            db.force_compress("sensor_data", 99),
            Err(AggregateError::Storage(crate::storage::StorageError::ChunkNotFound(99)))
        ));
    }
}
