//! # Hyperchunk
//!
//! Chunked time-series storage with columnar compression and continuously
//! refreshed bucket aggregates.
//!
//! ## Features
//!
//! - **Time partitioning**: rows land in fixed-width chunks that move from open
//!   to closed, compressed and tiered
//! - **Columnar compression**: closed chunks are rewritten into segments with
//!   per-column codecs, min/max ranges and bloom filters for pruning
//! - **Durability**: write-ahead log for open chunks, checksummed chunk files
//! - **Continuous aggregates**: bucketed partial states materialized up to a
//!   watermark, with late rows invalidating the buckets they touch
//! - **Policies**: compression, retention and refresh jobs on a scheduler
//!
//! ## Modules
//!
//! - [`storage`]: hypertables, chunks, compression and the WAL
//! - [`aggregate`]: bucketing, partial states and continuous aggregates
//! - [`jobs`]: policy scheduler
//! - [`catalog`]: the database that ties tables, aggregates and jobs together
//! - [`ingest`]: sample data and CSV loading
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hyperchunk::aggregate::{AggFunc, AggregateExpr, BucketSpec, ContinuousAggregateDef, QueryOptions};
//! use hyperchunk::storage::{Event, TableConfig, TimeRange, DAY_MILLIS};
//! use hyperchunk::Database;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::open("./data")?;
//!     let table = db.create_table(
//!         TableConfig::new("sensor_data")
//!             .tags(["equipment_id"])
//!             .fields(["temperature"]),
//!     )?;
//!
//!     table.insert(
//!         Event::new(1_704_067_200_000)
//!             .tag("equipment_id", "MOTOR_001")
//!             .field("temperature", 61.5),
//!     )?;
//!
//!     let spec = BucketSpec::new(DAY_MILLIS)
//!         .group_by(["equipment_id"])
//!         .aggregate(AggregateExpr::new(AggFunc::Avg("temperature".into())).alias("avg_temp"));
//!     let daily = db.create_continuous_aggregate(
//!         ContinuousAggregateDef::new("daily_temps", "sensor_data", spec),
//!     )?;
//!
//!     daily.refresh(chrono::Utc::now().timestamp_millis())?;
//!     for row in daily.query(&TimeRange::all(), &QueryOptions::default())? {
//!         println!("{} {:?}", row.bucket, row.value("avg_temp"));
//!     }
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod catalog;
pub mod config;
pub mod ingest;
pub mod jobs;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{
    BatchMode, BatchReport, ChunkState, CompressOutcome, Event, Hypertable, ScanFilter,
    StorageError, StorageResult, TableConfig, TierOutcome, TieredReads, TimeRange,
};

pub use aggregate::{
    AggFunc, AggregateError, AggregateExpr, AggregateResult, BucketSpec, ContinuousAggregate,
    ContinuousAggregateDef, QueryOptions, RefreshOutcome, RefreshReport, ResultRow,
};

pub use catalog::{Database, PolicyIntervals};

pub use jobs::{Job, JobError, JobKind, JobRun, JobScheduler, JobStatus};

pub use config::{generate_default_config, Config, ConfigError, LoggingConfig};
