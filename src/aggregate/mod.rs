//! Bucketed aggregation and continuous aggregates
//!
//! # Architecture
//!
//! ```text
//! Hypertable --visit--> BucketAggregator --partial rows--> MaterializedStore (SQLite)
//!     |                                                          |
//!     +--insert--> InvalidationLog                               |
//!                                                                v
//!                 query = store rows below watermark + raw rows above it
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use hyperchunk::aggregate::*;
//! use hyperchunk::storage::{Hypertable, TableConfig, TimeRange};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let table = Arc::new(Hypertable::open(
//!     "./data/tables",
//!     TableConfig::new("sensor_data")
//!         .tags(["equipment_id"])
//!         .fields(["temperature"]),
//! )?);
//!
//! let spec = BucketSpec::new(parse_duration("1h")?)
//!     .group_by(["equipment_id"])
//!     .aggregate(parse_aggregate("avg(temperature) as avg_temp")?);
//! let cagg = ContinuousAggregate::open(
//!     "./data/caggs",
//!     ContinuousAggregateDef::new("hourly_temps", "sensor_data", spec),
//!     table,
//! )?;
//!
//! let now = chrono::Utc::now().timestamp_millis();
//! cagg.refresh(now)?;
//! let rows = cagg.query(&TimeRange::new(now - parse_duration("1d")?, now), &QueryOptions::default())?;
//! # Ok(())
//! # }
//! ```

pub mod bucket;
pub mod continuous;
pub mod error;
pub mod function;
pub mod materialized;
pub mod parse;
pub mod view;

pub use bucket::{
    aggregate, finalize, rollup, time_bucket, BucketAggregator, BucketKey, BucketRow, BucketSpec,
    ResultRow,
};
pub use continuous::{
    AggregateInfo, ContinuousAggregate, ContinuousAggregateDef, InvalidationLog, RefreshFailure,
    RefreshOutcome, RefreshReport, Watermark,
};
pub use error::{AggregateError, AggregateResult};
pub use function::{AggFunc, AggState, AggregateExpr, Pick, TieBreak};
pub use materialized::MaterializedStore;
pub use parse::{format_duration, parse_aggregate, parse_duration, parse_millis_or_duration, parse_order_by};
pub use view::{raw_query, QueryOptions};
