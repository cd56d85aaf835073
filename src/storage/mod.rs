//! Hyperchunk Storage Engine
//!
//! This module provides the hypertable and its physical storage:
//!
//! - **types**: Core data structures (Event, TimeRange, ChunkState)
//! - **wal**: Write-ahead log for the row-oriented chunks
//! - **chunk**: Chunks, their swappable storage and the chunk manager
//! - **compression**: Column segments (delta encoding + LZ4)
//! - **sparse_index**: Per-segment min/max and bloom indexes
//! - **segment**: Chunk file format
//! - **engine**: The hypertable orchestrating all components
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   Event → schema check → assign chunk → WAL (fsync) → raw chunk
//!
//! Lifecycle:
//!   OPEN → CLOSED → COMPRESSED (chunk file) → TIERED (cold dir)
//!
//! Read Path:
//!   Range → overlapping chunks → raw rows | pruned segments → filter
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use hyperchunk::storage::{Event, Hypertable, ScanFilter, TableConfig, TimeRange};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TableConfig::new("sensor_data")
//!         .tags(["equipment_id", "status"])
//!         .fields(["temperature", "vibration"]);
//!     let table = Hypertable::open("./data", config)?;
//!
//!     table.insert(
//!         Event::now()
//!             .tag("equipment_id", "MOTOR_001")
//!             .field("temperature", 61.5),
//!     )?;
//!
//!     let rows = table.scan(&TimeRange::all(), &ScanFilter::new())?;
//!     println!("{} rows", rows.len());
//!     Ok(())
//! }
//! ```

pub mod chunk;
pub mod compression;
pub mod engine;
pub mod error;
pub mod segment;
pub mod sparse_index;
pub mod types;
pub mod wal;

// Re-export commonly used types
pub use chunk::{ChunkInfo, CompressOutcome, CompressedSummary, SegmentInfo};
pub use compression::{compress_rows, CompressedChunk, CompressionLayout, CompressionStats};
pub use engine::{
    BatchMode, BatchReport, Hypertable, InsertObserver, Rejection, TableConfig, TableStats,
    TierOutcome, TieredReads, DAY_MILLIS,
};
pub use error::{StorageError, StorageResult};
pub use segment::ChunkFile;
pub use sparse_index::{MinMaxIndex, SegmentBloomFilter};
pub use types::{format_millis, ChunkState, Event, OrderBy, ScanFilter, TimeRange, TIME_COLUMN};
pub use wal::{WalSyncMode, WriteAheadLog};
