//! Hypertable storage engine
//!
//! The hypertable orchestrates the storage components:
//! - Write path: Event → schema check → chunk assignment → WAL → raw chunk
//! - Read path: range → overlapping chunks → raw rows or pruned segments
//! - Lifecycle: close → compress → tier, retention drops, explicit decompress
//!
//! Lock order is always WAL, then chunk map, then a chunk's row lock. Inserts,
//! compression swaps and WAL compaction all take the WAL first, so a swap can
//! never race an insert that has already passed its writability check.

use crate::storage::chunk::{
    read_rows, write_rows, Chunk, ChunkCatalog, ChunkInfo, ChunkManager, ChunkStorage,
    CompressOutcome, CompressedSummary, SegmentInfo,
};
use crate::storage::compression::{compress_rows, CompressionLayout, CompressionStats};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::segment::ChunkFile;
use crate::storage::types::{ChunkState, Event, ScanFilter, TimeRange};
use crate::storage::wal::{check_event_size, WalSyncMode, WriteAheadLog};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One day in milliseconds
pub const DAY_MILLIS: i64 = 86_400_000;

/// Attempts before a compression racing late inserts gives up
const MAX_COMPRESS_ATTEMPTS: usize = 3;

/// Rows per batch when bulk loading
const BULK_LOAD_BATCH: usize = 10_000;

/// How a batch insert treats individual rejections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// Insert what is valid, report the rest
    #[default]
    PerEvent,
    /// Any rejection aborts the whole batch before anything is written
    AllOrNothing,
}

/// How reads treat chunks in cold storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieredReads {
    /// Load the chunk file from the cold directory on demand
    #[default]
    Fetch,
    /// Fail with `TieredUnavailable`
    Deny,
}

impl std::str::FromStr for TieredReads {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fetch" => Ok(TieredReads::Fetch),
            "deny" => Ok(TieredReads::Deny),
            other => Err(StorageError::Config(format!(
                "unknown tiered read policy '{}', expected fetch or deny",
                other
            ))),
        }
    }
}

/// Notified after a row becomes visible to scans
pub trait InsertObserver: Send + Sync {
    fn row_inserted(&self, timestamp: i64);
}

/// Configuration for one hypertable
#[derive(Debug, Clone)]
pub struct TableConfig {
    pub name: String,
    /// Declared tag columns
    pub tags: Vec<String>,
    /// Declared numeric field columns
    pub fields: Vec<String>,
    /// Chunk width in milliseconds
    pub chunk_interval: i64,
    /// Segment layout used when compressing
    pub layout: CompressionLayout,
    /// How long an ended chunk stays open for late rows
    pub close_after: i64,
    /// Retention policy: drop chunks older than this
    pub retention: Option<i64>,
    /// Compression policy: compress chunks older than this
    pub compress_after: Option<i64>,
    pub batch_mode: BatchMode,
    pub wal_sync: WalSyncMode,
    pub tiered_reads: TieredReads,
}

impl TableConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
            fields: Vec::new(),
            chunk_interval: DAY_MILLIS,
            layout: CompressionLayout {
                order_by: crate::storage::types::OrderBy::time_desc(),
                ..Default::default()
            },
            close_after: 0,
            retention: None,
            compress_after: None,
            batch_mode: BatchMode::default(),
            wal_sync: WalSyncMode::default(),
            tiered_reads: TieredReads::default(),
        }
    }

    pub fn tags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn fields<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn chunk_interval(mut self, millis: i64) -> Self {
        self.chunk_interval = millis;
        self
    }

    pub fn layout(mut self, layout: CompressionLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn batch_mode(mut self, mode: BatchMode) -> Self {
        self.batch_mode = mode;
        self
    }

    pub fn tiered_reads(mut self, policy: TieredReads) -> Self {
        self.tiered_reads = policy;
        self
    }

    pub fn wal_sync(mut self, mode: WalSyncMode) -> Self {
        self.wal_sync = mode;
        self
    }

    /// Check the configuration is self-consistent
    pub fn validate(&self) -> StorageResult<()> {
        if self.name.is_empty() || self.name.contains(['/', '\\']) || self.name.starts_with('.') {
            return Err(StorageError::Config(format!(
                "invalid table name '{}'",
                self.name
            )));
        }
        if self.chunk_interval <= 0 {
            return Err(StorageError::Config(format!(
                "chunk interval of table {} must be positive",
                self.name
            )));
        }
        for column in self.layout.segment_by.iter().chain(&self.layout.bloom_columns) {
            if !self.tags.contains(column) {
                return Err(StorageError::SchemaMismatch(format!(
                    "table {} has no tag column '{}'",
                    self.name, column
                )));
            }
        }
        for key in &self.layout.order_by {
            if key.column != crate::storage::types::TIME_COLUMN && !self.fields.contains(&key.column) {
                return Err(StorageError::SchemaMismatch(format!(
                    "table {} cannot order by unknown column '{}'",
                    self.name, key.column
                )));
            }
        }
        Ok(())
    }
}

/// One event rejected from a batch
#[derive(Debug)]
pub struct Rejection {
    /// Position of the event in the batch
    pub index: usize,
    pub error: StorageError,
}

/// Result of a batch insert
#[derive(Debug, Default)]
pub struct BatchReport {
    pub total: usize,
    pub inserted: usize,
    pub rejected: Vec<Rejection>,
}

impl BatchReport {
    fn merge(&mut self, other: BatchReport) {
        let offset = self.total;
        self.total += other.total;
        self.inserted += other.inserted;
        self.rejected
            .extend(other.rejected.into_iter().map(|r| Rejection {
                index: r.index + offset,
                error: r.error,
            }));
    }
}

/// Outcome of a tiering request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierOutcome {
    Tiered { bytes: u64 },
    AlreadyTiered,
}

/// Storage statistics for a table
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableStats {
    pub chunk_count: usize,
    pub open_chunks: usize,
    pub closed_chunks: usize,
    pub compressed_chunks: usize,
    pub tiered_chunks: usize,
    pub row_count: u64,
    pub uncompressed_bytes: u64,
    pub compressed_bytes: u64,
    pub wal_entries: u64,
    pub wal_size_bytes: u64,
    pub retention_floor: Option<i64>,
}

/// A time-partitioned table
pub struct Hypertable {
    config: TableConfig,
    /// Root directory of this table
    dir: PathBuf,
    /// Write-ahead log for the row-oriented chunks
    wal: Mutex<WriteAheadLog>,
    /// Chunk map
    chunks: RwLock<ChunkManager>,
    /// Next ingestion sequence
    next_seq: AtomicU64,
    observers: RwLock<Vec<Arc<dyn InsertObserver>>>,
    /// Runs after a compressed image is built and before it is swapped in
    #[cfg(test)]
    before_swap: Mutex<Option<BeforeSwap>>,
}

#[cfg(test)]
type BeforeSwap = Box<dyn Fn(&Hypertable, usize) + Send + Sync>;

impl Hypertable {
    /// Open or create a table under `data_dir/<name>`, replaying its WAL
    pub fn open(data_dir: impl AsRef<Path>, config: TableConfig) -> StorageResult<Self> {
        config.validate()?;
        let dir = data_dir.as_ref().join(&config.name);
        std::fs::create_dir_all(dir.join("wal"))?;
        std::fs::create_dir_all(dir.join("meta"))?;
        std::fs::create_dir_all(dir.join("chunks"))?;
        std::fs::create_dir_all(dir.join("cold"))?;

        let catalog = ChunkCatalog::load(&dir.join("meta").join("chunks.json"))?;
        let mut loaded = Vec::with_capacity(catalog.chunks.len());
        for record in &catalog.chunks {
            let file_name = ChunkFile::file_name(record.id);
            let storage = match record.state {
                ChunkState::Open | ChunkState::Closed => ChunkStorage::raw(Vec::new()),
                ChunkState::Compressed => {
                    let path = dir.join("chunks").join(&file_name);
                    let (header, image) = ChunkFile::read(&path)?;
                    if header.chunk_id != record.id {
                        return Err(StorageError::Corruption(format!(
                            "{} holds chunk {}, catalog expects {}",
                            path.display(),
                            header.chunk_id,
                            record.id
                        )));
                    }
                    let summary = match record.summary {
                        Some(summary) => summary,
                        None => CompressedSummary::of(&image, std::fs::metadata(&path)?.len()),
                    };
                    ChunkStorage::Compressed { image, summary }
                }
                ChunkState::Tiered => {
                    let path = dir.join("cold").join(&file_name);
                    if !path.exists() {
                        tracing::warn!(chunk_id = record.id, "Tiered chunk file missing: {:?}", path);
                    }
                    ChunkStorage::Tiered {
                        path,
                        summary: record.summary.unwrap_or_default(),
                    }
                }
            };
            loaded.push(Arc::new(Chunk::with_storage(
                record.id,
                record.range,
                record.state != ChunkState::Open,
                storage,
            )));
        }
        let mut manager = ChunkManager::restore(config.chunk_interval, &catalog, loaded);

        // Replay the WAL into the row-oriented chunks
        let mut wal = WriteAheadLog::open(dir.join("wal").join("current.wal"), config.wal_sync)?;
        let recovered = wal.recover()?;
        let mut next_seq = catalog.next_seq.max(1);
        let mut replayed = 0usize;
        let mut stale = 0usize;
        for event in recovered {
            next_seq = next_seq.max(event.seq + 1);
            match manager.assign(event.timestamp) {
                Ok((chunk, _)) => match chunk.append(event) {
                    Ok(()) => replayed += 1,
                    Err(StorageError::ChunkImmutable { .. }) => stale += 1,
                    Err(e) => return Err(e),
                },
                Err(StorageError::OutOfRetention { .. }) => stale += 1,
                Err(e) => return Err(e),
            }
        }
        if stale > 0 {
            // Rows of chunks compressed or dropped before the last compaction
            Self::compact_wal(&mut wal, &manager)?;
        }

        tracing::info!(
            table = %config.name,
            chunks = manager.len(),
            replayed,
            stale,
            "Opened hypertable"
        );

        let table = Self {
            config,
            dir,
            wal: Mutex::new(wal),
            chunks: RwLock::new(manager),
            next_seq: AtomicU64::new(next_seq),
            observers: RwLock::new(Vec::new()),
            #[cfg(test)]
            before_swap: Mutex::new(None),
        };
        {
            let chunks = table.read_chunks()?;
            table.save_catalog(&chunks)?;
        }
        Ok(table)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    pub fn chunk_interval(&self) -> i64 {
        self.config.chunk_interval
    }

    /// Get path to the directory holding compressed chunk files
    pub fn chunks_dir(&self) -> PathBuf {
        self.dir.join("chunks")
    }

    /// Get path to the cold storage directory
    pub fn cold_dir(&self) -> PathBuf {
        self.dir.join("cold")
    }

    fn catalog_path(&self) -> PathBuf {
        self.dir.join("meta").join("chunks.json")
    }

    fn lock_wal(&self) -> StorageResult<MutexGuard<'_, WriteAheadLog>> {
        self.wal
            .lock()
            .map_err(|e| StorageError::Lock(format!("Failed to acquire WAL lock: {}", e)))
    }

    fn read_chunks(&self) -> StorageResult<RwLockReadGuard<'_, ChunkManager>> {
        self.chunks
            .read()
            .map_err(|e| StorageError::Lock(format!("Failed to acquire chunk map lock: {}", e)))
    }

    fn write_chunks(&self) -> StorageResult<RwLockWriteGuard<'_, ChunkManager>> {
        self.chunks
            .write()
            .map_err(|e| StorageError::Lock(format!("Failed to acquire chunk map lock: {}", e)))
    }

    fn save_catalog(&self, chunks: &ChunkManager) -> StorageResult<()> {
        chunks
            .catalog(self.next_seq.load(Ordering::SeqCst))
            .save(&self.catalog_path())
    }

    /// Rewrite the WAL to hold exactly the rows of row-oriented chunks
    fn compact_wal(wal: &mut WriteAheadLog, chunks: &ChunkManager) -> StorageResult<()> {
        let mut rows = Vec::new();
        for chunk in chunks.all() {
            if let ChunkStorage::Raw(lock) = &*chunk.storage() {
                rows.extend(read_rows(lock)?.rows.iter().cloned());
            }
        }
        rows.sort_by_key(|e| e.seq);
        wal.rewrite(&rows)
    }

    fn get_chunk(&self, id: u32) -> StorageResult<Arc<Chunk>> {
        self.read_chunks()?
            .get(id)
            .cloned()
            .ok_or(StorageError::ChunkNotFound(id))
    }

    /// Register an observer for future inserts
    pub fn register_observer(&self, observer: Arc<dyn InsertObserver>) -> StorageResult<()> {
        self.observers
            .write()
            .map_err(|e| StorageError::Lock(format!("Failed to acquire observer lock: {}", e)))?
            .push(observer);
        Ok(())
    }

    fn notify(&self, timestamps: &[i64]) {
        if timestamps.is_empty() {
            return;
        }
        if let Ok(observers) = self.observers.read() {
            for observer in observers.iter() {
                for &ts in timestamps {
                    observer.row_inserted(ts);
                }
            }
        }
    }

    /// Check an event only uses declared columns
    pub fn validate(&self, event: &Event) -> StorageResult<()> {
        if let Some(tag) = event.tags.keys().find(|k| !self.config.tags.contains(k)) {
            return Err(StorageError::SchemaMismatch(format!(
                "table {} has no tag column '{}'",
                self.config.name, tag
            )));
        }
        if let Some(field) = event.fields.keys().find(|k| !self.config.fields.contains(k)) {
            return Err(StorageError::SchemaMismatch(format!(
                "table {} has no field column '{}'",
                self.config.name, field
            )));
        }
        check_event_size(event)
    }

    /// Chunk covering `ts`, creating and registering it if needed
    fn chunk_for(&self, ts: i64) -> StorageResult<Arc<Chunk>> {
        {
            let chunks = self.read_chunks()?;
            chunks.check_retention(ts)?;
            if let Some(chunk) = chunks.find(ts) {
                return Ok(Arc::clone(chunk));
            }
        }

        let mut chunks = self.write_chunks()?;
        let (chunk, created) = chunks.assign(ts)?;
        if created {
            self.save_catalog(&chunks)?;
        }
        Ok(chunk)
    }

    /// Append with the WAL lock held
    fn append_locked(
        &self,
        wal: &mut WriteAheadLog,
        chunk: &Chunk,
        mut event: Event,
    ) -> StorageResult<()> {
        chunk.check_writable()?;
        event.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        wal.append(&event)?;
        chunk.append(event)
    }

    /// Insert a single event, returning the id of the chunk it landed in
    pub fn insert(&self, event: Event) -> StorageResult<u32> {
        self.validate(&event)?;
        let ts = event.timestamp;

        let chunk_id = {
            let mut wal = self.lock_wal()?;
            let chunk = self.chunk_for(ts)?;
            self.append_locked(&mut wal, &chunk, event)?;
            chunk.id
        };

        self.notify(&[ts]);
        Ok(chunk_id)
    }

    /// Insert a batch according to the table's batch mode
    pub fn insert_batch(&self, events: Vec<Event>) -> StorageResult<BatchReport> {
        let total = events.len();
        let mut report = BatchReport {
            total,
            ..Default::default()
        };
        let mut inserted = Vec::with_capacity(total);

        {
            let mut wal = self.lock_wal()?;

            if self.config.batch_mode == BatchMode::AllOrNothing {
                let chunks = self.read_chunks()?;
                let mut failures: Vec<StorageError> = events
                    .iter()
                    .filter_map(|event| {
                        self.validate(event)
                            .and_then(|_| chunks.check_retention(event.timestamp))
                            .and_then(|_| match chunks.find(event.timestamp) {
                                Some(chunk) => chunk.check_writable(),
                                None => Ok(()),
                            })
                            .err()
                    })
                    .collect();
                if !failures.is_empty() {
                    let rejected = failures.len();
                    return Err(StorageError::BatchRejected {
                        rejected,
                        total,
                        first: Box::new(failures.swap_remove(0)),
                    });
                }
            }

            for (index, event) in events.into_iter().enumerate() {
                let ts = event.timestamp;
                let result = self
                    .validate(&event)
                    .and_then(|_| self.chunk_for(ts))
                    .and_then(|chunk| self.append_locked(&mut wal, &chunk, event));
                match result {
                    Ok(()) => {
                        report.inserted += 1;
                        inserted.push(ts);
                    }
                    Err(error) if error.is_rejection() => {
                        report.rejected.push(Rejection { index, error })
                    }
                    Err(error) => return Err(error),
                }
            }
        }

        if !report.rejected.is_empty() {
            tracing::debug!(
                table = %self.config.name,
                rejected = report.rejected.len(),
                total,
                "Batch had rejected events"
            );
        }
        self.notify(&inserted);
        Ok(report)
    }

    /// Load events from any source in batches
    pub fn bulk_load(&self, source: impl IntoIterator<Item = Event>) -> StorageResult<BatchReport> {
        let mut report = BatchReport::default();
        let mut batch = Vec::with_capacity(BULK_LOAD_BATCH);

        for event in source {
            batch.push(event);
            if batch.len() >= BULK_LOAD_BATCH {
                report.merge(self.insert_batch(std::mem::take(&mut batch))?);
            }
        }
        if !batch.is_empty() {
            report.merge(self.insert_batch(batch)?);
        }

        self.lock_wal()?.sync()?;
        tracing::info!(
            table = %self.config.name,
            inserted = report.inserted,
            rejected = report.rejected.len(),
            "Bulk load complete"
        );
        Ok(report)
    }

    /// Visit every row in the range matching the filter, chunk by chunk
    ///
    /// Rows within a raw chunk come in ingestion order, compressed chunks in
    /// segment order. Compressed segments are pruned with their sparse indexes.
    pub fn visit<F: FnMut(&Event)>(
        &self,
        range: &TimeRange,
        filter: &ScanFilter,
        mut f: F,
    ) -> StorageResult<()> {
        let chunks = self.read_chunks()?.overlapping(range);

        for chunk in chunks {
            match &*chunk.storage() {
                ChunkStorage::Raw(lock) => {
                    let raw = read_rows(lock)?;
                    raw.rows
                        .iter()
                        .filter(|e| range.contains(e.timestamp) && filter.matches(e))
                        .for_each(&mut f);
                }
                ChunkStorage::Compressed { image, .. } => {
                    let mut rows = Vec::new();
                    image.scan(range, filter, &mut rows)?;
                    rows.iter().for_each(&mut f);
                }
                ChunkStorage::Tiered { path, .. } => match self.config.tiered_reads {
                    TieredReads::Deny => {
                        return Err(StorageError::TieredUnavailable { chunk_id: chunk.id })
                    }
                    TieredReads::Fetch => {
                        tracing::debug!(chunk_id = chunk.id, "Fetching tiered chunk");
                        let (_, image) = ChunkFile::read(path)?;
                        let mut rows = Vec::new();
                        image.scan(range, filter, &mut rows)?;
                        rows.iter().for_each(&mut f);
                    }
                },
            }
        }
        Ok(())
    }

    /// Rows in the range matching the filter, sorted by time then ingestion
    pub fn scan(&self, range: &TimeRange, filter: &ScanFilter) -> StorageResult<Vec<Event>> {
        let mut rows = Vec::new();
        self.visit(range, filter, |e| rows.push(e.clone()))?;
        rows.sort_by_key(|e| (e.timestamp, e.seq));
        Ok(rows)
    }

    /// Close open chunks that ended at least `close_after` before `now`
    pub fn close_chunks(&self, now: i64) -> StorageResult<Vec<u32>> {
        let chunks = self.read_chunks()?;
        let closed = chunks.close(now, self.config.close_after);
        if !closed.is_empty() {
            self.save_catalog(&chunks)?;
            tracing::info!(table = %self.config.name, chunks = ?closed, "Closed chunks");
        }
        Ok(closed)
    }

    /// Closed chunks that ended at least `lag` before `now`
    pub fn compression_candidates(&self, now: i64, lag: i64) -> StorageResult<Vec<u32>> {
        let cutoff = now.saturating_sub(lag);
        Ok(self
            .read_chunks()?
            .all()
            .filter(|c| c.state() == ChunkState::Closed && c.range.end <= cutoff)
            .map(|c| c.id)
            .collect())
    }

    /// Rewrite a closed chunk into compressed column segments
    pub fn compress_chunk(&self, id: u32) -> StorageResult<CompressOutcome> {
        let chunk = self.get_chunk(id)?;
        let Some(_guard) = chunk.try_begin_compression() else {
            return Ok(CompressOutcome::AlreadyInProgress);
        };

        let path = self.chunks_dir().join(ChunkFile::file_name(id));

        for attempt in 1..=MAX_COMPRESS_ATTEMPTS {
            let storage = chunk.storage();
            let lock = match &*storage {
                ChunkStorage::Raw(lock) => lock,
                _ => return Ok(CompressOutcome::AlreadyCompressed),
            };
            let state = chunk.state();
            if state == ChunkState::Open {
                return Err(StorageError::InvalidState {
                    chunk_id: id,
                    state,
                    operation: "compress",
                });
            }

            let rows = read_rows(lock)?.rows.clone();
            let image = compress_rows(&rows, &self.config.layout)?;
            let file_bytes = ChunkFile::write(&path, id, chunk.range, &image)?;
            let summary = CompressedSummary::of(&image, file_bytes);

            #[cfg(test)]
            {
                let hook = self
                    .before_swap
                    .lock()
                    .map_err(|e| StorageError::Lock(e.to_string()))?;
                if let Some(hook) = hook.as_ref() {
                    hook(self, attempt);
                }
            }

            let mut wal = self.lock_wal()?;
            let swapped = {
                let mut raw = write_rows(lock)?;
                if raw.rows.len() == rows.len() {
                    raw.sealed = true;
                    chunk.swap_storage(ChunkStorage::Compressed { image, summary });
                    true
                } else {
                    false
                }
            };

            if swapped {
                let chunks = self.read_chunks()?;
                self.save_catalog(&chunks)?;
                Self::compact_wal(&mut wal, &chunks)?;

                tracing::info!(
                    table = %self.config.name,
                    chunk_id = id,
                    rows = summary.row_count,
                    segments = summary.segment_count,
                    ratio = %format_args!("{:.1}", summary.ratio()),
                    "Compressed chunk"
                );
                return Ok(CompressOutcome::Compressed(CompressionStats {
                    row_count: summary.row_count,
                    original_size: summary.uncompressed_bytes,
                    compressed_size: summary.compressed_bytes,
                    ratio: summary.ratio(),
                }));
            }

            tracing::debug!(chunk_id = id, attempt, "Rows arrived during compression, retrying");
        }

        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(chunk_id = id, "Failed to remove abandoned chunk file: {}", e);
        }
        Err(StorageError::Compression(format!(
            "chunk {} kept receiving rows during {} compression attempts",
            id, MAX_COMPRESS_ATTEMPTS
        )))
    }

    /// Restore a compressed chunk to row-oriented storage
    ///
    /// Returns the number of rows restored. The rows keep their timestamps, tags,
    /// fields and sequence numbers.
    pub fn decompress_chunk(&self, id: u32) -> StorageResult<u64> {
        let chunk = self.get_chunk(id)?;
        let Some(_guard) = chunk.try_begin_compression() else {
            return Err(StorageError::Lock(format!(
                "chunk {} is being compressed",
                id
            )));
        };

        let storage = chunk.storage();
        let image = match &*storage {
            ChunkStorage::Compressed { image, .. } => image,
            _ => {
                return Err(StorageError::InvalidState {
                    chunk_id: id,
                    state: chunk.state(),
                    operation: "decompress",
                })
            }
        };

        let mut rows = image.decompress_all()?;
        rows.sort_by_key(|e| e.seq);
        let count = rows.len() as u64;

        {
            let mut wal = self.lock_wal()?;
            wal.append_batch(&rows)?;
            wal.sync()?;
            chunk.mark_closed();
            chunk.swap_storage(ChunkStorage::raw(rows));
        }

        let path = self.chunks_dir().join(ChunkFile::file_name(id));
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(chunk_id = id, "Failed to remove chunk file {:?}: {}", path, e);
        }
        {
            let chunks = self.read_chunks()?;
            self.save_catalog(&chunks)?;
        }

        tracing::info!(table = %self.config.name, chunk_id = id, rows = count, "Decompressed chunk");
        Ok(count)
    }

    /// Move a compressed chunk's file to cold storage
    pub fn tier_chunk(&self, id: u32) -> StorageResult<TierOutcome> {
        let chunk = self.get_chunk(id)?;
        let Some(_guard) = chunk.try_begin_compression() else {
            return Err(StorageError::Lock(format!(
                "chunk {} is being compressed",
                id
            )));
        };

        let summary = match &*chunk.storage() {
            ChunkStorage::Tiered { .. } => return Ok(TierOutcome::AlreadyTiered),
            ChunkStorage::Compressed { summary, .. } => *summary,
            ChunkStorage::Raw(_) => {
                return Err(StorageError::InvalidState {
                    chunk_id: id,
                    state: chunk.state(),
                    operation: "tier",
                })
            }
        };

        let file_name = ChunkFile::file_name(id);
        let hot = self.chunks_dir().join(&file_name);
        let cold = self.cold_dir().join(&file_name);
        std::fs::create_dir_all(self.cold_dir())?;
        std::fs::rename(&hot, &cold)?;
        let bytes = std::fs::metadata(&cold)?.len();

        chunk.swap_storage(ChunkStorage::Tiered {
            path: cold,
            summary,
        });
        {
            let chunks = self.read_chunks()?;
            self.save_catalog(&chunks)?;
        }

        tracing::info!(table = %self.config.name, chunk_id = id, bytes, "Tiered chunk");
        Ok(TierOutcome::Tiered { bytes })
    }

    /// Drop every chunk whose range ended at or before `cutoff`
    pub fn drop_chunks_before(&self, cutoff: i64) -> StorageResult<Vec<u32>> {
        let mut wal = self.lock_wal()?;
        let mut chunks = self.write_chunks()?;

        let removed = chunks.remove_before(cutoff);
        if removed.is_empty() {
            return Ok(Vec::new());
        }

        let mut had_raw = false;
        for chunk in &removed {
            let path = match &*chunk.storage() {
                ChunkStorage::Raw(_) => {
                    had_raw = true;
                    continue;
                }
                ChunkStorage::Compressed { .. } => {
                    self.chunks_dir().join(ChunkFile::file_name(chunk.id))
                }
                ChunkStorage::Tiered { path, .. } => path.clone(),
            };
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(chunk_id = chunk.id, "Failed to remove {:?}: {}", path, e);
            }
        }

        self.save_catalog(&chunks)?;
        if had_raw {
            Self::compact_wal(&mut wal, &chunks)?;
        }

        let ids: Vec<u32> = removed.iter().map(|c| c.id).collect();
        tracing::info!(table = %self.config.name, chunks = ?ids, "Dropped chunks by retention");
        Ok(ids)
    }

    /// Introspect every chunk in time order
    pub fn chunks(&self) -> StorageResult<Vec<ChunkInfo>> {
        Ok(self.read_chunks()?.all().map(|c| c.info()).collect())
    }

    /// Span from the first chunk's start to the last chunk's end
    pub fn extent(&self) -> StorageResult<Option<TimeRange>> {
        let chunks = self.read_chunks()?;
        let mut all = chunks.all();
        let Some(first) = all.next() else {
            return Ok(None);
        };
        let end = all.last().map_or(first.range.end, |c| c.range.end);
        Ok(Some(TimeRange {
            start: first.range.start,
            end,
        }))
    }

    pub fn retention_floor(&self) -> StorageResult<Option<i64>> {
        Ok(self.read_chunks()?.retention_floor())
    }

    pub fn chunk_state(&self, id: u32) -> StorageResult<ChunkState> {
        Ok(self.get_chunk(id)?.state())
    }

    /// Introspect the segments of a compressed or tiered chunk
    pub fn segments(&self, id: u32) -> StorageResult<Vec<SegmentInfo>> {
        let chunk = self.get_chunk(id)?;
        let storage = chunk.storage();
        match &*storage {
            ChunkStorage::Compressed { image, .. } => Ok(SegmentInfo::list(image)),
            ChunkStorage::Tiered { path, .. } => {
                let (_, image) = ChunkFile::read(path)?;
                Ok(SegmentInfo::list(&image))
            }
            ChunkStorage::Raw(_) => Err(StorageError::InvalidState {
                chunk_id: id,
                state: chunk.state(),
                operation: "list segments of",
            }),
        }
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageResult<TableStats> {
        let (infos, retention_floor) = {
            let chunks = self.read_chunks()?;
            (
                chunks.all().map(|c| c.info()).collect::<Vec<_>>(),
                chunks.retention_floor(),
            )
        };
        let (wal_entries, wal_size_bytes) = {
            let wal = self.lock_wal()?;
            (wal.entry_count(), wal.file_size()?)
        };

        let mut stats = TableStats {
            chunk_count: infos.len(),
            wal_entries,
            wal_size_bytes,
            retention_floor,
            ..Default::default()
        };
        for info in infos {
            match info.state {
                ChunkState::Open => stats.open_chunks += 1,
                ChunkState::Closed => stats.closed_chunks += 1,
                ChunkState::Compressed => stats.compressed_chunks += 1,
                ChunkState::Tiered => stats.tiered_chunks += 1,
            }
            stats.row_count += info.row_count;
            stats.uncompressed_bytes += info.uncompressed_bytes;
            stats.compressed_bytes += info.compressed_bytes;
        }
        Ok(stats)
    }

    /// Force the WAL to disk
    pub fn sync(&self) -> StorageResult<()> {
        self.lock_wal()?.sync()
    }
}
