//! Chunks and the chunk manager
//!
//! A hypertable's timeline is partitioned into half-open, non-overlapping chunks.
//! Each chunk owns an atomically swappable storage pointer, so a compression or
//! decompression replaces the whole representation at once and readers see
//! either the old image or the new one.
//!
//! Chunk metadata is persisted in `meta/chunks.json`. Row data lives in the WAL
//! for row-oriented chunks and in `chunks/chunk_NNNNNN.chk` once compressed.

use crate::storage::compression::{CompressedChunk, CompressionStats};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{ChunkState, Event, TimeRange};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Row-oriented contents of a chunk
#[derive(Debug, Default)]
pub struct RawRows {
    pub rows: Vec<Event>,
    /// Set when the buffer has been replaced by a compressed image
    pub sealed: bool,
}

/// Size figures of a compressed chunk, kept even after tiering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompressedSummary {
    pub row_count: u64,
    pub uncompressed_bytes: u64,
    pub compressed_bytes: u64,
    pub segment_count: u32,
}

impl CompressedSummary {
    pub fn of(image: &CompressedChunk, file_bytes: u64) -> Self {
        Self {
            row_count: image.row_count(),
            uncompressed_bytes: image.uncompressed_bytes(),
            compressed_bytes: file_bytes,
            segment_count: image.segments.len() as u32,
        }
    }

    pub fn ratio(&self) -> f64 {
        if self.compressed_bytes == 0 {
            0.0
        } else {
            self.uncompressed_bytes as f64 / self.compressed_bytes as f64
        }
    }
}

/// Physical representation of a chunk
pub enum ChunkStorage {
    Raw(RwLock<RawRows>),
    Compressed {
        image: CompressedChunk,
        summary: CompressedSummary,
    },
    Tiered {
        path: PathBuf,
        summary: CompressedSummary,
    },
}

impl ChunkStorage {
    pub fn raw(rows: Vec<Event>) -> Self {
        ChunkStorage::Raw(RwLock::new(RawRows {
            rows,
            sealed: false,
        }))
    }
}

/// Marks a chunk as being compressed; released on drop
pub struct CompressionGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for CompressionGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// One time-bounded partition of a hypertable
pub struct Chunk {
    pub id: u32,
    pub range: TimeRange,
    closed: AtomicBool,
    compressing: AtomicBool,
    storage: ArcSwap<ChunkStorage>,
}

impl Chunk {
    pub fn new(id: u32, range: TimeRange) -> Self {
        Self::with_storage(id, range, false, ChunkStorage::raw(Vec::new()))
    }

    pub fn with_storage(id: u32, range: TimeRange, closed: bool, storage: ChunkStorage) -> Self {
        Self {
            id,
            range,
            closed: AtomicBool::new(closed),
            compressing: AtomicBool::new(false),
            storage: ArcSwap::from_pointee(storage),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ChunkState {
        match &**self.storage.load() {
            ChunkStorage::Raw(_) if self.closed.load(Ordering::Acquire) => ChunkState::Closed,
            ChunkStorage::Raw(_) => ChunkState::Open,
            ChunkStorage::Compressed { .. } => ChunkState::Compressed,
            ChunkStorage::Tiered { .. } => ChunkState::Tiered,
        }
    }

    /// Snapshot of the storage pointer
    pub fn storage(&self) -> Arc<ChunkStorage> {
        self.storage.load_full()
    }

    pub(crate) fn swap_storage(&self, storage: ChunkStorage) {
        self.storage.store(Arc::new(storage));
    }

    /// Mark the chunk closed; returns false if it was not open
    pub fn close(&self) -> bool {
        self.state() == ChunkState::Open && !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Claim the exclusive compression marker
    pub fn try_begin_compression(&self) -> Option<CompressionGuard<'_>> {
        self.compressing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CompressionGuard {
                flag: &self.compressing,
            })
    }

    pub fn is_compressing(&self) -> bool {
        self.compressing.load(Ordering::Acquire)
    }

    /// Append a row; fails if the chunk is no longer row-oriented
    pub fn append(&self, event: Event) -> StorageResult<()> {
        let storage = self.storage();
        match &*storage {
            ChunkStorage::Raw(lock) => {
                let mut raw = write_rows(lock)?;
                if raw.sealed {
                    // Swapped out while we waited for the lock
                    return Err(StorageError::ChunkImmutable {
                        chunk_id: self.id,
                        state: self.state(),
                    });
                }
                raw.rows.push(event);
                Ok(())
            }
            _ => Err(StorageError::ChunkImmutable {
                chunk_id: self.id,
                state: self.state(),
            }),
        }
    }

    /// Check that a write would currently be accepted
    pub fn check_writable(&self) -> StorageResult<()> {
        match self.state() {
            ChunkState::Open | ChunkState::Closed => Ok(()),
            state => Err(StorageError::ChunkImmutable {
                chunk_id: self.id,
                state,
            }),
        }
    }

    /// Row count, uncompressed size and compressed size
    pub fn info(&self) -> ChunkInfo {
        let state = self.state();
        let (row_count, uncompressed_bytes, compressed_bytes) = match &*self.storage() {
            ChunkStorage::Raw(lock) => match lock.read() {
                Ok(raw) => (
                    raw.rows.len() as u64,
                    raw.rows.iter().map(|e| e.estimated_size() as u64).sum(),
                    0,
                ),
                Err(_) => (0, 0, 0),
            },
            ChunkStorage::Compressed { summary, .. } | ChunkStorage::Tiered { summary, .. } => (
                summary.row_count,
                summary.uncompressed_bytes,
                summary.compressed_bytes,
            ),
        };
        ChunkInfo {
            id: self.id,
            range: self.range,
            state,
            row_count,
            uncompressed_bytes,
            compressed_bytes,
        }
    }
}

pub(crate) fn read_rows(lock: &RwLock<RawRows>) -> StorageResult<RwLockReadGuard<'_, RawRows>> {
    lock.read()
        .map_err(|e| StorageError::Lock(format!("Failed to acquire chunk read lock: {}", e)))
}

pub(crate) fn write_rows(lock: &RwLock<RawRows>) -> StorageResult<RwLockWriteGuard<'_, RawRows>> {
    lock.write()
        .map_err(|e| StorageError::Lock(format!("Failed to acquire chunk write lock: {}", e)))
}

/// Introspection record for one chunk
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkInfo {
    pub id: u32,
    pub range: TimeRange,
    pub state: ChunkState,
    pub row_count: u64,
    pub uncompressed_bytes: u64,
    pub compressed_bytes: u64,
}

/// Introspection record for one segment of a compressed chunk
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentInfo {
    pub segment_key: Vec<(String, Option<String>)>,
    pub row_count: u32,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub compressed_bytes: u64,
    pub bloom_columns: Vec<String>,
}

impl SegmentInfo {
    pub fn list(image: &CompressedChunk) -> Vec<SegmentInfo> {
        image
            .segments
            .iter()
            .map(|s| SegmentInfo {
                segment_key: image
                    .layout
                    .segment_by
                    .iter()
                    .cloned()
                    .zip(s.segment_key.iter().cloned())
                    .collect(),
                row_count: s.row_count,
                min_timestamp: s.time_index.min,
                max_timestamp: s.time_index.max,
                compressed_bytes: s.data.len() as u64,
                bloom_columns: s.blooms.keys().cloned().collect(),
            })
            .collect()
    }
}

/// Outcome of a compression request
#[derive(Debug, Clone, PartialEq)]
pub enum CompressOutcome {
    Compressed(CompressionStats),
    AlreadyCompressed,
    AlreadyInProgress,
}

impl std::fmt::Display for CompressOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompressOutcome::Compressed(stats) => write!(
                f,
                "compressed {} rows ({} -> {} bytes, {:.1}x)",
                stats.row_count, stats.original_size, stats.compressed_size, stats.ratio
            ),
            CompressOutcome::AlreadyCompressed => write!(f, "already compressed"),
            CompressOutcome::AlreadyInProgress => write!(f, "compression already in progress"),
        }
    }
}

/// Persisted form of one chunk's metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: u32,
    pub range: TimeRange,
    pub state: ChunkState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<CompressedSummary>,
}

/// Persisted chunk catalog
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkCatalog {
    pub next_id: u32,
    #[serde(default)]
    pub next_seq: u64,
    /// End of the newest chunk dropped by retention
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_floor: Option<i64>,
    pub chunks: Vec<ChunkRecord>,
}

impl ChunkCatalog {
    /// Load from JSON file
    pub fn load(path: &Path) -> StorageResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save to JSON file
    pub fn save(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Partitions the timeline into chunks and assigns events to them
pub struct ChunkManager {
    /// Chunks keyed by range start
    chunks: BTreeMap<i64, Arc<Chunk>>,
    width: i64,
    next_id: u32,
    retention_floor: Option<i64>,
}

impl ChunkManager {
    pub fn new(width: i64) -> Self {
        Self {
            chunks: BTreeMap::new(),
            width: width.max(1),
            next_id: 1,
            retention_floor: None,
        }
    }

    /// Rebuild from a catalog and already-loaded chunks
    pub fn restore(width: i64, catalog: &ChunkCatalog, chunks: Vec<Arc<Chunk>>) -> Self {
        let mut manager = Self::new(width);
        manager.next_id = catalog.next_id.max(1);
        manager.retention_floor = catalog.retention_floor;
        for chunk in chunks {
            manager.next_id = manager.next_id.max(chunk.id + 1);
            manager.chunks.insert(chunk.range.start, chunk);
        }
        manager
    }

    pub fn width(&self) -> i64 {
        self.width
    }

    pub fn retention_floor(&self) -> Option<i64> {
        self.retention_floor
    }

    /// Reject timestamps below the retention floor
    pub fn check_retention(&self, ts: i64) -> StorageResult<()> {
        match self.retention_floor {
            Some(floor) if ts < floor => Err(StorageError::OutOfRetention {
                timestamp: ts,
                floor,
            }),
            _ => Ok(()),
        }
    }

    /// Chunk covering `ts`, if any
    pub fn find(&self, ts: i64) -> Option<&Arc<Chunk>> {
        self.chunks
            .range(..=ts)
            .next_back()
            .map(|(_, c)| c)
            .filter(|c| c.range.contains(ts))
    }

    /// Range a new chunk for `ts` would get: aligned to the width, clipped to
    /// its neighbours
    fn range_for(&self, ts: i64) -> TimeRange {
        let mut start = ts.div_euclid(self.width).saturating_mul(self.width);
        let mut end = start.saturating_add(self.width);

        if let Some((_, prev)) = self.chunks.range(..=ts).next_back() {
            start = start.max(prev.range.end);
        }
        if let Some((_, next)) = self.chunks.range(ts.saturating_add(1)..).next() {
            end = end.min(next.range.start);
        }
        if end <= ts {
            // ts == i64::MAX
            end = i64::MAX;
            start = start.min(ts);
        }
        TimeRange { start, end }
    }

    /// Chunk for `ts`, creating an open one when none covers it
    ///
    /// The boolean is true when a chunk was created.
    pub fn assign(&mut self, ts: i64) -> StorageResult<(Arc<Chunk>, bool)> {
        self.check_retention(ts)?;
        if let Some(chunk) = self.find(ts) {
            return Ok((Arc::clone(chunk), false));
        }

        let range = self.range_for(ts);
        let chunk = Arc::new(Chunk::new(self.next_id, range));
        self.next_id += 1;
        self.chunks.insert(range.start, Arc::clone(&chunk));
        tracing::debug!(chunk_id = chunk.id, %range, "Created chunk");
        Ok((chunk, true))
    }

    pub fn get(&self, id: u32) -> Option<&Arc<Chunk>> {
        self.chunks.values().find(|c| c.id == id)
    }

    /// Chunks overlapping a range, in time order
    pub fn overlapping(&self, range: &TimeRange) -> Vec<Arc<Chunk>> {
        let first = self
            .chunks
            .range(..=range.start)
            .next_back()
            .map(|(start, _)| *start)
            .unwrap_or(i64::MIN);
        self.chunks
            .range(first..)
            .take_while(|(start, _)| **start < range.end)
            .filter(|(_, c)| c.range.overlaps(range))
            .map(|(_, c)| Arc::clone(c))
            .collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<Chunk>> {
        self.chunks.values()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Open chunks whose range ended at least `lag` before `now`
    pub fn close_eligible(&self, now: i64, lag: i64) -> Vec<u32> {
        let cutoff = now.saturating_sub(lag);
        self.chunks
            .values()
            .filter(|c| c.state() == ChunkState::Open && c.range.end <= cutoff)
            .map(|c| c.id)
            .collect()
    }

    /// Close every eligible chunk, returning the ids closed
    pub fn close(&self, now: i64, lag: i64) -> Vec<u32> {
        self.close_eligible(now, lag)
            .into_iter()
            .filter(|id| self.get(*id).map(|c| c.close()).unwrap_or(false))
            .collect()
    }

    /// Remove chunks whose range ended at or before `cutoff`, raising the
    /// retention floor
    pub fn remove_before(&mut self, cutoff: i64) -> Vec<Arc<Chunk>> {
        let doomed: Vec<i64> = self
            .chunks
            .iter()
            .filter(|(_, c)| c.range.end <= cutoff)
            .map(|(start, _)| *start)
            .collect();

        let removed: Vec<Arc<Chunk>> = doomed
            .into_iter()
            .filter_map(|start| self.chunks.remove(&start))
            .collect();

        if let Some(newest_end) = removed.iter().map(|c| c.range.end).max() {
            self.retention_floor = Some(self.retention_floor.map_or(newest_end, |f| f.max(newest_end)));
        }
        removed
    }

    /// Catalog snapshot for persistence
    pub fn catalog(&self, next_seq: u64) -> ChunkCatalog {
        ChunkCatalog {
            next_id: self.next_id,
            next_seq,
            retention_floor: self.retention_floor,
            chunks: self
                .chunks
                .values()
                .map(|c| {
                    let summary = match &*c.storage() {
                        ChunkStorage::Compressed { summary, .. }
                        | ChunkStorage::Tiered { summary, .. } => Some(*summary),
                        ChunkStorage::Raw(_) => None,
                    };
                    ChunkRecord {
                        id: c.id,
                        range: c.range,
                        state: c.state(),
                        summary,
                    }
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 86_400_000;

    #[test]
    fn test_assign_is_deterministic_and_aligned() {
        let mut manager = ChunkManager::new(DAY);
        let (a, created) = manager.assign(DAY + 5).unwrap();
        assert!(created);
        assert_eq!(a.range, TimeRange::new(DAY, 2 * DAY));

        let (b, created) = manager.assign(2 * DAY - 1).unwrap();
        assert!(!created);
        assert_eq!(a.id, b.id);

        // Negative timestamps align downward
        let (c, _) = manager.assign(-1).unwrap();
        assert_eq!(c.range, TimeRange::new(-DAY, 0));
    }

    #[test]
    fn test_new_chunks_are_clipped_to_neighbours() {
        let mut manager = ChunkManager::new(DAY);
        manager.assign(DAY).unwrap();

        // A wider width after reopening must not overlap the existing chunk
        let catalog = manager.catalog(0);
        let chunks: Vec<Arc<Chunk>> = manager.all().cloned().collect();
        let mut widened = ChunkManager::restore(7 * DAY, &catalog, chunks);

        let (before, _) = widened.assign(0).unwrap();
        assert_eq!(before.range, TimeRange::new(0, DAY));
        let (after, _) = widened.assign(3 * DAY).unwrap();
        assert_eq!(after.range, TimeRange::new(2 * DAY, 7 * DAY));

        let mut ranges: Vec<TimeRange> = widened.all().map(|c| c.range).collect();
        ranges.sort_by_key(|r| r.start);
        for pair in ranges.windows(2) {
            assert!(pair[0].end <= pair[1].start);
        }
    }

    #[test]
    fn test_close_eligible_respects_lag() {
        let mut manager = ChunkManager::new(DAY);
        manager.assign(0).unwrap();
        manager.assign(DAY).unwrap();

        assert_eq!(manager.close_eligible(DAY, 0).len(), 1);
        assert!(manager.close_eligible(DAY, 1).is_empty());

        let closed = manager.close(2 * DAY, 0);
        assert_eq!(closed.len(), 2);
        assert!(manager.all().all(|c| c.state() == ChunkState::Closed));
        assert!(manager.close(3 * DAY, 0).is_empty());
    }

    #[test]
    fn test_retention_floor() {
        let mut manager = ChunkManager::new(DAY);
        for day in 0..5 {
            manager.assign(day * DAY).unwrap();
        }

        let removed = manager.remove_before(3 * DAY);
        assert_eq!(removed.len(), 3);
        assert_eq!(manager.retention_floor(), Some(3 * DAY));

        assert!(matches!(
            manager.assign(DAY),
            Err(StorageError::OutOfRetention { floor, .. }) if floor == 3 * DAY
        ));
        assert!(manager.assign(3 * DAY).is_ok());
    }

    #[test]
    fn test_compression_guard_is_exclusive() {
        let chunk = Chunk::new(1, TimeRange::new(0, DAY));
        let guard = chunk.try_begin_compression().unwrap();
        assert!(chunk.try_begin_compression().is_none());
        assert!(chunk.is_compressing());
        drop(guard);
        assert!(chunk.try_begin_compression().is_some());
    }

    #[test]
    fn test_sealed_buffer_rejects_append() {
        let chunk = Chunk::new(1, TimeRange::new(0, DAY));
        chunk.append(Event::new(10)).unwrap();

        if let ChunkStorage::Raw(lock) = &*chunk.storage() {
            lock.write().unwrap().sealed = true;
        }
        assert!(matches!(
            chunk.append(Event::new(20)),
            Err(StorageError::ChunkImmutable { chunk_id: 1, .. })
        ));
        assert_eq!(chunk.info().row_count, 1);
    }

    #[test]
    fn test_catalog_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta").join("chunks.json");

        let mut manager = ChunkManager::new(DAY);
        manager.assign(0).unwrap();
        manager.assign(DAY).unwrap();
        manager.close(DAY, 0);
        manager.catalog(42).save(&path).unwrap();

        let catalog = ChunkCatalog::load(&path).unwrap();
        assert_eq!(catalog.next_id, 3);
        assert_eq!(catalog.next_seq, 42);
        assert_eq!(catalog.chunks.len(), 2);
        assert_eq!(catalog.chunks[0].state, ChunkState::Closed);
        assert_eq!(catalog.chunks[1].state, ChunkState::Open);
    }
}
