//! Columnar segment compression
//!
//! A closed chunk is rewritten into segments, one per distinct segment-by key.
//!
//! Strategy per segment:
//! 1. Sort rows by the configured order-by keys, ties broken by ingestion sequence
//! 2. Delta-encode timestamps and sequences
//! 3. Store each field as its own column (missing values kept as `None`)
//! 4. Intern the remaining tag strings
//! 5. Serialize with bincode and LZ4 compress the result
//!
//! Each segment also carries its sparse indexes (time and field min/max bounds,
//! bloom filters on configured tag columns) so scans can skip it without
//! decompressing.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::sparse_index::{MinMaxIndex, SegmentBloomFilter};
use crate::storage::types::{Event, OrderBy, ScanFilter, TimeRange};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// How a chunk is laid out when compressed
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompressionLayout {
    /// Tags whose values define a segment
    pub segment_by: Vec<String>,
    /// Sort keys within a segment
    pub order_by: Vec<OrderBy>,
    /// Tags that get a bloom filter per segment
    pub bloom_columns: Vec<String>,
}

/// Intermediate format for one segment's columns
#[derive(Debug, Serialize, Deserialize)]
struct ColumnBlock {
    /// First row's timestamp
    base_timestamp: i64,
    /// Delta-encoded timestamps (differences from previous)
    timestamp_deltas: Vec<i64>,
    /// First row's sequence
    base_seq: u64,
    /// Delta-encoded sequences (may be negative under non-seq orderings)
    seq_deltas: Vec<i64>,
    /// One column per field name present in the segment
    fields: Vec<(String, Vec<Option<f64>>)>,
    /// Tags not covered by the segment key
    tags: EncodedTags,
}

/// Space-efficient tag storage with string deduplication
#[derive(Debug, Default, Serialize, Deserialize)]
struct EncodedTags {
    /// String intern table
    strings: Vec<String>,
    /// For each row: Vec of (key_idx, value_idx) pairs
    row_tags: Vec<Vec<(u32, u32)>>,
}

impl EncodedTags {
    fn intern(&mut self, lookup: &mut BTreeMap<String, u32>, s: &str) -> u32 {
        if let Some(&idx) = lookup.get(s) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(s.to_string());
        lookup.insert(s.to_string(), idx);
        idx
    }

    fn decode_row_tags(&self, row: usize) -> StorageResult<BTreeMap<String, String>> {
        let pairs = self.row_tags.get(row).ok_or_else(|| {
            StorageError::Corruption(format!("missing tag entry for row {}", row))
        })?;
        pairs
            .iter()
            .map(|&(k, v)| {
                let key = self.strings.get(k as usize);
                let value = self.strings.get(v as usize);
                match (key, value) {
                    (Some(key), Some(value)) => Ok((key.clone(), value.clone())),
                    _ => Err(StorageError::Corruption(format!(
                        "tag string index out of range in row {}",
                        row
                    ))),
                }
            })
            .collect()
    }
}

/// One compressed group of rows sharing a segment-by key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedSegment {
    /// Segment-by values, aligned with the layout's `segment_by`
    pub segment_key: Vec<Option<String>>,
    /// Number of rows in the segment
    pub row_count: u32,
    /// Bounds of the time column
    pub time_index: MinMaxIndex<i64>,
    /// Bounds of each numeric field
    pub field_indexes: BTreeMap<String, MinMaxIndex<f64>>,
    /// Membership filters for configured tag columns
    pub blooms: BTreeMap<String, SegmentBloomFilter>,
    /// Estimated row-oriented size of the segment
    pub uncompressed_bytes: u64,
    /// LZ4-compressed column block
    pub data: Vec<u8>,
}

impl CompressedSegment {
    /// Check whether the segment may hold rows matching the range and filter
    ///
    /// Never returns `false` for a segment that holds a matching row.
    pub fn may_match(&self, segment_by: &[String], range: &TimeRange, filter: &ScanFilter) -> bool {
        if !self.time_index.overlaps_range(range.start, range.end) {
            return false;
        }

        filter.tags.iter().all(|(key, value)| {
            if let Some(pos) = segment_by.iter().position(|s| s == key) {
                return self.segment_key.get(pos).and_then(|v| v.as_deref()) == Some(value);
            }
            match self.blooms.get(key) {
                Some(bloom) => bloom.might_contain(value),
                None => true,
            }
        })
    }

    /// Decompress the segment back into rows, in stored order
    pub fn decode(&self, segment_by: &[String]) -> StorageResult<Vec<Event>> {
        let decompressed = lz4_flex::decompress_size_prepended(&self.data)
            .map_err(|e| StorageError::Compression(format!("LZ4 decompression failed: {}", e)))?;
        let block: ColumnBlock = bincode::deserialize(&decompressed)?;

        let rows = block.timestamp_deltas.len();
        if block.seq_deltas.len() != rows || rows != self.row_count as usize {
            return Err(StorageError::Corruption(format!(
                "segment column lengths disagree: {} timestamps, {} sequences, {} rows",
                rows,
                block.seq_deltas.len(),
                self.row_count
            )));
        }
        for (name, values) in &block.fields {
            if values.len() != rows {
                return Err(StorageError::Corruption(format!(
                    "field column {} has {} values for {} rows",
                    name,
                    values.len(),
                    rows
                )));
            }
        }

        let mut events = Vec::with_capacity(rows);
        let mut timestamp = block.base_timestamp;
        let mut seq = block.base_seq as i64;

        for i in 0..rows {
            timestamp += block.timestamp_deltas[i];
            seq = seq.wrapping_add(block.seq_deltas[i]);

            let mut tags = block.tags.decode_row_tags(i)?;
            for (name, value) in segment_by.iter().zip(&self.segment_key) {
                if let Some(value) = value {
                    tags.insert(name.clone(), value.clone());
                }
            }

            let fields = block
                .fields
                .iter()
                .filter_map(|(name, values)| values[i].map(|v| (name.clone(), v)))
                .collect();

            events.push(Event {
                timestamp,
                seq: seq as u64,
                tags,
                fields,
            });
        }

        Ok(events)
    }
}

/// The compressed image of a whole chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedChunk {
    /// Layout the segments were built with
    pub layout: CompressionLayout,
    /// Segments sorted by segment key
    pub segments: Vec<CompressedSegment>,
}

impl CompressedChunk {
    /// Total rows across segments
    pub fn row_count(&self) -> u64 {
        self.segments.iter().map(|s| s.row_count as u64).sum()
    }

    /// Total compressed payload size
    pub fn compressed_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.data.len() as u64).sum()
    }

    /// Estimated row-oriented size before compression
    pub fn uncompressed_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.uncompressed_bytes).sum()
    }

    /// Append rows matching the range and filter, skipping pruned segments
    ///
    /// Returns the number of segments actually decompressed.
    pub fn scan(
        &self,
        range: &TimeRange,
        filter: &ScanFilter,
        out: &mut Vec<Event>,
    ) -> StorageResult<usize> {
        let mut decoded = 0;
        for segment in &self.segments {
            if !segment.may_match(&self.layout.segment_by, range, filter) {
                continue;
            }
            decoded += 1;
            out.extend(
                segment
                    .decode(&self.layout.segment_by)?
                    .into_iter()
                    .filter(|e| range.contains(e.timestamp) && filter.matches(e)),
            );
        }
        Ok(decoded)
    }

    /// Decompress every segment
    pub fn decompress_all(&self) -> StorageResult<Vec<Event>> {
        let mut rows = Vec::with_capacity(self.row_count() as usize);
        for segment in &self.segments {
            rows.extend(segment.decode(&self.layout.segment_by)?);
        }
        Ok(rows)
    }
}

/// Compare two optional numeric values, `None` sorting first
fn cmp_nullable(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.total_cmp(&b),
    }
}

/// Order rows by the layout's keys, then by ingestion sequence
fn compare_rows(a: &Event, b: &Event, order_by: &[OrderBy]) -> Ordering {
    for key in order_by {
        let ord = cmp_nullable(a.numeric(&key.column), b.numeric(&key.column));
        let ord = if key.descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.seq.cmp(&b.seq)
}

/// Compress one segment's rows (already grouped by segment key)
fn compress_segment(
    segment_key: Vec<Option<String>>,
    mut rows: Vec<&Event>,
    layout: &CompressionLayout,
) -> StorageResult<CompressedSegment> {
    rows.sort_by(|a, b| compare_rows(a, b, &layout.order_by));

    // Delta encode timestamps and sequences
    let base_timestamp = rows[0].timestamp;
    let base_seq = rows[0].seq;
    let mut timestamp_deltas = Vec::with_capacity(rows.len());
    let mut seq_deltas = Vec::with_capacity(rows.len());
    let mut prev_ts = base_timestamp;
    let mut prev_seq = base_seq as i64;
    for row in &rows {
        timestamp_deltas.push(row.timestamp - prev_ts);
        seq_deltas.push((row.seq as i64).wrapping_sub(prev_seq));
        prev_ts = row.timestamp;
        prev_seq = row.seq as i64;
    }

    // One column per field seen in the segment
    let field_names: BTreeSet<&String> = rows.iter().flat_map(|r| r.fields.keys()).collect();
    let fields: Vec<(String, Vec<Option<f64>>)> = field_names
        .into_iter()
        .map(|name| {
            let values = rows.iter().map(|r| r.fields.get(name).copied()).collect();
            (name.clone(), values)
        })
        .collect();

    // Remaining tags, interned
    let mut tags = EncodedTags::default();
    let mut lookup = BTreeMap::new();
    for row in &rows {
        let mut encoded = Vec::with_capacity(row.tags.len());
        for (k, v) in &row.tags {
            if layout.segment_by.contains(k) {
                continue;
            }
            let k_idx = tags.intern(&mut lookup, k);
            let v_idx = tags.intern(&mut lookup, v);
            encoded.push((k_idx, v_idx));
        }
        tags.row_tags.push(encoded);
    }

    // Sparse indexes
    let time_index = MinMaxIndex::from_values(rows.iter().map(|r| r.timestamp))
        .ok_or_else(|| StorageError::Compression("empty segment".into()))?;
    let field_indexes = fields
        .iter()
        .filter_map(|(name, values)| {
            MinMaxIndex::from_values(values.iter().flatten().copied().filter(|v| !v.is_nan()))
                .map(|index| (name.clone(), index))
        })
        .collect();
    let blooms = layout
        .bloom_columns
        .iter()
        .map(|column| {
            let distinct: BTreeSet<&str> = rows
                .iter()
                .filter_map(|r| r.tags.get(column).map(String::as_str))
                .collect();
            let mut bloom = SegmentBloomFilter::new(distinct.len());
            for value in distinct {
                bloom.add(value);
            }
            (column.clone(), bloom)
        })
        .collect();

    let uncompressed_bytes = rows.iter().map(|r| r.estimated_size() as u64).sum();
    let row_count = rows.len() as u32;

    let block = ColumnBlock {
        base_timestamp,
        timestamp_deltas,
        base_seq,
        seq_deltas,
        fields,
        tags,
    };
    let serialized = bincode::serialize(&block)?;
    let data = lz4_flex::compress_prepend_size(&serialized);

    Ok(CompressedSegment {
        segment_key,
        row_count,
        time_index,
        field_indexes,
        blooms,
        uncompressed_bytes,
        data,
    })
}

/// Compress a chunk's rows into column segments
///
/// Rows are grouped by segment key; segments come out sorted by that key.
pub fn compress_rows(rows: &[Event], layout: &CompressionLayout) -> StorageResult<CompressedChunk> {
    let mut groups: BTreeMap<Vec<Option<String>>, Vec<&Event>> = BTreeMap::new();
    for row in rows {
        let key = layout
            .segment_by
            .iter()
            .map(|name| row.tags.get(name).cloned())
            .collect();
        groups.entry(key).or_default().push(row);
    }

    let segments = groups
        .into_iter()
        .map(|(key, group)| compress_segment(key, group, layout))
        .collect::<StorageResult<Vec<_>>>()?;

    Ok(CompressedChunk {
        layout: layout.clone(),
        segments,
    })
}

/// Compression statistics for a chunk
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressionStats {
    /// Number of rows
    pub row_count: u64,
    /// Original size estimate (bytes)
    pub original_size: u64,
    /// Compressed size (bytes)
    pub compressed_size: u64,
    /// Compression ratio (original / compressed)
    pub ratio: f64,
}

impl CompressionStats {
    pub fn of(chunk: &CompressedChunk) -> Self {
        let original_size = chunk.uncompressed_bytes();
        let compressed_size = chunk.compressed_bytes();
        let ratio = if compressed_size > 0 {
            original_size as f64 / compressed_size as f64
        } else {
            0.0
        };
        Self {
            row_count: chunk.row_count(),
            original_size,
            compressed_size,
            ratio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> CompressionLayout {
        CompressionLayout {
            segment_by: vec!["equipment_id".into()],
            order_by: OrderBy::time_desc(),
            bloom_columns: vec!["status".into()],
        }
    }

    fn readings(equipment: &[&str], count: i64) -> Vec<Event> {
        let mut seq = 0;
        let mut rows = Vec::new();
        for i in 0..count {
            for eq in equipment {
                seq += 1;
                let status = if i % 10 == 0 { "warning" } else { "normal" };
                rows.push(
                    Event::new(1_700_000_000_000 + i * 120_000)
                        .with_seq(seq)
                        .tag("equipment_id", *eq)
                        .tag("status", status)
                        .field("temperature", 55.0 + (i as f64 * 0.1).sin() * 4.0)
                        .field("vibration", 6.0 + (i % 7) as f64 * 0.25),
                );
            }
        }
        rows
    }

    fn sorted(mut rows: Vec<Event>) -> Vec<Event> {
        rows.sort_by_key(|e| (e.timestamp, e.seq));
        rows
    }

    #[test]
    fn test_compress_roundtrip_is_lossless() {
        let rows = readings(&["MOTOR_001", "PUMP_001", "CONV_001"], 200);
        let chunk = compress_rows(&rows, &layout()).unwrap();

        assert_eq!(chunk.segments.len(), 3);
        assert_eq!(chunk.row_count(), 600);

        let restored = chunk.decompress_all().unwrap();
        assert_eq!(sorted(restored), sorted(rows));
    }

    #[test]
    fn test_segments_follow_order_by() {
        let rows = readings(&["MOTOR_001"], 50);
        let chunk = compress_rows(&rows, &layout()).unwrap();
        let decoded = chunk.segments[0].decode(&chunk.layout.segment_by).unwrap();

        // time DESC
        assert!(decoded.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }

    #[test]
    fn test_ties_keep_ingestion_order() {
        let rows: Vec<Event> = (0..5)
            .map(|i| Event::new(1000).with_seq(10 - i).field("temperature", i as f64))
            .collect();
        let layout = CompressionLayout {
            order_by: vec![OrderBy::asc("time")],
            ..Default::default()
        };
        let chunk = compress_rows(&rows, &layout).unwrap();
        let decoded = chunk.decompress_all().unwrap();
        let seqs: Vec<u64> = decoded.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_missing_fields_and_tags_survive() {
        let rows = vec![
            Event::new(1000).with_seq(1).field("temperature", 50.0),
            Event::new(2000).with_seq(2).tag("status", "critical"),
            Event::new(3000).with_seq(3),
        ];
        let chunk = compress_rows(&rows, &layout()).unwrap();
        assert_eq!(chunk.segments.len(), 1);
        assert_eq!(chunk.segments[0].segment_key, vec![None]);

        assert_eq!(sorted(chunk.decompress_all().unwrap()), rows);
    }

    #[test]
    fn test_sparse_indexes_bound_every_row() {
        let rows = readings(&["MOTOR_001", "PUMP_002"], 100);
        let chunk = compress_rows(&rows, &layout()).unwrap();

        for segment in &chunk.segments {
            for row in segment.decode(&chunk.layout.segment_by).unwrap() {
                assert!(segment.time_index.contains(row.timestamp));
                for (name, value) in &row.fields {
                    assert!(segment.field_indexes[name].contains(*value));
                }
                assert!(segment.blooms["status"].might_contain(&row.tags["status"]));
            }
        }
    }

    #[test]
    fn test_scan_prunes_segments() {
        let rows = readings(&["MOTOR_001", "PUMP_001", "CONV_001"], 20);
        let chunk = compress_rows(&rows, &layout()).unwrap();

        let mut out = Vec::new();
        let filter = ScanFilter::new().tag("equipment_id", "PUMP_001");
        let decoded = chunk.scan(&TimeRange::all(), &filter, &mut out).unwrap();

        assert_eq!(decoded, 1);
        assert_eq!(out.len(), 20);
        assert!(out.iter().all(|e| e.has_tag("equipment_id", "PUMP_001")));

        // Time pruning: a range before every row decodes nothing
        let mut out = Vec::new();
        let decoded = chunk
            .scan(&TimeRange::new(0, 1000), &ScanFilter::new(), &mut out)
            .unwrap();
        assert_eq!(decoded, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_compression_ratio() {
        let rows = readings(&["MOTOR_001", "MOTOR_002"], 720);
        let chunk = compress_rows(&rows, &layout()).unwrap();
        let stats = CompressionStats::of(&chunk);

        assert_eq!(stats.row_count, 1440);
        assert!(stats.ratio > 3.0, "Compression ratio too low: {}", stats.ratio);
    }
}
