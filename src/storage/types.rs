//! Core data types for the hyperchunk storage layer
//!
//! This module defines the fundamental types used throughout the storage layer:
//! - `Event`: A single time-stamped row with tag and field columns
//! - `TimeRange`: A half-open time interval
//! - `ChunkState`: Lifecycle state of a chunk
//! - `OrderBy` and `ScanFilter`: Compression ordering and scan predicates

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the implicit time column in order-by specifications
pub const TIME_COLUMN: &str = "time";

/// A single time-series event
///
/// Tags are string dimension columns (device id, status), fields are numeric
/// measurements. Missing tags and fields behave as NULL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Ingestion sequence, assigned by the hypertable on insert
    #[serde(default)]
    pub seq: u64,
    /// Dimension columns
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Measurement columns
    #[serde(default)]
    pub fields: BTreeMap<String, f64>,
}

impl Event {
    /// Create an event at the given timestamp with no columns
    pub fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            seq: 0,
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    /// Create an event stamped with the current time
    pub fn now() -> Self {
        Self::new(Utc::now().timestamp_millis())
    }

    /// Builder method: add a tag
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Builder method: add a measurement
    pub fn field(mut self, key: impl Into<String>, value: f64) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Builder method: set the ingestion sequence
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    /// Check if this event has a specific tag value
    pub fn has_tag(&self, key: &str, value: &str) -> bool {
        self.tags.get(key).map(|v| v == value).unwrap_or(false)
    }

    /// Value of a numeric column, `time` resolving to the timestamp
    pub fn numeric(&self, column: &str) -> Option<f64> {
        if column == TIME_COLUMN {
            Some(self.timestamp as f64)
        } else {
            self.fields.get(column).copied()
        }
    }

    /// Get estimated size in bytes (used for compression statistics)
    pub fn estimated_size(&self) -> usize {
        // Base: timestamp(8) + seq(8)
        let tag_size: usize = self
            .tags
            .iter()
            .map(|(k, v)| k.len() + v.len() + 16)
            .sum();
        let field_size: usize = self.fields.keys().map(|k| k.len() + 8 + 16).sum();
        16 + tag_size + field_size + 48
    }
}

/// Half-open millisecond interval `[start, end)`
///
/// Chunk ranges, bucket ranges and query ranges all use this type, so two
/// adjacent ranges never share a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    /// # Panics
    /// When the range would be empty
    pub fn new(start: i64, end: i64) -> Self {
        assert!(start < end, "empty time range [{}, {})", start, end);
        Self { start, end }
    }

    /// `None` for an empty range
    pub fn try_new(start: i64, end: i64) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// The whole representable timeline
    pub fn all() -> Self {
        Self {
            start: i64::MIN,
            end: i64::MAX,
        }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        (self.start..self.end).contains(&timestamp)
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        other.end > self.start && other.start < self.end
    }

    pub fn intersection(&self, other: &TimeRange) -> Option<Self> {
        Self::try_new(self.start.max(other.start), self.end.min(other.end))
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", format_millis(self.start), format_millis(self.end))
    }
}

/// Render a millisecond timestamp as RFC 3339, falling back to the raw number
pub fn format_millis(ts: i64) -> String {
    match ts {
        i64::MIN => "-inf".to_string(),
        i64::MAX => "+inf".to_string(),
        _ => chrono::DateTime::from_timestamp_millis(ts)
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
            .unwrap_or_else(|| ts.to_string()),
    }
}

/// Lifecycle state of a chunk
///
/// Transitions only move forward (OPEN → CLOSED → COMPRESSED → TIERED), with the
/// explicit decompress operation as the single way back to CLOSED.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    /// Accepting writes
    Open,
    /// Range is past the configured lag, rows still row-oriented
    Closed,
    /// Column-segmented and compressed
    Compressed,
    /// Compressed image moved to cold storage
    Tiered,
}

impl std::fmt::Display for ChunkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkState::Open => write!(f, "open"),
            ChunkState::Closed => write!(f, "closed"),
            ChunkState::Compressed => write!(f, "compressed"),
            ChunkState::Tiered => write!(f, "tiered"),
        }
    }
}

/// One order-by key used when laying out compressed segments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// `time` or a field name
    pub column: String,
    /// Sort descending instead of ascending
    #[serde(default)]
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }

    /// Default ordering: time descending, matching the usual "latest first" reads
    pub fn time_desc() -> Vec<OrderBy> {
        vec![Self::desc(TIME_COLUMN)]
    }
}

/// Predicate applied while scanning raw or compressed rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanFilter {
    /// Tag equality predicates (all must match)
    pub tags: BTreeMap<String, String>,
}

impl ScanFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &Event) -> bool {
        self.tags.iter().all(|(k, v)| event.has_tag(k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = Event::new(1000)
            .tag("equipment_id", "MOTOR_001")
            .field("temperature", 61.5);

        assert_eq!(event.timestamp, 1000);
        assert!(event.has_tag("equipment_id", "MOTOR_001"));
        assert!(!event.has_tag("equipment_id", "PUMP_001"));
        assert_eq!(event.numeric("temperature"), Some(61.5));
        assert_eq!(event.numeric("time"), Some(1000.0));
        assert_eq!(event.numeric("vibration"), None);
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::new(42).tag("status", "normal").field("vibration", 3.25).with_seq(7);
        let json = serde_json::to_string(&event).unwrap();
        let restored: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, restored);

        let bytes = bincode::serialize(&event).unwrap();
        let restored: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, restored);
    }

    #[test]
    fn test_chunk_ranges_are_half_open() {
        let day = TimeRange::new(0, 86_400_000);
        let next = TimeRange::new(86_400_000, 2 * 86_400_000);

        assert!(day.contains(0));
        assert!(day.contains(86_399_999));
        assert!(!day.contains(86_400_000));
        assert!(next.contains(86_400_000));
        assert!(!day.overlaps(&next));
        assert_eq!(day.intersection(&next), None);
    }

    #[test]
    fn test_query_range_clipped_to_chunk() {
        let chunk = TimeRange::new(3_600_000, 7_200_000);
        let query = TimeRange::new(5_000_000, 9_000_000);

        assert!(chunk.overlaps(&query));
        assert_eq!(chunk.intersection(&query), Some(TimeRange::new(5_000_000, 7_200_000)));
        assert_eq!(TimeRange::all().intersection(&chunk), Some(chunk));
        assert_eq!(TimeRange::try_new(10, 10), None);
    }

    #[test]
    fn test_chunk_state_order() {
        assert!(ChunkState::Open < ChunkState::Closed);
        assert!(ChunkState::Closed < ChunkState::Compressed);
        assert!(ChunkState::Compressed < ChunkState::Tiered);
        assert_eq!(ChunkState::Tiered.to_string(), "tiered");
    }

    #[test]
    fn test_scan_filter() {
        let event = Event::new(0).tag("equipment_id", "PUMP_002").tag("status", "warning");

        assert!(ScanFilter::new().matches(&event));
        assert!(ScanFilter::new().tag("status", "warning").matches(&event));
        assert!(!ScanFilter::new()
            .tag("status", "warning")
            .tag("equipment_id", "PUMP_001")
            .matches(&event));
    }
}
