//! Sparse per-segment indexes
//!
//! Compressed segments carry lightweight metadata so scans can skip them without
//! decompressing:
//!
//! - [`MinMaxIndex`]: bounds of a column, for range predicates
//! - [`SegmentBloomFilter`]: membership of a tag column, for equality predicates
//!
//! Both are sound: min/max bounds always contain every value of the column, and
//! a bloom filter may report false positives but never false negatives.

use bloomfilter::Bloom;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Default false positive rate (1%)
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Inclusive bounds of a column within one segment
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinMaxIndex<T> {
    pub min: T,
    pub max: T,
}

impl<T: PartialOrd + Copy> MinMaxIndex<T> {
    /// Build bounds from a column, `None` when the column has no values
    pub fn from_values(values: impl IntoIterator<Item = T>) -> Option<Self> {
        let mut iter = values.into_iter();
        let first = iter.next()?;
        let mut index = Self {
            min: first,
            max: first,
        };
        for value in iter {
            index.include(value);
        }
        Some(index)
    }

    /// Widen the bounds to include a value
    pub fn include(&mut self, value: T) {
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }

    /// Check if a value lies within the bounds
    pub fn contains(&self, value: T) -> bool {
        value >= self.min && value <= self.max
    }
}

impl MinMaxIndex<i64> {
    /// Check if any indexed timestamp can fall inside `[start, end)`
    pub fn overlaps_range(&self, start: i64, end: i64) -> bool {
        self.min < end && self.max >= start
    }
}

/// Bloom filter over the values of one tag column in a segment
pub struct SegmentBloomFilter {
    bloom: Bloom<[u8]>,
    item_count: usize,
}

impl SegmentBloomFilter {
    /// Create a bloom filter sized for the expected number of items
    pub fn new(expected_items: usize) -> Self {
        Self::with_rate(expected_items, DEFAULT_FALSE_POSITIVE_RATE)
    }

    fn with_rate(expected_items: usize, false_positive_rate: f64) -> Self {
        Self {
            bloom: Bloom::new_for_fp_rate(expected_items.max(1), false_positive_rate),
            item_count: 0,
        }
    }

    /// Add a key to the filter
    pub fn add(&mut self, key: &str) {
        self.bloom.set(key.as_bytes());
        self.item_count += 1;
    }

    /// Returns `false` only if the key is definitely absent
    pub fn might_contain(&self, key: &str) -> bool {
        self.bloom.check(key.as_bytes())
    }

    /// Number of keys added
    pub fn item_count(&self) -> usize {
        self.item_count
    }

    /// Size of the bitmap in bytes
    pub fn size_bytes(&self) -> usize {
        (self.bloom.number_of_bits() as usize + 7) / 8
    }

    fn to_parts(&self) -> BloomParts {
        let sip_keys = self.bloom.sip_keys();
        BloomParts {
            bitmap: self.bloom.bitmap(),
            num_bits: self.bloom.number_of_bits(),
            num_hashes: self.bloom.number_of_hash_functions(),
            sip_keys: [sip_keys[0], sip_keys[1]],
            item_count: self.item_count,
        }
    }

    fn from_parts(parts: BloomParts) -> Self {
        Self {
            bloom: Bloom::from_existing(
                &parts.bitmap,
                parts.num_bits,
                parts.num_hashes,
                parts.sip_keys,
            ),
            item_count: parts.item_count,
        }
    }
}

/// Serialized form of a bloom filter, including its hash keys
#[derive(Serialize, Deserialize)]
struct BloomParts {
    bitmap: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
    sip_keys: [(u64, u64); 2],
    item_count: usize,
}

impl Serialize for SegmentBloomFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_parts().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SegmentBloomFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        BloomParts::deserialize(deserializer).map(Self::from_parts)
    }
}

impl Clone for SegmentBloomFilter {
    fn clone(&self) -> Self {
        Self::from_parts(self.to_parts())
    }
}

impl std::fmt::Debug for SegmentBloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentBloomFilter")
            .field("item_count", &self.item_count)
            .field("size_bytes", &self.size_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_max_bounds() {
        let index = MinMaxIndex::from_values([3.5, -1.0, 7.25, 0.0]).unwrap();
        assert_eq!(index.min, -1.0);
        assert_eq!(index.max, 7.25);
        assert!(index.contains(0.0));
        assert!(!index.contains(7.5));

        assert!(MinMaxIndex::<f64>::from_values(Vec::new()).is_none());
    }

    #[test]
    fn test_time_bounds_overlap() {
        let index = MinMaxIndex::from_values([1000i64, 1500, 1999]).unwrap();
        assert!(index.overlaps_range(0, 1001));
        assert!(index.overlaps_range(1999, 3000));
        assert!(!index.overlaps_range(0, 1000));
        assert!(!index.overlaps_range(2000, 3000));
    }

    #[test]
    fn test_bloom_no_false_negatives() {
        let mut bloom = SegmentBloomFilter::new(500);
        let keys: Vec<String> = (0..500).map(|i| format!("BATCH_{:04}", i)).collect();
        for key in &keys {
            bloom.add(key);
        }

        for key in &keys {
            assert!(bloom.might_contain(key), "false negative for {}", key);
        }
        assert_eq!(bloom.item_count(), 500);
    }

    #[test]
    fn test_bloom_rejects_most_absent_keys() {
        let mut bloom = SegmentBloomFilter::new(100);
        for i in 0..100 {
            bloom.add(&format!("present_{}", i));
        }

        let false_positives = (0..1000)
            .filter(|i| bloom.might_contain(&format!("absent_{}", i)))
            .count();
        assert!(false_positives < 100, "too many false positives: {}", false_positives);
    }

    #[test]
    fn test_bloom_serde_roundtrip_keeps_membership() {
        let mut bloom = SegmentBloomFilter::new(10);
        bloom.add("normal");
        bloom.add("critical");

        let bytes = bincode::serialize(&bloom).unwrap();
        let restored: SegmentBloomFilter = bincode::deserialize(&bytes).unwrap();

        assert!(restored.might_contain("normal"));
        assert!(restored.might_contain("critical"));
        assert_eq!(restored.item_count(), 2);
        assert_eq!(restored.size_bytes(), bloom.size_bytes());
    }
}
