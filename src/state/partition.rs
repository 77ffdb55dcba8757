use crate::HarvestError;
use serde::Serialize;
use std::fmt;

/// A half-open range `[low, high)` over the partitioning dimension
///
/// Bounds are whole units of the dimension (e.g. euros), which keeps the
/// midpoint split exact and reproducible across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PartitionRange {
    pub low: i64,
    pub high: i64,
}

impl PartitionRange {
    /// Creates a range, rejecting empty or inverted bounds
    pub fn new(low: i64, high: i64) -> Result<Self, HarvestError> {
        if low >= high {
            return Err(HarvestError::InvalidRange { low, high });
        }
        Ok(Self { low, high })
    }

    /// Width of the range in dimension units
    pub fn width(&self) -> i64 {
        self.high - self.low
    }

    /// Deterministic split point, `low + (high - low) / 2`
    pub fn midpoint(&self) -> i64 {
        self.low + (self.high - self.low) / 2
    }

    /// Splits into `[low, mid)` and `[mid, high)`
    ///
    /// Returns `None` for unit-width ranges, which have no interior midpoint.
    pub fn split(&self) -> Option<(Self, Self)> {
        if self.width() < 2 {
            return None;
        }
        let mid = self.midpoint();
        Some((
            Self {
                low: self.low,
                high: mid,
            },
            Self {
                low: mid,
                high: self.high,
            },
        ))
    }

    /// Whether a dimension value falls inside the range
    pub fn contains(&self, value: f64) -> bool {
        value >= self.low as f64 && value < self.high as f64
    }
}

impl fmt::Display for PartitionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.low, self.high)
    }
}

/// The recursion unit of the partition planner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionNode {
    pub range: PartitionRange,
    pub depth: u32,
    /// Match count reported by the prober, `None` while unknown
    pub probed_count: Option<u64>,
}

impl PartitionNode {
    pub fn root(range: PartitionRange) -> Self {
        Self {
            range,
            depth: 0,
            probed_count: None,
        }
    }

    /// Children one level deeper, or `None` when the range cannot be split
    pub fn children(&self) -> Option<(Self, Self)> {
        let (left, right) = self.range.split()?;
        let child = |range| Self {
            range,
            depth: self.depth + 1,
            probed_count: None,
        };
        Some((child(left), child(right)))
    }
}

/// A finalized partition handed to the slice crawler
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeafPartition {
    pub range: PartitionRange,
    pub depth: u32,
    pub probed_count: Option<u64>,
    /// The range still exceeds the window (or its count is unknown) but could not
    /// be split further, so only the first window of results is reachable
    pub capped: bool,
}

/// One filter combination crawled independently: transaction × category × zone
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Segment {
    pub transaction: String,
    pub category: String,
    pub zone: Option<String>,
}

impl Segment {
    pub fn new(transaction: &str, category: &str, zone: Option<&str>) -> Self {
        Self {
            transaction: transaction.to_string(),
            category: category.to_string(),
            zone: zone.map(str::to_string),
        }
    }

    /// Stable identifier used to record completed leaves
    pub fn key(&self) -> String {
        match &self.zone {
            Some(zone) => format!("{}/{}/{}", self.transaction, self.category, zone),
            None => format!("{}/{}", self.transaction, self.category),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_empty_range() {
        assert!(PartitionRange::new(0, 10).is_ok());
        assert!(matches!(
            PartitionRange::new(10, 10),
            Err(HarvestError::InvalidRange { low: 10, high: 10 })
        ));
        assert!(PartitionRange::new(10, 3).is_err());
    }

    #[test]
    fn test_split_is_contiguous() {
        let range = PartitionRange::new(0, 10_000).unwrap();
        let (left, right) = range.split().unwrap();

        assert_eq!(left, PartitionRange { low: 0, high: 5000 });
        assert_eq!(right, PartitionRange { low: 5000, high: 10_000 });
        assert_eq!(left.high, right.low);
    }

    #[test]
    fn test_split_odd_width() {
        let range = PartitionRange::new(3, 8).unwrap();
        let (left, right) = range.split().unwrap();

        assert_eq!(left, PartitionRange { low: 3, high: 5 });
        assert_eq!(right, PartitionRange { low: 5, high: 8 });
    }

    #[test]
    fn test_unit_range_cannot_split() {
        let range = PartitionRange::new(41, 42).unwrap();
        assert!(range.split().is_none());
    }

    #[test]
    fn test_contains_is_half_open() {
        let range = PartitionRange::new(100, 200).unwrap();
        assert!(range.contains(100.0));
        assert!(range.contains(199.5));
        assert!(!range.contains(200.0));
        assert!(!range.contains(99.0));
    }

    #[test]
    fn test_children_increment_depth() {
        let node = PartitionNode::root(PartitionRange::new(0, 4).unwrap());
        let (left, right) = node.children().unwrap();
        assert_eq!(left.depth, 1);
        assert_eq!(right.depth, 1);
        assert_eq!(left.probed_count, None);
    }

    #[test]
    fn test_segment_key() {
        assert_eq!(Segment::new("buy", "flat", Some("75-")).key(), "buy/flat/75-");
        assert_eq!(Segment::new("rent", "house", None).key(), "rent/house");
    }
}
