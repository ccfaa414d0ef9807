//! Core types for MetricDB

use crate::{MetricError, Result};
use serde::{Deserialize, Serialize};

/// Sample timestamp, the sort key of every table
pub type Timestamp = u64;

/// A single reading of a metric
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Timestamp (key)
    pub timestamp: Timestamp,
    /// Numeric value
    pub value: f64,
}

impl Sample {
    /// Encoded size of a sample in tables and WAL records
    pub const ENCODED_SIZE: usize = 16;

    /// Create a new sample
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        Self { timestamp, value }
    }

    /// Reject samples the engine cannot store
    pub fn validate(&self) -> Result<()> {
        if !self.value.is_finite() {
            return Err(MetricError::InvalidSample(format!(
                "non-finite value {} at timestamp {}",
                self.value, self.timestamp
            )));
        }
        Ok(())
    }
}

impl From<(Timestamp, f64)> for Sample {
    fn from((timestamp, value): (Timestamp, f64)) -> Self {
        Sample::new(timestamp, value)
    }
}

/// Closed key range `[first, last]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    /// First key (inclusive)
    pub first: Timestamp,
    /// Last key (inclusive)
    pub last: Timestamp,
}

impl KeyRange {
    /// Create a new key range
    pub fn new(first: Timestamp, last: Timestamp) -> Self {
        Self { first, last }
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.first && ts <= self.last
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.first <= other.last && self.last >= other.first
    }

    /// Smallest range covering both
    pub fn union(&self, other: &KeyRange) -> KeyRange {
        KeyRange::new(self.first.min(other.first), self.last.max(other.last))
    }

    /// An inverted range selects nothing
    pub fn is_empty(&self) -> bool {
        self.first > self.last
    }
}
