//! MemTable - the per-metric write buffer
//!
//! The MemTable absorbs recent samples in timestamp order until it is
//! frozen and flushed to a sorted table. It is backed by a lock-free skip
//! list so inserts and range scans can run concurrently.

use crate::{KeyRange, Result, Sample, Timestamp};
use crossbeam_skiplist::SkipMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Write buffer flush thresholds
#[derive(Debug, Clone)]
pub struct MemTableConfig {
    /// Flush once this many distinct timestamps are buffered
    pub max_samples: usize,
    /// Flush once the byte estimate reaches this size
    pub max_bytes: usize,
    /// Flush once the oldest buffered insert is this old
    pub max_age: Option<Duration>,
}

impl Default for MemTableConfig {
    fn default() -> Self {
        Self {
            max_samples: crate::config::MEMTABLE_MAX_SAMPLES,
            max_bytes: crate::config::MEMTABLE_SIZE_LIMIT,
            max_age: None,
        }
    }
}

/// MemTable for in-memory writes
pub struct MemTable {
    /// Skip list of value by timestamp
    data: SkipMap<Timestamp, f64>,
    /// Time of the first insert, for age-based flushing
    first_insert: OnceLock<Instant>,
    /// Generation of this memtable within its metric
    id: u64,
}

impl MemTable {
    /// Create a new MemTable
    pub fn new(id: u64) -> Self {
        Self {
            data: SkipMap::new(),
            first_insert: OnceLock::new(),
            id,
        }
    }

    /// Get the MemTable ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Insert a sample, replacing any value at the same timestamp
    pub fn insert(&self, sample: Sample) -> Result<()> {
        sample.validate()?;
        self.insert_unchecked(sample);
        Ok(())
    }

    /// Insert multiple samples; nothing is inserted if any is invalid
    pub fn insert_batch(&self, samples: &[Sample]) -> Result<()> {
        for sample in samples {
            sample.validate()?;
        }
        for sample in samples {
            self.insert_unchecked(*sample);
        }
        Ok(())
    }

    fn insert_unchecked(&self, sample: Sample) {
        self.first_insert.get_or_init(Instant::now);
        self.data.insert(sample.timestamp, sample.value);
    }

    /// Check if the MemTable should be flushed
    pub fn should_flush(&self, config: &MemTableConfig) -> bool {
        if self.is_empty() {
            return false;
        }
        if self.len() >= config.max_samples || self.size() >= config.max_bytes {
            return true;
        }
        match (config.max_age, self.age()) {
            (Some(max_age), Some(age)) => age >= max_age,
            _ => false,
        }
    }

    /// Approximate size in bytes, one entry estimate per distinct timestamp
    pub fn size(&self) -> usize {
        self.data.len() * crate::config::MEMTABLE_ENTRY_SIZE
    }

    /// Time since the first insert
    pub fn age(&self) -> Option<Duration> {
        self.first_insert.get().map(Instant::elapsed)
    }

    /// Lazy ascending scan of samples with `lo <= timestamp <= hi`.
    ///
    /// Each call starts a fresh scan.
    pub fn range(&self, lo: Timestamp, hi: Timestamp) -> Box<dyn Iterator<Item = Sample> + '_> {
        if lo > hi {
            return Box::new(std::iter::empty());
        }
        Box::new(
            self.data
                .range(lo..=hi)
                .map(|entry| Sample::new(*entry.key(), *entry.value())),
        )
    }

    /// Iterate over all samples in sorted order
    pub fn iter(&self) -> impl Iterator<Item = Sample> + '_ {
        self.data
            .iter()
            .map(|entry| Sample::new(*entry.key(), *entry.value()))
    }

    /// Value stored at a timestamp
    pub fn get(&self, timestamp: Timestamp) -> Option<f64> {
        self.data.get(&timestamp).map(|entry| *entry.value())
    }

    /// Get the key range covered by this MemTable
    pub fn key_range(&self) -> Option<KeyRange> {
        let first = self.data.front()?;
        let last = self.data.back()?;
        Some(KeyRange::new(*first.key(), *last.key()))
    }

    /// Get entry count
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
