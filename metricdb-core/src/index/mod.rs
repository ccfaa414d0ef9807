//! Table index - the catalog of a metric's sorted tables
//!
//! The index is the single source of truth for which tables exist. Tables
//! are referenced by identifier only; the repository owns their lifecycle.
//! It is persisted as a manifest and replaced atomically on every change.

mod manifest;

pub use manifest::{Manifest, MANIFEST_VERSION};

use crate::{KeyRange, MetricError, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Level of tables written by a buffer flush
pub const FLUSH_LEVEL: u8 = 0;

/// Level of tables written by compaction
pub const COMPACTED_LEVEL: u8 = 1;

/// Descriptor of one on-disk table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    /// Repository identifier
    pub id: String,
    /// Creation sequence; a higher sequence is authoritative on key collision
    pub seq: u64,
    /// 0 for flush output, 1 for compaction output
    pub level: u8,
    /// Closed key range of the table
    pub key_range: KeyRange,
    /// Number of samples in the table
    pub sample_count: u64,
}

impl TableEntry {
    /// First key covered
    pub fn first_key(&self) -> Timestamp {
        self.key_range.first
    }

    /// Last key covered
    pub fn last_key(&self) -> Timestamp {
        self.key_range.last
    }
}

/// In-memory table index.
///
/// Entries are kept sorted by `(first_key, seq)`. Alongside them the index
/// keeps the running maximum of `last_key`, which is non-decreasing and lets
/// an overlap lookup binary search both ends of the candidate window.
#[derive(Debug, Clone, Default)]
pub struct TableIndex {
    entries: Vec<TableEntry>,
    max_last: Vec<Timestamp>,
}

impl TableIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from persisted entries
    pub fn from_entries(entries: Vec<TableEntry>) -> Result<Self> {
        let mut index = Self {
            entries,
            max_last: Vec::new(),
        };
        index.rebuild()?;
        Ok(index)
    }

    /// Register a newly flushed table
    pub fn add_entry(&mut self, entry: TableEntry) -> Result<()> {
        self.entries.push(entry);
        if let Err(e) = self.rebuild() {
            self.entries.pop();
            self.rebuild()?;
            return Err(e);
        }
        Ok(())
    }

    /// Swap the entries with the given identifiers for `added`
    pub fn replace(&mut self, removed: &[String], added: Vec<TableEntry>) -> Result<()> {
        let removed: HashSet<&str> = removed.iter().map(String::as_str).collect();
        let missing = removed
            .iter()
            .find(|id| !self.entries.iter().any(|e| e.id == **id));
        if let Some(id) = missing {
            return Err(MetricError::NotFound(id.to_string()));
        }

        let mut entries: Vec<TableEntry> = self
            .entries
            .iter()
            .filter(|e| !removed.contains(e.id.as_str()))
            .cloned()
            .collect();
        entries.extend(added);

        let mut replaced = Self {
            entries,
            max_last: Vec::new(),
        };
        replaced.rebuild()?;
        *self = replaced;
        Ok(())
    }

    /// Every entry whose key range intersects `[lo, hi]`, ordered by first key.
    ///
    /// Runs in O(log T + k) once tables no longer overlap.
    pub fn entries_overlapping(&self, lo: Timestamp, hi: Timestamp) -> Vec<&TableEntry> {
        if lo > hi {
            return Vec::new();
        }
        let end = self.entries.partition_point(|e| e.first_key() <= hi);
        let start = self.max_last[..end].partition_point(|&last| last < lo);
        self.entries[start..end]
            .iter()
            .filter(|e| e.last_key() >= lo)
            .collect()
    }

    /// All entries, ordered by first key
    pub fn entries(&self) -> &[TableEntry] {
        &self.entries
    }

    /// Entries at the given level
    pub fn level(&self, level: u8) -> impl Iterator<Item = &TableEntry> {
        self.entries.iter().filter(move |e| e.level == level)
    }

    /// Number of entries whose range intersects an earlier entry's range
    pub fn overlap_count(&self) -> usize {
        self.entries
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(i, e)| e.first_key() <= self.max_last[i - 1])
            .count()
    }

    /// Highest sequence number in use
    pub fn max_seq(&self) -> Option<u64> {
        self.entries.iter().map(|e| e.seq).max()
    }

    /// Total samples across all tables
    pub fn sample_count(&self) -> u64 {
        self.entries.iter().map(|e| e.sample_count).sum()
    }

    /// Get entry count
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn rebuild(&mut self) -> Result<()> {
        let mut ids = HashSet::with_capacity(self.entries.len());
        let mut seqs = HashSet::with_capacity(self.entries.len());
        for entry in &self.entries {
            if entry.key_range.is_empty() {
                return Err(MetricError::InvalidFormat(format!(
                    "table {} has inverted range {:?}",
                    entry.id, entry.key_range
                )));
            }
            if !ids.insert(entry.id.as_str()) || !seqs.insert(entry.seq) {
                return Err(MetricError::InvalidFormat(format!(
                    "duplicate table entry {} (seq {})",
                    entry.id, entry.seq
                )));
            }
        }

        self.entries
            .sort_by(|a, b| (a.first_key(), a.seq).cmp(&(b.first_key(), b.seq)));
        self.max_last = self
            .entries
            .iter()
            .scan(0, |max, e| {
                *max = (*max).max(e.last_key());
                Some(*max)
            })
            .collect();
        Ok(())
    }
}
