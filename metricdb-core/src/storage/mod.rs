//! Storage engine - coordinates all storage components
//!
//! A [`Metric`] owns one series: its write buffers, its table index and the
//! flush and compaction of its tables. The [`MetricStore`] keeps the open
//! metrics by key and runs the background worker that flushes and compacts
//! them off the write path.

mod engine;
mod metric;
mod worker;

pub use engine::{MetricStore, StoreStats};
pub use metric::{Metric, MetricStats, WriteOutcome};

use crate::compaction::CompactionConfig;
use crate::memtable::MemTableConfig;
use crate::wal::WalConfig;
use std::time::Duration;

/// Where a buffer that crossed its flush threshold is written out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// The inserting call writes the table before returning
    #[default]
    Inline,
    /// The inserting call only freezes the buffer; a worker writes it
    Background,
}

/// Per-metric configuration
#[derive(Debug, Clone)]
pub struct MetricConfig {
    /// Write buffer thresholds
    pub memtable: MemTableConfig,
    /// Compaction thresholds
    pub compaction: CompactionConfig,
    /// Write-ahead log; `None` keeps unflushed samples in memory only
    pub wal: Option<WalConfig>,
    /// Flush scheduling
    pub flush_mode: FlushMode,
    /// Frozen buffers allowed to wait for a background flush before the
    /// writer flushes them itself
    pub max_frozen_buffers: usize,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            memtable: MemTableConfig::default(),
            compaction: CompactionConfig::default(),
            wal: None,
            flush_mode: FlushMode::default(),
            max_frozen_buffers: crate::config::MAX_FROZEN_BUFFERS,
        }
    }
}

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Configuration applied to every metric
    pub metric: MetricConfig,
    /// Run flush and compaction on a background thread
    pub background_worker: bool,
    /// How often the worker checks buffers for age-based flushing
    pub tick_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            metric: MetricConfig {
                flush_mode: FlushMode::Background,
                ..Default::default()
            },
            background_worker: true,
            tick_interval: Duration::from_millis(crate::config::WORKER_TICK_MILLIS),
        }
    }
}
