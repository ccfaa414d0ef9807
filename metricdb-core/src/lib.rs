//! MetricDB Core - Per-Series Time-Series Storage Engine
//!
//! Stores timestamped numeric samples per named metric and serves ordered
//! range queries without keeping all data in memory.
//!
//! # Architecture
//!
//! Every metric is its own small LSM tree:
//!
//! - **MemTable**: in-memory skip list absorbing recent samples
//! - **WAL (Write-Ahead Log)**: keeps unflushed samples across restarts
//! - **SSTable**: immutable sorted files, written once and checksummed
//! - **Table Index**: persisted catalog of tables by key range
//! - **Compaction**: merges overlapping tables into non-overlapping ones
//!
//! Files are obtained through a [`repository::FileRepository`], so the
//! engine never deals with paths directly.
//!
//! ```no_run
//! use metricdb_core::repository::LocalFileRepository;
//! use metricdb_core::storage::{MetricStore, StoreConfig};
//! use std::sync::Arc;
//!
//! # fn main() -> metricdb_core::Result<()> {
//! let repo = Arc::new(LocalFileRepository::new("data/tables")?);
//! let store = MetricStore::open(repo, StoreConfig::default())?;
//! store.add_sample("temp", 100, 3.14)?;
//! let samples = store.query("temp", 0, 1000)?;
//! # Ok(())
//! # }
//! ```

pub mod compaction;
pub mod index;
pub mod memtable;
pub mod merge;
pub mod repository;
pub mod sstable;
pub mod storage;
pub mod wal;

mod error;
mod types;

pub use error::{MetricError, Result};
pub use types::*;

/// MetricDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Maximum MemTable byte estimate before flush (64MB)
    pub const MEMTABLE_SIZE_LIMIT: usize = 64 * 1024 * 1024;

    /// Maximum distinct timestamps in a MemTable before flush
    pub const MEMTABLE_MAX_SAMPLES: usize = 1024 * 1024;

    /// Estimated bytes per MemTable entry (sample plus skip list node)
    pub const MEMTABLE_ENTRY_SIZE: usize = 64;

    /// Frozen buffers waiting for a background flush before writes stall
    pub const MAX_FROZEN_BUFFERS: usize = 4;

    /// Level-0 tables before compaction
    pub const L0_COMPACTION_TRIGGER: usize = 4;

    /// Overlapping tables before compaction
    pub const OVERLAP_COMPACTION_TRIGGER: usize = 8;

    /// Maximum samples per compacted table
    pub const TARGET_TABLE_SAMPLES: u64 = 4 * 1024 * 1024;

    /// Background worker tick in milliseconds
    pub const WORKER_TICK_MILLIS: u64 = 1000;
}
