//! Write-Ahead Log (WAL) implementation
//!
//! The WAL keeps the contents of a metric's write buffers durable until they
//! are flushed. Each buffer generation owns one segment; a segment is
//! removed only after its buffer's table and index entry are committed, so
//! after a crash every remaining segment is replayed into a buffer and
//! flushed again.

mod entry;
mod reader;
mod writer;

pub use entry::{WalEntry, WalEntryType};
pub use reader::{RecoveredSegment, WalReader};
pub use writer::WalWriter;

use std::path::{Path, PathBuf};

/// WAL sync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// Sync after every write (safest, slowest)
    #[default]
    Immediate,
    /// Sync after N writes
    EveryN(usize),
    /// Sync on interval (trades durability for performance)
    Interval { millis: u64 },
    /// Never sync (OS decides, fastest, least safe)
    None,
}

/// WAL configuration
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Root directory; each metric gets its own subdirectory
    pub dir: PathBuf,
    /// Sync policy
    pub sync_policy: SyncPolicy,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/wal"),
            sync_policy: SyncPolicy::default(),
        }
    }
}

pub(crate) fn segment_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!("wal_{:020}.log", segment_id))
}

pub(crate) fn parse_segment_id(path: &Path) -> Option<u64> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.strip_prefix("wal_"))
        .and_then(|s| s.strip_suffix(".log"))
        .and_then(|s| s.parse().ok())
}
