//! WAL writer implementation

use super::{segment_path, SyncPolicy, WalEntry};
use crate::Result;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::debug;

/// WAL writer for appending entries of one metric to disk
pub struct WalWriter {
    dir: PathBuf,
    sync_policy: SyncPolicy,
    inner: Mutex<WalWriterInner>,
}

struct WalWriterInner {
    file: BufWriter<File>,
    segment_id: u64,
    writes_since_sync: usize,
    last_sync: Instant,
}

impl WalWriter {
    /// Create a writer appending to segment `segment_id` under `dir`
    pub fn new(dir: impl AsRef<Path>, sync_policy: SyncPolicy, segment_id: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let file = Self::open_segment(&dir, segment_id)?;

        let inner = WalWriterInner {
            file: BufWriter::new(file),
            segment_id,
            writes_since_sync: 0,
            last_sync: Instant::now(),
        };

        Ok(Self {
            dir,
            sync_policy,
            inner: Mutex::new(inner),
        })
    }

    /// Append an entry to the current segment
    pub fn append(&self, entry: &WalEntry) -> Result<()> {
        let serialized = entry.serialize_with_checksum();
        let mut inner = self.inner.lock();

        inner.file.write_all(&serialized)?;
        inner.writes_since_sync += 1;

        // Sync based on policy
        if self.should_sync(&inner) {
            Self::sync_inner(&mut inner)?;
        } else if self.sync_policy != SyncPolicy::None {
            inner.file.flush()?;
        }

        Ok(())
    }

    /// Force sync to disk
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::sync_inner(&mut inner)
    }

    /// Get current segment ID
    pub fn current_segment(&self) -> u64 {
        self.inner.lock().segment_id
    }

    /// Seal the current segment and continue in `segment_id`
    pub fn rotate(&self, segment_id: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::sync_inner(&mut inner)?;

        let file = Self::open_segment(&self.dir, segment_id)?;
        inner.file = BufWriter::new(file);
        inner.segment_id = segment_id;
        inner.writes_since_sync = 0;
        debug!(dir = ?self.dir, segment_id, "Rotated WAL segment");
        Ok(())
    }

    /// Delete a sealed segment once its contents are durable elsewhere
    pub fn remove_segment(&self, segment_id: u64) -> Result<()> {
        if segment_id == self.current_segment() {
            return Ok(());
        }
        match fs::remove_file(segment_path(&self.dir, segment_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn should_sync(&self, inner: &WalWriterInner) -> bool {
        match self.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => inner.writes_since_sync >= n,
            SyncPolicy::Interval { millis } => {
                inner.last_sync.elapsed().as_millis() >= millis as u128
            }
            SyncPolicy::None => false,
        }
    }

    fn sync_inner(inner: &mut WalWriterInner) -> Result<()> {
        inner.file.flush()?;
        inner.file.get_ref().sync_all()?;
        inner.writes_since_sync = 0;
        inner.last_sync = Instant::now();
        Ok(())
    }

    fn open_segment(dir: &Path, segment_id: u64) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(dir, segment_id))?;
        Ok(file)
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        let _ = self.inner.get_mut().file.flush();
    }
}
