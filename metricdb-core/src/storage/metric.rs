//! Metric - one named series and its LSM tree

use super::{FlushMode, MetricConfig};
use crate::compaction::{self, CompactionPolicy, CompactionReport, CompactionTask};
use crate::index::{Manifest, TableEntry, TableIndex, FLUSH_LEVEL};
use crate::memtable::MemTable;
use crate::merge::{MergeIter, SampleStream};
use crate::repository::{FileKind, FileRepository, MetricLayout};
use crate::sstable::{self, TableReader};
use crate::wal::{WalEntry, WalReader, WalWriter};
use crate::{MetricError, Result, Sample, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a write left behind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Samples are buffered
    Buffered,
    /// Samples are buffered and a frozen buffer waits for a background flush
    FlushPending,
}

/// Metric statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricStats {
    pub key: String,
    pub buffered_samples: usize,
    pub frozen_buffers: usize,
    pub tables: usize,
    pub table_samples: u64,
    pub level0_tables: usize,
    /// Cause of a flush failure not yet cleared by a successful flush
    pub flush_error: Option<String>,
}

/// Snapshot of everything a query reads
#[derive(Clone)]
struct MetricState {
    active: Arc<MemTable>,
    /// Frozen buffers waiting to be flushed, oldest first
    frozen: Vec<Arc<MemTable>>,
    index: Arc<TableIndex>,
}

/// Owned by whoever holds the writer lock (flush or compaction)
struct Writer {
    next_seq: u64,
    flushed_generation: u64,
}

/// A single metric
pub struct Metric {
    key: String,
    layout: MetricLayout,
    repo: Arc<dyn FileRepository>,
    config: MetricConfig,
    policy: CompactionPolicy,

    state: RwLock<MetricState>,
    writer: Mutex<Writer>,
    // Orders WAL appends and buffer inserts identically
    append_lock: Mutex<()>,
    // Held shared while tables are opened, exclusively while they are deleted
    table_guard: RwLock<()>,
    // Set by a failed flush; writes are refused until a flush succeeds
    flush_error: Mutex<Option<Arc<MetricError>>>,

    next_generation: AtomicU64,
    wal: Option<WalWriter>,
}

impl Metric {
    /// Open a metric, creating it if nothing is stored under its key.
    ///
    /// Loads the manifest, deletes tables the manifest does not reference and
    /// replays any WAL segments into frozen buffers.
    pub fn open(key: &str, repo: Arc<dyn FileRepository>, config: MetricConfig) -> Result<Self> {
        let layout = MetricLayout::new(key)?;

        let (index, mut next_seq, flushed_generation) =
            match Manifest::load(repo.as_ref(), &layout)? {
                Some(manifest) => (
                    TableIndex::from_entries(manifest.entries)?,
                    manifest.next_seq,
                    manifest.flushed_generation,
                ),
                None => (TableIndex::new(), 1, 0),
            };
        if let Some(max_seq) = index.max_seq() {
            next_seq = next_seq.max(max_seq + 1);
        }
        next_seq = next_seq.max(Self::remove_orphans(repo.as_ref(), &layout, &index)?);

        let mut frozen = Vec::new();
        let mut next_generation = flushed_generation + 1;
        let wal = match &config.wal {
            Some(wal_config) => {
                let dir = layout.wal_dir(&wal_config.dir);
                let mut stale = Vec::new();
                for segment in WalReader::new(&dir).recover()? {
                    next_generation = next_generation.max(segment.segment_id + 1);
                    if segment.segment_id <= flushed_generation || segment.samples.is_empty() {
                        stale.push(segment.segment_id);
                        continue;
                    }
                    let memtable = MemTable::new(segment.segment_id);
                    memtable.insert_batch(&segment.samples)?;
                    frozen.push(Arc::new(memtable));
                }

                let writer = WalWriter::new(&dir, wal_config.sync_policy, next_generation)?;
                for segment_id in stale {
                    writer.remove_segment(segment_id)?;
                }
                Some(writer)
            }
            None => None,
        };

        info!(
            "Opened metric {}: {} tables, {} buffers recovered",
            key,
            index.len(),
            frozen.len()
        );

        let metric = Self {
            key: key.to_string(),
            layout,
            repo,
            policy: CompactionPolicy::new(config.compaction.clone()),
            config,
            state: RwLock::new(MetricState {
                active: Arc::new(MemTable::new(next_generation)),
                frozen,
                index: Arc::new(index),
            }),
            writer: Mutex::new(Writer {
                next_seq,
                flushed_generation,
            }),
            append_lock: Mutex::new(()),
            table_guard: RwLock::new(()),
            flush_error: Mutex::new(None),
            next_generation: AtomicU64::new(next_generation + 1),
            wal,
        };

        if metric.config.flush_mode == FlushMode::Inline && metric.has_pending_flush() {
            if let Err(e) = metric.flush_pending() {
                warn!("Flushing recovered buffers of {} failed: {}", metric.key, e);
            }
        }

        Ok(metric)
    }

    /// Get metric key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get the configuration
    pub fn config(&self) -> &MetricConfig {
        &self.config
    }

    /// Buffer one sample
    pub fn add_sample(&self, sample: Sample) -> Result<WriteOutcome> {
        sample.validate()?;
        self.buffer(&[sample], || Ok(WalEntry::sample(&sample)))
    }

    /// Buffer several samples; nothing is buffered if any is invalid
    pub fn add_samples(&self, samples: &[Sample]) -> Result<WriteOutcome> {
        for sample in samples {
            sample.validate()?;
        }
        if samples.is_empty() {
            return Ok(WriteOutcome::Buffered);
        }
        self.buffer(samples, || WalEntry::batch(samples))
    }

    fn buffer(
        &self,
        samples: &[Sample],
        entry: impl FnOnce() -> Result<WalEntry>,
    ) -> Result<WriteOutcome> {
        if let Some(cause) = self.flush_error.lock().as_ref() {
            return Err(MetricError::flush_failed(&self.key, Arc::clone(cause)));
        }

        let full = {
            let state = self.state.read();
            let _append = self.append_lock.lock();
            if let Some(wal) = &self.wal {
                wal.append(&entry()?)?;
            }
            state.active.insert_batch(samples)?;
            state.active.should_flush(&self.config.memtable)
        };

        if !full {
            return Ok(WriteOutcome::Buffered);
        }
        self.freeze(false)?;
        let frozen = self.state.read().frozen.len();
        if frozen == 0 {
            return Ok(WriteOutcome::Buffered);
        }

        match self.config.flush_mode {
            FlushMode::Inline => {
                self.flush_pending()?;
                Ok(WriteOutcome::Buffered)
            }
            FlushMode::Background if frozen > self.config.max_frozen_buffers => {
                debug!(metric = %self.key, frozen, "Write stall, flushing on the writer");
                self.flush_pending()?;
                Ok(WriteOutcome::Buffered)
            }
            FlushMode::Background => Ok(WriteOutcome::FlushPending),
        }
    }

    /// Freeze the active buffer if it has crossed a threshold, age included
    pub fn freeze_if_due(&self) -> Result<bool> {
        self.freeze(false)
    }

    fn freeze(&self, force: bool) -> Result<bool> {
        let mut state = self.state.write();
        if state.active.is_empty() {
            return Ok(false);
        }
        if !force && !state.active.should_flush(&self.config.memtable) {
            return Ok(false);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        if let Some(wal) = &self.wal {
            wal.rotate(generation)?;
        }
        let frozen = std::mem::replace(&mut state.active, Arc::new(MemTable::new(generation)));
        debug!(
            metric = %self.key,
            generation = frozen.id(),
            samples = frozen.len(),
            "Froze write buffer"
        );
        state.frozen.push(frozen);
        Ok(true)
    }

    /// Check if a frozen buffer is waiting to be flushed
    pub fn has_pending_flush(&self) -> bool {
        !self.state.read().frozen.is_empty()
    }

    /// Freeze the active buffer and flush every buffer to tables
    pub fn flush(&self) -> Result<usize> {
        self.freeze(true)?;
        self.flush_pending()
    }

    /// Flush frozen buffers, oldest first.
    ///
    /// Stops at the first failure; the failed buffer stays frozen and
    /// queryable, and the index is unchanged. Until a later flush succeeds,
    /// writes fail with the same `FlushFailed` and the background worker
    /// leaves the metric alone.
    pub fn flush_pending(&self) -> Result<usize> {
        let mut writer = self.writer.lock();
        let mut flushed = 0;

        loop {
            let oldest = self.state.read().frozen.first().cloned();
            let Some(memtable) = oldest else {
                break;
            };
            if let Err(e) = self.flush_memtable(&mut writer, &memtable) {
                let cause = Arc::new(e);
                *self.flush_error.lock() = Some(Arc::clone(&cause));
                return Err(MetricError::flush_failed(&self.key, cause));
            }
            flushed += 1;
        }

        *self.flush_error.lock() = None;
        Ok(flushed)
    }

    /// Flush for the background worker; does nothing after an unretried failure
    pub(super) fn background_flush(&self) -> Result<usize> {
        if self.flush_error.lock().is_some() {
            return Ok(0);
        }
        self.flush_pending()
    }

    fn flush_memtable(&self, writer: &mut Writer, memtable: &Arc<MemTable>) -> Result<()> {
        let samples: Vec<Sample> = memtable.iter().collect();
        let seq = writer.next_seq;
        let id = self.layout.table_id(seq);

        // Writing
        let info = match sstable::write_verified(self.repo.as_ref(), &id, &samples) {
            Ok(info) => info,
            Err(e) => {
                self.discard_table(&id);
                return Err(e);
            }
        };

        // Indexed
        let mut index = TableIndex::clone(&self.state.read().index);
        index.add_entry(TableEntry {
            id: info.id,
            seq,
            level: FLUSH_LEVEL,
            key_range: info.key_range,
            sample_count: info.sample_count,
        })?;
        Manifest::new(&self.key, seq + 1, memtable.id(), &index)
            .store(self.repo.as_ref(), &self.layout)?;

        writer.next_seq = seq + 1;
        writer.flushed_generation = memtable.id();
        {
            let mut state = self.state.write();
            state.index = Arc::new(index);
            state.frozen.retain(|m| !Arc::ptr_eq(m, memtable));
        }

        if let Some(wal) = &self.wal {
            if let Err(e) = wal.remove_segment(memtable.id()) {
                warn!(
                    "Failed to remove WAL segment {} of {}: {}",
                    memtable.id(),
                    self.key,
                    e
                );
            }
        }

        info!(
            "Flushed buffer {} of {} to table {} ({} samples)",
            memtable.id(),
            self.key,
            id,
            info.sample_count
        );
        Ok(())
    }

    /// Compact every level-0 table regardless of thresholds
    pub fn compact(&self) -> Result<Option<CompactionReport>> {
        self.run_compaction(true)
    }

    /// Compact if a threshold is crossed
    pub fn maybe_compact(&self) -> Result<Option<CompactionReport>> {
        self.run_compaction(false)
    }

    /// Check if a compaction threshold is crossed
    pub fn needs_compaction(&self) -> bool {
        self.policy.needs_compaction(&self.state.read().index)
    }

    fn run_compaction(&self, force: bool) -> Result<Option<CompactionReport>> {
        let mut writer = self.writer.lock();
        let index = Arc::clone(&self.state.read().index);

        let task = if force {
            CompactionPolicy::plan(&index)
        } else {
            self.policy.select_compaction(&index)
        };
        let Some(task) = task else {
            return Ok(None);
        };

        self.compact_task(&mut writer, &index, &task)
            .map(Some)
            .map_err(|e| MetricError::compaction_failed(&self.key, e))
    }

    fn compact_task(
        &self,
        writer: &mut Writer,
        index: &TableIndex,
        task: &CompactionTask,
    ) -> Result<CompactionReport> {
        // Writing
        let output = compaction::execute(
            self.repo.as_ref(),
            &self.layout,
            self.policy.config(),
            task,
            writer.next_seq,
        )?;

        // Indexed
        let removed = task.input_ids();
        let mut compacted = index.clone();
        compacted.replace(&removed, output.entries.clone())?;
        let stored = Manifest::new(
            &self.key,
            output.next_seq,
            writer.flushed_generation,
            &compacted,
        )
        .store(self.repo.as_ref(), &self.layout);
        if let Err(e) = stored {
            self.discard_unreferenced(&output.entries);
            return Err(e);
        }

        writer.next_seq = output.next_seq;
        self.state.write().index = Arc::new(compacted);

        // OldReleased
        self.release_tables(&removed);

        let report = CompactionReport {
            inputs: removed.len(),
            outputs: output.entries.len(),
            samples_written: output.samples_written,
            duplicates_resolved: output.duplicates_resolved,
        };
        info!(
            "Compacted {}: {} tables into {} ({} samples, {} duplicates)",
            self.key,
            report.inputs,
            report.outputs,
            report.samples_written,
            report.duplicates_resolved
        );
        Ok(report)
    }

    /// Samples with `lo <= timestamp <= hi`, ascending, newest write winning
    pub fn query(&self, lo: Timestamp, hi: Timestamp) -> Result<Vec<Sample>> {
        self.query_with_cancel(lo, hi, &CancellationToken::new())
    }

    /// Like [`Metric::query`], checking `cancel` before every table open
    pub fn query_with_cancel(
        &self,
        lo: Timestamp,
        hi: Timestamp,
        cancel: &CancellationToken,
    ) -> Result<Vec<Sample>> {
        if lo > hi {
            return Ok(Vec::new());
        }

        let guard = self.table_guard.read();
        let snapshot = self.state.read().clone();

        let mut tables = snapshot.index.entries_overlapping(lo, hi);
        tables.sort_by(|a, b| b.seq.cmp(&a.seq));

        let mut sources: Vec<SampleStream<'_>> = Vec::with_capacity(2 + tables.len());
        sources.push(Box::new(snapshot.active.range(lo, hi).map(Ok)));
        for memtable in snapshot.frozen.iter().rev() {
            sources.push(Box::new(memtable.range(lo, hi).map(Ok)));
        }
        for entry in tables {
            if cancel.is_cancelled() {
                return Err(MetricError::Cancelled);
            }
            let reader = self.open_table(entry)?;
            sources.push(Box::new(reader.scan(lo, hi)?));
        }
        drop(guard);

        let merge = MergeIter::new(sources);
        merge.collect()
    }

    /// Get metric statistics
    pub fn stats(&self) -> MetricStats {
        let state = self.state.read();
        MetricStats {
            key: self.key.clone(),
            buffered_samples: state.active.len()
                + state.frozen.iter().map(|m| m.len()).sum::<usize>(),
            frozen_buffers: state.frozen.len(),
            tables: state.index.len(),
            table_samples: state.index.sample_count(),
            level0_tables: state.index.level(FLUSH_LEVEL).count(),
            flush_error: self.flush_error.lock().as_ref().map(|e| e.to_string()),
        }
    }

    /// Flush everything and sync the WAL
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        if let Some(wal) = &self.wal {
            wal.sync()?;
        }
        Ok(())
    }

    /// Open a table, retrying once on an I/O error
    fn open_table(&self, entry: &TableEntry) -> Result<TableReader> {
        let reader = match TableReader::open(self.repo.as_ref(), &entry.id) {
            Err(MetricError::Io(e)) => {
                debug!(table = %entry.id, error = %e, "Retrying table open");
                TableReader::open(self.repo.as_ref(), &entry.id)?
            }
            other => other?,
        };

        let info = reader.info();
        if info.key_range != entry.key_range || info.sample_count != entry.sample_count {
            return Err(MetricError::corrupt(
                &entry.id,
                "header does not match its index entry",
            ));
        }
        Ok(reader)
    }

    fn release_tables(&self, ids: &[String]) {
        let _guard = self.table_guard.write();
        for id in ids {
            match self.repo.delete(id) {
                Ok(()) | Err(MetricError::NotFound(_)) => {}
                Err(e) => warn!("Failed to release table {}: {}", id, e),
            }
        }
    }

    /// Delete tables a failed manifest store left behind.
    ///
    /// A commit can fail after the manifest landed, so only tables the
    /// stored manifest does not reference are deleted.
    fn discard_unreferenced(&self, entries: &[TableEntry]) {
        let referenced = match Manifest::load(self.repo.as_ref(), &self.layout) {
            Ok(manifest) => manifest.map(|m| m.entries).unwrap_or_default(),
            Err(e) => {
                warn!("Keeping compaction output of {}: {}", self.key, e);
                return;
            }
        };
        for entry in entries {
            if !referenced.iter().any(|r| r.id == entry.id) {
                self.discard_table(&entry.id);
            }
        }
    }

    fn discard_table(&self, id: &str) {
        match self.repo.delete(id) {
            Ok(()) | Err(MetricError::NotFound(_)) => {}
            Err(e) => warn!("Failed to discard table {}: {}", id, e),
        }
    }

    /// Delete tables of this metric the index does not reference.
    ///
    /// Returns one past the highest table sequence found.
    fn remove_orphans(
        repo: &dyn FileRepository,
        layout: &MetricLayout,
        index: &TableIndex,
    ) -> Result<u64> {
        let mut next_seq = 0;
        for id in repo.list()? {
            let Some(FileKind::Table(seq)) = layout.classify(&id) else {
                continue;
            };
            next_seq = next_seq.max(seq + 1);
            if index.entries().iter().any(|e| e.id == id) {
                continue;
            }
            warn!("Removing orphaned table {}", id);
            match repo.delete(&id) {
                Ok(()) | Err(MetricError::NotFound(_)) => {}
                Err(e) => warn!("Failed to remove orphaned table {}: {}", id, e),
            }
        }
        Ok(next_seq)
    }
}
