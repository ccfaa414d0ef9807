//! Compaction for the per-metric LSM tree
//!
//! Flushes write level-0 tables whose ranges may overlap. Compaction merges
//! every level-0 table together with the level-1 tables their union range
//! touches, and writes the result back as level-1 tables that never overlap
//! each other. Planning and table writing live here; publishing the result
//! in the index and releasing the inputs is left to the caller.

use crate::index::{TableEntry, TableIndex, COMPACTED_LEVEL, FLUSH_LEVEL};
use crate::merge::{MergeIter, SampleStream};
use crate::repository::{FileRepository, MetricLayout};
use crate::sstable::{self, TableReader};
use crate::{MetricError, Result, Sample};
use tracing::{debug, info, warn};

/// Compaction configuration
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Level-0 table count that triggers compaction
    pub l0_trigger: usize,
    /// Number of overlapping tables that triggers compaction
    pub overlap_trigger: usize,
    /// Maximum samples per output table
    pub target_table_samples: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            l0_trigger: crate::config::L0_COMPACTION_TRIGGER,
            overlap_trigger: crate::config::OVERLAP_COMPACTION_TRIGGER,
            target_table_samples: crate::config::TARGET_TABLE_SAMPLES,
        }
    }
}

/// Tables selected for one compaction
#[derive(Debug, Clone)]
pub struct CompactionTask {
    /// Every level-0 table
    pub l0_tables: Vec<TableEntry>,
    /// Level-1 tables intersecting the level-0 union range
    pub l1_tables: Vec<TableEntry>,
}

impl CompactionTask {
    /// All input tables, newest first
    pub fn inputs(&self) -> Vec<&TableEntry> {
        let mut inputs: Vec<&TableEntry> =
            self.l0_tables.iter().chain(self.l1_tables.iter()).collect();
        inputs.sort_by(|a, b| b.seq.cmp(&a.seq));
        inputs
    }

    /// Identifiers of all input tables
    pub fn input_ids(&self) -> Vec<String> {
        self.l0_tables
            .iter()
            .chain(self.l1_tables.iter())
            .map(|e| e.id.clone())
            .collect()
    }

    /// Number of input tables
    pub fn len(&self) -> usize {
        self.l0_tables.len() + self.l1_tables.len()
    }

    /// Check if the task has no inputs
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of writing a compaction's output tables
#[derive(Debug, Clone)]
pub struct CompactionOutput {
    /// Entries of the new level-1 tables
    pub entries: Vec<TableEntry>,
    /// First sequence number not used by the output
    pub next_seq: u64,
    /// Samples written across all outputs
    pub samples_written: u64,
    /// Shadowed samples dropped by the merge
    pub duplicates_resolved: u64,
}

/// Summary of a committed compaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    /// Tables merged away
    pub inputs: usize,
    /// Tables written
    pub outputs: usize,
    /// Samples written
    pub samples_written: u64,
    /// Shadowed samples dropped
    pub duplicates_resolved: u64,
}

/// Decides when and what to compact
#[derive(Debug, Clone)]
pub struct CompactionPolicy {
    config: CompactionConfig,
}

impl CompactionPolicy {
    /// Create a policy from configuration
    pub fn new(config: CompactionConfig) -> Self {
        Self { config }
    }

    /// Get the configuration
    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Check if the index has crossed a compaction threshold
    pub fn needs_compaction(&self, index: &TableIndex) -> bool {
        let l0_count = index.level(FLUSH_LEVEL).count();
        if l0_count == 0 {
            return false;
        }
        l0_count >= self.config.l0_trigger || index.overlap_count() >= self.config.overlap_trigger
    }

    /// Select a task if a threshold is crossed
    pub fn select_compaction(&self, index: &TableIndex) -> Option<CompactionTask> {
        if !self.needs_compaction(index) {
            return None;
        }
        Self::plan(index)
    }

    /// Plan a compaction of every level-0 table regardless of thresholds
    pub fn plan(index: &TableIndex) -> Option<CompactionTask> {
        let l0_tables: Vec<TableEntry> = index.level(FLUSH_LEVEL).cloned().collect();
        let union = l0_tables
            .iter()
            .map(|e| e.key_range)
            .reduce(|acc, range| acc.union(&range))?;

        let l1_tables: Vec<TableEntry> = index
            .entries_overlapping(union.first, union.last)
            .into_iter()
            .filter(|e| e.level == COMPACTED_LEVEL)
            .cloned()
            .collect();

        debug!(
            l0 = l0_tables.len(),
            l1 = l1_tables.len(),
            "Selected compaction inputs"
        );
        Some(CompactionTask {
            l0_tables,
            l1_tables,
        })
    }
}

/// Merge the task's inputs and write them as level-1 tables.
///
/// Output tables get fresh sequence numbers starting at `first_seq`. On
/// failure every output already written is deleted and the inputs are left
/// untouched.
pub fn execute(
    repo: &dyn FileRepository,
    layout: &MetricLayout,
    config: &CompactionConfig,
    task: &CompactionTask,
    first_seq: u64,
) -> Result<CompactionOutput> {
    info!(
        "Compacting {} L0 tables with {} L1 tables",
        task.l0_tables.len(),
        task.l1_tables.len()
    );

    let mut written: Vec<TableEntry> = Vec::new();
    let result = write_outputs(repo, layout, config, task, first_seq, &mut written);
    if result.is_err() {
        for entry in &written {
            if let Err(e) = repo.delete(&entry.id) {
                warn!("Failed to delete partial compaction output {}: {}", entry.id, e);
            }
        }
    }
    let (samples_written, duplicates_resolved) = result?;

    let next_seq = first_seq + written.len() as u64;
    Ok(CompactionOutput {
        entries: written,
        next_seq,
        samples_written,
        duplicates_resolved,
    })
}

fn write_outputs(
    repo: &dyn FileRepository,
    layout: &MetricLayout,
    config: &CompactionConfig,
    task: &CompactionTask,
    first_seq: u64,
    written: &mut Vec<TableEntry>,
) -> Result<(u64, u64)> {
    let chunk_size = config.target_table_samples.max(1) as usize;

    let mut sources: Vec<SampleStream<'_>> = Vec::with_capacity(task.len());
    for entry in task.inputs() {
        let reader = TableReader::open(repo, &entry.id)?;
        if reader.info().key_range != entry.key_range {
            return Err(MetricError::corrupt(
                &entry.id,
                "key range does not match its index entry",
            ));
        }
        sources.push(Box::new(reader.scan_all()?));
    }

    let mut merge = MergeIter::new(sources);
    let mut chunk: Vec<Sample> = Vec::with_capacity(chunk_size.min(64 * 1024));
    let mut samples_written = 0u64;

    loop {
        let next = merge.next().transpose()?;
        if let Some(sample) = next {
            chunk.push(sample);
            if chunk.len() < chunk_size {
                continue;
            }
        }
        if !chunk.is_empty() {
            let seq = first_seq + written.len() as u64;
            let entry = write_table(repo, layout, seq, &chunk)?;
            samples_written += entry.sample_count;
            written.push(entry);
            chunk.clear();
        }
        if next.is_none() {
            break;
        }
    }

    Ok((samples_written, merge.duplicates()))
}

fn write_table(
    repo: &dyn FileRepository,
    layout: &MetricLayout,
    seq: u64,
    samples: &[Sample],
) -> Result<TableEntry> {
    let id = layout.table_id(seq);
    let info = sstable::write_verified(repo, &id, samples)?;
    Ok(TableEntry {
        id: info.id,
        seq,
        level: COMPACTED_LEVEL,
        key_range: info.key_range,
        sample_count: info.sample_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{FaultOp, MemoryFileRepository};

    fn flushed(
        repo: &MemoryFileRepository,
        layout: &MetricLayout,
        seq: u64,
        samples: &[(u64, f64)],
    ) -> TableEntry {
        let samples: Vec<Sample> = samples.iter().copied().map(Sample::from).collect();
        let info = sstable::write_verified(repo, &layout.table_id(seq), &samples).unwrap();
        TableEntry {
            id: info.id,
            seq,
            level: FLUSH_LEVEL,
            key_range: info.key_range,
            sample_count: info.sample_count,
        }
    }

    fn read_all(repo: &MemoryFileRepository, entries: &[TableEntry]) -> Vec<Sample> {
        entries
            .iter()
            .flat_map(|e| {
                TableReader::open(repo, &e.id)
                    .unwrap()
                    .scan_all()
                    .unwrap()
                    .map(|s| s.unwrap())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn test_policy_thresholds() {
        let repo = MemoryFileRepository::new();
        let layout = MetricLayout::new("cpu").unwrap();
        let policy = CompactionPolicy::new(CompactionConfig {
            l0_trigger: 4,
            overlap_trigger: 2,
            target_table_samples: 100,
        });

        let mut index = TableIndex::new();
        index.add_entry(flushed(&repo, &layout, 1, &[(0, 1.0), (10, 1.0)])).unwrap();
        index.add_entry(flushed(&repo, &layout, 2, &[(20, 1.0), (30, 1.0)])).unwrap();
        assert!(policy.select_compaction(&index).is_none());

        // A second overlap crosses the overlap trigger before the count trigger
        index.add_entry(flushed(&repo, &layout, 3, &[(5, 1.0), (25, 1.0)])).unwrap();
        let task = policy.select_compaction(&index).unwrap();
        assert_eq!(task.l0_tables.len(), 3);
        assert!(task.l1_tables.is_empty());
        assert_eq!(
            task.inputs().iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![3, 2, 1]
        );
    }

    #[test]
    fn test_newest_table_wins() {
        let repo = MemoryFileRepository::new();
        let layout = MetricLayout::new("cpu").unwrap();
        let index = TableIndex::from_entries(vec![
            flushed(&repo, &layout, 1, &[(1, 1.0), (5, 1.0), (9, 1.0)]),
            flushed(&repo, &layout, 2, &[(5, 2.0), (7, 2.0)]),
        ])
        .unwrap();

        let task = CompactionPolicy::plan(&index).unwrap();
        let config = CompactionConfig::default();
        let output = execute(&repo, &layout, &config, &task, 3).unwrap();

        assert_eq!(output.entries.len(), 1);
        assert_eq!(output.next_seq, 4);
        assert_eq!(output.duplicates_resolved, 1);
        assert_eq!(output.entries[0].level, COMPACTED_LEVEL);
        assert_eq!(
            read_all(&repo, &output.entries),
            vec![
                Sample::new(1, 1.0),
                Sample::new(5, 2.0),
                Sample::new(7, 2.0),
                Sample::new(9, 1.0)
            ]
        );
    }

    #[test]
    fn test_output_split_does_not_overlap() {
        let repo = MemoryFileRepository::new();
        let layout = MetricLayout::new("cpu").unwrap();
        let evens: Vec<(u64, f64)> = (0..50).map(|i| (i * 2, 0.0)).collect();
        let odds: Vec<(u64, f64)> = (0..50).map(|i| (i * 2 + 1, 1.0)).collect();
        let index = TableIndex::from_entries(vec![
            flushed(&repo, &layout, 1, &evens),
            flushed(&repo, &layout, 2, &odds),
        ])
        .unwrap();

        let config = CompactionConfig {
            target_table_samples: 30,
            ..Default::default()
        };
        let task = CompactionPolicy::plan(&index).unwrap();
        let output = execute(&repo, &layout, &config, &task, 10).unwrap();

        let counts: Vec<u64> = output.entries.iter().map(|e| e.sample_count).collect();
        assert_eq!(counts, vec![30, 30, 30, 10]);
        assert_eq!(output.samples_written, 100);

        let mut compacted = TableIndex::new();
        for entry in output.entries.clone() {
            compacted.add_entry(entry).unwrap();
        }
        assert_eq!(compacted.overlap_count(), 0);
        let timestamps: Vec<u64> = read_all(&repo, &output.entries)
            .iter()
            .map(|s| s.timestamp)
            .collect();
        assert_eq!(timestamps, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_plan_includes_overlapping_l1_only() {
        let repo = MemoryFileRepository::new();
        let layout = MetricLayout::new("cpu").unwrap();
        let mut low = flushed(&repo, &layout, 1, &[(0, 0.0), (10, 0.0)]);
        low.level = COMPACTED_LEVEL;
        let mut high = flushed(&repo, &layout, 2, &[(100, 0.0), (110, 0.0)]);
        high.level = COMPACTED_LEVEL;
        let fresh = flushed(&repo, &layout, 3, &[(5, 1.0), (8, 1.0)]);
        let index = TableIndex::from_entries(vec![low, high, fresh]).unwrap();

        let task = CompactionPolicy::plan(&index).unwrap();
        assert_eq!(task.l1_tables.len(), 1);
        assert_eq!(task.l1_tables[0].seq, 1);
        assert_eq!(task.input_ids().len(), 2);
    }

    #[test]
    fn test_failed_output_is_removed() {
        let repo = MemoryFileRepository::new();
        let layout = MetricLayout::new("cpu").unwrap();
        let index = TableIndex::from_entries(vec![
            flushed(&repo, &layout, 1, &[(1, 1.0), (2, 1.0), (3, 1.0)]),
            flushed(&repo, &layout, 2, &[(4, 1.0)]),
        ])
        .unwrap();
        let config = CompactionConfig {
            target_table_samples: 2,
            ..Default::default()
        };

        // The second output fails to commit; the first must not survive
        repo.fail_next(FaultOp::Commit, layout.table_id(6));
        let task = CompactionPolicy::plan(&index).unwrap();
        assert!(execute(&repo, &layout, &config, &task, 5).is_err());

        let ids = repo.list().unwrap();
        assert!(!ids.contains(&layout.table_id(5)));
        assert!(!ids.contains(&layout.table_id(6)));
        assert!(ids.contains(&layout.table_id(1)));
        assert!(ids.contains(&layout.table_id(2)));
    }

    #[test]
    fn test_empty_index_has_no_plan() {
        assert!(CompactionPolicy::plan(&TableIndex::new()).is_none());
    }
}
