//! SSTable (Sorted String Table) implementation
//!
//! Immutable on-disk storage for the samples of one metric. A table is
//! written once, sequentially, from an already sorted source and never
//! modified afterwards; compaction replaces tables instead of editing them.
//!
//! # File format
//!
//! All integers are little-endian.
//!
//! ```text
//! +------------------------------------------------------------+
//! | header:  sample_count u64 | first_key u64 | last_key u64   |
//! +------------------------------------------------------------+
//! | body:    sample_count x { timestamp u64 | value f64 bits } |
//! +------------------------------------------------------------+
//! | trailer: checksum u64 (XXH3-64 over header + body)         |
//! +------------------------------------------------------------+
//! ```

mod reader;
mod writer;

pub use reader::{TableReader, TableScan};
pub use writer::TableWriter;

use crate::repository::FileRepository;
use crate::{KeyRange, MetricError, Result, Sample};

/// Header size in bytes
pub const HEADER_SIZE: u64 = 24;

/// Size of one encoded sample
pub const RECORD_SIZE: u64 = Sample::ENCODED_SIZE as u64;

/// Trailer size in bytes
pub const TRAILER_SIZE: u64 = 8;

/// Metadata of a written or opened table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    /// Repository identifier
    pub id: String,
    /// Number of samples
    pub sample_count: u64,
    /// Closed key range covered by the samples
    pub key_range: KeyRange,
    /// Checksum stored in the trailer
    pub checksum: u64,
}

/// Expected total file length for a table with `sample_count` samples
pub fn expected_len(sample_count: u64) -> Option<u64> {
    sample_count
        .checked_mul(RECORD_SIZE)?
        .checked_add(HEADER_SIZE + TRAILER_SIZE)
}

/// Write `samples` as a table and reopen it to prove it validates.
///
/// The table is only returned once it reads back with the same header and
/// checksum, so an index entry is never published for a table that would
/// fail its own validation.
pub fn write_verified(
    repo: &dyn FileRepository,
    id: &str,
    samples: &[Sample],
) -> Result<TableInfo> {
    let (first, last) = match (samples.first(), samples.last()) {
        (Some(first), Some(last)) => (first.timestamp, last.timestamp),
        _ => {
            return Err(MetricError::Internal(format!(
                "refusing to write empty table {}",
                id
            )))
        }
    };

    let mut writer = TableWriter::create(
        repo,
        id,
        samples.len() as u64,
        KeyRange::new(first, last),
    )?;
    for sample in samples {
        writer.append(*sample)?;
    }
    let written = writer.finish()?;
    verify(repo, &written)?;
    Ok(written)
}

/// Reopen a freshly written table and compare it with what was written
pub fn verify(repo: &dyn FileRepository, written: &TableInfo) -> Result<()> {
    let reopened = TableReader::open(repo, &written.id)?;
    if reopened.info() != written {
        return Err(MetricError::corrupt(
            &written.id,
            "table does not read back as written",
        ));
    }
    Ok(())
}
