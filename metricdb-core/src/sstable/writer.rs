//! SSTable writer for persisting sorted samples

use super::{TableInfo, HEADER_SIZE};
use crate::repository::{FileRepository, WritableFile};
use crate::{KeyRange, MetricError, Result, Sample, Timestamp};
use bytes::{BufMut, BytesMut};
use std::io::Write;
use xxhash_rust::xxh3::Xxh3;

const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Streaming table writer.
///
/// The header is written up front, so the caller declares the sample count
/// and key range before appending. `finish` fails if the appended samples do
/// not match the declaration; the file is then discarded uncommitted.
pub struct TableWriter {
    id: String,
    file: Box<dyn WritableFile>,
    hasher: Xxh3,
    buf: BytesMut,
    declared_count: u64,
    declared_range: KeyRange,
    written: u64,
    last_key: Option<Timestamp>,
}

impl TableWriter {
    /// Create a table file and write its header
    pub fn create(
        repo: &dyn FileRepository,
        id: &str,
        sample_count: u64,
        key_range: KeyRange,
    ) -> Result<Self> {
        if sample_count == 0 || key_range.is_empty() {
            return Err(MetricError::Internal(format!(
                "invalid table declaration for {}: {} samples in {:?}",
                id, sample_count, key_range
            )));
        }

        let file = repo.create(id)?;
        let mut writer = Self {
            id: id.to_string(),
            file,
            hasher: Xxh3::new(),
            buf: BytesMut::with_capacity(WRITE_BUFFER_SIZE),
            declared_count: sample_count,
            declared_range: key_range,
            written: 0,
            last_key: None,
        };

        writer.buf.put_u64_le(sample_count);
        writer.buf.put_u64_le(key_range.first);
        writer.buf.put_u64_le(key_range.last);
        debug_assert_eq!(writer.buf.len() as u64, HEADER_SIZE);

        Ok(writer)
    }

    /// Append the next sample; timestamps must be strictly ascending
    pub fn append(&mut self, sample: Sample) -> Result<()> {
        match self.last_key {
            Some(last) if sample.timestamp <= last => {
                return Err(MetricError::Internal(format!(
                    "out of order sample {} after {} in table {}",
                    sample.timestamp, last, self.id
                )));
            }
            None if sample.timestamp != self.declared_range.first => {
                return Err(MetricError::Internal(format!(
                    "table {} does not start at its declared first key {}",
                    self.id, self.declared_range.first
                )));
            }
            _ => {}
        }
        if !self.declared_range.contains(sample.timestamp) {
            return Err(MetricError::Internal(format!(
                "sample {} outside declared range {:?} of table {}",
                sample.timestamp, self.declared_range, self.id
            )));
        }
        if self.written == self.declared_count {
            return Err(MetricError::Internal(format!(
                "more than {} samples appended to table {}",
                self.declared_count, self.id
            )));
        }

        self.buf.put_u64_le(sample.timestamp);
        self.buf.put_u64_le(sample.value.to_bits());
        self.written += 1;
        self.last_key = Some(sample.timestamp);

        if self.buf.len() >= WRITE_BUFFER_SIZE {
            self.drain()?;
        }
        Ok(())
    }

    /// Write the trailer and commit the file
    pub fn finish(mut self) -> Result<TableInfo> {
        if self.written != self.declared_count {
            return Err(MetricError::Internal(format!(
                "table {} declared {} samples but got {}",
                self.id, self.declared_count, self.written
            )));
        }
        if self.last_key != Some(self.declared_range.last) {
            return Err(MetricError::Internal(format!(
                "table {} does not end at its declared last key {}",
                self.id, self.declared_range.last
            )));
        }

        self.drain()?;
        let checksum = self.hasher.digest();
        self.file.write_all(&checksum.to_le_bytes())?;
        self.file.commit()?;

        Ok(TableInfo {
            id: self.id,
            sample_count: self.declared_count,
            key_range: self.declared_range,
            checksum,
        })
    }

    fn drain(&mut self) -> Result<()> {
        self.hasher.update(&self.buf);
        self.file.write_all(&self.buf)?;
        self.buf.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryFileRepository;

    #[test]
    fn test_rejects_out_of_order() {
        let repo = MemoryFileRepository::new();
        let mut writer = TableWriter::create(&repo, "t.sst", 2, KeyRange::new(1, 5)).unwrap();
        writer.append(Sample::new(5, 0.0)).unwrap();
        assert!(writer.append(Sample::new(1, 0.0)).is_err());
    }

    #[test]
    fn test_short_table_is_not_committed() {
        let repo = MemoryFileRepository::new();
        let mut writer = TableWriter::create(&repo, "t.sst", 3, KeyRange::new(1, 3)).unwrap();
        writer.append(Sample::new(1, 0.0)).unwrap();
        writer.append(Sample::new(3, 0.0)).unwrap();
        assert!(writer.finish().is_err());
        assert!(!repo.exists("t.sst").unwrap());
    }

    #[test]
    fn test_first_key_must_match_declaration() {
        let repo = MemoryFileRepository::new();
        let mut writer = TableWriter::create(&repo, "t.sst", 2, KeyRange::new(1, 3)).unwrap();
        assert!(writer.append(Sample::new(2, 0.0)).is_err());
    }
}
