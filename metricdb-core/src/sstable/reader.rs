//! SSTable reader for querying samples

use super::{expected_len, TableInfo, HEADER_SIZE, RECORD_SIZE};
use crate::repository::{FileRepository, ReadableFile};
use crate::{KeyRange, MetricError, Result, Sample, Timestamp};
use bytes::Buf;
use std::io::{Read, Seek, SeekFrom};
use xxhash_rust::xxh3::Xxh3;

const VERIFY_CHUNK_RECORDS: usize = 4096;

/// Validated, open table
pub struct TableReader {
    file: Box<dyn ReadableFile>,
    info: TableInfo,
}

impl TableReader {
    /// Open a table, validating its length, ordering and checksum.
    ///
    /// Fails with `NotFound` if the repository has no such identifier and
    /// with `CorruptTable` if the contents do not validate.
    pub fn open(repo: &dyn FileRepository, id: &str) -> Result<Self> {
        let mut file = repo.open(id)?;
        let file_len = file.len()?;
        if file_len < HEADER_SIZE + super::TRAILER_SIZE {
            return Err(MetricError::corrupt(id, format!("file too short: {} bytes", file_len)));
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let mut cursor = &header[..];
        let sample_count = cursor.get_u64_le();
        let first_key = cursor.get_u64_le();
        let last_key = cursor.get_u64_le();

        if expected_len(sample_count) != Some(file_len) {
            return Err(MetricError::corrupt(
                id,
                format!(
                    "length mismatch: header declares {} samples, file has {} bytes",
                    sample_count, file_len
                ),
            ));
        }
        if sample_count == 0 || first_key > last_key {
            return Err(MetricError::corrupt(
                id,
                format!("invalid header: {} samples in [{}, {}]", sample_count, first_key, last_key),
            ));
        }

        let mut hasher = Xxh3::new();
        hasher.update(&header);
        verify_body(id, &mut file, &mut hasher, sample_count, first_key, last_key)?;

        let mut trailer = [0u8; 8];
        file.read_exact(&mut trailer)?;
        let stored = u64::from_le_bytes(trailer);
        let actual = hasher.digest();
        if stored != actual {
            return Err(MetricError::corrupt(
                id,
                format!("checksum mismatch: stored {:#018x}, computed {:#018x}", stored, actual),
            ));
        }

        Ok(Self {
            file,
            info: TableInfo {
                id: id.to_string(),
                sample_count,
                key_range: KeyRange::new(first_key, last_key),
                checksum: stored,
            },
        })
    }

    /// Table metadata
    pub fn info(&self) -> &TableInfo {
        &self.info
    }

    /// Lazy ascending scan of samples with `lo <= timestamp <= hi`.
    ///
    /// Skips ahead with a binary search over the fixed-size records, so
    /// only the matching tail of the body is read sequentially.
    pub fn scan(mut self, lo: Timestamp, hi: Timestamp) -> Result<TableScan> {
        let range = self.info.key_range;
        if lo > hi || !range.overlaps(&KeyRange::new(lo, hi)) {
            return Ok(TableScan::exhausted(self));
        }

        let start = if lo <= range.first {
            0
        } else {
            self.lower_bound(lo)?
        };
        self.file
            .seek(SeekFrom::Start(HEADER_SIZE + start * RECORD_SIZE))?;

        Ok(TableScan {
            next: start,
            end: self.info.sample_count,
            hi,
            reader: self,
            failed: false,
        })
    }

    /// Scan every sample in the table
    pub fn scan_all(self) -> Result<TableScan> {
        self.scan(0, Timestamp::MAX)
    }

    /// Index of the first record with `timestamp >= key`
    fn lower_bound(&mut self, key: Timestamp) -> Result<u64> {
        let mut lo = 0u64;
        let mut hi = self.info.sample_count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.timestamp_at(mid)? < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    fn timestamp_at(&mut self, index: u64) -> Result<Timestamp> {
        self.file
            .seek(SeekFrom::Start(HEADER_SIZE + index * RECORD_SIZE))?;
        let mut buf = [0u8; 8];
        self.file.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

fn verify_body(
    id: &str,
    file: &mut Box<dyn ReadableFile>,
    hasher: &mut Xxh3,
    sample_count: u64,
    first_key: Timestamp,
    last_key: Timestamp,
) -> Result<()> {
    let mut chunk = vec![0u8; VERIFY_CHUNK_RECORDS * RECORD_SIZE as usize];
    let mut remaining = sample_count;
    let mut previous: Option<Timestamp> = None;

    while remaining > 0 {
        let records = remaining.min(VERIFY_CHUNK_RECORDS as u64) as usize;
        let bytes = &mut chunk[..records * RECORD_SIZE as usize];
        file.read_exact(bytes)?;
        hasher.update(bytes);

        let mut cursor = &bytes[..];
        while cursor.has_remaining() {
            let ts = cursor.get_u64_le();
            cursor.advance(8);
            let in_order = match previous {
                Some(prev) => ts > prev,
                None => ts == first_key,
            };
            if !in_order {
                return Err(MetricError::corrupt(
                    id,
                    format!("record {} out of order", sample_count - remaining),
                ));
            }
            previous = Some(ts);
        }
        remaining -= records as u64;
    }

    if previous != Some(last_key) {
        return Err(MetricError::corrupt(id, "last record does not match header"));
    }
    Ok(())
}

/// Lazy iterator over a table's samples
pub struct TableScan {
    reader: TableReader,
    next: u64,
    end: u64,
    hi: Timestamp,
    failed: bool,
}

impl TableScan {
    fn exhausted(reader: TableReader) -> Self {
        Self {
            reader,
            next: 0,
            end: 0,
            hi: 0,
            failed: false,
        }
    }

    fn read_record(&mut self) -> Result<Sample> {
        let mut buf = [0u8; RECORD_SIZE as usize];
        self.reader.file.read_exact(&mut buf)?;
        let mut cursor = &buf[..];
        let timestamp = cursor.get_u64_le();
        let value = f64::from_bits(cursor.get_u64_le());
        Ok(Sample::new(timestamp, value))
    }
}

impl Iterator for TableScan {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next >= self.end {
            return None;
        }
        match self.read_record() {
            Ok(sample) if sample.timestamp > self.hi => {
                self.next = self.end;
                None
            }
            Ok(sample) => {
                self.next += 1;
                Some(Ok(sample))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
