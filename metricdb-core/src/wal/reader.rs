//! WAL reader for recovery

use super::{parse_segment_id, segment_path, WalEntry};
use crate::{MetricError, Result, Sample};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Samples recovered from one segment, in append order
#[derive(Debug, Clone)]
pub struct RecoveredSegment {
    /// Segment ID
    pub segment_id: u64,
    /// Samples in the order they were logged
    pub samples: Vec<Sample>,
}

/// WAL reader for recovering a metric's segments after a crash
pub struct WalReader {
    dir: PathBuf,
}

impl WalReader {
    /// Create a new WAL reader
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Recover every segment, oldest first
    pub fn recover(&self) -> Result<Vec<RecoveredSegment>> {
        let mut recovered = Vec::new();

        for segment_id in self.segments()? {
            let samples = self.read_segment(segment_id)?;
            info!(
                "Recovered {} samples from WAL segment {} in {:?}",
                samples.len(),
                segment_id,
                self.dir
            );
            recovered.push(RecoveredSegment {
                segment_id,
                samples,
            });
        }

        Ok(recovered)
    }

    /// IDs of the segments present, ascending
    pub fn segments(&self) -> Result<Vec<u64>> {
        let mut segments = Vec::new();

        if !self.dir.exists() {
            return Ok(segments);
        }

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(id) = parse_segment_id(&entry.path()) {
                segments.push(id);
            }
        }

        segments.sort_unstable();
        Ok(segments)
    }

    fn read_segment(&self, segment_id: u64) -> Result<Vec<Sample>> {
        let path = segment_path(&self.dir, segment_id);
        let mut file = File::open(&path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut samples = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            match WalEntry::deserialize_with_checksum(&data[offset..]) {
                Ok(Some((entry, bytes_read))) => {
                    samples.extend(entry.samples()?);
                    offset += bytes_read;
                }
                Ok(None) => {
                    // Incomplete entry at end (crash during write)
                    warn!(
                        "Torn entry at offset {} in {:?}, ignoring {} trailing bytes",
                        offset,
                        path,
                        data.len() - offset
                    );
                    break;
                }
                Err(e @ (MetricError::ChecksumMismatch { .. } | MetricError::InvalidFormat(_))) => {
                    // Corrupted entry, skip rest of segment
                    warn!(
                        "Corrupt entry at offset {} in {:?}, truncating: {}",
                        offset, path, e
                    );
                    break;
                }
                Err(e) => {
                    return Err(e);
                }
            }
        }

        Ok(samples)
    }
}
