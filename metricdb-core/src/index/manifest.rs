//! Persisted table index
//!
//! Format:
//! - 4 bytes: payload length
//! - 4 bytes: CRC32 of the payload
//! - N bytes: bincode-encoded [`Manifest`]

use super::{TableEntry, TableIndex};
use crate::repository::{FileRepository, MetricLayout};
use crate::{MetricError, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Manifest format version
pub const MANIFEST_VERSION: u32 = 1;

/// Durable record of a metric's tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Format version
    pub version: u32,
    /// Metric key, for diagnostics
    pub metric: String,
    /// Next table sequence number to hand out
    pub next_seq: u64,
    /// Newest write buffer generation whose samples are in a table
    pub flushed_generation: u64,
    /// Current tables
    pub entries: Vec<TableEntry>,
}

impl Manifest {
    /// Snapshot an index into a manifest
    pub fn new(metric: &str, next_seq: u64, flushed_generation: u64, index: &TableIndex) -> Self {
        Self {
            version: MANIFEST_VERSION,
            metric: metric.to_string(),
            next_seq,
            flushed_generation,
            entries: index.entries().to_vec(),
        }
    }

    /// Load the manifest of a metric, if one has been committed
    pub fn load(repo: &dyn FileRepository, layout: &MetricLayout) -> Result<Option<Self>> {
        let id = layout.manifest_id();
        let mut file = match repo.open(&id) {
            Ok(file) => file,
            Err(MetricError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Self::decode(&data).map(Some)
    }

    /// Replace the metric's manifest atomically
    pub fn store(&self, repo: &dyn FileRepository, layout: &MetricLayout) -> Result<()> {
        let encoded = self.encode()?;
        let mut file = repo.create(&layout.manifest_id())?;
        file.write_all(&encoded)?;
        file.commit()
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let payload =
            bincode::serialize(self).map_err(|e| MetricError::InvalidFormat(e.to_string()))?;

        let mut buf = BytesMut::with_capacity(8 + payload.len());
        buf.put_u32_le(payload.len() as u32);
        buf.put_u32_le(crc32fast::hash(&payload));
        buf.put_slice(&payload);
        Ok(buf.to_vec())
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(MetricError::InvalidFormat("Manifest too short".into()));
        }

        let mut cursor = data;
        let len = cursor.get_u32_le() as usize;
        let expected = cursor.get_u32_le();
        if cursor.len() != len {
            return Err(MetricError::InvalidFormat(format!(
                "Manifest length mismatch: header says {}, found {}",
                len,
                cursor.len()
            )));
        }

        let actual = crc32fast::hash(cursor);
        if expected != actual {
            return Err(MetricError::ChecksumMismatch { expected, actual });
        }

        let manifest: Manifest =
            bincode::deserialize(cursor).map_err(|e| MetricError::InvalidFormat(e.to_string()))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(MetricError::InvalidFormat(format!(
                "Unsupported manifest version: {}",
                manifest.version
            )));
        }
        Ok(manifest)
    }
}
