//! WAL entry types and serialization

use crate::{MetricError, Result, Sample};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// WAL entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalEntryType {
    /// One sample, raw 16-byte payload
    Sample = 1,
    /// Several samples, bincode payload
    Batch = 2,
}

impl TryFrom<u8> for WalEntryType {
    type Error = MetricError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WalEntryType::Sample),
            2 => Ok(WalEntryType::Batch),
            _ => Err(MetricError::InvalidFormat(format!(
                "Invalid WAL entry type: {}",
                value
            ))),
        }
    }
}

/// A single WAL entry
#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    /// Entry type
    pub entry_type: WalEntryType,
    /// Entry payload (serialized)
    pub payload: Vec<u8>,
}

impl WalEntry {
    /// Create an entry for one sample
    pub fn sample(sample: &Sample) -> Self {
        let mut payload = Vec::with_capacity(Sample::ENCODED_SIZE);
        payload.put_u64_le(sample.timestamp);
        payload.put_u64_le(sample.value.to_bits());
        Self {
            entry_type: WalEntryType::Sample,
            payload,
        }
    }

    /// Create an entry for a batch of samples
    pub fn batch(samples: &[Sample]) -> Result<Self> {
        let payload =
            bincode::serialize(samples).map_err(|e| MetricError::InvalidFormat(e.to_string()))?;
        Ok(Self {
            entry_type: WalEntryType::Batch,
            payload,
        })
    }

    /// Serialize the entry with length prefix and CRC checksum
    ///
    /// Format:
    /// - 4 bytes: entry length (excluding this field)
    /// - 1 byte: entry type
    /// - N bytes: payload
    /// - 4 bytes: CRC32 checksum of type and payload
    pub fn serialize_with_checksum(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9 + self.payload.len());

        // Reserve space for length prefix
        buf.put_u32_le(0);
        buf.put_u8(self.entry_type as u8);
        buf.put_slice(&self.payload);

        let checksum = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(checksum);

        let len = (buf.len() - 4) as u32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());

        buf.freeze()
    }

    /// Deserialize an entry from the front of `data`.
    ///
    /// Returns `Ok(None)` when `data` ends before the entry does, which is
    /// how a write torn by a crash looks.
    pub fn deserialize_with_checksum(data: &[u8]) -> Result<Option<(Self, usize)>> {
        if data.len() < 4 {
            return Ok(None);
        }

        let mut cursor = data;
        let len = cursor.get_u32_le() as usize;
        if len < 5 {
            return Err(MetricError::InvalidFormat(format!(
                "WAL entry length {} too small",
                len
            )));
        }
        if cursor.len() < len {
            return Ok(None);
        }

        let entry_data = &data[4..4 + len];
        let (body, checksum) = entry_data.split_at(len - 4);
        let expected = u32::from_le_bytes([checksum[0], checksum[1], checksum[2], checksum[3]]);
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(MetricError::ChecksumMismatch { expected, actual });
        }

        let entry = WalEntry {
            entry_type: WalEntryType::try_from(body[0])?,
            payload: body[1..].to_vec(),
        };
        Ok(Some((entry, 4 + len)))
    }

    /// Get the samples carried by this entry
    pub fn samples(&self) -> Result<Vec<Sample>> {
        match self.entry_type {
            WalEntryType::Sample => {
                if self.payload.len() != Sample::ENCODED_SIZE {
                    return Err(MetricError::InvalidFormat(format!(
                        "WAL sample payload of {} bytes",
                        self.payload.len()
                    )));
                }
                let mut cursor = &self.payload[..];
                let timestamp = cursor.get_u64_le();
                let value = f64::from_bits(cursor.get_u64_le());
                Ok(vec![Sample::new(timestamp, value)])
            }
            WalEntryType::Batch => bincode::deserialize(&self.payload)
                .map_err(|e| MetricError::InvalidFormat(e.to_string())),
        }
    }
}
