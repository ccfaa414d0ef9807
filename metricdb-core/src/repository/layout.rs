//! Naming of the files that belong to one metric

use crate::{MetricError, Result};
use std::path::{Path, PathBuf};

const TABLE_EXTENSION: &str = "sst";
const MANIFEST_EXTENSION: &str = "manifest";

/// Kind of a repository file owned by a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Sorted table with its creation sequence number
    Table(u64),
    /// Persisted table index
    Manifest,
}

/// Identifier scheme for one metric.
///
/// Identifiers are `{prefix}.{seq:020}.sst` and `{prefix}.manifest`, where
/// the prefix is the metric key with every byte outside `[A-Za-z0-9_-]`
/// percent-escaped. The prefix never contains a `.`, so parsing splits at
/// the first one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricLayout {
    prefix: String,
}

impl MetricLayout {
    /// Create the layout for a metric key
    pub fn new(metric_key: &str) -> Result<Self> {
        if metric_key.is_empty() {
            return Err(MetricError::InvalidKey("metric key is empty".into()));
        }
        Ok(Self {
            prefix: encode_key(metric_key),
        })
    }

    /// Escaped key used as the identifier prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Identifier of the table with the given sequence number
    pub fn table_id(&self, seq: u64) -> String {
        format!("{}.{:020}.{}", self.prefix, seq, TABLE_EXTENSION)
    }

    /// Identifier of the metric's manifest
    pub fn manifest_id(&self) -> String {
        format!("{}.{}", self.prefix, MANIFEST_EXTENSION)
    }

    /// Directory holding this metric's WAL segments
    pub fn wal_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.prefix)
    }

    /// Classify an identifier, returning `None` if another metric owns it
    pub fn classify(&self, id: &str) -> Option<FileKind> {
        let (prefix, rest) = id.split_once('.')?;
        if prefix != self.prefix {
            return None;
        }
        if rest == MANIFEST_EXTENSION {
            return Some(FileKind::Manifest);
        }
        let seq = rest.strip_suffix(TABLE_EXTENSION)?.strip_suffix('.')?;
        seq.parse().ok().map(FileKind::Table)
    }

    /// Recover the metric key from a manifest identifier
    pub fn metric_key_of_manifest(id: &str) -> Option<String> {
        let prefix = id.strip_suffix(MANIFEST_EXTENSION)?.strip_suffix('.')?;
        Self::metric_key_of_prefix(prefix)
    }

    /// Recover the metric key from an escaped prefix
    pub fn metric_key_of_prefix(prefix: &str) -> Option<String> {
        if prefix.is_empty() || prefix.contains('.') {
            return None;
        }
        decode_key(prefix)
    }
}

fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn decode_key(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
