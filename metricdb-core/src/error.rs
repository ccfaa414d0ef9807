//! Error types for MetricDB

use thiserror::Error;

/// Result type alias for MetricDB operations
pub type Result<T> = std::result::Result<T, MetricError>;

type Source = Box<dyn std::error::Error + Send + Sync + 'static>;

/// MetricDB error types
#[derive(Error, Debug)]
pub enum MetricError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Sample rejected at the buffer boundary
    #[error("Invalid sample: {0}")]
    InvalidSample(String),

    /// Metric key or table identifier is not usable
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// The file repository has no file under this identifier
    #[error("Not found: {0}")]
    NotFound(String),

    /// A sorted table failed its length or checksum validation
    #[error("Corrupt table {id}: {reason}")]
    CorruptTable { id: String, reason: String },

    /// Checksum mismatch in a framed record (WAL, manifest)
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Writing a buffer out as a table failed; buffer and index are unchanged
    #[error("Flush failed for metric {metric}: {source}")]
    FlushFailed {
        metric: String,
        #[source]
        source: Source,
    },

    /// Merging tables failed; the previous tables and index are unchanged
    #[error("Compaction failed for metric {metric}: {source}")]
    CompactionFailed {
        metric: String,
        #[source]
        source: Source,
    },

    /// A query was cancelled between table opens
    #[error("Query cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MetricError {
    /// Wrap an error raised while flushing a buffer
    pub fn flush_failed<E>(metric: &str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        MetricError::FlushFailed {
            metric: metric.to_string(),
            source: Box::new(source),
        }
    }

    /// Wrap an error raised while compacting tables
    pub fn compaction_failed(metric: &str, source: MetricError) -> Self {
        MetricError::CompactionFailed {
            metric: metric.to_string(),
            source: Box::new(source),
        }
    }

    /// Build a corruption error for a table
    pub fn corrupt(id: &str, reason: impl Into<String>) -> Self {
        MetricError::CorruptTable {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MetricError::Io(_) | MetricError::FlushFailed { .. } | MetricError::CompactionFailed { .. }
        )
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            MetricError::CorruptTable { .. } | MetricError::ChecksumMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_failed_keeps_source() {
        let err = MetricError::flush_failed("temp", MetricError::NotFound("x".into()));
        assert!(err.is_retryable());
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "Not found: x");
    }

    #[test]
    fn test_corruption_classification() {
        assert!(MetricError::corrupt("t1", "bad checksum").is_corruption());
        assert!(!MetricError::Cancelled.is_corruption());
    }
}
