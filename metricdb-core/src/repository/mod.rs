//! File repository - durable named storage for table and manifest files
//!
//! The storage engine never touches paths directly. Every on-disk table and
//! manifest is addressed by an identifier and obtained through a
//! [`FileRepository`]. A file becomes visible under its identifier only when
//! its [`WritableFile`] is committed; dropping an uncommitted handle discards
//! the partial file.

mod layout;
mod local;
mod memory;

pub use layout::{FileKind, MetricLayout};
pub use local::LocalFileRepository;
pub use memory::{FaultOp, MemoryFileRepository};

use crate::{MetricError, Result};
use std::io::{Read, Seek, Write};

/// Writable handle returned by [`FileRepository::create`]
pub trait WritableFile: Write + Send {
    /// Make the written bytes durable and visible under the identifier.
    ///
    /// Replaces any existing file with the same identifier atomically.
    fn commit(self: Box<Self>) -> Result<()>;
}

/// Readable handle returned by [`FileRepository::open`]
pub trait ReadableFile: Read + Seek + Send {
    /// Total length in bytes
    fn len(&self) -> Result<u64>;

    /// Check if the file is empty
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Capability supplying durable storage handles keyed by identifier.
///
/// All operations are durable once they return `Ok`.
pub trait FileRepository: Send + Sync {
    /// Start writing a new file
    fn create(&self, id: &str) -> Result<Box<dyn WritableFile>>;

    /// Open a committed file for reading
    fn open(&self, id: &str) -> Result<Box<dyn ReadableFile>>;

    /// Delete a committed file
    fn delete(&self, id: &str) -> Result<()>;

    /// List every committed identifier
    fn list(&self) -> Result<Vec<String>>;

    /// Check whether an identifier has been committed
    fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.list()?.iter().any(|existing| existing == id))
    }
}

/// Reject identifiers that cannot be stored as a single flat file name
pub(crate) fn validate_id(id: &str) -> Result<()> {
    if id.is_empty()
        || id.starts_with('.')
        || id.ends_with(local::TMP_SUFFIX)
        || id.contains(['/', '\\', '\0'])
    {
        return Err(MetricError::InvalidKey(format!(
            "invalid file identifier {:?}",
            id
        )));
    }
    Ok(())
}
