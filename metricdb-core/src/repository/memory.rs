//! In-memory file repository with fault injection

use super::{validate_id, FileRepository, ReadableFile, WritableFile};
use crate::{MetricError, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

/// Repository operation a fault can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOp {
    /// `create`
    Create,
    /// `WritableFile::commit`
    Commit,
    /// `open`
    Open,
    /// `delete`
    Delete,
}

#[derive(Debug)]
struct Fault {
    op: FaultOp,
    pattern: String,
}

#[derive(Debug, Default)]
struct Inner {
    files: BTreeMap<String, Arc<Vec<u8>>>,
    faults: Vec<Fault>,
}

impl Inner {
    fn take_fault(&mut self, op: FaultOp, id: &str) -> Result<()> {
        let hit = self
            .faults
            .iter()
            .position(|f| f.op == op && id.contains(&f.pattern));
        match hit {
            Some(index) => {
                self.faults.remove(index);
                Err(MetricError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    format!("injected {:?} failure for {}", op, id),
                )))
            }
            None => Ok(()),
        }
    }
}

/// File repository keeping every file in memory.
///
/// Cloning shares the underlying files, which lets a test "restart" by
/// opening a fresh metric over a clone. Faults registered with
/// [`MemoryFileRepository::fail_next`] fire once on the first matching call.
#[derive(Debug, Clone, Default)]
pub struct MemoryFileRepository {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryFileRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `op` whose identifier contains `pattern`
    pub fn fail_next(&self, op: FaultOp, pattern: impl Into<String>) {
        self.inner.lock().faults.push(Fault {
            op,
            pattern: pattern.into(),
        });
    }

    /// Raw bytes of a committed file
    pub fn contents(&self, id: &str) -> Option<Vec<u8>> {
        self.inner.lock().files.get(id).map(|data| data.as_ref().clone())
    }

    /// Overwrite a committed file, bypassing the write path
    pub fn replace_contents(&self, id: &str, data: Vec<u8>) {
        self.inner.lock().files.insert(id.to_string(), Arc::new(data));
    }
}

impl FileRepository for MemoryFileRepository {
    fn create(&self, id: &str) -> Result<Box<dyn WritableFile>> {
        validate_id(id)?;
        self.inner.lock().take_fault(FaultOp::Create, id)?;
        Ok(Box::new(MemoryWritableFile {
            id: id.to_string(),
            buf: Vec::new(),
            inner: Arc::clone(&self.inner),
        }))
    }

    fn open(&self, id: &str) -> Result<Box<dyn ReadableFile>> {
        let mut inner = self.inner.lock();
        inner.take_fault(FaultOp::Open, id)?;
        let data = inner
            .files
            .get(id)
            .cloned()
            .ok_or_else(|| MetricError::NotFound(id.to_string()))?;
        Ok(Box::new(MemoryReadableFile {
            cursor: Cursor::new(SharedBytes(data)),
        }))
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.take_fault(FaultOp::Delete, id)?;
        inner
            .files
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| MetricError::NotFound(id.to_string()))
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().files.keys().cloned().collect())
    }

    fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.inner.lock().files.contains_key(id))
    }
}

struct MemoryWritableFile {
    id: String,
    buf: Vec<u8>,
    inner: Arc<Mutex<Inner>>,
}

impl Write for MemoryWritableFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl WritableFile for MemoryWritableFile {
    fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        let mut inner = this.inner.lock();
        inner.take_fault(FaultOp::Commit, &this.id)?;
        inner.files.insert(this.id, Arc::new(this.buf));
        Ok(())
    }
}

struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

struct MemoryReadableFile {
    cursor: Cursor<SharedBytes>,
}

impl Read for MemoryReadableFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryReadableFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl ReadableFile for MemoryReadableFile {
    fn len(&self) -> Result<u64> {
        Ok(self.cursor.get_ref().0.len() as u64)
    }
}
