//! Directory-backed file repository

use super::{validate_id, FileRepository, ReadableFile, WritableFile};
use crate::{MetricError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

pub(crate) const TMP_SUFFIX: &str = ".tmp";

/// File repository storing each identifier as one file in a directory.
///
/// New files are written to `{id}.tmp` and renamed into place on commit,
/// so a crash never exposes a half-written file under its identifier.
#[derive(Debug, Clone)]
pub struct LocalFileRepository {
    dir: PathBuf,
}

impl LocalFileRepository {
    /// Open (creating if needed) a repository rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Remove temp files left behind by interrupted writes
    pub fn remove_partial_files(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_tmp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(TMP_SUFFIX));
            if is_tmp {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn path_of(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.dir.join(id))
    }
}

impl FileRepository for LocalFileRepository {
    fn create(&self, id: &str) -> Result<Box<dyn WritableFile>> {
        let path = self.path_of(id)?;
        let tmp_path = self.dir.join(format!("{}{}", id, TMP_SUFFIX));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        Ok(Box::new(LocalWritableFile {
            file: Some(BufWriter::new(file)),
            tmp_path,
            path,
            dir: self.dir.clone(),
        }))
    }

    fn open(&self, id: &str) -> Result<Box<dyn ReadableFile>> {
        let path = self.path_of(id)?;
        let file = File::open(&path).map_err(|e| not_found_or_io(e, id))?;
        let len = file.metadata()?.len();
        Ok(Box::new(LocalReadableFile {
            reader: BufReader::new(file),
            len,
        }))
    }

    fn delete(&self, id: &str) -> Result<()> {
        let path = self.path_of(id)?;
        fs::remove_file(&path).map_err(|e| not_found_or_io(e, id))?;
        sync_dir(&self.dir)
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || name.ends_with(TMP_SUFFIX) {
                continue;
            }
            ids.push(name);
        }
        ids.sort();
        Ok(ids)
    }

    fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.path_of(id)?.is_file())
    }
}

struct LocalWritableFile {
    file: Option<BufWriter<File>>,
    tmp_path: PathBuf,
    path: PathBuf,
    dir: PathBuf,
}

impl Write for LocalWritableFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "file already committed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl WritableFile for LocalWritableFile {
    fn commit(mut self: Box<Self>) -> Result<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| MetricError::Internal("file already committed".into()))?;
        let published = file
            .flush()
            .and_then(|_| file.get_ref().sync_all())
            .and_then(|_| fs::rename(&self.tmp_path, &self.path));
        if let Err(e) = published {
            let _ = fs::remove_file(&self.tmp_path);
            return Err(e.into());
        }
        sync_dir(&self.dir)
    }
}

impl Drop for LocalWritableFile {
    fn drop(&mut self) {
        // Uncommitted: discard the partial file
        if self.file.take().is_some() {
            if let Err(e) = fs::remove_file(&self.tmp_path) {
                warn!("Failed to remove partial file {:?}: {}", self.tmp_path, e);
            }
        }
    }
}

struct LocalReadableFile {
    reader: BufReader<File>,
    len: u64,
}

impl Read for LocalReadableFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for LocalReadableFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl ReadableFile for LocalReadableFile {
    fn len(&self) -> Result<u64> {
        Ok(self.len)
    }
}

fn not_found_or_io(e: io::Error, id: &str) -> MetricError {
    if e.kind() == io::ErrorKind::NotFound {
        MetricError::NotFound(id.to_string())
    } else {
        MetricError::Io(e)
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_commit_open() {
        let temp_dir = TempDir::new().unwrap();
        let repo = LocalFileRepository::new(temp_dir.path()).unwrap();

        let mut file = repo.create("a.sst").unwrap();
        file.write_all(b"hello").unwrap();
        assert!(!repo.exists("a.sst").unwrap());
        file.commit().unwrap();

        assert_eq!(repo.list().unwrap(), vec!["a.sst".to_string()]);
        let mut reader = repo.open("a.sst").unwrap();
        assert_eq!(reader.len().unwrap(), 5);
        let mut content = String::new();
        reader.read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello");
    }

    #[test]
    fn test_uncommitted_file_is_discarded() {
        let temp_dir = TempDir::new().unwrap();
        let repo = LocalFileRepository::new(temp_dir.path()).unwrap();

        {
            let mut file = repo.create("b.sst").unwrap();
            file.write_all(b"partial").unwrap();
        }

        assert!(repo.list().unwrap().is_empty());
        assert_eq!(repo.remove_partial_files().unwrap(), 0);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let repo = LocalFileRepository::new(temp_dir.path()).unwrap();

        assert!(matches!(repo.open("nope.sst"), Err(MetricError::NotFound(_))));
        assert!(matches!(repo.delete("nope.sst"), Err(MetricError::NotFound(_))));
    }
}
