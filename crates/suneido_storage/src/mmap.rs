//! Memory-mapped storage backend.
//!
//! The file grows in fixed-size chunks. Appends land in the mapping and the
//! logical size tracks how much of the mapping holds data. On drop the file
//! is cut back to the logical size, so a cleanly closed file carries no
//! slack.
//!
//! ## Crash Behavior
//!
//! A process that dies without dropping the backend leaves the file at its
//! chunk-rounded length. The bytes past the last append are zero. Reopening
//! such a file reports the full chunk-rounded length as the size; the engine
//! trims the zero tail itself before scanning blocks.
//!
//! ## Remapping
//!
//! Growing replaces the mapping. Every method that can grow takes `&mut self`,
//! and reads copy out of the mapping, so no borrowed slice outlives a remap.

#![allow(unsafe_code)]

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Default growth increment for memory-mapped files (4 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// A memory-mapped, chunk-growing storage backend.
///
/// # Example
///
/// ```no_run
/// use suneido_storage::{StorageBackend, MmapBackend, DEFAULT_CHUNK_SIZE};
/// use std::path::Path;
///
/// let mut backend = MmapBackend::open(Path::new("suneido.db"), DEFAULT_CHUNK_SIZE).unwrap();
/// backend.append(b"data").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct MmapBackend {
    path: PathBuf,
    file: File,
    mmap: Option<MmapMut>,
    capacity: u64,
    size: u64,
    chunk_size: u64,
}

impl MmapBackend {
    /// Opens or creates a memory-mapped file.
    ///
    /// The logical size starts at the current file length.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or mapped.
    pub fn open(path: &Path, chunk_size: u64) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();
        Self::with_file(path, file, size, chunk_size)
    }

    /// Creates a new, empty memory-mapped file, replacing any existing one.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or mapped.
    pub fn create(path: &Path, chunk_size: u64) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::with_file(path, file, 0, chunk_size)
    }

    fn with_file(path: &Path, file: File, size: u64, chunk_size: u64) -> StorageResult<Self> {
        let chunk_size = chunk_size.max(4096);
        let mut backend = Self {
            path: path.to_path_buf(),
            file,
            mmap: None,
            capacity: 0,
            size,
            chunk_size,
        };
        backend.remap(size)?;
        Ok(backend)
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of mapped bytes, including unused slack.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn remap(&mut self, capacity: u64) -> StorageResult<()> {
        if let Some(mmap) = self.mmap.take() {
            mmap.flush()?;
        }
        if self.file.metadata()?.len() != capacity {
            self.file.set_len(capacity)?;
        }
        self.capacity = capacity;
        if capacity == 0 {
            return Ok(());
        }
        // SAFETY: the file is opened read-write by this backend and the
        // mapping length equals the file length set just above. Callers only
        // reach the mapping through methods that copy in or out of it, and
        // remapping requires `&mut self`, so no slice into the old mapping
        // can outlive it.
        let mmap = unsafe { MmapOptions::new().len(capacity as usize).map_mut(&self.file)? };
        self.mmap = Some(mmap);
        Ok(())
    }

    fn ensure_capacity(&mut self, needed: u64) -> StorageResult<()> {
        if needed <= self.capacity {
            return Ok(());
        }
        let chunks = needed.div_ceil(self.chunk_size);
        self.remap(chunks * self.chunk_size)
    }

    fn mapped(&self) -> StorageResult<&MmapMut> {
        self.mmap.as_ref().ok_or(StorageError::Closed)
    }

    fn mapped_mut(&mut self) -> StorageResult<&mut MmapMut> {
        self.mmap.as_mut().ok_or(StorageError::Closed)
    }
}

impl StorageBackend for MmapBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = self.size;
        let end = offset.saturating_add(len as u64);
        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        if len == 0 {
            return Ok(Vec::new());
        }
        let mmap = self.mapped()?;
        Ok(mmap[offset as usize..end as usize].to_vec())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let offset = self.size;
        if data.is_empty() {
            return Ok(offset);
        }
        let end = offset + data.len() as u64;
        self.ensure_capacity(end)?;
        let mmap = self.mapped_mut()?;
        mmap[offset as usize..end as usize].copy_from_slice(data);
        self.size = end;
        Ok(offset)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let size = self.size;
        let end = offset.saturating_add(data.len() as u64);
        if offset > size || end > size {
            return Err(StorageError::WritePastEnd {
                offset,
                len: data.len(),
                size,
            });
        }
        if data.is_empty() {
            return Ok(());
        }
        let mmap = self.mapped_mut()?;
        mmap[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        if let Some(mmap) = &self.mmap {
            mmap.flush()?;
        }
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.size)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        if new_size > self.size {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "cannot truncate to size {} which is greater than current size {}",
                    new_size, self.size
                ),
            )));
        }
        self.size = new_size;
        self.remap(new_size)?;
        self.file.sync_all()?;
        Ok(())
    }
}

impl Drop for MmapBackend {
    fn drop(&mut self) {
        if let Some(mmap) = self.mmap.take() {
            let _ = mmap.flush();
        }
        let _ = self.file.set_len(self.size);
        let _ = self.file.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const CHUNK: u64 = 4096;

    #[test]
    fn mmap_create_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let backend = MmapBackend::create(&path, CHUNK).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert_eq!(backend.capacity(), 0);
        assert_eq!(backend.path(), path);
    }

    #[test]
    fn mmap_append_grows_in_chunks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut backend = MmapBackend::create(&path, CHUNK).unwrap();
        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.capacity(), CHUNK);

        let big = vec![7u8; 5000];
        assert_eq!(backend.append(&big).unwrap(), 5);
        assert_eq!(backend.size().unwrap(), 5005);
        assert_eq!(backend.capacity(), 2 * CHUNK);
        assert_eq!(backend.read_at(0, 5).unwrap(), b"hello");
        assert_eq!(backend.read_at(5, 5000).unwrap(), big);
    }

    #[test]
    fn mmap_drop_trims_to_logical_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let mut backend = MmapBackend::create(&path, CHUNK).unwrap();
            backend.append(b"persistent").unwrap();
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10);

        let backend = MmapBackend::open(&path, CHUNK).unwrap();
        assert_eq!(backend.read_at(0, 10).unwrap(), b"persistent");
    }

    #[test]
    fn mmap_write_at_and_bounds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut backend = MmapBackend::create(&path, CHUNK).unwrap();
        backend.append(&[0u8; 8]).unwrap();
        backend.write_at(4, b"abcd").unwrap();
        assert_eq!(backend.read_at(4, 4).unwrap(), b"abcd");
        assert!(matches!(
            backend.write_at(6, b"xyz"),
            Err(StorageError::WritePastEnd { .. })
        ));
        assert!(matches!(
            backend.read_at(6, 8),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn mmap_truncate_and_append_again() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut backend = MmapBackend::create(&path, CHUNK).unwrap();
        backend.append(b"hello world").unwrap();
        backend.truncate(5).unwrap();
        assert_eq!(backend.size().unwrap(), 5);
        assert_eq!(backend.append(b"!").unwrap(), 5);
        assert_eq!(backend.read_at(0, 6).unwrap(), b"hello!");
    }
}
