//! Append-only block storage.
//!
//! [`Storage`] turns an opaque [`StorageBackend`] into an arena of typed,
//! length-prefixed blocks addressed by logical byte offset:
//!
//! ```text
//! offset 0: "SUNEIDB1"
//! offset 8: block | block | block | ...
//! ```
//!
//! ## Invariants
//!
//! - Every block starts on an 8-byte boundary
//! - Committed bytes are never rewritten; superseded blocks are orphaned
//!   until compaction
//! - Appends happen on one thread at a time (the committing thread)
//! - Iterators never fail mid-scan: a bad tag or length ends the scan and is
//!   reported through `corruption()`

mod block;
mod iter;

pub use block::{
    align, block_size, decode_data, encode_data, feed_data, feeds_checksum, now_millis, Block,
    BlockType, CommitInfo, SessionInfo, SessionKind, ALIGN, BLOCK_HEADER_SIZE,
    BLOCK_TRAILER_SIZE,
};
pub use iter::{BlockIter, Corruption, RevBlockIter};

pub(crate) use block::read_u64;

use crate::error::{CoreError, CoreResult};
use crate::types::Address;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use suneido_storage::{InMemoryBackend, StorageBackend};
use tracing::warn;

/// Magic bytes at the start of every database file.
pub const FILE_MAGIC: [u8; 8] = *b"SUNEIDB1";

/// Address of the first block.
pub const FIRST_BLOCK: Address = Address(FILE_MAGIC.len() as u64);

const TAIL_SCAN_CHUNK: u64 = 64 * 1024;

/// A block arena over a storage backend.
pub struct Storage {
    backend: RwLock<Box<dyn StorageBackend>>,
    end: AtomicU64,
    read_only: bool,
}

impl Storage {
    /// Initializes an empty backend with the file header.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is not empty or the header cannot be written.
    pub fn create(mut backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        if backend.size()? != 0 {
            return Err(CoreError::invalid_operation(
                "cannot create storage over a non-empty backend",
            ));
        }
        backend.append(&FILE_MAGIC)?;
        let end = backend.size()?;
        Ok(Self {
            read_only: backend.is_read_only(),
            backend: RwLock::new(backend),
            end: AtomicU64::new(end),
        })
    }

    /// Creates heap-backed storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be written.
    pub fn in_memory() -> CoreResult<Self> {
        Self::create(Box::new(InMemoryBackend::new()))
    }

    /// Opens an existing arena.
    ///
    /// Validates the header and drops an all-zero tail, which is what a
    /// memory-mapped file looks like after a crash.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the header is missing or wrong.
    pub fn open(mut backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let size = backend.size()?;
        if size < FILE_MAGIC.len() as u64 {
            return Err(CoreError::invalid_format("file too short for a database header"));
        }
        let magic = backend.read_at(0, FILE_MAGIC.len())?;
        if magic != FILE_MAGIC {
            return Err(CoreError::invalid_format("not a database file"));
        }

        let end = data_end(backend.as_ref(), size)?;
        if end < size {
            warn!(size, end, "ignoring zero tail");
            if !backend.is_read_only() {
                backend.truncate(end)?;
            }
        }

        Ok(Self {
            read_only: backend.is_read_only(),
            backend: RwLock::new(backend),
            end: AtomicU64::new(end),
        })
    }

    /// Returns true if the backend rejects writes.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Logical size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.end.load(Ordering::Acquire)
    }

    /// Address just past the last byte.
    #[must_use]
    pub fn end(&self) -> Address {
        Address(self.size())
    }

    /// Reserves `n` bytes, rounded up to the alignment, at the end.
    ///
    /// The reserved region reads as zeros until filled with [`Storage::write`].
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot grow.
    pub fn alloc(&self, n: u64) -> CoreResult<Address> {
        self.ensure_writable()?;
        let mut backend = self.backend.write();
        let adr = backend.append(&vec![0u8; align(n) as usize])?;
        self.end.store(backend.size()?, Ordering::Release);
        Ok(Address(adr))
    }

    /// Fills part of a reserved region.
    ///
    /// # Errors
    ///
    /// Returns an error if the range lies past the end.
    pub fn write(&self, adr: Address, data: &[u8]) -> CoreResult<()> {
        self.ensure_writable()?;
        self.backend.write().write_at(adr.0, data)?;
        Ok(())
    }

    /// Reads `len` committed bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the range lies past the end.
    pub fn read(&self, adr: Address, len: usize) -> CoreResult<Bytes> {
        let end = self.size();
        if adr.0.saturating_add(len as u64) > end {
            return Err(CoreError::corrupted(
                adr.0,
                format!("read of {len} bytes past end {end}"),
            ));
        }
        Ok(Bytes::from(self.backend.read().read_at(adr.0, len)?))
    }

    /// Appends a block and returns its address.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot grow.
    pub fn append_block(
        &self,
        block_type: BlockType,
        payload: &[u8],
        checksum: u32,
    ) -> CoreResult<Address> {
        self.ensure_writable()?;
        let total = block_size(payload.len() as u64);
        let mut buf = Vec::with_capacity(total as usize);
        buf.push(block_type.as_byte());
        buf.extend_from_slice(&[0, 0, 0]);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        buf.resize((total - BLOCK_TRAILER_SIZE) as usize, 0);
        buf.extend_from_slice(&(total as u32).to_le_bytes());
        buf.extend_from_slice(&checksum.to_le_bytes());

        let mut backend = self.backend.write();
        let adr = backend.append(&buf)?;
        self.end.store(backend.size()?, Ordering::Release);
        Ok(Address(adr))
    }

    /// Reads and validates the block at `adr`.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if the header or trailer is invalid.
    pub fn read_block(&self, adr: Address) -> CoreResult<Block> {
        self.read_block_before(adr, self.size())
    }

    pub(crate) fn read_block_before(&self, adr: Address, limit: u64) -> CoreResult<Block> {
        if adr.0 < FIRST_BLOCK.0 || adr.0 % ALIGN != 0 {
            return Err(CoreError::corrupted(adr.0, "misaligned block address"));
        }
        if adr.0 + BLOCK_HEADER_SIZE + BLOCK_TRAILER_SIZE > limit {
            return Err(CoreError::corrupted(adr.0, "block header past end"));
        }
        let backend = self.backend.read();
        let header = backend.read_at(adr.0, BLOCK_HEADER_SIZE as usize)?;
        let block_type = BlockType::from_byte(header[0])
            .ok_or_else(|| CoreError::corrupted(adr.0, format!("invalid block tag {}", header[0])))?;
        if header[1..4] != [0, 0, 0] {
            return Err(CoreError::corrupted(adr.0, "invalid block header"));
        }
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as u64;
        let total = block_size(len);
        if adr.0 + total > limit {
            return Err(CoreError::corrupted(
                adr.0,
                format!("block length {len} past end"),
            ));
        }
        let body = backend.read_at(adr.0 + BLOCK_HEADER_SIZE, (total - BLOCK_HEADER_SIZE) as usize)?;
        let trailer = &body[body.len() - BLOCK_TRAILER_SIZE as usize..];
        let stored_total = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if u64::from(stored_total) != total {
            return Err(CoreError::corrupted(adr.0, "block trailer length mismatch"));
        }
        let checksum = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);
        let mut body = body;
        body.truncate(len as usize);
        Ok(Block {
            adr,
            block_type,
            payload: Bytes::from(body),
            checksum,
        })
    }

    /// Iterates forward from the first block.
    #[must_use]
    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter::new(self, FIRST_BLOCK, self.end())
    }

    /// Iterates forward over `[from, to)`.
    #[must_use]
    pub fn iter_range(&self, from: Address, to: Address) -> BlockIter<'_> {
        BlockIter::new(self, from, to)
    }

    /// Iterates backward from the end.
    #[must_use]
    pub fn rev_iter(&self) -> RevBlockIter<'_> {
        RevBlockIter::new(self, self.end())
    }

    /// Iterates backward from `end`.
    #[must_use]
    pub fn rev_iter_from(&self, end: Address) -> RevBlockIter<'_> {
        RevBlockIter::new(self, end)
    }

    /// Pushes appended data to the OS.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn flush(&self) -> CoreResult<()> {
        if self.read_only {
            return Ok(());
        }
        self.backend.write().flush()?;
        Ok(())
    }

    /// Makes appended data durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> CoreResult<()> {
        if self.read_only {
            return Ok(());
        }
        self.backend.write().sync()?;
        Ok(())
    }

    /// Discards everything at or after `end`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage is read-only or truncation fails.
    pub fn truncate(&self, end: Address) -> CoreResult<()> {
        self.ensure_writable()?;
        let mut backend = self.backend.write();
        backend.truncate(end.0)?;
        self.end.store(end.0, Ordering::Release);
        Ok(())
    }

    /// Copies the whole arena.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    pub fn to_vec(&self) -> CoreResult<Vec<u8>> {
        let size = self.size();
        Ok(self.backend.read().read_at(0, size as usize)?)
    }

    fn ensure_writable(&self) -> CoreResult<()> {
        if self.read_only {
            return Err(CoreError::ReadOnly);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("size", &self.size())
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

/// Finds the end of the data, ignoring trailing zero bytes.
///
/// The last word of every block holds a non-zero length, so a zero tail can
/// only be slack.
fn data_end(backend: &dyn StorageBackend, size: u64) -> CoreResult<u64> {
    let header = FILE_MAGIC.len() as u64;
    let mut pos = size;
    while pos > header {
        let start = pos.saturating_sub(TAIL_SCAN_CHUNK).max(header);
        let chunk = backend.read_at(start, (pos - start) as usize)?;
        if let Some(i) = chunk.iter().rposition(|&b| b != 0) {
            return Ok(align(start + i as u64 + 1).min(size));
        }
        pos = start;
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_writes_header() {
        let storage = Storage::in_memory().unwrap();
        assert_eq!(storage.size(), 8);
        assert_eq!(storage.read(Address(0), 8).unwrap().as_ref(), &FILE_MAGIC);
    }

    #[test]
    fn append_and_read_block() {
        let storage = Storage::in_memory().unwrap();
        let adr = storage.append_block(BlockType::Other, b"hello", 0).unwrap();
        assert_eq!(adr, FIRST_BLOCK);
        assert_eq!(storage.size(), 8 + block_size(5));

        let block = storage.read_block(adr).unwrap();
        assert_eq!(block.block_type, BlockType::Other);
        assert_eq!(block.payload.as_ref(), b"hello");
        assert_eq!(block.end(), storage.end());
    }

    #[test]
    fn alloc_then_write() {
        let storage = Storage::in_memory().unwrap();
        let adr = storage.alloc(5).unwrap();
        assert_eq!(storage.size(), 16);
        storage.write(adr, b"abc").unwrap();
        assert_eq!(storage.read(adr, 5).unwrap().as_ref(), b"abc\0\0");
    }

    #[test]
    fn open_rejects_bad_magic() {
        let backend = InMemoryBackend::with_data(b"NOTADB!!".to_vec());
        assert!(matches!(
            Storage::open(Box::new(backend)),
            Err(CoreError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn open_trims_zero_tail() {
        let storage = Storage::in_memory().unwrap();
        storage.append_block(BlockType::Other, b"x", 0).unwrap();
        let mut bytes = storage.to_vec().unwrap();
        let real = bytes.len() as u64;
        bytes.extend_from_slice(&[0u8; 4096]);

        let reopened = Storage::open(Box::new(InMemoryBackend::with_data(bytes))).unwrap();
        assert_eq!(reopened.size(), real);
        assert_eq!(reopened.iter().count(), 1);
    }

    #[test]
    fn read_block_detects_bad_tag() {
        let storage = Storage::in_memory().unwrap();
        storage.append_block(BlockType::Data, b"abcd", 0).unwrap();
        let mut bytes = storage.to_vec().unwrap();
        bytes[8] = 9;
        let reopened = Storage::open(Box::new(InMemoryBackend::with_data(bytes))).unwrap();
        assert!(matches!(
            reopened.read_block(FIRST_BLOCK),
            Err(CoreError::Corrupted { .. })
        ));
    }
}
