//! Damage database files the way crashes and failing disks do.
//!
//! ## Test Strategy
//!
//! 1. **Crash mid-session** - copy the file while the database is still open,
//!    so no shutdown marker is written
//! 2. **Torn write** - cut bytes off the end of the file
//! 3. **Bit rot** - flip a byte inside a committed block
//! 4. **Uncommitted tail** - append data blocks no commit covers
//!
//! ## Usage
//!
//! ```rust,no_run
//! use suneido_testkit::corruption::{crash_copy, flip_byte, last_data_block};
//! # fn demo(db: &suneido_core::Database, path: &std::path::Path, copy: &std::path::Path) {
//! crash_copy(db, copy).unwrap();
//! let adr = last_data_block(copy).unwrap().unwrap();
//! flip_byte(copy, adr.0 + 12).unwrap();
//! # let _ = path;
//! # }
//! ```

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use suneido_core::storage::{encode_data, Block, BlockType};
use suneido_core::{Address, CoreError, CoreResult, Database, Record, Storage, TableNum};
use suneido_storage::FileBackend;
use tracing::debug;

/// Copies the file of an open database, as if the process died right now.
///
/// The copy has no shutdown marker after its last session.
///
/// # Errors
///
/// Returns an error if the database is in memory or the copy fails.
pub fn crash_copy(db: &Database, dest: &Path) -> CoreResult<()> {
    let src = db
        .path()
        .ok_or_else(|| CoreError::invalid_operation("in-memory database has no file"))?;
    db.storage().flush()?;
    fs::copy(src, dest)?;
    debug!(src = %src.display(), dest = %dest.display(), "copied open database");
    Ok(())
}

/// XORs the byte at `offset` with `0xff`.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read or written.
pub fn flip_byte(path: &Path, offset: u64) -> CoreResult<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut b = [0u8; 1];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut b)?;
    b[0] ^= 0xff;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&b)?;
    file.sync_all()?;
    Ok(())
}

/// Removes the last `n` bytes of the file.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be resized.
pub fn truncate_by(path: &Path, n: u64) -> CoreResult<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    let len = file.metadata()?.len();
    file.set_len(len.saturating_sub(n))?;
    file.sync_all()?;
    Ok(())
}

/// Appends a Data block that no commit covers.
///
/// # Errors
///
/// Returns an error if the file is not a database or cannot be written.
pub fn append_uncommitted(path: &Path, table: TableNum, rec: &Record) -> CoreResult<Address> {
    let storage = Storage::open(Box::new(FileBackend::open(path)?))?;
    let adr = storage.append_block(BlockType::Data, &encode_data(table, rec), 0)?;
    storage.sync()?;
    Ok(adr)
}

/// Address of the last Data block belonging to a user table.
///
/// # Errors
///
/// Returns an error if the file is not a database.
pub fn last_data_block(path: &Path) -> CoreResult<Option<Address>> {
    let storage = Storage::open(Box::new(FileBackend::open_read_only(path)?))?;
    let mut last = None;
    for block in storage.iter() {
        if block.block_type == BlockType::Data {
            let (table, _) = block.data()?;
            if !suneido_core::schema::is_system_table(table) {
                last = Some(block.adr);
            }
        }
    }
    Ok(last)
}

/// The last Commit block, whose checksum sits in its final four bytes.
///
/// # Errors
///
/// Returns an error if the file is not a database.
pub fn last_commit_block(path: &Path) -> CoreResult<Option<Block>> {
    let storage = Storage::open(Box::new(FileBackend::open_read_only(path)?))?;
    Ok(storage
        .rev_iter()
        .find(|block| block.block_type == BlockType::Commit))
}

/// Number of blocks of each type: Data, Commit, Session, Other.
///
/// # Errors
///
/// Returns an error if the file is not a database.
pub fn block_counts(path: &Path) -> CoreResult<[usize; 4]> {
    let storage = Storage::open(Box::new(FileBackend::open_read_only(path)?))?;
    let mut counts = [0; 4];
    for block in storage.iter() {
        let i = match block.block_type {
            BlockType::Data => 0,
            BlockType::Commit => 1,
            BlockType::Session => 2,
            BlockType::Other => 3,
        };
        counts[i] += 1;
    }
    Ok(counts)
}
