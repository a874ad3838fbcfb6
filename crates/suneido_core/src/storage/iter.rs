//! Forward and reverse block iterators.
//!
//! Neither iterator returns errors. A block that fails validation ends the
//! scan and is recorded as a [`Corruption`]; deciding what that means is the
//! caller's job.

use super::{Block, Storage, BLOCK_TRAILER_SIZE, FIRST_BLOCK};
use crate::types::Address;

/// Where and why a scan stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corruption {
    /// Address of the block that failed validation.
    pub adr: Address,
    /// What was wrong with it.
    pub reason: String,
}

/// Iterates blocks from low to high addresses.
pub struct BlockIter<'a> {
    storage: &'a Storage,
    pos: u64,
    end: u64,
    corruption: Option<Corruption>,
    finished: bool,
}

impl<'a> BlockIter<'a> {
    pub(super) fn new(storage: &'a Storage, from: Address, to: Address) -> Self {
        Self {
            storage,
            pos: from.0,
            end: to.0.min(storage.size()),
            corruption: None,
            finished: false,
        }
    }

    /// Address of the next block, or where the scan stopped.
    #[must_use]
    pub fn position(&self) -> Address {
        Address(self.pos)
    }

    /// The block that ended the scan, if any.
    #[must_use]
    pub fn corruption(&self) -> Option<&Corruption> {
        self.corruption.as_ref()
    }
}

impl Iterator for BlockIter<'_> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.pos >= self.end {
            self.finished = true;
            return None;
        }
        match self.storage.read_block_before(Address(self.pos), self.end) {
            Ok(block) => {
                self.pos = block.end().0;
                Some(block)
            }
            Err(e) => {
                self.corruption = Some(Corruption {
                    adr: Address(self.pos),
                    reason: e.to_string(),
                });
                self.finished = true;
                None
            }
        }
    }
}

/// Iterates blocks from high to low addresses using each block's trailer.
pub struct RevBlockIter<'a> {
    storage: &'a Storage,
    pos: u64,
    corruption: Option<Corruption>,
    finished: bool,
}

impl<'a> RevBlockIter<'a> {
    pub(super) fn new(storage: &'a Storage, end: Address) -> Self {
        Self {
            storage,
            pos: end.0.min(storage.size()),
            corruption: None,
            finished: false,
        }
    }

    /// The block that ended the scan, if any.
    #[must_use]
    pub fn corruption(&self) -> Option<&Corruption> {
        self.corruption.as_ref()
    }

    fn step(&mut self) -> Result<Block, String> {
        if self.pos < FIRST_BLOCK.0 + BLOCK_TRAILER_SIZE {
            return Err("truncated trailer".to_string());
        }
        let trailer = self
            .storage
            .read(Address(self.pos - BLOCK_TRAILER_SIZE), 4)
            .map_err(|e| e.to_string())?;
        let total = u64::from(u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]));
        if total == 0 || total > self.pos - FIRST_BLOCK.0 {
            return Err(format!("invalid trailer length {total}"));
        }
        let start = Address(self.pos - total);
        let block = self
            .storage
            .read_block_before(start, self.pos)
            .map_err(|e| e.to_string())?;
        if block.end().0 != self.pos {
            return Err("trailer does not match header".to_string());
        }
        Ok(block)
    }
}

impl Iterator for RevBlockIter<'_> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.pos <= FIRST_BLOCK.0 {
            self.finished = true;
            return None;
        }
        match self.step() {
            Ok(block) => {
                self.pos = block.adr.0;
                Some(block)
            }
            Err(reason) => {
                self.corruption = Some(Corruption {
                    adr: Address(self.pos),
                    reason,
                });
                self.finished = true;
                None
            }
        }
    }
}
