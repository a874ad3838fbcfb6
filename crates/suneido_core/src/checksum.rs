//! Rolling checksum over byte ranges.

use crc32fast::Hasher;

/// Accumulates a CRC-32 over a sequence of byte ranges.
///
/// Feeding `a` then `b` gives the same value as feeding `a ++ b`, so the
/// commit path and the integrity check can feed blocks one at a time.
#[derive(Debug, Clone, Default)]
pub struct Checksum {
    hasher: Hasher,
    bytes: u64,
}

impl Checksum {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a byte range.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Returns the checksum of everything fed so far.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Returns the number of bytes fed so far.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.bytes
    }

    /// Returns true if nothing has been fed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    /// Starts over.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
