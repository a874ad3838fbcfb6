//! Core type definitions for Suneido.

use std::fmt;

/// Logical byte offset into the storage arena.
///
/// Addresses are stable across arena growth and identical for every backend.
/// Zero is the null address; the file header occupies it. Addresses with
/// [`Address::TEMP_BIT`] set are provisional: they name transaction-private
/// records or unsaved B-tree nodes and never reach disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub u64);

impl Address {
    /// The null address.
    pub const NULL: Self = Self(0);

    /// Sentinel used by minimized separator keys.
    pub const MAX: Self = Self(u64::MAX);

    /// Bit marking a provisional address.
    pub const TEMP_BIT: u64 = 1 << 62;

    /// Creates a new address.
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Creates the `n`th provisional address.
    #[must_use]
    pub const fn temp(n: u64) -> Self {
        Self(Self::TEMP_BIT | n)
    }

    /// Returns the raw offset.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true for the null address.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns true for provisional addresses.
    #[must_use]
    pub const fn is_temp(self) -> bool {
        self.0 != u64::MAX && self.0 & Self::TEMP_BIT != 0
    }

    /// Returns the index part of a provisional address.
    #[must_use]
    pub const fn temp_index(self) -> u64 {
        self.0 & !Self::TEMP_BIT
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_temp() {
            write!(f, "tmp:{}", self.temp_index())
        } else {
            write!(f, "@{}", self.0)
        }
    }
}

/// Sequence number for ordering commits.
///
/// Sequence numbers provide total ordering of committed transactions within
/// one open database. Higher sequence numbers indicate later commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// Creates a new sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// Table number. System tables are 1 to 4; user tables start at 5.
pub type TableNum = u32;
