//! B-tree keys.

use crate::record::Record;
use crate::types::Address;
use std::cmp::Ordering;
use std::fmt;

/// An index entry.
///
/// In a leaf, `key` is the indexed-column prefix of a row and `adr` is the
/// row's Data block. In an interior node the entry is a separator and
/// `child` points at the subtree holding keys from this separator up to the
/// next one.
///
/// Keys order by `(key, adr)`; `child` does not take part.
#[derive(Clone)]
pub struct BtreeKey {
    /// Indexed-column prefix.
    pub key: Record,
    /// Data address, or [`Address::MAX`] for a minimized separator.
    pub adr: Address,
    /// Child node, for interior entries.
    pub child: Option<Address>,
}

impl BtreeKey {
    /// Creates a leaf key.
    #[must_use]
    pub fn new(key: Record, adr: Address) -> Self {
        Self {
            key,
            adr,
            child: None,
        }
    }

    /// The smallest possible key.
    #[must_use]
    pub fn min() -> Self {
        Self::new(Record::empty(), Address::NULL)
    }

    /// Returns a separator that sorts after every key with the same fields.
    #[must_use]
    pub fn minimize(&self) -> Self {
        Self::new(self.key.clone(), Address::MAX)
    }

    /// Returns this key pointing at `child`.
    #[must_use]
    pub fn with_child(mut self, child: Address) -> Self {
        self.child = Some(child);
        self
    }

    /// Returns this key without a child pointer.
    #[must_use]
    pub fn without_child(mut self) -> Self {
        self.child = None;
        self
    }

    /// Returns true if both keys have equal fields, ignoring addresses.
    #[must_use]
    pub fn same_fields(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl PartialEq for BtreeKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for BtreeKey {}

impl PartialOrd for BtreeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BtreeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key).then(self.adr.cmp(&other.adr))
    }
}

impl fmt::Debug for BtreeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.child {
            Some(child) => write!(f, "{}{} -> {}", self.key, self.adr, child),
            None => write!(f, "{}{}", self.key, self.adr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordBuilder;

    fn key(s: &str, adr: u64) -> BtreeKey {
        BtreeKey::new(RecordBuilder::new().string(s).build(), Address(adr))
    }

    #[test]
    fn orders_by_fields_then_address() {
        assert!(key("a", 9) < key("b", 1));
        assert!(key("a", 1) < key("a", 2));
        assert!(BtreeKey::min() < key("", 0));
    }

    #[test]
    fn minimized_bounds_equal_fields() {
        let sep = key("m", 40).minimize();
        assert!(key("m", 40) < sep);
        assert!(key("m", 1 << 40) < sep);
        assert!(sep < key("n", 0));
    }

    #[test]
    fn child_is_ignored_by_ordering() {
        let a = key("x", 8).with_child(Address(100));
        let b = key("x", 8);
        assert_eq!(a, b);
        assert_eq!(a.clone().without_child().child, None);
        assert!(a.same_fields(&key("x", 16)));
    }
}
