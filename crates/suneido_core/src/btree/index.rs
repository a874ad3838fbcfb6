//! A B-tree bound to a table index definition.

use super::key::BtreeKey;
use super::tree::{Btree, BtreeIter};
use crate::error::CoreResult;
use crate::record::Record;
use crate::schema::{Index, IndexMode};
use crate::types::Address;
use std::collections::HashSet;

/// Maps projected index keys to Data block addresses.
#[derive(Debug, Clone)]
pub struct BtreeIndex {
    index: Index,
    tree: Btree,
}

impl BtreeIndex {
    /// Wraps a tree for an index.
    #[must_use]
    pub fn new(index: Index, tree: Btree) -> Self {
        Self { index, tree }
    }

    /// The index definition.
    #[must_use]
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// The underlying tree.
    #[must_use]
    pub fn tree(&self) -> &Btree {
        &self.tree
    }

    /// Mutable access to the underlying tree.
    pub fn tree_mut(&mut self) -> &mut Btree {
        &mut self.tree
    }

    /// Projects a row onto the indexed fields.
    #[must_use]
    pub fn key_of(&self, rec: &Record) -> Record {
        rec.project(&self.index.fields)
    }

    /// Adds a row.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be read.
    pub fn insert(&mut self, rec: &Record, adr: Address) -> CoreResult<()> {
        let key = self.key_of(rec);
        self.tree.insert(BtreeKey::new(key, adr))
    }

    /// Removes a row. Returns false if it was not indexed.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be read.
    pub fn remove(&mut self, rec: &Record, adr: Address) -> CoreResult<bool> {
        let key = self.key_of(rec);
        self.tree.remove(&BtreeKey::new(key, adr))
    }

    /// Address of the first row whose indexed fields equal `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be read.
    pub fn lookup(&self, key: &Record) -> CoreResult<Option<Address>> {
        self.equal(key).next().transpose().map(|k| k.map(|k| k.adr))
    }

    /// Entries whose indexed fields equal `key`.
    #[must_use]
    pub fn equal(&self, key: &Record) -> BtreeIter<'_> {
        self.tree.range(
            &BtreeKey::new(key.clone(), Address::NULL),
            &BtreeKey::new(key.clone(), Address::MAX),
        )
    }

    /// Entries whose leading indexed fields equal `prefix`.
    #[must_use]
    pub fn prefix(&self, prefix: &Record) -> BtreeIter<'_> {
        self.tree.range(
            &BtreeKey::new(prefix.clone(), Address::NULL),
            &BtreeKey::new(prefix.prefix_upper_bound(), Address::NULL),
        )
    }

    /// Entries with keys in `[from, to)`.
    #[must_use]
    pub fn range(&self, from: &Record, to: &Record) -> BtreeIter<'_> {
        self.tree.range(
            &BtreeKey::new(from.clone(), Address::NULL),
            &BtreeKey::new(to.clone(), Address::NULL),
        )
    }

    /// All entries in key order.
    #[must_use]
    pub fn iter(&self) -> BtreeIter<'_> {
        self.tree.iter()
    }

    /// Returns the address of an existing row that `rec` would duplicate
    /// under this index's mode, skipping rows in `ignore`.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be read.
    pub fn conflicts(&self, rec: &Record, ignore: &HashSet<Address>) -> CoreResult<Option<Address>> {
        let key = self.key_of(rec);
        if self.index.mode == IndexMode::Plain || !self.index.is_unique_for(&key) {
            return Ok(None);
        }
        for entry in self.equal(&key) {
            let entry = entry?;
            if !ignore.contains(&entry.adr) {
                return Ok(Some(entry.adr));
            }
        }
        Ok(None)
    }

    /// Appends dirty nodes and returns the stored root.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree holds provisional rows or an append fails.
    pub fn store(&mut self) -> CoreResult<Address> {
        self.tree.store()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordBuilder;
    use crate::storage::Storage;
    use std::sync::Arc;

    fn index(mode: IndexMode) -> BtreeIndex {
        let index = Index {
            columns: vec!["name".into()],
            fields: vec![1],
            mode,
        };
        BtreeIndex::new(index, Btree::new(Arc::new(Storage::in_memory().unwrap()), 256))
    }

    fn row(id: i64, name: &str) -> Record {
        RecordBuilder::new().int(id).string(name).build()
    }

    fn name(s: &str) -> Record {
        RecordBuilder::new().string(s).build()
    }

    #[test]
    fn lookup_and_prefix() {
        let mut ix = index(IndexMode::Plain);
        for (i, n) in ["bob", "bobby", "alice", "carol", "bob"].iter().enumerate() {
            ix.insert(&row(i as i64, n), Address(16 * (i as u64 + 1))).unwrap();
        }
        assert_eq!(ix.lookup(&name("alice")).unwrap(), Some(Address(48)));
        assert_eq!(ix.lookup(&name("dave")).unwrap(), None);
        assert_eq!(ix.equal(&name("bob")).count(), 2);
        assert_eq!(ix.iter().count(), 5);

        let from = name("b");
        let to = name("c");
        assert_eq!(ix.range(&from, &to).count(), 3);
    }

    #[test]
    fn key_conflicts_and_ignores() {
        let mut ix = index(IndexMode::Key);
        ix.insert(&row(1, "x"), Address(8)).unwrap();
        let none = HashSet::new();
        assert_eq!(ix.conflicts(&row(2, "x"), &none).unwrap(), Some(Address(8)));
        assert_eq!(ix.conflicts(&row(2, "y"), &none).unwrap(), None);

        let ignore: HashSet<Address> = [Address(8)].into_iter().collect();
        assert_eq!(ix.conflicts(&row(2, "x"), &ignore).unwrap(), None);
    }

    #[test]
    fn unique_allows_empty_and_plain_never_conflicts() {
        let mut unique = index(IndexMode::Unique);
        let blank = RecordBuilder::new().int(1).empty().build();
        unique.insert(&blank, Address(8)).unwrap();
        assert_eq!(unique.conflicts(&blank, &HashSet::new()).unwrap(), None);

        let mut plain = index(IndexMode::Plain);
        plain.insert(&row(1, "x"), Address(8)).unwrap();
        assert_eq!(plain.conflicts(&row(2, "x"), &HashSet::new()).unwrap(), None);
    }

    #[test]
    fn remove_row() {
        let mut ix = index(IndexMode::Key);
        ix.insert(&row(1, "x"), Address(8)).unwrap();
        assert!(ix.remove(&row(1, "x"), Address(8)).unwrap());
        assert!(!ix.remove(&row(1, "x"), Address(8)).unwrap());
        assert_eq!(ix.lookup(&name("x")).unwrap(), None);
    }
}
