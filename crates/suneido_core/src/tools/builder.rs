//! Writes a complete database into empty storage in one commit.
//!
//! Used to create new databases and by rebuild and compact: rows are
//! appended as Data blocks, then every index of every table is built from
//! them, stored, and published through a single Commit.

use crate::btree::{Btree, BtreeIndex};
use crate::checksum::Checksum;
use crate::error::{CoreError, CoreResult};
use crate::record::Record;
use crate::schema::Schema;
use crate::storage::{
    encode_data, feed_data, now_millis, BlockType, CommitInfo, SessionInfo, SessionKind, Storage,
};
use crate::transaction::read_row;
use crate::trie::{DbHashTrie, IndexInfo, TableInfo};
use crate::types::{Address, TableNum};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Accumulates rows and writes the final commit.
pub struct DbBuilder {
    storage: Arc<Storage>,
    node_size: usize,
    ck: Checksum,
    creates: Vec<Address>,
    rows: BTreeMap<TableNum, Vec<Address>>,
}

/// What [`DbBuilder::finish`] wrote.
#[derive(Debug, Clone)]
pub struct Built {
    /// Metadata trie root.
    pub trie: DbHashTrie,
    /// Rows written, system tables included.
    pub rows: usize,
}

impl DbBuilder {
    /// Creates a builder appending to `storage`.
    #[must_use]
    pub fn new(storage: Arc<Storage>, node_size: usize) -> Self {
        Self {
            storage,
            node_size,
            ck: Checksum::new(),
            creates: Vec::new(),
            rows: BTreeMap::new(),
        }
    }

    /// The storage being written.
    #[must_use]
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Appends a Session marker. Resets the commit checksum.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the append fails.
    pub fn session(&mut self, kind: SessionKind) -> CoreResult<()> {
        self.ck.reset();
        self.storage
            .append_block(BlockType::Session, &SessionInfo::now(kind).encode(), 0)?;
        Ok(())
    }

    /// Appends a row.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the append fails.
    pub fn add_row(&mut self, table: TableNum, rec: &Record) -> CoreResult<Address> {
        let payload = encode_data(table, rec);
        let adr = self.storage.append_block(BlockType::Data, &payload, 0)?;
        feed_data(&mut self.ck, &payload);
        self.creates.push(adr);
        self.rows.entry(table).or_default().push(adr);
        Ok(adr)
    }

    /// Number of rows appended for `table`.
    #[must_use]
    pub fn row_count(&self, table: TableNum) -> usize {
        self.rows.get(&table).map_or(0, Vec::len)
    }

    /// Builds every index of every table in `schema`, then appends the trie
    /// and the Commit. Rows of tables `schema` does not define are an error.
    ///
    /// # Errors
    ///
    /// Returns `Internal` for rows of unknown tables, or a storage error.
    pub fn finish(mut self, schema: &Schema) -> CoreResult<Built> {
        if let Some(num) = self.rows.keys().find(|n| schema.table(**n).is_none()) {
            return Err(CoreError::internal(format!("rows written for unknown table {num}")));
        }
        let mut trie = DbHashTrie::new(self.storage.clone());
        for table in schema.tables() {
            let adrs = self.rows.remove(&table.num).unwrap_or_default();
            let mut trees: Vec<BtreeIndex> = table
                .indexes
                .iter()
                .map(|ix| {
                    BtreeIndex::new(ix.clone(), Btree::new(self.storage.clone(), self.node_size))
                })
                .collect();
            let mut info = TableInfo::new(table.num);
            for adr in &adrs {
                let rec = read_row(&self.storage, *adr, table.num)?;
                for tree in &mut trees {
                    tree.insert(&rec, *adr)?;
                }
                info.nrows += 1;
                info.total_size += rec.size() as u64;
            }
            for tree in &mut trees {
                let root = tree.store()?;
                info.indexes.push(IndexInfo {
                    columns: tree.index().columns_string(),
                    root,
                    levels: tree.tree().levels(),
                });
            }
            debug!(table = %table.name, rows = info.nrows, "built table");
            trie = trie.with(info)?;
        }
        let dbinfo = trie.store(|e| Ok(e.clone()))?;

        let commit = CommitInfo {
            timestamp: now_millis(),
            dbinfo,
            creates: std::mem::take(&mut self.creates),
            deletes: Vec::new(),
        };
        let payload = commit.encode();
        self.ck.update(&payload);
        self.storage
            .append_block(BlockType::Commit, &payload, self.ck.value())?;
        self.ck.reset();
        Ok(Built {
            trie,
            rows: commit.creates.len(),
        })
    }
}

impl std::fmt::Debug for DbBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbBuilder")
            .field("rows", &self.creates.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordBuilder;
    use crate::schema::{table_rows, SchemaText};

    #[test]
    fn empty_database_has_system_tables() {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let mut b = DbBuilder::new(storage.clone(), 4096);
        b.session(SessionKind::Startup).unwrap();
        let built = b.finish(&Schema::new()).unwrap();
        assert_eq!(built.rows, 0);
        assert_eq!(built.trie.iter().count(), 4);
        let last = storage.rev_iter().next().unwrap();
        assert_eq!(last.block_type, BlockType::Commit);
        assert_eq!(last.commit().unwrap().dbinfo, built.trie.address().unwrap());
    }

    #[test]
    fn rows_are_indexed() {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let mut schema = Schema::new();
        let table = SchemaText::parse("(id,name) key(id) index(name)")
            .unwrap()
            .to_table(5, "people")
            .unwrap();
        let mut b = DbBuilder::new(storage, 4096);
        for (sys, rec) in table_rows(&table) {
            b.add_row(sys, &rec).unwrap();
        }
        for i in 0..100 {
            b.add_row(5, &RecordBuilder::new().int(i).string("x").build())
                .unwrap();
        }
        assert_eq!(b.row_count(5), 100);
        schema.insert(table);
        let built = b.finish(&schema).unwrap();
        let info = built.trie.get(5).unwrap().unwrap();
        assert_eq!(info.nrows, 100);
        assert_eq!(info.indexes.len(), 2);
    }

    #[test]
    fn rows_of_unknown_tables_are_rejected() {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let mut b = DbBuilder::new(storage, 4096);
        b.add_row(9, &RecordBuilder::new().int(1).build()).unwrap();
        assert!(b.finish(&Schema::new()).is_err());
    }
}
