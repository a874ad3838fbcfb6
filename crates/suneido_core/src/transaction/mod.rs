//! Snapshot-isolated transactions.
//!
//! A transaction reads the [`DbState`] published when it began and never
//! sees later commits. Update transactions keep their changes private:
//!
//! - new rows get provisional addresses and live in memory
//! - deleted rows are remembered with their contents
//! - every index touched is a private copy-on-write clone of the snapshot tree
//!
//! Nothing reaches storage until [`Transaction::commit`], which re-checks the
//! changes against everything committed since the snapshot and then appends
//! them in one Commit.
//!
//! ## Invariants
//!
//! - Dropping an active transaction aborts it
//! - A failed commit leaves no trace in the published state
//! - Table numbers are never reused within one transaction

mod manager;
mod state;

pub use manager::TransactionManager;
pub use state::{DbState, TransactionKind, TransactionState};

pub(crate) use manager::read_row;

use crate::btree::{Btree, BtreeIndex};
use crate::error::{CoreError, CoreResult};
use crate::record::{Record, RecordBuilder};
use crate::schema::{
    columns_row, indexes_row, is_system_table, table_rows, tables_row, views_row, Index,
    IndexMode, Schema, SchemaText, Table, COLUMNS_TABLE, INDEXES_TABLE, TABLES_TABLE,
    VIEWS_TABLE,
};
use crate::trie::TableInfo;
use crate::types::{Address, SequenceNumber, TableNum};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// A database transaction.
pub struct Transaction<'db> {
    manager: &'db TransactionManager,
    kind: TransactionKind,
    state: TransactionState,
    snapshot: Arc<DbState>,
    schema: Arc<Schema>,
    next_table: TableNum,
    /// Rows added, indexed by provisional address. `None` once removed again.
    created: Vec<Option<(TableNum, Record)>>,
    /// Committed rows deleted by this transaction.
    removed: Vec<(TableNum, Address, Record)>,
    removed_set: HashSet<Address>,
    trees: HashMap<(TableNum, String), BtreeIndex>,
    touched: HashSet<TableNum>,
    schema_changed: HashSet<TableNum>,
    views_changed: HashSet<String>,
    /// Row count and byte deltas per table.
    deltas: HashMap<TableNum, (i64, i64)>,
}

impl<'db> Transaction<'db> {
    fn new(manager: &'db TransactionManager, kind: TransactionKind, snapshot: Arc<DbState>) -> Self {
        let schema = snapshot.schema.clone();
        Self {
            manager,
            kind,
            state: TransactionState::Active,
            next_table: schema.next_table_num(),
            schema,
            snapshot,
            created: Vec::new(),
            removed: Vec::new(),
            removed_set: HashSet::new(),
            trees: HashMap::new(),
            touched: HashSet::new(),
            schema_changed: HashSet::new(),
            views_changed: HashSet::new(),
            deltas: HashMap::new(),
        }
    }

    /// Transaction kind.
    #[must_use]
    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Returns true until the transaction commits or aborts.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Sequence number of the snapshot this transaction reads.
    #[must_use]
    pub fn snapshot_seq(&self) -> SequenceNumber {
        self.snapshot.seq
    }

    /// The schema as seen by this transaction, including its own changes.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn has_changes(&self) -> bool {
        self.created.iter().any(Option::is_some)
            || !self.removed.is_empty()
            || !self.schema_changed.is_empty()
            || !self.views_changed.is_empty()
    }

    fn ensure_active(&self) -> CoreResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(CoreError::invalid_operation("transaction is not active"))
        }
    }

    fn ensure_update(&self) -> CoreResult<()> {
        self.ensure_active()?;
        if self.kind.is_update() {
            Ok(())
        } else {
            Err(CoreError::invalid_operation("cannot write in a readonly transaction"))
        }
    }

    fn maintains_indexes(&self, num: TableNum) -> bool {
        self.kind != TransactionKind::Bulk || is_system_table(num)
    }

    // -------------------------------------------------------------------
    // reads
    // -------------------------------------------------------------------

    /// Table definition by name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no such table.
    pub fn table(&self, name: &str) -> CoreResult<Arc<Table>> {
        self.schema.require(name).cloned()
    }

    fn user_table(&self, name: &str) -> CoreResult<Arc<Table>> {
        let table = self.table(name)?;
        if is_system_table(table.num) {
            return Err(CoreError::invalid_operation(format!(
                "{name} is a system table"
            )));
        }
        Ok(table)
    }

    /// Row count, size and index roots of a table. Counts include this
    /// transaction's changes; index roots are the snapshot's.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no such table.
    pub fn table_info(&self, name: &str) -> CoreResult<TableInfo> {
        let table = self.table(name)?;
        let mut info = self
            .snapshot
            .trie
            .get(table.num)?
            .map_or_else(|| TableInfo::new(table.num), |i| (*i).clone());
        if let Some((rows, size)) = self.deltas.get(&table.num) {
            info.nrows = (info.nrows as i64 + rows).max(0) as u64;
            info.total_size = (info.total_size as i64 + size).max(0) as u64;
        }
        Ok(info)
    }

    fn open_index(&self, table: &Table, index: &Index) -> CoreResult<BtreeIndex> {
        let storage = self.manager.storage().clone();
        let node_size = self.manager.node_size();
        let info = self.snapshot.trie.get(table.num)?;
        let tree = match info.as_ref().and_then(|i| i.index(&index.columns_string())) {
            Some(ix) => Btree::open(storage, ix.root, ix.levels, node_size),
            None => Btree::new(storage, node_size),
        };
        Ok(BtreeIndex::new(index.clone(), tree))
    }

    fn index_mut(&mut self, table: &Table, columns: &str) -> CoreResult<&mut BtreeIndex> {
        let key = (table.num, columns.to_string());
        if !self.trees.contains_key(&key) {
            let index = table
                .index(columns)
                .ok_or_else(|| CoreError::not_found(format!("index {}({columns})", table.name)))?;
            let tree = self.open_index(table, index)?;
            self.trees.insert(key.clone(), tree);
        }
        self.trees
            .get_mut(&key)
            .ok_or_else(|| CoreError::internal("index vanished"))
    }

    /// The index of `table` on `columns`, as this transaction sees it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the table or index does not exist.
    pub fn get_btree_index(&mut self, table: &str, columns: &str) -> CoreResult<&BtreeIndex> {
        self.ensure_active()?;
        let table = self.table(table)?;
        let columns = table
            .index(columns)
            .map(Index::columns_string)
            .ok_or_else(|| CoreError::not_found(format!("index {}({columns})", table.name)))?;
        Ok(&*self.index_mut(&table, &columns)?)
    }

    fn read_row(&self, adr: Address) -> CoreResult<(TableNum, Record)> {
        if adr.is_temp() {
            return usize::try_from(adr.temp_index())
                .ok()
                .and_then(|i| self.created.get(i))
                .and_then(|slot| slot.clone())
                .ok_or_else(|| CoreError::not_found(format!("record {adr}")));
        }
        self.manager.storage().read_block(adr)?.data()
    }

    /// Reads the row at `adr`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown provisional address or `Corrupted`
    /// if `adr` is not a Data block.
    pub fn get_record(&self, adr: Address) -> CoreResult<Record> {
        self.ensure_active()?;
        self.read_row(adr).map(|(_, rec)| rec)
    }

    /// Finds the row whose `columns` equal `key`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the table or index does not exist.
    pub fn lookup(
        &mut self,
        table: &str,
        columns: &str,
        key: &Record,
    ) -> CoreResult<Option<(Address, Record)>> {
        let adr = self.get_btree_index(table, columns)?.lookup(key)?;
        adr.map(|adr| self.get_record(adr).map(|rec| (adr, rec)))
            .transpose()
    }

    /// Every row of a table in primary key order.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the table does not exist.
    pub fn records(&mut self, table: &str) -> CoreResult<Vec<(Address, Record)>> {
        let t = self.table(table)?;
        let primary = t.primary()?.columns_string();
        let adrs = self
            .get_btree_index(table, &primary)?
            .iter()
            .map(|k| k.map(|k| k.adr))
            .collect::<CoreResult<Vec<_>>>()?;
        adrs.into_iter()
            .map(|adr| self.read_row(adr).map(|(_, rec)| (adr, rec)))
            .collect()
    }

    // -------------------------------------------------------------------
    // row changes
    // -------------------------------------------------------------------

    /// Adds a row and returns its provisional address.
    ///
    /// # Errors
    ///
    /// Returns a `DuplicateKey` conflict if a key or unique index already
    /// holds the row's key (not checked by bulk transactions).
    pub fn add_record(&mut self, table: &str, rec: Record) -> CoreResult<Address> {
        self.ensure_update()?;
        let table = self.user_table(table)?;
        self.insert_row(&table, rec, None)
    }

    /// Removes a row.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the row was already removed, or
    /// `InvalidOperation` if it belongs to another table.
    pub fn remove_record(&mut self, table: &str, adr: Address) -> CoreResult<()> {
        self.ensure_update()?;
        let table = self.user_table(table)?;
        self.delete_row(&table, adr).map(|_| ())
    }

    /// Replaces a row and returns the new row's address.
    ///
    /// # Errors
    ///
    /// As for [`Transaction::remove_record`] and [`Transaction::add_record`].
    /// The old row is kept if the new one would be a duplicate.
    pub fn update_record(&mut self, table: &str, adr: Address, rec: Record) -> CoreResult<Address> {
        self.ensure_update()?;
        let table = self.user_table(table)?;
        if self.maintains_indexes(table.num) {
            self.check_unique(&table, &rec, Some(adr))?;
        }
        self.delete_row(&table, adr)?;
        self.insert_row(&table, rec, Some(adr))
    }

    fn check_unique(&mut self, table: &Table, rec: &Record, replacing: Option<Address>) -> CoreResult<()> {
        let ignore: HashSet<Address> = replacing.into_iter().collect();
        for ix in &table.indexes {
            let columns = ix.columns_string();
            if self.index_mut(table, &columns)?.conflicts(rec, &ignore)?.is_some() {
                return Err(CoreError::duplicate_key(table.name.clone(), columns));
            }
        }
        Ok(())
    }

    fn insert_row(&mut self, table: &Table, rec: Record, checked: Option<Address>) -> CoreResult<Address> {
        let adr = Address::temp(self.created.len() as u64);
        if self.maintains_indexes(table.num) {
            if checked.is_none() {
                self.check_unique(table, &rec, None)?;
            }
            for ix in &table.indexes {
                self.index_mut(table, &ix.columns_string())?.insert(&rec, adr)?;
            }
        }
        let delta = self.deltas.entry(table.num).or_insert((0, 0));
        delta.0 += 1;
        delta.1 += rec.size() as i64;
        self.touched.insert(table.num);
        self.created.push(Some((table.num, rec)));
        Ok(adr)
    }

    fn delete_row(&mut self, table: &Table, adr: Address) -> CoreResult<Record> {
        if self.removed_set.contains(&adr) {
            return Err(CoreError::not_found(format!("record {adr} already removed")));
        }
        let (num, rec) = self.read_row(adr)?;
        if num != table.num {
            return Err(CoreError::invalid_operation(format!(
                "record {adr} is not in {}",
                table.name
            )));
        }
        if self.maintains_indexes(num) {
            for ix in &table.indexes {
                if !self.index_mut(table, &ix.columns_string())?.remove(&rec, adr)? {
                    return Err(CoreError::not_found(format!("record {adr} in {}", table.name)));
                }
            }
        }
        if adr.is_temp() {
            if let Some(slot) = usize::try_from(adr.temp_index())
                .ok()
                .and_then(|i| self.created.get_mut(i))
            {
                *slot = None;
            }
        } else {
            self.removed.push((num, adr, rec.clone()));
            self.removed_set.insert(adr);
        }
        let delta = self.deltas.entry(num).or_insert((0, 0));
        delta.0 -= 1;
        delta.1 -= rec.size() as i64;
        self.touched.insert(num);
        Ok(rec)
    }

    // -------------------------------------------------------------------
    // schema changes
    // -------------------------------------------------------------------

    fn system(&self, num: TableNum) -> CoreResult<Arc<Table>> {
        self.schema
            .table(num)
            .cloned()
            .ok_or_else(|| CoreError::internal(format!("missing system table {num}")))
    }

    fn insert_system(&mut self, num: TableNum, rec: Record) -> CoreResult<()> {
        let table = self.system(num)?;
        self.insert_row(&table, rec, None).map(|_| ())
    }

    fn remove_system(&mut self, num: TableNum, key: Record) -> CoreResult<()> {
        let table = self.system(num)?;
        let primary = table.primary()?.columns_string();
        let adr = self
            .index_mut(&table, &primary)?
            .lookup(&key)?
            .ok_or_else(|| CoreError::internal(format!("missing {} row {key}", table.name)))?;
        self.delete_row(&table, adr).map(|_| ())
    }

    fn replace_table(&mut self, table: Table) {
        self.schema_changed.insert(table.num);
        Arc::make_mut(&mut self.schema).insert(table);
    }

    fn num_key(num: TableNum) -> Record {
        RecordBuilder::new().int(i64::from(num)).build()
    }

    fn pair_key(num: TableNum, s: &str) -> Record {
        RecordBuilder::new().int(i64::from(num)).string(s).build()
    }

    /// Creates a table from schema text such as `(a,b,c) key(a) index(b)`
    /// and returns its number.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the name is taken or the definition has
    /// no key, or `InvalidFormat` for malformed text.
    pub fn create_table(&mut self, name: &str, schema: &str) -> CoreResult<TableNum> {
        self.ensure_update()?;
        if self.schema.get(name).is_some() {
            return Err(CoreError::invalid_operation(format!("table {name} already exists")));
        }
        let num = self.next_table.max(self.schema.next_table_num());
        let table = SchemaText::parse(schema)?.to_table(num, name)?;
        self.next_table = num + 1;
        for (sys, rec) in table_rows(&table) {
            self.insert_system(sys, rec)?;
        }
        debug!(table = name, num, "create table");
        self.replace_table(table);
        Ok(num)
    }

    /// Drops a table and all its rows.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `InvalidOperation` for a system table.
    pub fn drop_table(&mut self, name: &str) -> CoreResult<()> {
        self.ensure_update()?;
        let table = self.user_table(name)?;
        let num = table.num;
        for (adr, _) in self.records(name)? {
            self.delete_row(&table, adr)?;
        }
        for slot in &mut self.created {
            if matches!(slot, Some((n, _)) if *n == num) {
                *slot = None;
            }
        }
        self.remove_system(TABLES_TABLE, Self::num_key(num))?;
        for c in &table.columns {
            self.remove_system(COLUMNS_TABLE, Self::pair_key(num, &c.name))?;
        }
        for ix in &table.indexes {
            self.remove_system(INDEXES_TABLE, Self::pair_key(num, &ix.columns_string()))?;
        }
        self.trees.retain(|(n, _), _| *n != num);
        self.next_table = self.next_table.max(num + 1);
        self.schema_changed.insert(num);
        Arc::make_mut(&mut self.schema).remove(num);
        debug!(table = name, num, "drop table");
        Ok(())
    }

    /// Renames a table.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, or `InvalidOperation` if `to` is taken.
    pub fn rename_table(&mut self, from: &str, to: &str) -> CoreResult<()> {
        self.ensure_update()?;
        let table = self.user_table(from)?;
        if self.schema.get(to).is_some() {
            return Err(CoreError::invalid_operation(format!("table {to} already exists")));
        }
        let mut renamed = (*table).clone();
        renamed.name = to.to_string();
        self.remove_system(TABLES_TABLE, Self::num_key(table.num))?;
        self.insert_system(TABLES_TABLE, tables_row(&renamed))?;
        self.replace_table(renamed);
        Ok(())
    }

    /// Adds a column at the next free field.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `InvalidOperation` if the column exists.
    pub fn add_column(&mut self, table: &str, column: &str) -> CoreResult<()> {
        self.ensure_update()?;
        let table = self.user_table(table)?;
        let mut changed = (*table).clone();
        let field = changed.nextfield;
        changed.push_column(column, field)?;
        self.remove_system(TABLES_TABLE, Self::num_key(table.num))?;
        self.insert_system(TABLES_TABLE, tables_row(&changed))?;
        let col = changed
            .columns
            .iter()
            .find(|c| c.name == column)
            .cloned()
            .ok_or_else(|| CoreError::internal("added column vanished"))?;
        self.insert_system(COLUMNS_TABLE, columns_row(table.num, &col))?;
        self.replace_table(changed);
        Ok(())
    }

    /// Removes a column. Its field position is not reused.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, or `InvalidOperation` if an index uses the column.
    pub fn drop_column(&mut self, table: &str, column: &str) -> CoreResult<()> {
        self.ensure_update()?;
        let table = self.user_table(table)?;
        let mut changed = (*table).clone();
        changed.remove_column(column)?;
        self.remove_system(COLUMNS_TABLE, Self::pair_key(table.num, column))?;
        self.replace_table(changed);
        Ok(())
    }

    /// Adds an index and fills it from the table's rows.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` for unknown columns or an existing index,
    /// or a `DuplicateKey` conflict if existing rows violate the new index.
    pub fn add_index(&mut self, table: &str, columns: &str, mode: IndexMode) -> CoreResult<()> {
        self.ensure_update()?;
        let t = self.user_table(table)?;
        let mut changed = (*t).clone();
        let index = changed.push_index(columns, mode)?.clone();
        let cols = index.columns_string();
        if self.maintains_indexes(t.num) {
            let storage = self.manager.storage().clone();
            let mut tree = BtreeIndex::new(index.clone(), Btree::new(storage, self.manager.node_size()));
            let none = HashSet::new();
            for (adr, rec) in self.records(table)? {
                if tree.conflicts(&rec, &none)?.is_some() {
                    return Err(CoreError::duplicate_key(t.name.clone(), cols));
                }
                tree.insert(&rec, adr)?;
            }
            self.trees.insert((t.num, cols.clone()), tree);
        }
        self.insert_system(INDEXES_TABLE, indexes_row(t.num, &index))?;
        debug!(table, index = %cols, "add index");
        self.replace_table(changed);
        Ok(())
    }

    /// Drops an index. A table keeps at least one key.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, or `InvalidOperation` for the last key.
    pub fn drop_index(&mut self, table: &str, columns: &str) -> CoreResult<()> {
        self.ensure_update()?;
        let t = self.user_table(table)?;
        let mut changed = (*t).clone();
        let removed = changed.remove_index(columns)?;
        let cols = removed.columns_string();
        self.remove_system(INDEXES_TABLE, Self::pair_key(t.num, &cols))?;
        self.trees.remove(&(t.num, cols));
        self.replace_table(changed);
        Ok(())
    }

    /// Defines a view.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the view exists.
    pub fn add_view(&mut self, name: &str, definition: &str) -> CoreResult<()> {
        self.ensure_update()?;
        if self.schema.view(name).is_some() {
            return Err(CoreError::invalid_operation(format!("view {name} already exists")));
        }
        self.insert_system(VIEWS_TABLE, views_row(name, definition))?;
        Arc::make_mut(&mut self.schema).set_view(name, definition);
        self.views_changed.insert(name.to_string());
        Ok(())
    }

    /// Removes a view.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no such view.
    pub fn drop_view(&mut self, name: &str) -> CoreResult<()> {
        self.ensure_update()?;
        if self.schema.view(name).is_none() {
            return Err(CoreError::not_found(format!("view {name}")));
        }
        self.remove_system(VIEWS_TABLE, RecordBuilder::new().string(name).build())?;
        Arc::make_mut(&mut self.schema).remove_view(name);
        self.views_changed.insert(name.to_string());
        Ok(())
    }

    // -------------------------------------------------------------------
    // completion
    // -------------------------------------------------------------------

    fn finish(&mut self, state: TransactionState) {
        if self.is_active() {
            self.state = state;
            self.manager.release(self.kind, self.snapshot.seq);
        }
    }

    /// Commits the transaction and returns the published sequence number.
    /// A readonly transaction simply completes.
    ///
    /// # Errors
    ///
    /// Returns a `Conflict` if a concurrent commit collides with this one, or
    /// `Poisoned` after an earlier write failure. The transaction is aborted
    /// either way.
    pub fn commit(mut self) -> CoreResult<SequenceNumber> {
        self.ensure_active()?;
        if !self.kind.is_update() {
            self.finish(TransactionState::Committed);
            return Ok(self.snapshot.seq);
        }
        let manager = self.manager;
        match manager.commit(&self) {
            Ok(seq) => {
                self.finish(TransactionState::Committed);
                Ok(seq)
            }
            Err(e) => {
                self.finish(TransactionState::Aborted);
                Err(e)
            }
        }
    }

    /// Ends the transaction, committing any changes.
    ///
    /// # Errors
    ///
    /// As for [`Transaction::commit`].
    pub fn complete(self) -> CoreResult<()> {
        self.commit().map(|_| ())
    }

    /// Discards the transaction.
    pub fn abort(mut self) {
        self.finish(TransactionState::Aborted);
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.is_active() {
            warn!(kind = ?self.kind, snapshot = self.snapshot.seq.as_u64(), "transaction dropped while active; aborting");
            self.finish(TransactionState::Aborted);
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("snapshot", &self.snapshot.seq)
            .field("created", &self.created.len())
            .field("removed", &self.removed.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use crate::database::Database;
    use crate::error::{ConflictKind, CoreError};
    use crate::record::{Record, RecordBuilder};
    use crate::schema::IndexMode;
    use crate::tools::CheckStatus;

    fn row(id: i64, name: &str) -> Record {
        RecordBuilder::new().int(id).string(name).build()
    }

    fn key(id: i64) -> Record {
        RecordBuilder::new().int(id).build()
    }

    fn people() -> Database {
        let db = Database::open_in_memory().unwrap();
        let mut t = db.update_transaction().unwrap();
        t.create_table("people", "(id,name) key(id) index(name)").unwrap();
        t.commit().unwrap();
        db
    }

    #[test]
    fn reads_see_own_writes() {
        let db = people();
        let mut t = db.update_transaction().unwrap();
        let adr = t.add_record("people", row(1, "ann")).unwrap();
        assert!(adr.is_temp());
        let (found, rec) = t.lookup("people", "id", &key(1)).unwrap().unwrap();
        assert_eq!(found, adr);
        assert_eq!(rec.get_string(1).unwrap(), "ann");
        assert_eq!(t.table_info("people").unwrap().nrows, 1);
        t.commit().unwrap();

        let mut r = db.readonly_tran().unwrap();
        let (adr, rec) = r.lookup("people", "id", &key(1)).unwrap().unwrap();
        assert!(!adr.is_temp());
        assert_eq!(rec, row(1, "ann"));
        assert_eq!(r.table_info("people").unwrap().nrows, 1);
        r.complete().unwrap();
    }

    #[test]
    fn snapshot_ignores_later_commits() {
        let db = people();
        let mut reader = db.readonly_tran().unwrap();
        let mut writer = db.update_transaction().unwrap();
        writer.add_record("people", row(1, "ann")).unwrap();
        writer.commit().unwrap();

        assert!(reader.records("people").unwrap().is_empty());
        reader.complete().unwrap();
        let mut fresh = db.readonly_tran().unwrap();
        assert_eq!(fresh.records("people").unwrap().len(), 1);
        fresh.abort();
    }

    #[test]
    fn duplicate_key_in_one_transaction() {
        let db = people();
        let mut t = db.update_transaction().unwrap();
        t.add_record("people", row(1, "ann")).unwrap();
        let err = t.add_record("people", row(1, "bob")).unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));
        t.add_record("people", row(2, "ann")).unwrap();
        t.commit().unwrap();
    }

    #[test]
    fn update_and_remove() {
        let db = people();
        let mut t = db.update_transaction().unwrap();
        t.add_record("people", row(1, "ann")).unwrap();
        t.add_record("people", row(2, "bob")).unwrap();
        t.commit().unwrap();

        let mut t = db.update_transaction().unwrap();
        let (a, _) = t.lookup("people", "id", &key(1)).unwrap().unwrap();
        let a2 = t.update_record("people", a, row(1, "anne")).unwrap();
        assert!(t.update_record("people", a2, row(2, "dup")).is_err());
        let (b, _) = t.lookup("people", "id", &key(2)).unwrap().unwrap();
        t.remove_record("people", b).unwrap();
        assert!(t.remove_record("people", b).is_err());
        t.commit().unwrap();

        let mut r = db.readonly_tran().unwrap();
        let rows = r.records("people").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, row(1, "anne"));
        assert_eq!(r.get_btree_index("people", "name").unwrap().iter().count(), 1);
        r.complete().unwrap();
    }

    #[test]
    fn readonly_cannot_write() {
        let db = people();
        let mut r = db.readonly_tran().unwrap();
        assert!(r.add_record("people", row(1, "x")).is_err());
        assert!(r.create_table("x", "(a) key(a)").is_err());
        r.abort();
    }

    #[test]
    fn concurrent_delete_conflicts() {
        let db = people();
        let mut t = db.update_transaction().unwrap();
        t.add_record("people", row(1, "ann")).unwrap();
        t.commit().unwrap();

        let mut t1 = db.update_transaction().unwrap();
        let mut t2 = db.update_transaction().unwrap();
        let (a1, _) = t1.lookup("people", "id", &key(1)).unwrap().unwrap();
        let (a2, _) = t2.lookup("people", "id", &key(1)).unwrap().unwrap();
        t1.remove_record("people", a1).unwrap();
        t2.update_record("people", a2, row(1, "changed")).unwrap();
        t1.commit().unwrap();
        let err = t2.commit().unwrap_err();
        assert!(matches!(
            err.conflict_kind(),
            Some(crate::error::ConflictKind::WriteConflict { .. })
        ));
    }

    #[test]
    fn schema_change_conflicts_with_writers() {
        let db = people();
        let mut writer = db.update_transaction().unwrap();
        let mut ddl = db.update_transaction().unwrap();
        writer.add_record("people", row(1, "ann")).unwrap();
        ddl.add_column("people", "email").unwrap();
        ddl.commit().unwrap();
        let err = writer.commit().unwrap_err();
        assert!(matches!(
            err.conflict_kind(),
            Some(crate::error::ConflictKind::SchemaChanged { .. })
        ));
    }

    #[test]
    fn schema_operations() {
        let db = people();
        let mut t = db.update_transaction().unwrap();
        t.add_record("people", row(1, "ann")).unwrap();
        t.add_column("people", "email").unwrap();
        t.add_index("people", "email", IndexMode::Plain).unwrap();
        t.add_view("ann_only", "people where name = 'ann'").unwrap();
        t.commit().unwrap();

        let schema = db.schema();
        let people = schema.require("people").unwrap();
        assert_eq!(people.schema(), "(id,name,email) key(id) index(email) index(name)");
        assert_eq!(schema.view("ann_only"), Some("people where name = 'ann'"));

        let mut t = db.update_transaction().unwrap();
        assert!(t.drop_column("people", "email").is_err());
        t.drop_index("people", "email").unwrap();
        t.drop_column("people", "email").unwrap();
        t.rename_table("people", "persons").unwrap();
        t.drop_view("ann_only").unwrap();
        t.commit().unwrap();

        let schema = db.schema();
        assert!(schema.get("people").is_none());
        assert_eq!(
            schema.require("persons").unwrap().schema(),
            "(id,name,-) key(id) index(name)"
        );
        assert!(schema.view("ann_only").is_none());

        let mut r = db.readonly_tran().unwrap();
        assert_eq!(r.records("persons").unwrap().len(), 1);
        r.complete().unwrap();
    }

    #[test]
    fn add_index_rejects_existing_duplicates() {
        let db = Database::open_in_memory().unwrap();
        db.transaction(|t| {
            t.create_table("pets", "(id,name) key(id)")?;
            t.add_record("pets", row(1, "rex"))?;
            t.add_record("pets", row(2, "rex"))
        })
        .unwrap();

        let mut t = db.update_transaction().unwrap();
        let err = t.add_index("pets", "name", IndexMode::Unique).unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));
        assert_eq!(t.table("pets").unwrap().indexes.len(), 1);
        t.add_index("pets", "name", IndexMode::Plain).unwrap();
        assert_eq!(t.table("pets").unwrap().indexes.len(), 2);
        t.commit().unwrap();

        let mut r = db.readonly_tran().unwrap();
        assert_eq!(r.get_btree_index("pets", "name").unwrap().iter().count(), 2);
        r.complete().unwrap();
    }

    #[test]
    fn drop_and_create_same_name_keeps_the_new_table() {
        let db = people();
        for i in 0..64 {
            let mut t = db.update_transaction().unwrap();
            t.drop_table("people").unwrap();
            let num = t.create_table("people", "(id,name) key(id) index(name)").unwrap();
            t.add_record("people", row(i, "ann")).unwrap();
            t.commit().unwrap();

            let schema = db.schema();
            assert_eq!(schema.require("people").unwrap().num, num);
            assert_eq!(schema.user_tables().len(), 1);
            let mut r = db.readonly_tran().unwrap();
            assert_eq!(r.records("people").unwrap().len(), 1);
            r.complete().unwrap();
        }
    }

    #[test]
    fn inserts_racing_index_changes_keep_every_index() {
        let db = Database::open_in_memory().unwrap();
        db.transaction(|t| t.create_table("flux", "(k,v) key(k)").map(|_| ()))
            .unwrap();

        std::thread::scope(|s| {
            for th in 0..2i64 {
                let db = &db;
                s.spawn(move || {
                    for i in 0..100 {
                        let rec = RecordBuilder::new().int(th * 1000 + i).int(i % 3).build();
                        match db.transaction(|t| t.add_record("flux", rec)) {
                            Ok(_) | Err(CoreError::Conflict { .. }) => {}
                            Err(e) => panic!("insert failed: {e}"),
                        }
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..40 {
                    let flipped = db.transaction(|t| {
                        if t.table("flux")?.index("v").is_some() {
                            t.drop_index("flux", "v")
                        } else {
                            t.add_index("flux", "v", IndexMode::Plain)
                        }
                    });
                    match flipped {
                        Ok(()) | Err(CoreError::Conflict { .. }) => {}
                        Err(e) => panic!("index change failed: {e}"),
                    }
                }
            });
        });

        let mut r = db.readonly_tran().unwrap();
        let rows = r.records("flux").unwrap().len();
        for ix in &r.table("flux").unwrap().indexes {
            let cols = ix.columns_string();
            assert_eq!(r.get_btree_index("flux", &cols).unwrap().iter().count(), rows);
        }
        r.complete().unwrap();
        assert_eq!(db.check().status, CheckStatus::Ok);
    }

    #[test]
    fn drop_table_removes_rows() {
        let db = people();
        let mut t = db.update_transaction().unwrap();
        t.add_record("people", row(1, "ann")).unwrap();
        t.commit().unwrap();

        let mut t = db.update_transaction().unwrap();
        t.drop_table("people").unwrap();
        let num = t.create_table("people", "(id) key(id)").unwrap();
        t.commit().unwrap();

        let mut r = db.readonly_tran().unwrap();
        assert!(r.records("people").unwrap().is_empty());
        assert_eq!(r.table("people").unwrap().num, num);
        r.complete().unwrap();
    }

    #[test]
    fn bulk_builds_indexes_at_commit() {
        let db = people();
        let mut t = db.bulk_transaction().unwrap();
        for i in 0..500 {
            t.add_record("people", row(i, &format!("n{}", i % 7))).unwrap();
        }
        t.commit().unwrap();

        let mut r = db.readonly_tran().unwrap();
        assert_eq!(r.records("people").unwrap().len(), 500);
        assert_eq!(r.get_btree_index("people", "name").unwrap().iter().count(), 500);
        assert_eq!(r.table_info("people").unwrap().nrows, 500);
        r.complete().unwrap();
    }

    #[test]
    fn bulk_commit_rejects_duplicate_keys() {
        let db = people();
        db.transaction(|t| t.add_record("people", row(7, "old"))).unwrap();

        let mut t = db.bulk_transaction().unwrap();
        t.add_record("people", row(1, "ann")).unwrap();
        t.add_record("people", row(1, "bob")).unwrap();
        let err = t.commit().unwrap_err();
        assert!(matches!(
            err,
            CoreError::Conflict { kind: ConflictKind::DuplicateKey { .. } }
        ));

        let mut t = db.bulk_transaction().unwrap();
        t.add_record("people", row(7, "again")).unwrap();
        assert!(t.commit().is_err());

        let mut r = db.readonly_tran().unwrap();
        assert_eq!(r.records("people").unwrap().len(), 1);
        r.complete().unwrap();
        assert_eq!(db.check().status, CheckStatus::Ok);
    }
}
