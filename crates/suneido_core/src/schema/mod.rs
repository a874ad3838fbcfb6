//! Table metadata.
//!
//! The schema is stored as ordinary rows of four system tables and read back
//! through the same indexes as user data:
//!
//! | num | table     | fields                              | key                |
//! |-----|-----------|-------------------------------------|--------------------|
//! | 1   | `tables`  | table, tablename, nextfield         | (table), (tablename) |
//! | 2   | `columns` | table, column, field                | (table,column)     |
//! | 3   | `indexes` | table, columns, mode                | (table,columns)    |
//! | 4   | `views`   | view_name, view_definition          | (view_name)        |
//!
//! The system tables themselves are not described by rows.

mod table;

pub use table::{Column, Index, IndexMode, SchemaText, Table, UNUSED_COLUMN};

use crate::error::{CoreError, CoreResult};
use crate::record::{Record, RecordBuilder};
use crate::types::TableNum;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::warn;

/// Table of tables.
pub const TABLES_TABLE: TableNum = 1;
/// Table of columns.
pub const COLUMNS_TABLE: TableNum = 2;
/// Table of indexes.
pub const INDEXES_TABLE: TableNum = 3;
/// Table of views.
pub const VIEWS_TABLE: TableNum = 4;
/// First number assigned to a user table.
pub const FIRST_USER_TABLE: TableNum = 5;

/// Returns true for the four system tables.
#[must_use]
pub const fn is_system_table(num: TableNum) -> bool {
    num < FIRST_USER_TABLE
}

fn system_table(num: TableNum, name: &str, columns: &[&str], keys: &[&[usize]]) -> Table {
    Table {
        num,
        name: name.to_string(),
        columns: columns
            .iter()
            .enumerate()
            .map(|(field, c)| Column {
                name: (*c).to_string(),
                field,
            })
            .collect(),
        indexes: keys
            .iter()
            .map(|fields| Index {
                columns: fields.iter().map(|&f| columns[f].to_string()).collect(),
                fields: fields.to_vec(),
                mode: IndexMode::Key,
            })
            .collect(),
        nextfield: columns.len(),
    }
}

/// Definitions of the system tables.
#[must_use]
pub fn system_tables() -> Vec<Table> {
    vec![
        system_table(
            TABLES_TABLE,
            "tables",
            &["table", "tablename", "nextfield"],
            &[&[0], &[1]],
        ),
        system_table(COLUMNS_TABLE, "columns", &["table", "column", "field"], &[&[0, 1]]),
        system_table(INDEXES_TABLE, "indexes", &["table", "columns", "mode"], &[&[0, 1]]),
        system_table(VIEWS_TABLE, "views", &["view_name", "view_definition"], &[&[0]]),
    ]
}

/// Row of `tables` for a table.
#[must_use]
pub fn tables_row(table: &Table) -> Record {
    RecordBuilder::new()
        .int(i64::from(table.num))
        .string(&table.name)
        .int(table.nextfield as i64)
        .build()
}

/// Row of `columns` for a column.
#[must_use]
pub fn columns_row(num: TableNum, column: &Column) -> Record {
    RecordBuilder::new()
        .int(i64::from(num))
        .string(&column.name)
        .int(column.field as i64)
        .build()
}

/// Row of `indexes` for an index.
#[must_use]
pub fn indexes_row(num: TableNum, index: &Index) -> Record {
    RecordBuilder::new()
        .int(i64::from(num))
        .string(&index.columns_string())
        .string(index.mode.as_str())
        .build()
}

/// Row of `views`.
#[must_use]
pub fn views_row(name: &str, definition: &str) -> Record {
    RecordBuilder::new().string(name).string(definition).build()
}

/// Every system row describing a user table.
#[must_use]
pub fn table_rows(table: &Table) -> Vec<(TableNum, Record)> {
    let mut rows = vec![(TABLES_TABLE, tables_row(table))];
    rows.extend(
        table
            .columns
            .iter()
            .map(|c| (COLUMNS_TABLE, columns_row(table.num, c))),
    );
    rows.extend(
        table
            .indexes
            .iter()
            .map(|ix| (INDEXES_TABLE, indexes_row(table.num, ix))),
    );
    rows
}

fn table_num(rec: &Record) -> CoreResult<TableNum> {
    let n = rec.get_int(0)?;
    TableNum::try_from(n).map_err(|_| CoreError::invalid_format(format!("bad table number {n}")))
}

fn field_num(rec: &Record, i: usize) -> CoreResult<usize> {
    let n = rec.get_int(i)?;
    usize::try_from(n).map_err(|_| CoreError::invalid_format(format!("bad field number {n}")))
}

/// An immutable snapshot of every table and view definition.
#[derive(Debug, Clone)]
pub struct Schema {
    tables: HashMap<TableNum, Arc<Table>>,
    names: HashMap<String, TableNum>,
    views: BTreeMap<String, String>,
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

impl Schema {
    /// A schema holding only the system tables.
    #[must_use]
    pub fn new() -> Self {
        let mut schema = Self {
            tables: HashMap::new(),
            names: HashMap::new(),
            views: BTreeMap::new(),
        };
        for t in system_tables() {
            schema.insert(t);
        }
        schema
    }

    /// Table by number.
    #[must_use]
    pub fn table(&self, num: TableNum) -> Option<&Arc<Table>> {
        self.tables.get(&num)
    }

    /// Table by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<Table>> {
        self.names.get(name).and_then(|n| self.tables.get(n))
    }

    /// Table by name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no such table.
    pub fn require(&self, name: &str) -> CoreResult<&Arc<Table>> {
        self.get(name)
            .ok_or_else(|| CoreError::not_found(format!("table {name}")))
    }

    /// All tables ordered by number.
    #[must_use]
    pub fn tables(&self) -> Vec<&Arc<Table>> {
        let mut all: Vec<_> = self.tables.values().collect();
        all.sort_by_key(|t| t.num);
        all
    }

    /// User tables ordered by number.
    #[must_use]
    pub fn user_tables(&self) -> Vec<&Arc<Table>> {
        self.tables()
            .into_iter()
            .filter(|t| !is_system_table(t.num))
            .collect()
    }

    /// Adds or replaces a table.
    pub fn insert(&mut self, table: Table) {
        if let Some(old) = self.tables.get(&table.num) {
            if self.names.get(&old.name) == Some(&table.num) {
                self.names.remove(&old.name);
            }
        }
        self.names.insert(table.name.clone(), table.num);
        self.tables.insert(table.num, Arc::new(table));
    }

    /// Removes a table.
    pub fn remove(&mut self, num: TableNum) -> Option<Arc<Table>> {
        let old = self.tables.remove(&num)?;
        if self.names.get(&old.name) == Some(&num) {
            self.names.remove(&old.name);
        }
        Some(old)
    }

    /// Number for the next created table.
    #[must_use]
    pub fn next_table_num(&self) -> TableNum {
        self.tables
            .keys()
            .copied()
            .max()
            .map_or(FIRST_USER_TABLE, |n| (n + 1).max(FIRST_USER_TABLE))
    }

    /// View definition by name.
    #[must_use]
    pub fn view(&self, name: &str) -> Option<&str> {
        self.views.get(name).map(String::as_str)
    }

    /// All views ordered by name.
    pub fn views(&self) -> impl Iterator<Item = (&str, &str)> {
        self.views.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Adds or replaces a view.
    pub fn set_view(&mut self, name: &str, definition: &str) {
        self.views.insert(name.to_string(), definition.to_string());
    }

    /// Removes a view.
    pub fn remove_view(&mut self, name: &str) -> Option<String> {
        self.views.remove(name)
    }
}

/// Reconstructs a [`Schema`] from system rows.
///
/// Rows may arrive in any order; [`SchemaBuilder::remove_row`] and
/// [`SchemaBuilder::drop_table`] replay deletions when the rows come from
/// the log.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    tables: BTreeMap<TableNum, (String, usize)>,
    columns: BTreeMap<(TableNum, String), usize>,
    indexes: BTreeMap<(TableNum, String), IndexMode>,
    views: BTreeMap<String, String>,
}

impl SchemaBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a system row. Rows of user tables are ignored.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the row does not decode.
    pub fn add_row(&mut self, table: TableNum, rec: &Record) -> CoreResult<()> {
        match table {
            TABLES_TABLE => {
                let num = table_num(rec)?;
                self.tables
                    .insert(num, (rec.get_string(1)?, field_num(rec, 2)?));
            }
            COLUMNS_TABLE => {
                self.columns
                    .insert((table_num(rec)?, rec.get_string(1)?), field_num(rec, 2)?);
            }
            INDEXES_TABLE => {
                let mode = IndexMode::parse(&rec.get_string(2)?)?;
                self.indexes
                    .insert((table_num(rec)?, rec.get_string(1)?), mode);
            }
            VIEWS_TABLE => {
                self.views.insert(rec.get_string(0)?, rec.get_string(1)?);
            }
            _ => {}
        }
        Ok(())
    }

    /// Reverses [`SchemaBuilder::add_row`]. A `tables` row only removes the
    /// table entry; see [`SchemaBuilder::drop_table`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the row does not decode.
    pub fn remove_row(&mut self, table: TableNum, rec: &Record) -> CoreResult<()> {
        match table {
            TABLES_TABLE => {
                self.tables.remove(&table_num(rec)?);
            }
            COLUMNS_TABLE => {
                self.columns.remove(&(table_num(rec)?, rec.get_string(1)?));
            }
            INDEXES_TABLE => {
                self.indexes.remove(&(table_num(rec)?, rec.get_string(1)?));
            }
            VIEWS_TABLE => {
                self.views.remove(&rec.get_string(0)?);
            }
            _ => {}
        }
        Ok(())
    }

    /// Forgets a table with its columns and indexes.
    pub fn drop_table(&mut self, num: TableNum) {
        self.tables.remove(&num);
        self.columns.retain(|(t, _), _| *t != num);
        self.indexes.retain(|(t, _), _| *t != num);
    }

    /// Returns true if a table with this number is defined.
    #[must_use]
    pub fn has_table(&self, num: TableNum) -> bool {
        self.tables.contains_key(&num)
    }

    /// Builds the schema. Tables that fail to assemble are skipped with a
    /// warning when `lenient`, otherwise they are an error.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` for an inconsistent table when not lenient.
    pub fn build(self, lenient: bool) -> CoreResult<Schema> {
        let mut schema = Schema::new();
        for (num, (name, nextfield)) in &self.tables {
            match self.assemble(*num, name, *nextfield) {
                Ok(table) => schema.insert(table),
                Err(e) if lenient => warn!(table = %name, error = %e, "skipping table"),
                Err(e) => {
                    return Err(CoreError::corrupted(0, format!("table {name}: {e}")));
                }
            }
        }
        for ((num, column), _) in &self.columns {
            if !self.tables.contains_key(num) {
                warn!(table = num, column = %column, "column row without table");
            }
        }
        schema.views = self.views;
        Ok(schema)
    }

    fn assemble(&self, num: TableNum, name: &str, nextfield: usize) -> CoreResult<Table> {
        let mut table = Table {
            num,
            name: name.to_string(),
            columns: Vec::new(),
            indexes: Vec::new(),
            nextfield,
        };
        for ((t, column), field) in self.columns.range((num, String::new())..) {
            if *t != num {
                break;
            }
            table.push_column(column, *field)?;
        }
        for ((t, columns), mode) in self.indexes.range((num, String::new())..) {
            if *t != num {
                break;
            }
            table.push_index(columns, *mode)?;
        }
        table.primary()?;
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> Table {
        Table::new(
            7,
            "orders",
            &["id", "customer", "total"],
            &[("id", IndexMode::Key), ("customer", IndexMode::Plain)],
        )
        .unwrap()
    }

    #[test]
    fn bootstrap_has_system_tables() {
        let schema = Schema::new();
        assert_eq!(schema.tables().len(), 4);
        assert_eq!(schema.require("columns").unwrap().num, COLUMNS_TABLE);
        assert_eq!(schema.next_table_num(), FIRST_USER_TABLE);
        assert!(schema.user_tables().is_empty());
        assert!(schema.require("nope").is_err());
    }

    #[test]
    fn removing_a_replaced_name_keeps_the_new_table() {
        let mut schema = Schema::new();
        schema.insert(orders());
        let mut again = orders();
        again.num = 8;
        schema.insert(again);
        assert!(schema.remove(7).is_some());
        assert_eq!(schema.require("orders").unwrap().num, 8);
        assert_eq!(schema.user_tables().len(), 1);
    }

    #[test]
    fn rows_rebuild_the_table() {
        let table = orders();
        let mut builder = SchemaBuilder::new();
        for (num, rec) in table_rows(&table) {
            builder.add_row(num, &rec).unwrap();
        }
        builder
            .add_row(VIEWS_TABLE, &views_row("big", "orders where total > 100"))
            .unwrap();
        let schema = builder.build(false).unwrap();
        assert_eq!(**schema.require("orders").unwrap(), table);
        assert_eq!(schema.view("big"), Some("orders where total > 100"));
        assert_eq!(schema.next_table_num(), 8);
    }

    #[test]
    fn dropping_forgets_columns() {
        let table = orders();
        let mut builder = SchemaBuilder::new();
        for (num, rec) in table_rows(&table) {
            builder.add_row(num, &rec).unwrap();
        }
        builder.drop_table(7);
        assert!(!builder.has_table(7));

        let reused = Table::new(7, "other", &["k"], &[("k", IndexMode::Key)]).unwrap();
        for (num, rec) in table_rows(&reused) {
            builder.add_row(num, &rec).unwrap();
        }
        let schema = builder.build(false).unwrap();
        assert_eq!(**schema.table(7).unwrap(), reused);
        assert!(schema.get("orders").is_none());
    }

    #[test]
    fn table_without_key_is_rejected_unless_lenient() {
        let mut builder = SchemaBuilder::new();
        let t = orders();
        builder.add_row(TABLES_TABLE, &tables_row(&t)).unwrap();
        assert!(builder.build(false).is_err());

        let mut builder = SchemaBuilder::new();
        builder.add_row(TABLES_TABLE, &tables_row(&t)).unwrap();
        assert!(builder.build(true).unwrap().get("orders").is_none());
    }

    #[test]
    fn rename_replaces_name_index() {
        let mut schema = Schema::new();
        let mut t = orders();
        schema.insert(t.clone());
        t.name = "purchases".into();
        schema.insert(t);
        assert!(schema.get("orders").is_none());
        assert_eq!(schema.require("purchases").unwrap().num, 7);
    }
}
