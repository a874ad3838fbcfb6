//! Table definitions and the textual schema format.
//!
//! A schema string lists the fields in order, with `-` for slots no column
//! uses, followed by the indexes:
//!
//! ```text
//! (id,name,-,city) key(id) index(city,name) unique(name)
//! ```

use crate::error::{CoreError, CoreResult};
use crate::record::Record;
use crate::types::TableNum;
use std::fmt;

/// Placeholder for an unused field slot.
pub const UNUSED_COLUMN: &str = "-";

/// Index uniqueness mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexMode {
    /// Unique key. Every table needs at least one.
    Key,
    /// Unique unless every indexed field is empty.
    Unique,
    /// Duplicates allowed.
    Plain,
}

impl IndexMode {
    /// The value stored in the `indexes` system table.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Key => "key",
            Self::Unique => "unique",
            Self::Plain => "",
        }
    }

    /// Parses the stored value.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for an unknown mode.
    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "key" => Ok(Self::Key),
            "unique" => Ok(Self::Unique),
            "" | "index" => Ok(Self::Plain),
            _ => Err(CoreError::invalid_format(format!("unknown index mode {s:?}"))),
        }
    }

    fn keyword(self) -> &'static str {
        match self {
            Self::Key => "key",
            Self::Unique => "unique",
            Self::Plain => "index",
        }
    }
}

/// A named column bound to a field position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Field position in the table's records.
    pub field: usize,
}

/// An index definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    /// Indexed column names, in key order.
    pub columns: Vec<String>,
    /// Field positions of the indexed columns.
    pub fields: Vec<usize>,
    /// Uniqueness mode.
    pub mode: IndexMode,
}

impl Index {
    /// Comma-separated column names, the index's identity within its table.
    #[must_use]
    pub fn columns_string(&self) -> String {
        self.columns.join(",")
    }

    /// Returns true if two records with the same key fields may not coexist.
    #[must_use]
    pub fn is_unique_for(&self, key: &Record) -> bool {
        match self.mode {
            IndexMode::Key => true,
            IndexMode::Unique => !key.all_empty(),
            IndexMode::Plain => false,
        }
    }
}

/// A table definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    /// Table number.
    pub num: TableNum,
    /// Table name.
    pub name: String,
    /// Columns, ordered by field.
    pub columns: Vec<Column>,
    /// Indexes; key indexes first.
    pub indexes: Vec<Index>,
    /// Next field position to assign.
    pub nextfield: usize,
}

impl Table {
    /// Builds a table from column names (with `-` placeholders) and index
    /// specifications.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` for duplicate columns, an index on an
    /// unknown column, or a table without a key.
    pub fn new(
        num: TableNum,
        name: &str,
        columns: &[&str],
        indexes: &[(&str, IndexMode)],
    ) -> CoreResult<Self> {
        let mut table = Self {
            num,
            name: name.to_string(),
            columns: Vec::new(),
            indexes: Vec::new(),
            nextfield: columns.len(),
        };
        for (field, col) in columns.iter().enumerate() {
            if *col != UNUSED_COLUMN {
                table.push_column(col, field)?;
            }
        }
        for (cols, mode) in indexes {
            table.push_index(cols, *mode)?;
        }
        table.ensure_key()?;
        Ok(table)
    }

    /// Adds a column at a known field position.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the name is already used.
    pub fn push_column(&mut self, name: &str, field: usize) -> CoreResult<()> {
        if name.is_empty() || name == UNUSED_COLUMN {
            return Err(CoreError::invalid_operation(format!("invalid column name {name:?}")));
        }
        if self.field(name).is_some() {
            return Err(CoreError::invalid_operation(format!(
                "{}: column {name} already exists",
                self.name
            )));
        }
        let at = self.columns.partition_point(|c| c.field < field);
        self.columns.insert(
            at,
            Column {
                name: name.to_string(),
                field,
            },
        );
        self.nextfield = self.nextfield.max(field + 1);
        Ok(())
    }

    /// Removes a column.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if it does not exist, or `InvalidOperation` if an
    /// index uses it.
    pub fn remove_column(&mut self, name: &str) -> CoreResult<Column> {
        if self.indexes.iter().any(|ix| ix.columns.iter().any(|c| c == name)) {
            return Err(CoreError::invalid_operation(format!(
                "{}: column {name} is used by an index",
                self.name
            )));
        }
        let at = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| CoreError::not_found(format!("column {}.{name}", self.name)))?;
        Ok(self.columns.remove(at))
    }

    /// Adds an index over existing columns.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` for an unknown column or an existing index.
    pub fn push_index(&mut self, columns: &str, mode: IndexMode) -> CoreResult<&Index> {
        let names: Vec<String> = split_columns(columns);
        if names.is_empty() {
            return Err(CoreError::invalid_operation("index needs at least one column"));
        }
        let joined = names.join(",");
        if self.index(&joined).is_some() {
            return Err(CoreError::invalid_operation(format!(
                "{}: index ({joined}) already exists",
                self.name
            )));
        }
        let fields = names
            .iter()
            .map(|n| {
                self.field(n).ok_or_else(|| {
                    CoreError::invalid_operation(format!("{}: no column {n}", self.name))
                })
            })
            .collect::<CoreResult<Vec<_>>>()?;
        let index = Index {
            columns: names,
            fields,
            mode,
        };
        let at = self
            .indexes
            .partition_point(|ix| (ix.mode, ix.columns_string()) < (mode, joined.clone()));
        self.indexes.insert(at, index);
        Ok(&self.indexes[at])
    }

    /// Removes an index, keeping at least one key.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `InvalidOperation` if it is the last key.
    pub fn remove_index(&mut self, columns: &str) -> CoreResult<Index> {
        let joined = split_columns(columns).join(",");
        let at = self
            .indexes
            .iter()
            .position(|ix| ix.columns_string() == joined)
            .ok_or_else(|| CoreError::not_found(format!("index {}({joined})", self.name)))?;
        let removed = self.indexes.remove(at);
        if let Err(e) = self.ensure_key() {
            self.indexes.insert(at, removed);
            return Err(e);
        }
        Ok(removed)
    }

    fn ensure_key(&self) -> CoreResult<()> {
        if self.indexes.iter().any(|ix| ix.mode == IndexMode::Key) {
            Ok(())
        } else {
            Err(CoreError::invalid_operation(format!(
                "{}: a table needs a key",
                self.name
            )))
        }
    }

    /// Field position of a column.
    #[must_use]
    pub fn field(&self, column: &str) -> Option<usize> {
        self.columns.iter().find(|c| c.name == column).map(|c| c.field)
    }

    /// Index by its comma-separated columns.
    #[must_use]
    pub fn index(&self, columns: &str) -> Option<&Index> {
        let joined = split_columns(columns).join(",");
        self.indexes.iter().find(|ix| ix.columns_string() == joined)
    }

    /// The primary index: the first key.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the table has no key.
    pub fn primary(&self) -> CoreResult<&Index> {
        self.indexes
            .iter()
            .find(|ix| ix.mode == IndexMode::Key)
            .ok_or_else(|| CoreError::internal(format!("{} has no key", self.name)))
    }

    /// Number of leading fields any column uses.
    #[must_use]
    pub fn used_fields(&self) -> usize {
        self.columns.iter().map(|c| c.field + 1).max().unwrap_or(0)
    }

    /// The textual schema.
    #[must_use]
    pub fn schema(&self) -> String {
        let mut slots = vec![UNUSED_COLUMN; self.nextfield];
        for c in &self.columns {
            if c.field < slots.len() {
                slots[c.field] = &c.name;
            }
        }
        let mut s = format!("({})", slots.join(","));
        for ix in &self.indexes {
            s.push_str(&format!(" {}({})", ix.mode.keyword(), ix.columns_string()));
        }
        s
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.schema())
    }
}

fn split_columns(columns: &str) -> Vec<String> {
    columns
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parsed schema text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaText {
    /// Field slots, `-` for unused.
    pub columns: Vec<String>,
    /// Index columns and modes.
    pub indexes: Vec<(String, IndexMode)>,
}

impl SchemaText {
    /// Parses `(a,b,-) key(a) index(b)`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for malformed text.
    pub fn parse(text: &str) -> CoreResult<Self> {
        let text = text.trim();
        let rest = text
            .strip_prefix('(')
            .ok_or_else(|| CoreError::invalid_format("schema must start with '('"))?;
        let close = rest
            .find(')')
            .ok_or_else(|| CoreError::invalid_format("unterminated column list"))?;
        let columns = rest[..close]
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let mut indexes = Vec::new();
        let mut rest = rest[close + 1..].trim_start();
        while !rest.is_empty() {
            let open = rest
                .find('(')
                .ok_or_else(|| CoreError::invalid_format(format!("expected index at {rest:?}")))?;
            let mode = match rest[..open].trim() {
                "key" => IndexMode::Key,
                "unique" => IndexMode::Unique,
                "index" => IndexMode::Plain,
                other => {
                    return Err(CoreError::invalid_format(format!(
                        "unknown index kind {other:?}"
                    )))
                }
            };
            let close = rest
                .find(')')
                .ok_or_else(|| CoreError::invalid_format("unterminated index columns"))?;
            if close < open {
                return Err(CoreError::invalid_format("malformed index"));
            }
            indexes.push((split_columns(&rest[open + 1..close]).join(","), mode));
            rest = rest[close + 1..].trim_start();
        }
        Ok(Self { columns, indexes })
    }

    /// Builds a table from the parsed text.
    ///
    /// # Errors
    ///
    /// Returns an error if the definition is inconsistent.
    pub fn to_table(&self, num: TableNum, name: &str) -> CoreResult<Table> {
        let cols: Vec<&str> = self.columns.iter().map(String::as_str).collect();
        let ixs: Vec<(&str, IndexMode)> =
            self.indexes.iter().map(|(c, m)| (c.as_str(), *m)).collect();
        Table::new(num, name, &cols, &ixs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customers() -> Table {
        Table::new(
            5,
            "customers",
            &["id", "name", "-", "city"],
            &[("id", IndexMode::Key), ("city,name", IndexMode::Plain), ("name", IndexMode::Unique)],
        )
        .unwrap()
    }

    #[test]
    fn schema_text() {
        let t = customers();
        assert_eq!(
            t.schema(),
            "(id,name,-,city) key(id) unique(name) index(city,name)"
        );
        assert_eq!(t.field("city"), Some(3));
        assert_eq!(t.primary().unwrap().columns, vec!["id"]);
        assert_eq!(t.index("city, name").unwrap().fields, vec![3, 1]);
        assert_eq!(t.used_fields(), 4);
    }

    #[test]
    fn parse_round_trip() {
        let t = customers();
        let parsed = SchemaText::parse(&t.schema()).unwrap();
        assert_eq!(parsed.to_table(5, "customers").unwrap(), t);
    }

    #[test]
    fn parse_errors() {
        assert!(SchemaText::parse("a,b key(a)").is_err());
        assert!(SchemaText::parse("(a,b) primary(a)").is_err());
        assert!(SchemaText::parse("(a,b) key(a").is_err());
    }

    #[test]
    fn table_needs_key() {
        assert!(Table::new(5, "t", &["a"], &[("a", IndexMode::Plain)]).is_err());
        let mut t = Table::new(5, "t", &["a"], &[("a", IndexMode::Key)]).unwrap();
        assert!(t.remove_index("a").is_err());
        assert_eq!(t.indexes.len(), 1);
    }

    #[test]
    fn columns_used_by_indexes_cannot_drop() {
        let mut t = customers();
        assert!(t.remove_column("id").is_err());
        t.push_column("zip", t.nextfield).unwrap();
        assert_eq!(t.field("zip"), Some(4));
        assert_eq!(t.remove_column("zip").unwrap().field, 4);
        assert_eq!(t.schema(), "(id,name,-,city,-) key(id) unique(name) index(city,name)");
    }

    #[test]
    fn unique_allows_empty_keys() {
        let t = customers();
        let unique = t.index("name").unwrap();
        assert!(!unique.is_unique_for(&crate::record::RecordBuilder::new().empty().build()));
        assert!(unique.is_unique_for(&crate::record::RecordBuilder::new().string("x").build()));
    }
}
