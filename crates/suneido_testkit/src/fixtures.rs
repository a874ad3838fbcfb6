//! Test fixtures and database helpers.
//!
//! Provides convenience functions for setting up test databases
//! and common test scenarios.

use std::path::{Path, PathBuf};
use suneido_core::{Config, Database};
use tempfile::TempDir;

/// A test database with automatic cleanup.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    path: Option<PathBuf>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestDatabase {
    /// Creates a new in-memory test database.
    pub fn memory() -> Self {
        Self {
            db: Database::open_in_memory().expect("Failed to open in-memory database"),
            path: None,
            _temp_dir: None,
        }
    }

    /// Creates a new file-based test database in a temporary directory.
    pub fn file() -> Self {
        Self::file_with_config(Config::default())
    }

    /// Creates a new file-based test database with the given configuration.
    pub fn file_with_config(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("test.db");
        let db = Database::open_with_config(&path, config.mode(suneido_core::OpenMode::Create))
            .expect("Failed to create file database");
        Self {
            db,
            path: Some(path),
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns the database path if file-based, None if in-memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the temporary directory of a file-based database.
    pub fn dir(&self) -> Option<&Path> {
        self._temp_dir.as_ref().map(TempDir::path)
    }

    /// Closes and reopens a file-based database.
    pub fn reopen(self) -> Self {
        self.reopen_with_config(Config::default())
    }

    /// Closes and reopens a file-based database with the given configuration.
    pub fn reopen_with_config(self, config: Config) -> Self {
        let Self {
            db,
            path,
            _temp_dir,
        } = self;
        let path = path.expect("Only file databases can be reopened");
        db.close().expect("Failed to close database");
        drop(db);
        let db = Database::open_with_config(&path, config).expect("Failed to reopen database");
        Self {
            db,
            path: Some(path),
            _temp_dir,
        }
    }

    /// Closes the database, keeping the temporary directory and its files.
    ///
    /// Returns the directory guard and the file path.
    pub fn into_closed(self) -> (TempDir, PathBuf) {
        let Self {
            db,
            path,
            _temp_dir,
        } = self;
        db.close().expect("Failed to close database");
        drop(db);
        (
            _temp_dir.expect("Only file databases can be closed into a path"),
            path.expect("File database should have a path"),
        )
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Runs a test with a temporary in-memory database.
///
/// # Example
///
/// ```rust
/// use suneido_testkit::with_temp_db;
///
/// with_temp_db(|db| {
///     db.transaction(|t| t.create_table("test", "(a) key(a)").map(|_| ()))
///         .unwrap();
/// });
/// ```
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database) -> R,
{
    let test_db = TestDatabase::memory();
    f(&test_db.db)
}

/// Runs a test with a temporary file-based database.
pub fn with_file_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database, &Path) -> R,
{
    let test_db = TestDatabase::file();
    let path = test_db.path().expect("File database should have a path").to_path_buf();
    f(&test_db.db, &path)
}

/// Test scenario helpers.
pub mod scenarios {
    use suneido_core::{Database, Record, RecordBuilder};

    /// Schema of the table created by [`customers`].
    pub const CUSTOMERS_SCHEMA: &str = "(id,name,city) key(id) index(name) index(city,id)";

    /// The row [`customers`] inserts for `i`.
    pub fn customer(i: i64) -> Record {
        RecordBuilder::new()
            .int(i)
            .string(&format!("customer {i:05}"))
            .string(["Calgary", "Saskatoon", "Toronto", "Vancouver"][(i % 4) as usize])
            .build()
    }

    /// Creates a `customers` table holding `count` rows with ids `0..count`.
    pub fn customers(db: &Database, count: i64) {
        db.transaction(|t| {
            t.create_table("customers", CUSTOMERS_SCHEMA)?;
            for i in 0..count {
                t.add_record("customers", customer(i))?;
            }
            Ok(())
        })
        .expect("Failed to create customers");
    }

    /// Adds `count` rows to `customers`, starting at id `from`, one commit each.
    pub fn add_customers(db: &Database, from: i64, count: i64) {
        for i in from..from + count {
            db.transaction(|t| t.add_record("customers", customer(i)).map(|_| ()))
                .expect("Failed to add customer");
        }
    }

    /// Creates a database with `tables` tables of `rows` rows each.
    ///
    /// Table `n` is named `table_n` with schema `(k,v) key(k) index(v)`.
    pub fn many_tables(db: &Database, tables: usize, rows: i64) {
        db.transaction(|t| {
            for n in 0..tables {
                let name = format!("table_{n}");
                t.create_table(&name, "(k,v) key(k) index(v)")?;
                for k in 0..rows {
                    t.add_record(&name, RecordBuilder::new().int(k).int(k * 7 % 13).build())?;
                }
            }
            Ok(())
        })
        .expect("Failed to create tables");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_database() {
        let test_db = TestDatabase::memory();
        assert!(test_db.path().is_none());
        assert!(test_db.schema().user_tables().is_empty());
    }

    #[test]
    fn test_file_database_reopens() {
        let test_db = TestDatabase::file();
        scenarios::customers(&test_db, 5);
        let test_db = test_db.reopen();
        assert_eq!(test_db.read(|t| t.records("customers")).unwrap().len(), 5);
    }

    #[test]
    fn test_many_tables_scenario() {
        with_temp_db(|db| {
            scenarios::many_tables(db, 3, 4);
            assert_eq!(db.schema().user_tables().len(), 3);
        });
    }
}
