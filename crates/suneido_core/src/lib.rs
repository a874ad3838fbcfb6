//! # Suneido Core
//!
//! Storage engine for Suneido databases.
//!
//! This crate provides:
//! - An append-only, checksummed block log over a [`suneido_storage`] backend
//! - Persistent copy-on-write B-tree indexes
//! - A persistent hash trie holding per-table metadata and index roots
//! - Tables, columns, indexes and views stored as rows of system tables
//! - Snapshot-isolated transactions with optimistic conflict detection
//! - Check, rebuild, compact, dump and load tools
//!
//! ## Example
//!
//! ```rust
//! use suneido_core::{Database, RecordBuilder};
//!
//! let db = Database::open_in_memory().unwrap();
//! db.transaction(|t| {
//!     t.create_table("customers", "(id,name) key(id) index(name)")?;
//!     t.add_record("customers", RecordBuilder::new().int(1).string("ann").build())?;
//!     Ok(())
//! })
//! .unwrap();
//!
//! let rows = db.read(|t| t.records("customers")).unwrap();
//! assert_eq!(rows.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod btree;
pub mod checksum;
pub mod config;
pub mod database;
pub mod dbfile;
pub mod error;
pub mod record;
pub mod schema;
pub mod storage;
pub mod tools;
pub mod transaction;
pub mod trie;
pub mod types;

pub use btree::{Btree, BtreeIndex, BtreeKey, BtreeNode};
pub use checksum::Checksum;
pub use config::{Config, OpenMode};
pub use database::Database;
pub use error::{ConflictKind, CoreError, CoreResult};
pub use record::{Record, RecordBuilder, Value};
pub use schema::{Index, IndexMode, Schema, Table};
pub use storage::{Block, BlockType, Storage};
pub use tools::{CheckReport, CheckStatus};
pub use transaction::{DbState, Transaction, TransactionKind, TransactionManager, TransactionState};
pub use trie::{DbHashTrie, IndexInfo, TableInfo};
pub use types::{Address, SequenceNumber, TableNum};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
