//! Offline maintenance: check, rebuild, compact, dump and load.
//!
//! Rebuild and compact write a new file next to the database and only
//! replace it, keeping `<file>.bak`, once the new file passes a check.

pub(crate) mod builder;
pub mod check;
pub mod compact;
pub mod dump;
pub mod rebuild;

pub use check::{check_contents, check_file, check_storage, scan, CheckReport, CheckStatus, ScanResult, TableCheck};
pub use compact::{compact_file, compact_storage, CompactReport};
pub use dump::{dump_database, dump_table, load_database, load_table, DumpStats, DUMP_HEADER};
pub use rebuild::{rebuild_file, rebuild_storage, RebuildReport};
