//! Integrity check.
//!
//! The check runs in two passes:
//!
//! 1. A forward scan of every block. Data payloads feed a rolling checksum
//!    (except rows of `tables` and `indexes`); each Commit must match it.
//!    Session markers reset it. The scan ends at the first bad block or
//!    checksum; everything up to the last good Commit or Session is the
//!    trusted prefix.
//! 2. If the scan is clean, every table's indexes are verified on a fixed
//!    pool of worker threads: keys must be in order, resolve to Data rows of
//!    the table, match the row's fields and agree with the row count.
//!
//! ## Invariants
//!
//! - Corruption is reported as a status, never as an error
//! - Results are reported in table order regardless of which worker
//!   finished first
//! - Once the error limit is reached outstanding tables are skipped

use crate::btree::{Btree, BtreeIndex, BtreeKey};
use crate::checksum::Checksum;
use crate::config::Config;
use crate::database::load_schema;
use crate::error::{CoreError, CoreResult};
use crate::schema::Table;
use crate::storage::{feed_data, BlockType, SessionKind, Storage, FIRST_BLOCK};
use crate::transaction::read_row;
use crate::trie::{DbHashTrie, TableInfo};
use crate::types::Address;
use crossbeam::channel;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use suneido_storage::FileBackend;
use tracing::{debug, info, warn};

/// Overall result of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// Everything verified.
    Ok,
    /// Damaged, but a trusted prefix with at least one commit exists.
    Corrupted,
    /// No usable commit survives.
    Unrecoverable,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "ok",
            Self::Corrupted => "corrupted",
            Self::Unrecoverable => "unrecoverable",
        })
    }
}

/// Result of the forward log scan.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// End of the last good Commit or Session block.
    pub trusted_end: Address,
    /// Address of the last good Commit block.
    pub last_commit: Option<Address>,
    /// Number of good commits.
    pub commits: usize,
    /// Number of Data blocks in the trusted prefix.
    pub data_blocks: usize,
    /// Whether the trusted prefix ends with a Shutdown marker.
    pub clean_shutdown: bool,
    /// Why the scan stopped early, if it did.
    pub problem: Option<String>,
}

/// Index problems found in one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableCheck {
    /// Table name.
    pub table: String,
    /// Rows counted through the first index.
    pub rows: u64,
    /// Problems found.
    pub errors: Vec<String>,
}

/// Full check result.
#[derive(Debug, Clone)]
pub struct CheckReport {
    /// Overall status.
    pub status: CheckStatus,
    /// Storage size when checked.
    pub size: u64,
    /// Log scan result.
    pub scan: ScanResult,
    /// Per-table results, in table order. Empty if the scan failed.
    pub tables: Vec<TableCheck>,
    /// Tables not checked because the error limit was reached.
    pub skipped: usize,
}

impl CheckReport {
    /// The first problem found, if any.
    #[must_use]
    pub fn problem(&self) -> Option<String> {
        self.scan.problem.clone().or_else(|| {
            self.tables
                .iter()
                .find_map(|t| t.errors.first().map(|e| format!("{}: {e}", t.table)))
        })
    }

    /// Number of index problems.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.tables.iter().map(|t| t.errors.len()).sum()
    }

    /// Converts a failed check into a `Corrupted` error.
    #[must_use]
    pub fn to_error(&self) -> CoreError {
        CoreError::corrupted(
            self.scan.trusted_end.0,
            format!(
                "database check {}: {}",
                self.status,
                self.problem().unwrap_or_else(|| "unknown problem".to_string())
            ),
        )
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} commits, {} tables, trusted to {} of {} bytes",
            self.status,
            self.scan.commits,
            self.tables.len(),
            self.scan.trusted_end.0,
            self.size
        )?;
        if let Some(p) = self.problem() {
            write!(f, " ({p})")?;
        }
        Ok(())
    }
}

/// Scans the log forward, verifying commit checksums.
#[must_use]
pub fn scan(storage: &Storage) -> ScanResult {
    let mut result = ScanResult {
        trusted_end: FIRST_BLOCK,
        ..ScanResult::default()
    };
    let mut ck = Checksum::new();
    let mut data = 0;
    let mut iter = storage.iter();
    for block in iter.by_ref() {
        match block.block_type {
            BlockType::Data => {
                feed_data(&mut ck, &block.payload);
                data += 1;
            }
            BlockType::Other => {}
            BlockType::Commit => {
                ck.update(&block.payload);
                if ck.value() != block.checksum {
                    result.problem = Some(format!("commit checksum mismatch at {}", block.adr));
                    break;
                }
                if let Err(e) = block.commit() {
                    result.problem = Some(e.to_string());
                    break;
                }
                ck.reset();
                result.commits += 1;
                result.data_blocks += data;
                data = 0;
                result.last_commit = Some(block.adr);
                result.trusted_end = block.end();
                result.clean_shutdown = false;
            }
            BlockType::Session => {
                let session = match block.session() {
                    Ok(s) => s,
                    Err(e) => {
                        result.problem = Some(e.to_string());
                        break;
                    }
                };
                ck.reset();
                data = 0;
                result.trusted_end = block.end();
                result.clean_shutdown = session.kind == SessionKind::Shutdown;
            }
        }
    }
    if result.problem.is_none() {
        if let Some(c) = iter.corruption() {
            result.problem = Some(format!("bad block at {}: {}", c.adr, c.reason));
        } else if result.trusted_end != storage.end() {
            result.problem = Some(format!(
                "uncommitted data after {}",
                result.trusted_end
            ));
        }
    }
    result
}

/// Checks storage with the check settings from `config`.
///
/// The status is `Ok` only if every checksum and index verifies and the log
/// ends with a Shutdown marker.
#[must_use]
pub fn check_storage(storage: &Arc<Storage>, config: &Config) -> CheckReport {
    run_check(storage, config, true)
}

/// As [`check_storage`], but a log that ends after its last good Commit or
/// Startup marker is `Ok`. Used for open databases and for deciding whether
/// a file that was not shut down needs a rebuild.
#[must_use]
pub fn check_contents(storage: &Arc<Storage>, config: &Config) -> CheckReport {
    run_check(storage, config, false)
}

fn run_check(storage: &Arc<Storage>, config: &Config, require_shutdown: bool) -> CheckReport {
    let scan = scan(storage);
    let mut report = CheckReport {
        status: CheckStatus::Ok,
        size: storage.size(),
        scan,
        tables: Vec::new(),
        skipped: 0,
    };
    let Some(last_commit) = report.scan.last_commit else {
        report.status = CheckStatus::Unrecoverable;
        if report.scan.problem.is_none() {
            report.scan.problem = Some("no commit found".to_string());
        }
        warn!(%report, "check failed");
        return report;
    };
    if report.scan.problem.is_some() {
        report.status = CheckStatus::Corrupted;
        warn!(%report, "check failed");
        return report;
    }
    match check_indexes(storage, last_commit, config) {
        Ok((tables, skipped)) => {
            report.tables = tables;
            report.skipped = skipped;
        }
        Err(e) => report.scan.problem = Some(format!("metadata: {e}")),
    }
    if require_shutdown && !report.scan.clean_shutdown && report.scan.problem.is_none() {
        report.scan.problem = Some(format!(
            "no shutdown marker after {}",
            report.scan.trusted_end
        ));
    }
    if report.scan.problem.is_some() || report.error_count() > 0 || report.skipped > 0 {
        report.status = CheckStatus::Corrupted;
        warn!(%report, "check failed");
    } else {
        info!(%report, "check passed");
    }
    report
}

/// Opens a file read-only and checks it.
///
/// # Errors
///
/// Returns an error only if the file cannot be opened as a database.
pub fn check_file(path: &Path, config: &Config) -> CoreResult<CheckReport> {
    let storage = Arc::new(Storage::open(Box::new(FileBackend::open_read_only(path)?))?);
    Ok(check_storage(&storage, config))
}

fn check_indexes(
    storage: &Arc<Storage>,
    last_commit: Address,
    config: &Config,
) -> CoreResult<(Vec<TableCheck>, usize)> {
    let commit = storage.read_block(last_commit)?.commit()?;
    let trie = DbHashTrie::from(storage.clone(), commit.dbinfo)?;
    let schema = load_schema(storage, &trie, config.node_size)?;
    let infos = trie.iter().collect::<CoreResult<Vec<_>>>()?;
    let mut tasks: Vec<(Arc<Table>, Arc<TableInfo>)> = Vec::with_capacity(infos.len());
    for info in infos {
        let table = schema.table(info.table).cloned().ok_or_else(|| {
            CoreError::corrupted(0, format!("metadata for unknown table {}", info.table))
        })?;
        tasks.push((table, info));
    }
    tasks.sort_by_key(|(t, _)| t.num);
    for table in schema.tables() {
        if !tasks.iter().any(|(t, _)| t.num == table.num) {
            return Err(CoreError::corrupted(
                0,
                format!("table {} missing from metadata", table.name),
            ));
        }
    }
    Ok(run_pool(storage, tasks, config))
}

/// Runs one check per table on `config.check_workers` threads.
fn run_pool(
    storage: &Arc<Storage>,
    tasks: Vec<(Arc<Table>, Arc<TableInfo>)>,
    config: &Config,
) -> (Vec<TableCheck>, usize) {
    let n = tasks.len();
    let workers = config.check_workers.clamp(1, n.max(1));
    let limit = config.check_error_limit.max(1);
    let cancel = AtomicBool::new(false);
    let errors = AtomicUsize::new(0);
    let (task_tx, task_rx) = channel::unbounded::<(usize, Arc<Table>, Arc<TableInfo>)>();
    let (result_tx, result_rx) = channel::unbounded::<(usize, TableCheck)>();
    for (i, (table, info)) in tasks.into_iter().enumerate() {
        // unbounded: send only fails if every receiver is gone
        let _ = task_tx.send((i, table, info));
    }
    drop(task_tx);

    std::thread::scope(|s| {
        for _ in 0..workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let cancel = &cancel;
            let errors = &errors;
            s.spawn(move || {
                for (i, table, info) in task_rx.iter() {
                    if cancel.load(Ordering::Acquire) {
                        continue;
                    }
                    let result = check_table(storage, &table, &info, config.node_size);
                    let total = errors.fetch_add(result.errors.len(), Ordering::AcqRel)
                        + result.errors.len();
                    if total >= limit {
                        cancel.store(true, Ordering::Release);
                    }
                    if result_tx.send((i, result)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_tx);

    let mut slots: Vec<Option<TableCheck>> = vec![None; n];
    for (i, result) in result_rx.iter() {
        slots[i] = Some(result);
    }
    let skipped = slots.iter().filter(|s| s.is_none()).count();
    (slots.into_iter().flatten().collect(), skipped)
}

/// Verifies every index of one table.
fn check_table(storage: &Arc<Storage>, table: &Table, info: &TableInfo, node_size: usize) -> TableCheck {
    let mut check = TableCheck {
        table: table.name.clone(),
        rows: 0,
        errors: Vec::new(),
    };
    if info.indexes.len() != table.indexes.len() {
        check.errors.push(format!(
            "{} indexes in metadata, {} in schema",
            info.indexes.len(),
            table.indexes.len()
        ));
    }
    let mut first: Option<(u64, u64)> = None;
    for ix in &table.indexes {
        let columns = ix.columns_string();
        let Some(stored) = info.index(&columns) else {
            check.errors.push(format!("index ({columns}) missing from metadata"));
            continue;
        };
        let tree = BtreeIndex::new(
            ix.clone(),
            Btree::open(storage.clone(), stored.root, stored.levels, node_size),
        );
        match check_index(storage, table, &tree) {
            Ok((rows, size)) => {
                match first {
                    None => first = Some((rows, size)),
                    Some((r, _)) if r != rows => check.errors.push(format!(
                        "index ({columns}) has {rows} rows, first index has {r}"
                    )),
                    Some(_) => {}
                }
            }
            Err(e) => check.errors.push(format!("index ({columns}): {e}")),
        }
    }
    if let Some((rows, size)) = first {
        check.rows = rows;
        if rows != info.nrows {
            check
                .errors
                .push(format!("metadata says {} rows, index has {rows}", info.nrows));
        }
        if size != info.total_size {
            check.errors.push(format!(
                "metadata says {} bytes, rows total {size}",
                info.total_size
            ));
        }
    }
    debug!(table = %table.name, rows = check.rows, errors = check.errors.len(), "checked table");
    check
}

/// Walks one index, returning its row count and total row size.
fn check_index(storage: &Storage, table: &Table, tree: &BtreeIndex) -> CoreResult<(u64, u64)> {
    let mut prev: Option<BtreeKey> = None;
    let mut rows = 0u64;
    let mut size = 0u64;
    for key in tree.iter() {
        let key = key?;
        if let Some(p) = &prev {
            if *p >= key {
                return Err(CoreError::corrupted(key.adr.0, "keys out of order"));
            }
            if p.same_fields(&key) && tree.index().is_unique_for(&key.key) {
                return Err(CoreError::corrupted(
                    key.adr.0,
                    format!("duplicate key {}", key.key),
                ));
            }
        }
        let rec = read_row(storage, key.adr, table.num)?;
        if tree.key_of(&rec) != key.key {
            return Err(CoreError::corrupted(
                key.adr.0,
                format!("key {} does not match row", key.key),
            ));
        }
        rows += 1;
        size += rec.size() as u64;
        prev = Some(key);
    }
    Ok((rows, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::record::RecordBuilder;
    use crate::schema::IndexMode;
    use crate::storage::encode_data;
    use suneido_storage::InMemoryBackend;

    fn populated() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.transaction(|t| {
            t.create_table("items", "(id,label) key(id) index(label)")?;
            t.create_table("tags", "(tag) key(tag)")?;
            for i in 0..50 {
                t.add_record("items", RecordBuilder::new().int(i).string("x").build())?;
            }
            t.add_record("tags", RecordBuilder::new().string("red").build())?;
            Ok(())
        })
        .unwrap();
        db
    }

    fn reopen_bytes(bytes: Vec<u8>) -> Arc<Storage> {
        Arc::new(Storage::open(Box::new(InMemoryBackend::with_data(bytes))).unwrap())
    }

    #[test]
    fn fresh_database_is_ok() {
        let db = populated();
        let report = db.check();
        assert_eq!(report.status, CheckStatus::Ok, "{report}");
        assert_eq!(report.tables.len(), 6);
        let items = report.tables.iter().find(|t| t.table == "items").unwrap();
        assert_eq!(items.rows, 50);
        assert!(report.scan.commits >= 2);
    }

    #[test]
    fn clean_shutdown_is_seen() {
        let db = populated();
        assert!(!db.check().scan.clean_shutdown);
        db.close().unwrap();
        assert!(db.check().scan.clean_shutdown);
    }

    #[test]
    fn missing_shutdown_fails_the_full_check() {
        let db = populated();
        let open = check_storage(db.storage(), &Config::default());
        assert_eq!(open.status, CheckStatus::Corrupted);
        assert!(open.problem().unwrap().contains("shutdown"));
        assert_eq!(open.tables.len(), 6);
        assert_eq!(check_contents(db.storage(), &Config::default()).status, CheckStatus::Ok);

        db.close().unwrap();
        let closed = check_storage(db.storage(), &Config::default());
        assert_eq!(closed.status, CheckStatus::Ok, "{closed}");
    }

    #[test]
    fn flipped_data_byte_fails_commit_checksum() {
        let db = populated();
        db.close().unwrap();
        let storage = db.storage().clone();
        let target = storage
            .iter()
            .filter(|b| b.block_type == BlockType::Data)
            .find(|b| b.data().map(|(t, _)| t == 5).unwrap_or(false))
            .unwrap();
        let mut bytes = storage.to_vec().unwrap();
        let at = target.adr.0 as usize + 8 + target.payload.len() - 1;
        bytes[at] ^= 0x5a;
        let report = check_storage(&reopen_bytes(bytes), &Config::default());
        assert_eq!(report.status, CheckStatus::Corrupted);
        assert!(report.problem().unwrap().contains("checksum"));
        assert!(report.scan.trusted_end < target.adr);
    }

    #[test]
    fn truncated_tail_is_corrupted() {
        let db = populated();
        let mut bytes = db.storage().to_vec().unwrap();
        bytes.truncate(bytes.len() - 3);
        let report = check_storage(&reopen_bytes(bytes), &Config::default());
        assert_eq!(report.status, CheckStatus::Corrupted);
    }

    #[test]
    fn duplicate_fields_in_a_key_index_are_reported() {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let table = Table::new(5, "dups", &["id"], &[("id", IndexMode::Key)]).unwrap();
        let mut tree = BtreeIndex::new(table.indexes[0].clone(), Btree::new(storage.clone(), 4096));
        let rec = RecordBuilder::new().int(1).build();
        for _ in 0..2 {
            let adr = storage
                .append_block(BlockType::Data, &encode_data(5, &rec), 0)
                .unwrap();
            tree.insert(&rec, adr).unwrap();
        }
        let err = check_index(&storage, &table, &tree).unwrap_err();
        assert!(err.to_string().contains("duplicate key"), "{err}");

        let mut plain = table.indexes[0].clone();
        plain.mode = IndexMode::Plain;
        let tree = BtreeIndex::new(plain, tree.tree().clone());
        assert_eq!(check_index(&storage, &table, &tree).unwrap().0, 2);
    }

    #[test]
    fn header_only_is_unrecoverable() {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let report = check_storage(&storage, &Config::default());
        assert_eq!(report.status, CheckStatus::Unrecoverable);
    }

    #[test]
    fn single_worker_gives_same_order() {
        let db = populated();
        let many = check_contents(db.storage(), &Config::default().check_workers(8));
        let one = check_contents(db.storage(), &Config::default().check_workers(1));
        let names = |r: &CheckReport| r.tables.iter().map(|t| t.table.clone()).collect::<Vec<_>>();
        assert_eq!(names(&many), names(&one));
    }
}
