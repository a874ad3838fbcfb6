//! Rebuild a damaged database from its trusted prefix.
//!
//! The log is replayed commit by commit up to the end of the last block the
//! check trusts. Replay tracks which Data blocks are still live and rebuilds
//! the schema from system rows in log order:
//!
//! - a new `tables` row creates a table
//! - a deleted `tables` row drops the table, unless the same commit adds a
//!   `tables` row for the same number (a rename or column change)
//! - other system rows add or remove columns, indexes and views
//!
//! Live rows are then copied to fresh storage, every index is rebuilt from
//! them, and the result must pass a check before it replaces the original.

use super::builder::DbBuilder;
use super::check::{check_storage, scan, CheckStatus};
use crate::config::Config;
use crate::dbfile::{replace_keeping_backup, temp_path, FileLock};
use crate::error::{CoreError, CoreResult};
use crate::record::Record;
use crate::schema::{
    is_system_table, SchemaBuilder, COLUMNS_TABLE, INDEXES_TABLE, TABLES_TABLE, VIEWS_TABLE,
};
use crate::storage::{BlockType, CommitInfo, SessionInfo, SessionKind, Storage, FIRST_BLOCK};
use crate::types::{Address, TableNum};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use suneido_storage::FileBackend;
use tracing::{info, warn};

/// What a rebuild did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Commits replayed.
    pub commits: usize,
    /// Rows copied, system rows included.
    pub rows: usize,
    /// Rows dropped because their table no longer exists.
    pub orphans: usize,
    /// User tables in the rebuilt database.
    pub tables: usize,
    /// End of the trusted prefix of the source.
    pub trusted_end: Address,
    /// Bytes after the trusted prefix that were discarded.
    pub discarded: u64,
}

impl std::fmt::Display for RebuildReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "replayed {} commits, copied {} rows into {} tables, discarded {} bytes",
            self.commits, self.rows, self.tables, self.discarded
        )
    }
}

/// Rebuilds the database at `path`, keeping the original as `<path>.bak`.
///
/// # Errors
///
/// Returns `DatabaseLocked` if the file is open, `Corrupted` if no commit
/// survives, or `Internal` if the rebuilt database fails its check.
pub fn rebuild_file(path: &Path, config: &Config) -> CoreResult<RebuildReport> {
    let _lock = FileLock::exclusive(path)?;
    rebuild_locked(path, config)
}

/// [`rebuild_file`] for callers already holding the lock.
pub(crate) fn rebuild_locked(path: &Path, config: &Config) -> CoreResult<RebuildReport> {
    let src = Storage::open(Box::new(FileBackend::open_read_only(path)?))?;
    let tmp = temp_path(path);
    if tmp.exists() {
        fs::remove_file(&tmp)?;
    }
    let dst = Arc::new(Storage::create(Box::new(FileBackend::create(&tmp)?))?);
    let written = rebuild_storage(&src, dst.clone(), config).and_then(|report| {
        dst.sync()?;
        Ok(report)
    });
    let report = match written {
        Ok(report) => report,
        Err(e) => {
            drop(dst);
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
    };

    let check = check_storage(&dst, config);
    if check.status != CheckStatus::Ok {
        drop(dst);
        fs::remove_file(&tmp)?;
        return Err(CoreError::internal(format!("rebuilt database failed check: {check}")));
    }
    drop(dst);
    drop(src);
    replace_keeping_backup(path, &tmp)?;
    info!(path = %path.display(), %report, "rebuilt database");
    Ok(report)
}

/// Live rows and schema reconstructed from the log.
#[derive(Default)]
struct Replay {
    live: BTreeMap<Address, (TableNum, Record)>,
    pending: HashMap<Address, (TableNum, Record)>,
    schema: SchemaBuilder,
    commits: usize,
}

impl Replay {
    fn commit(&mut self, adr: Address, commit: &CommitInfo) -> CoreResult<()> {
        let mut created = Vec::with_capacity(commit.creates.len());
        for c in &commit.creates {
            let row = self.pending.remove(c).ok_or_else(|| {
                CoreError::corrupted(adr.0, format!("commit lists missing row {c}"))
            })?;
            created.push((*c, row));
        }
        let mut recreated = HashSet::new();
        for (_, (t, rec)) in &created {
            if *t == TABLES_TABLE {
                recreated.insert(table_num(rec)?);
            }
        }

        let mut dropped = HashSet::new();
        for d in &commit.deletes {
            let Some((t, rec)) = self.live.remove(d) else {
                warn!(commit = %adr, row = %d, "commit deletes unknown row");
                continue;
            };
            if t == TABLES_TABLE {
                let num = table_num(&rec)?;
                if recreated.contains(&num) {
                    self.schema.remove_row(t, &rec)?;
                } else {
                    self.schema.drop_table(num);
                    dropped.insert(num);
                }
            } else if is_system_table(t) {
                self.schema.remove_row(t, &rec)?;
            }
        }
        if !dropped.is_empty() {
            self.live.retain(|_, row| !dropped.contains(&row.0));
        }

        for (c, (t, rec)) in created {
            if is_system_table(t) {
                self.schema.add_row(t, &rec)?;
            }
            self.live.insert(c, (t, rec));
        }
        self.pending.clear();
        self.commits += 1;
        Ok(())
    }
}

fn table_num(rec: &Record) -> CoreResult<TableNum> {
    TableNum::try_from(rec.get_int(0)?)
        .map_err(|_| CoreError::invalid_format("table number out of range"))
}

/// Replays the trusted prefix of `src` into the empty storage `dst`.
///
/// # Errors
///
/// Returns `Corrupted` if `src` has no valid commit or the replayed log is
/// inconsistent.
pub fn rebuild_storage(
    src: &Storage,
    dst: Arc<Storage>,
    config: &Config,
) -> CoreResult<RebuildReport> {
    let scanned = scan(src);
    if scanned.last_commit.is_none() {
        return Err(CoreError::corrupted(
            scanned.trusted_end.0,
            "no valid commit to rebuild from",
        ));
    }
    if let Some(problem) = &scanned.problem {
        warn!(%problem, trusted_end = %scanned.trusted_end, "rebuilding from trusted prefix");
    }

    let mut replay = Replay::default();
    for block in src.iter_range(FIRST_BLOCK, scanned.trusted_end) {
        match block.block_type {
            BlockType::Data => {
                let row = block.data()?;
                replay.pending.insert(block.adr, row);
            }
            BlockType::Commit => replay.commit(block.adr, &block.commit()?)?,
            BlockType::Session => replay.pending.clear(),
            BlockType::Other => {}
        }
    }

    let schema = replay.schema.build(true)?;
    let mut builder = DbBuilder::new(dst.clone(), config.node_size);
    builder.session(SessionKind::Startup)?;
    let mut orphans = 0;
    for (t, rec) in replay.live.values() {
        let owner = match *t {
            TABLES_TABLE | COLUMNS_TABLE | INDEXES_TABLE => table_num(rec)?,
            VIEWS_TABLE => VIEWS_TABLE,
            n => n,
        };
        if schema.table(owner).is_some() {
            builder.add_row(*t, rec)?;
        } else {
            orphans += 1;
        }
    }
    let built = builder.finish(&schema)?;
    dst.append_block(
        BlockType::Session,
        &SessionInfo::now(SessionKind::Shutdown).encode(),
        0,
    )?;
    dst.flush()?;
    if orphans > 0 {
        warn!(orphans, "dropped rows of tables that no longer exist");
    }

    Ok(RebuildReport {
        commits: replay.commits,
        rows: built.rows,
        orphans,
        tables: schema.user_tables().len(),
        trusted_end: scanned.trusted_end,
        discarded: src.size() - scanned.trusted_end.0,
    })
}
