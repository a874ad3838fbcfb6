//! Compaction: copy only live rows into a fresh file.

use super::builder::DbBuilder;
use super::check::{check_storage, CheckStatus};
use crate::btree::Btree;
use crate::config::Config;
use crate::database::load_state;
use crate::dbfile::{replace_keeping_backup, temp_path, FileLock};
use crate::error::{CoreError, CoreResult};
use crate::schema::{table_rows, views_row, VIEWS_TABLE};
use crate::storage::{BlockType, SessionInfo, SessionKind, Storage};
use crate::transaction::read_row;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use suneido_storage::FileBackend;
use tracing::{debug, info};

/// What a compaction did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactReport {
    /// User tables copied.
    pub tables: usize,
    /// User rows copied.
    pub rows: usize,
    /// Size before.
    pub before: u64,
    /// Size after.
    pub after: u64,
}

impl std::fmt::Display for CompactReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "copied {} rows in {} tables, {} -> {} bytes",
            self.rows, self.tables, self.before, self.after
        )
    }
}

/// Compacts the database at `path`, keeping the original as `<path>.bak`.
///
/// # Errors
///
/// Returns `DatabaseLocked` if the file is open, `Corrupted` if it does not
/// pass a check, or `Internal` if the compacted file fails its check.
pub fn compact_file(path: &Path, config: &Config) -> CoreResult<CompactReport> {
    let _lock = FileLock::exclusive(path)?;
    let src = Arc::new(Storage::open(Box::new(FileBackend::open_read_only(path)?))?);
    let before = check_storage(&src, config);
    if before.status != CheckStatus::Ok {
        return Err(before.to_error());
    }

    let tmp = temp_path(path);
    if tmp.exists() {
        fs::remove_file(&tmp)?;
    }
    let dst = Arc::new(Storage::create(Box::new(FileBackend::create(&tmp)?))?);
    let written = compact_storage(&src, dst.clone(), config).and_then(|report| {
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

    let after = check_storage(&dst, config);
    if after.status != CheckStatus::Ok {
        drop(dst);
        fs::remove_file(&tmp)?;
        return Err(CoreError::internal(format!("compacted database failed check: {after}")));
    }
    drop(dst);
    drop(src);
    replace_keeping_backup(path, &tmp)?;
    info!(path = %path.display(), %report, "compacted database");
    Ok(report)
}

/// Writes the live contents of `src` into the empty storage `dst`.
///
/// Rows are written in primary key order with trailing fields that no
/// column uses removed.
///
/// # Errors
///
/// Returns an error if `src` cannot be read or `dst` cannot be written.
pub fn compact_storage(
    src: &Arc<Storage>,
    dst: Arc<Storage>,
    config: &Config,
) -> CoreResult<CompactReport> {
    let state = load_state(src, config.node_size)?;
    let schema = &state.schema;
    let mut builder = DbBuilder::new(dst.clone(), config.node_size);
    builder.session(SessionKind::Startup)?;

    let tables = schema.user_tables();
    for table in &tables {
        for (sys, rec) in table_rows(table) {
            builder.add_row(sys, &rec)?;
        }
    }
    for (name, definition) in schema.views() {
        builder.add_row(VIEWS_TABLE, &views_row(name, definition))?;
    }

    let mut rows = 0;
    for table in &tables {
        let info = state
            .trie
            .get(table.num)?
            .ok_or_else(|| CoreError::corrupted(0, format!("{} missing from metadata", table.name)))?;
        let primary = table.primary()?.columns_string();
        let ix = info.index(&primary).ok_or_else(|| {
            CoreError::corrupted(0, format!("{} index ({primary}) missing", table.name))
        })?;
        let tree = Btree::open(src.clone(), ix.root, ix.levels, config.node_size);
        let used = table.used_fields();
        for key in tree.iter() {
            let rec = read_row(src, key?.adr, table.num)?;
            let rec = if rec.len() > used { rec.truncate(used) } else { rec };
            builder.add_row(table.num, &rec)?;
        }
        debug!(table = %table.name, rows = builder.row_count(table.num), "copied table");
        rows += builder.row_count(table.num);
    }

    builder.finish(schema)?;
    dst.append_block(
        BlockType::Session,
        &SessionInfo::now(SessionKind::Shutdown).encode(),
        0,
    )?;
    dst.flush()?;
    Ok(CompactReport {
        tables: tables.len(),
        rows,
        before: src.size(),
        after: dst.size(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::record::RecordBuilder;
    use suneido_storage::InMemoryBackend;

    #[test]
    fn compaction_drops_dead_rows() {
        let db = Database::open_in_memory().unwrap();
        db.transaction(|t| {
            t.create_table("log", "(id,text,extra) key(id) index(text)")?;
            for i in 0..200 {
                t.add_record(
                    "log",
                    RecordBuilder::new().int(i).string("entry").string("x").build(),
                )?;
            }
            Ok(())
        })
        .unwrap();
        db.transaction(|t| {
            t.drop_index("log", "text")?;
            t.drop_column("log", "text")?;
            t.drop_column("log", "extra")?;
            for (adr, rec) in t.records("log")? {
                if rec.get_int(0)? % 2 == 0 {
                    t.remove_record("log", adr)?;
                }
            }
            Ok(())
        })
        .unwrap();

        let dst = Arc::new(Storage::in_memory().unwrap());
        let report = compact_storage(db.storage(), dst.clone(), &Config::default()).unwrap();
        assert_eq!(report.tables, 1);
        assert_eq!(report.rows, 100);
        assert!(report.after < report.before);

        let storage = Storage::open(Box::new(InMemoryBackend::with_data(dst.to_vec().unwrap())))
            .unwrap();
        let copy = Database::with_storage(storage, Config::default()).unwrap();
        assert_eq!(copy.check().status, CheckStatus::Ok);
        let rows = copy.read(|t| t.records("log")).unwrap();
        assert_eq!(rows.len(), 100);
        assert!(rows.iter().all(|(_, r)| r.len() == 1));
        assert_eq!(copy.schema().require("log").unwrap().schema(), "(id,-,-) key(id)");
    }
}
