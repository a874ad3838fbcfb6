//! Transaction manager: snapshots, conflict detection and the commit protocol.

use super::state::{CommitSummary, DbState, TransactionKind};
use super::Transaction;
use crate::btree::{Btree, BtreeIndex};
use crate::checksum::Checksum;
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::record::Record;
use crate::schema::{is_system_table, Index, Schema, Table};
use crate::storage::{
    encode_data, feed_data, now_millis, BlockType, CommitInfo, SessionInfo, SessionKind, Storage,
};
use crate::trie::{IndexInfo, TableInfo};
use crate::types::{Address, SequenceNumber, TableNum};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Coordinates transactions over one [`Storage`].
///
/// Readers take the published [`DbState`] without waiting. Commits are
/// serialized by `commit_lock`, which is only held while a commit is checked
/// and written.
pub struct TransactionManager {
    storage: Arc<Storage>,
    node_size: usize,
    sync_on_commit: bool,
    state: RwLock<Arc<DbState>>,
    commit_lock: Mutex<()>,
    history: Mutex<VecDeque<CommitSummary>>,
    /// Snapshot sequence -> number of active update transactions using it.
    active: Mutex<BTreeMap<SequenceNumber, usize>>,
    poisoned: AtomicBool,
    closed: AtomicBool,
}

/// Work planned for one table before anything is appended.
struct TablePlan {
    table: Arc<Table>,
    base: Option<Arc<TableInfo>>,
    trees: Vec<BtreeIndex>,
    missing: Vec<Index>,
}

impl TransactionManager {
    /// Creates a manager publishing `state`.
    pub(crate) fn new(storage: Arc<Storage>, config: &Config, state: DbState) -> Self {
        Self {
            storage,
            node_size: config.node_size,
            sync_on_commit: config.sync_on_commit,
            state: RwLock::new(Arc::new(state)),
            commit_lock: Mutex::new(()),
            history: Mutex::new(VecDeque::new()),
            active: Mutex::new(BTreeMap::new()),
            poisoned: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// The current published state.
    #[must_use]
    pub fn current(&self) -> Arc<DbState> {
        self.state.read().clone()
    }

    pub(crate) fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub(crate) fn node_size(&self) -> usize {
        self.node_size
    }

    /// Returns true after a failed commit left storage in an unknown state.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Returns true once the database has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuses further transactions and, for writable storage that is not
    /// poisoned, appends a Shutdown marker. Waits for a running commit.
    pub(crate) fn shutdown(&self) -> CoreResult<()> {
        let _guard = self.commit_lock.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.storage.is_read_only() || self.is_poisoned() {
            return Ok(());
        }
        let marker = SessionInfo::now(SessionKind::Shutdown).encode();
        self.storage.append_block(BlockType::Session, &marker, 0)?;
        self.storage.flush()?;
        self.storage.sync()
    }

    /// Number of update transactions holding a snapshot.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.lock().values().sum()
    }

    /// Starts a transaction on the current state.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseClosed`, `ReadOnly` for an update on read-only
    /// storage, or `Poisoned` after a failed commit.
    pub fn begin(&self, kind: TransactionKind) -> CoreResult<Transaction<'_>> {
        if self.is_closed() {
            return Err(CoreError::DatabaseClosed);
        }
        if kind.is_update() {
            if self.storage.is_read_only() {
                return Err(CoreError::ReadOnly);
            }
            if self.is_poisoned() {
                return Err(CoreError::Poisoned);
            }
        }
        let snapshot = if kind.is_update() {
            // Read and registered under the lock record_history prunes with.
            let mut active = self.active.lock();
            let snapshot = self.current();
            *active.entry(snapshot.seq).or_insert(0) += 1;
            snapshot
        } else {
            self.current()
        };
        Ok(Transaction::new(self, kind, snapshot))
    }

    /// Releases an update transaction's snapshot.
    pub(crate) fn release(&self, kind: TransactionKind, seq: SequenceNumber) {
        if !kind.is_update() {
            return;
        }
        let mut active = self.active.lock();
        if let Some(n) = active.get_mut(&seq) {
            *n -= 1;
            if *n == 0 {
                active.remove(&seq);
            }
        }
    }

    /// Validates and writes a transaction's changes.
    pub(crate) fn commit(&self, tran: &Transaction<'_>) -> CoreResult<SequenceNumber> {
        if self.is_poisoned() {
            return Err(CoreError::Poisoned);
        }
        if !tran.has_changes() {
            return Ok(self.current().seq);
        }
        let _guard = self.commit_lock.lock();
        if self.is_closed() {
            return Err(CoreError::DatabaseClosed);
        }
        let latest = self.current();

        if let Err(e) = self.check_conflicts(tran, &latest) {
            warn!(error = %e, "commit rejected");
            return Err(e);
        }
        let mut plans = match self.plan(tran, &latest) {
            Ok(plans) => plans,
            Err(e) => {
                if e.conflict_kind().is_some() {
                    warn!(error = %e, "commit rejected");
                }
                return Err(e);
            }
        };

        let start = self.storage.end();
        let state = match self.write(tran, &latest, &mut plans) {
            Ok(state) => state,
            Err(e) => {
                self.abandon(start, &e);
                return Err(e);
            }
        };
        let seq = state.seq;
        debug!(
            seq = seq.as_u64(),
            creates = tran.created.iter().flatten().count(),
            deletes = tran.removed.len(),
            "committed"
        );
        *self.state.write() = Arc::new(state);
        self.record_history(tran, seq);
        Ok(seq)
    }

    fn table_name(tran: &Transaction<'_>, latest: &DbState, num: TableNum) -> String {
        tran.schema
            .table(num)
            .or_else(|| latest.schema.table(num))
            .map_or_else(|| format!("table {num}"), |t| t.name.clone())
    }

    fn check_conflicts(&self, tran: &Transaction<'_>, latest: &DbState) -> CoreResult<()> {
        let history = self.history.lock();
        for c in history.iter().filter(|c| c.seq > tran.snapshot.seq) {
            for num in &c.schema_changed {
                if !is_system_table(*num)
                    && (tran.touched.contains(num) || tran.schema_changed.contains(num))
                {
                    return Err(CoreError::schema_changed(Self::table_name(tran, latest, *num)));
                }
            }
            for num in &tran.schema_changed {
                if c.touched.contains(num) {
                    return Err(CoreError::schema_changed(Self::table_name(tran, latest, *num)));
                }
            }
            for (num, adr, _) in &tran.removed {
                if c.deletes.contains(adr) {
                    return Err(CoreError::write_conflict(Self::table_name(tran, latest, *num)));
                }
            }
        }
        Ok(())
    }

    fn open_tree(&self, info: &IndexInfo) -> Btree {
        Btree::open(self.storage.clone(), info.root, info.levels, self.node_size)
    }

    /// Opens the latest trees of every changed table, removes this
    /// transaction's deletes and checks its inserts for duplicates. Nothing
    /// is written.
    fn plan(&self, tran: &Transaction<'_>, latest: &DbState) -> CoreResult<Vec<(TableNum, Option<TablePlan>)>> {
        let nums: BTreeSet<TableNum> = tran
            .touched
            .iter()
            .chain(tran.schema_changed.iter())
            .copied()
            .collect();
        let mut plans = Vec::with_capacity(nums.len());
        for num in nums {
            let base = latest.trie.get(num)?;
            let Some(table) = tran.schema.table(num).cloned() else {
                plans.push((num, None));
                continue;
            };
            let mut trees = Vec::new();
            let mut missing = Vec::new();
            for ix in &table.indexes {
                match base.as_ref().map(|b| b.index(&ix.columns_string())) {
                    Some(Some(info)) => trees.push(BtreeIndex::new(ix.clone(), self.open_tree(info))),
                    Some(None) => missing.push(ix.clone()),
                    None => trees.push(BtreeIndex::new(
                        ix.clone(),
                        Btree::new(self.storage.clone(), self.node_size),
                    )),
                }
            }
            for (t, adr, rec) in &tran.removed {
                if *t != num {
                    continue;
                }
                for tree in &mut trees {
                    if !tree.remove(rec, *adr)? {
                        return Err(CoreError::internal(format!(
                            "{} index ({}) is missing deleted record {adr}",
                            table.name,
                            tree.index().columns_string()
                        )));
                    }
                }
            }
            // Bulk inserts were never checked against each other.
            let bulk = tran.kind == TransactionKind::Bulk && !is_system_table(num);
            let none = HashSet::new();
            let mut seen: Vec<BTreeSet<Record>> = vec![BTreeSet::new(); trees.len()];
            for (t, rec) in tran.created.iter().flatten() {
                if *t != num {
                    continue;
                }
                for (tree, seen) in trees.iter().zip(seen.iter_mut()) {
                    let duplicate = tree.conflicts(rec, &none)?.is_some()
                        || (bulk && {
                            let key = tree.key_of(rec);
                            tree.index().is_unique_for(&key) && !seen.insert(key)
                        });
                    if duplicate {
                        return Err(CoreError::duplicate_key(
                            table.name.clone(),
                            tree.index().columns_string(),
                        ));
                    }
                }
            }
            plans.push((
                num,
                Some(TablePlan {
                    table,
                    base,
                    trees,
                    missing,
                }),
            ));
        }
        Ok(plans)
    }

    fn write(
        &self,
        tran: &Transaction<'_>,
        latest: &DbState,
        plans: &mut [(TableNum, Option<TablePlan>)],
    ) -> CoreResult<DbState> {
        let mut ck = Checksum::new();
        let mut real = Vec::with_capacity(tran.created.len());
        let mut creates = Vec::new();
        for row in &tran.created {
            match row {
                Some((num, rec)) => {
                    let payload = encode_data(*num, rec);
                    let adr = self.storage.append_block(BlockType::Data, &payload, 0)?;
                    feed_data(&mut ck, &payload);
                    real.push(adr);
                    creates.push(adr);
                }
                None => real.push(Address::NULL),
            }
        }

        let mut trie = latest.trie.clone();
        let mut dirty: HashMap<TableNum, Vec<BtreeIndex>> = HashMap::new();
        for (num, plan) in plans.iter_mut() {
            let num = *num;
            let Some(plan) = plan else {
                trie = trie.without(num)?;
                continue;
            };
            let mut info = plan
                .base
                .as_deref()
                .cloned()
                .unwrap_or_else(|| TableInfo::new(num));
            let mut rows = info.nrows as i64;
            let mut size = info.total_size as i64;
            for (t, _, rec) in &tran.removed {
                if *t == num {
                    rows -= 1;
                    size -= rec.size() as i64;
                }
            }
            for (i, row) in tran.created.iter().enumerate() {
                if let Some((t, rec)) = row {
                    if *t == num {
                        for tree in &mut plan.trees {
                            tree.insert(rec, real[i])?;
                        }
                        rows += 1;
                        size += rec.size() as i64;
                    }
                }
            }
            let mut built = self.build_missing(tran, plan, &real)?;
            plan.trees.append(&mut built);

            info.nrows = rows.max(0) as u64;
            info.total_size = size.max(0) as u64;
            let mut trees = Vec::with_capacity(plan.table.indexes.len());
            info.indexes.clear();
            for ix in &plan.table.indexes {
                let cols = ix.columns_string();
                let at = plan
                    .trees
                    .iter()
                    .position(|t| t.index().columns_string() == cols)
                    .ok_or_else(|| CoreError::internal(format!("no tree for index ({cols})")))?;
                let tree = plan.trees.swap_remove(at);
                info.indexes.push(IndexInfo {
                    columns: cols,
                    root: tree.tree().root(),
                    levels: tree.tree().levels(),
                });
                trees.push(tree);
            }
            dirty.insert(num, trees);
            trie = trie.with(info)?;
        }

        let dbinfo = trie.store(|entry| {
            let Some(mut trees) = dirty.remove(&entry.table) else {
                return Ok(entry.clone());
            };
            let mut info = entry.clone();
            for (ix, tree) in info.indexes.iter_mut().zip(trees.iter_mut()) {
                ix.root = tree.store()?;
                ix.levels = tree.tree().levels();
            }
            Ok(info)
        })?;
        if !dirty.is_empty() {
            return Err(CoreError::internal("changed tables missing from metadata trie"));
        }

        let commit = CommitInfo {
            timestamp: now_millis(),
            dbinfo,
            creates,
            deletes: tran.removed.iter().map(|(_, adr, _)| *adr).collect(),
        };
        let payload = commit.encode();
        ck.update(&payload);
        self.storage
            .append_block(BlockType::Commit, &payload, ck.value())?;
        self.storage.flush()?;
        if self.sync_on_commit {
            self.storage.sync()?;
        }

        Ok(DbState {
            seq: latest.seq.next(),
            trie,
            schema: Arc::new(Self::merge_schema(tran, latest)),
            storage_end: self.storage.end(),
        })
    }

    /// Builds indexes that exist in this transaction's schema but not in the
    /// latest metadata, from any other index of the same table.
    fn build_missing(
        &self,
        tran: &Transaction<'_>,
        plan: &mut TablePlan,
        real: &[Address],
    ) -> CoreResult<Vec<BtreeIndex>> {
        if plan.missing.is_empty() {
            return Ok(Vec::new());
        }
        let source = match plan.trees.first() {
            Some(tree) => tree.clone(),
            None => {
                let base = plan
                    .base
                    .as_ref()
                    .and_then(|b| b.indexes.first())
                    .ok_or_else(|| CoreError::internal(format!("{} has no index", plan.table.name)))?;
                self.open_replayed(base, tran, plan.table.num, real)?
            }
        };
        let mut built = Vec::with_capacity(plan.missing.len());
        for ix in plan.missing.drain(..) {
            let mut tree = BtreeIndex::new(ix, Btree::new(self.storage.clone(), self.node_size));
            for key in source.iter() {
                let adr = key?.adr;
                let (_, rec) = self.storage.read_block(adr)?.data()?;
                tree.insert(&rec, adr)?;
            }
            debug!(table = %plan.table.name, index = %tree.index().columns_string(), "built index");
            built.push(tree);
        }
        Ok(built)
    }

    /// Opens the latest tree of an index this transaction dropped and applies
    /// the transaction's deltas to it.
    fn open_replayed(
        &self,
        base: &IndexInfo,
        tran: &Transaction<'_>,
        num: TableNum,
        real: &[Address],
    ) -> CoreResult<BtreeIndex> {
        let old = tran
            .snapshot
            .schema
            .table(num)
            .and_then(|t| t.index(&base.columns))
            .cloned()
            .ok_or_else(|| CoreError::internal(format!("unknown index ({})", base.columns)))?;
        let mut tree = BtreeIndex::new(old, self.open_tree(base));
        for (t, adr, rec) in &tran.removed {
            if *t == num {
                tree.remove(rec, *adr)?;
            }
        }
        for (i, row) in tran.created.iter().enumerate() {
            if let Some((t, rec)) = row {
                if *t == num {
                    tree.insert(rec, real[i])?;
                }
            }
        }
        Ok(tree)
    }

    fn merge_schema(tran: &Transaction<'_>, latest: &DbState) -> Schema {
        let mut schema = (*latest.schema).clone();
        let mut changed: Vec<TableNum> = tran.schema_changed.iter().copied().collect();
        changed.sort_unstable();
        for num in &changed {
            if tran.schema.table(*num).is_none() {
                schema.remove(*num);
            }
        }
        for num in &changed {
            if let Some(t) = tran.schema.table(*num) {
                schema.insert((**t).clone());
            }
        }
        for name in &tran.views_changed {
            match tran.schema.view(name) {
                Some(def) => schema.set_view(name, def),
                None => {
                    schema.remove_view(name);
                }
            }
        }
        schema
    }

    fn record_history(&self, tran: &Transaction<'_>, seq: SequenceNumber) {
        let mut history = self.history.lock();
        history.push_back(CommitSummary {
            seq,
            deletes: tran.removed.iter().map(|(_, adr, _)| *adr).collect(),
            touched: tran.touched.clone(),
            schema_changed: tran.schema_changed.clone(),
        });
        let oldest = self.active.lock().keys().next().copied();
        match oldest {
            Some(oldest) => history.retain(|c| c.seq > oldest),
            None => history.clear(),
        }
    }

    /// Cleans up after a commit that failed part way through writing.
    fn abandon(&self, start: Address, e: &CoreError) {
        if e.is_io() {
            error!(error = %e, "commit failed writing; database poisoned");
            self.poisoned.store(true, Ordering::Release);
            return;
        }
        if let Err(te) = self.storage.truncate(start) {
            error!(error = %e, truncate = %te, "commit failed and could not be undone; database poisoned");
            self.poisoned.store(true, Ordering::Release);
        } else {
            warn!(error = %e, "commit failed; appended blocks discarded");
        }
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("state", &self.current())
            .field("poisoned", &self.is_poisoned())
            .finish_non_exhaustive()
    }
}

/// Reads a data row, verifying it belongs to `num`.
pub(crate) fn read_row(storage: &Storage, adr: Address, num: TableNum) -> CoreResult<Record> {
    let (t, rec) = storage.read_block(adr)?.data()?;
    if t != num {
        return Err(CoreError::corrupted(
            adr.0,
            format!("row belongs to table {t}, expected {num}"),
        ));
    }
    Ok(rec)
}
