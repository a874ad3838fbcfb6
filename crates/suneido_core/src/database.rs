//! Database facade.

use crate::btree::Btree;
use crate::config::{Config, OpenMode};
use crate::dbfile::FileLock;
use crate::error::{CoreError, CoreResult};
use crate::schema::{Schema, SchemaBuilder, COLUMNS_TABLE, INDEXES_TABLE, TABLES_TABLE, VIEWS_TABLE};
use crate::storage::{BlockType, SessionInfo, SessionKind, Storage, FIRST_BLOCK};
use crate::tools::builder::DbBuilder;
use crate::tools::check::{check_contents, CheckReport, CheckStatus};
use crate::tools::rebuild::rebuild_locked;
use crate::transaction::{read_row, DbState, Transaction, TransactionKind, TransactionManager};
use crate::trie::DbHashTrie;
use crate::types::SequenceNumber;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use suneido_storage::{FileBackend, MmapBackend, StorageBackend};
use tracing::{info, warn};

/// The main database handle.
///
/// `Database` owns the storage and the transaction manager. Every
/// transaction borrows it, so it cannot be dropped while one is active.
///
/// # Opening a Database
///
/// ```rust,ignore
/// use suneido_core::{Database, RecordBuilder};
/// use std::path::Path;
///
/// let db = Database::open(Path::new("suneido.db"))?;
///
/// db.transaction(|t| {
///     t.create_table("customers", "(id,name) key(id)")?;
///     t.add_record("customers", RecordBuilder::new().int(1).string("ann").build())?;
///     Ok(())
/// })?;
///
/// db.close()?;
/// ```
///
/// # Crash Recovery
///
/// A file whose last block is not a Shutdown marker was not closed cleanly.
/// Opening it runs a full check; if the check finds damage and
/// [`Config::auto_rebuild`] is set, the file is rebuilt from its trusted
/// prefix before use.
pub struct Database {
    config: Config,
    path: Option<PathBuf>,
    _lock: Option<FileLock>,
    manager: TransactionManager,
}

impl Database {
    /// Opens a database file, creating it if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseLocked` if another handle has it open for writing,
    /// `InvalidFormat` for a non-database file, or `Corrupted` if the file is
    /// damaged and cannot be rebuilt.
    pub fn open(path: &Path) -> CoreResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Creates a new, empty database, replacing any existing file.
    ///
    /// # Errors
    ///
    /// As for [`Database::open`].
    pub fn create(path: &Path) -> CoreResult<Self> {
        Self::open_with_config(path, Config::default().mode(OpenMode::Create))
    }

    /// Opens an existing database without write access.
    ///
    /// # Errors
    ///
    /// As for [`Database::open`], plus `NotFound` if the file does not exist.
    pub fn open_read_only(path: &Path) -> CoreResult<Self> {
        Self::open_with_config(path, Config::default().mode(OpenMode::ReadOnly))
    }

    /// Opens a database file with custom configuration.
    ///
    /// # Errors
    ///
    /// As for [`Database::open`].
    pub fn open_with_config(path: &Path, config: Config) -> CoreResult<Self> {
        let lock = if config.mode.is_writable() {
            FileLock::exclusive(path)?
        } else {
            FileLock::shared(path)?
        };
        let exists = path.exists() && fs::metadata(path)?.len() > 0;
        match config.mode {
            OpenMode::Create => {
                if path.exists() {
                    fs::remove_file(path)?;
                }
                Self::create_file(path, config, lock)
            }
            OpenMode::Open if !exists => Self::create_file(path, config, lock),
            OpenMode::ReadOnly if !exists => Err(CoreError::not_found(format!(
                "database {}",
                path.display()
            ))),
            _ => Self::open_file(path, config, lock),
        }
    }

    /// Opens a fresh in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial commit cannot be written.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open_in_memory_with_config(Config::default())
    }

    /// Opens a fresh in-memory database with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial commit cannot be written.
    pub fn open_in_memory_with_config(config: Config) -> CoreResult<Self> {
        let storage = Arc::new(Storage::in_memory()?);
        let state = initialize(&storage, &config)?;
        Ok(Self::assemble(config, None, None, storage, state))
    }

    /// Opens a database over already opened storage, such as an in-memory
    /// copy of a file. The storage must end cleanly.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if the storage was not shut down cleanly and does
    /// not pass a check.
    pub fn with_storage(storage: Storage, config: Config) -> CoreResult<Self> {
        let storage = Arc::new(storage);
        if !is_clean(&storage) {
            let report = check_contents(&storage, &config);
            if report.status != CheckStatus::Ok {
                return Err(report.to_error());
            }
        }
        let state = load_state(&storage, config.node_size)?;
        if !storage.is_read_only() {
            start_session(&storage)?;
        }
        Ok(Self::assemble(config, None, None, storage, state))
    }

    fn create_file(path: &Path, config: Config, lock: FileLock) -> CoreResult<Self> {
        let backend = MmapBackend::create(path, config.mmap_chunk_size)?;
        let storage = Arc::new(Storage::create(Box::new(backend))?);
        let state = initialize(&storage, &config)?;
        info!(path = %path.display(), "created database");
        Ok(Self::assemble(
            config,
            Some(path.to_path_buf()),
            Some(lock),
            storage,
            state,
        ))
    }

    fn open_file(path: &Path, config: Config, lock: FileLock) -> CoreResult<Self> {
        let writable = config.mode.is_writable();
        let mut storage = Arc::new(open_storage(path, &config)?);
        if !is_clean(&storage) {
            warn!(path = %path.display(), "database was not shut down cleanly; checking");
            let report = check_contents(&storage, &config);
            match report.status {
                CheckStatus::Ok => {}
                CheckStatus::Corrupted if writable && config.auto_rebuild => {
                    warn!(problem = ?report.problem(), "rebuilding");
                    drop(storage);
                    rebuild_locked(path, &config)?;
                    storage = Arc::new(open_storage(path, &config)?);
                }
                _ => return Err(report.to_error()),
            }
        }
        let state = load_state(&storage, config.node_size)?;
        if writable {
            start_session(&storage)?;
        }
        info!(
            path = %path.display(),
            size = storage.size(),
            tables = state.schema.user_tables().len(),
            read_only = !writable,
            "opened database"
        );
        Ok(Self::assemble(
            config,
            Some(path.to_path_buf()),
            Some(lock),
            storage,
            state,
        ))
    }

    fn assemble(
        config: Config,
        path: Option<PathBuf>,
        lock: Option<FileLock>,
        storage: Arc<Storage>,
        state: DbState,
    ) -> Self {
        let manager = TransactionManager::new(storage, &config, state);
        Self {
            config,
            path,
            _lock: lock,
            manager,
        }
    }

    /// Starts a readonly transaction. It must be completed or aborted.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseClosed` after [`Database::close`].
    pub fn readonly_tran(&self) -> CoreResult<Transaction<'_>> {
        self.manager.begin(TransactionKind::ReadOnly)
    }

    /// Starts an update transaction.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseClosed`, `ReadOnly` or `Poisoned`.
    pub fn update_transaction(&self) -> CoreResult<Transaction<'_>> {
        self.manager.begin(TransactionKind::Update)
    }

    /// Starts a bulk transaction for loading.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseClosed`, `ReadOnly` or `Poisoned`.
    pub fn bulk_transaction(&self) -> CoreResult<Transaction<'_>> {
        self.manager.begin(TransactionKind::Bulk)
    }

    /// Runs `f` in an update transaction, committing if it returns `Ok` and
    /// aborting otherwise.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, or from the commit.
    pub fn transaction<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> CoreResult<T>,
    {
        let mut t = self.update_transaction()?;
        match f(&mut t) {
            Ok(value) => {
                t.commit()?;
                Ok(value)
            }
            Err(e) => {
                t.abort();
                Err(e)
            }
        }
    }

    /// Runs `f` in a readonly transaction.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`.
    pub fn read<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> CoreResult<T>,
    {
        let mut t = self.readonly_tran()?;
        let result = f(&mut t);
        t.abort();
        result
    }

    /// The current published state.
    #[must_use]
    pub fn state(&self) -> Arc<DbState> {
        self.manager.current()
    }

    /// The current schema.
    #[must_use]
    pub fn schema(&self) -> Arc<Schema> {
        self.manager.current().schema.clone()
    }

    /// The underlying storage.
    #[must_use]
    pub fn storage(&self) -> &Arc<Storage> {
        self.manager.storage()
    }

    /// The configuration the database was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// File path, or `None` for in-memory databases.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns true if an earlier commit failed while writing.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.manager.is_poisoned()
    }

    /// Returns true until [`Database::close`].
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.manager.is_closed()
    }

    /// Number of update transactions currently holding a snapshot.
    #[must_use]
    pub fn active_transactions(&self) -> usize {
        self.manager.active_count()
    }

    /// Checks the log and every index. An open database has no Shutdown
    /// marker yet, so its absence is not reported.
    #[must_use]
    pub fn check(&self) -> CheckReport {
        check_contents(self.storage(), &self.config)
    }

    /// Closes the database, writing a Shutdown marker if it is writable.
    /// Further transactions are refused. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the marker cannot be written.
    pub fn close(&self) -> CoreResult<()> {
        let was_open = self.is_open();
        self.manager.shutdown()?;
        if was_open {
            info!(path = ?self.path, size = self.storage().size(), "closed database");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close database cleanly");
        }
    }
}

fn open_storage(path: &Path, config: &Config) -> CoreResult<Storage> {
    let backend: Box<dyn StorageBackend> = if config.mode.is_writable() {
        Box::new(MmapBackend::open(path, config.mmap_chunk_size)?)
    } else {
        Box::new(FileBackend::open_read_only(path)?)
    };
    Storage::open(backend)
}

/// Writes the Startup marker and the commit holding empty system tables.
fn initialize(storage: &Arc<Storage>, config: &Config) -> CoreResult<DbState> {
    let schema = Schema::new();
    let mut builder = DbBuilder::new(storage.clone(), config.node_size);
    builder.session(SessionKind::Startup)?;
    let built = builder.finish(&schema)?;
    storage.flush()?;
    Ok(DbState {
        seq: SequenceNumber::new(0),
        trie: built.trie,
        schema: Arc::new(schema),
        storage_end: storage.end(),
    })
}

fn start_session(storage: &Storage) -> CoreResult<()> {
    let marker = SessionInfo::now(SessionKind::Startup).encode();
    storage.append_block(BlockType::Session, &marker, 0)?;
    storage.flush()
}

/// Returns true if the last block is a Shutdown marker.
pub(crate) fn is_clean(storage: &Storage) -> bool {
    storage.rev_iter().next().is_some_and(|b| {
        b.block_type == BlockType::Session
            && b.session().is_ok_and(|s| s.kind == SessionKind::Shutdown)
    })
}

/// Loads the state published by the last Commit.
///
/// # Errors
///
/// Returns `Corrupted` if there is no commit or the schema rows are bad.
pub(crate) fn load_state(storage: &Arc<Storage>, node_size: usize) -> CoreResult<DbState> {
    let commit = storage
        .rev_iter()
        .find(|b| b.block_type == BlockType::Commit)
        .ok_or_else(|| CoreError::corrupted(FIRST_BLOCK.0, "no commit found"))?;
    let info = commit.commit()?;
    let trie = DbHashTrie::from(storage.clone(), info.dbinfo)?;
    let schema = load_schema(storage, &trie, node_size)?;
    Ok(DbState {
        seq: SequenceNumber::new(0),
        trie,
        schema: Arc::new(schema),
        storage_end: storage.end(),
    })
}

/// Reads the schema from the system tables' primary indexes.
///
/// # Errors
///
/// Returns `Corrupted` if a system table is missing or a row is bad.
pub(crate) fn load_schema(
    storage: &Arc<Storage>,
    trie: &DbHashTrie,
    node_size: usize,
) -> CoreResult<Schema> {
    let system = Schema::new();
    let mut builder = SchemaBuilder::new();
    for num in [TABLES_TABLE, COLUMNS_TABLE, INDEXES_TABLE, VIEWS_TABLE] {
        let table = system
            .table(num)
            .ok_or_else(|| CoreError::internal(format!("no system table {num}")))?;
        let columns = table.primary()?.columns_string();
        let info = trie
            .get(num)?
            .ok_or_else(|| CoreError::corrupted(0, format!("{} missing from metadata", table.name)))?;
        let ix = info.index(&columns).ok_or_else(|| {
            CoreError::corrupted(0, format!("{} index ({columns}) missing", table.name))
        })?;
        let tree = Btree::open(storage.clone(), ix.root, ix.levels, node_size);
        for key in tree.iter() {
            let rec = read_row(storage, key?.adr, num)?;
            builder.add_row(num, &rec)?;
        }
    }
    builder.build(false)
}
