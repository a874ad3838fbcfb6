//! Transaction state.

use crate::schema::Schema;
use crate::trie::DbHashTrie;
use crate::types::{Address, SequenceNumber, TableNum};
use std::collections::HashSet;
use std::sync::Arc;

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and can perform operations.
    Active,
    /// Transaction has been committed.
    Committed,
    /// Transaction has been aborted.
    Aborted,
}

/// What a transaction may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Reads only. Must be completed or aborted to release its snapshot.
    ReadOnly,
    /// Reads and writes with private index deltas and duplicate checks.
    Update,
    /// Writes without per-row duplicate checks; indexes are built at commit.
    Bulk,
}

impl TransactionKind {
    /// Returns true if the transaction may write.
    #[must_use]
    pub const fn is_update(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

/// A published database version.
///
/// Every committed update transaction publishes a new state; transactions
/// read from the state that was current when they began.
#[derive(Clone)]
pub struct DbState {
    /// Commit sequence within this open database.
    pub seq: SequenceNumber,
    /// Per-table metadata and index roots.
    pub trie: DbHashTrie,
    /// Table and view definitions.
    pub schema: Arc<Schema>,
    /// Storage end when the state was published.
    pub storage_end: Address,
}

impl std::fmt::Debug for DbState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbState")
            .field("seq", &self.seq)
            .field("trie", &self.trie)
            .field("storage_end", &self.storage_end)
            .finish_non_exhaustive()
    }
}

/// What a committed update transaction changed, kept for conflict checks
/// against transactions whose snapshots predate it.
#[derive(Debug, Clone)]
pub(crate) struct CommitSummary {
    pub seq: SequenceNumber,
    pub deletes: HashSet<Address>,
    pub touched: HashSet<TableNum>,
    pub schema_changed: HashSet<TableNum>,
}
