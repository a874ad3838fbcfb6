//! Error types for Suneido core.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// The reason a commit was refused.
///
/// Conflicts are recoverable: the transaction is rolled back with no partial
/// effect and the caller may retry with a fresh snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// A key or unique index already holds the key.
    DuplicateKey {
        /// Table name.
        table: String,
        /// Index columns.
        index: String,
    },
    /// A concurrently committed transaction deleted or updated the same record.
    WriteConflict {
        /// Table name.
        table: String,
    },
    /// The table's schema changed after the snapshot was taken.
    SchemaChanged {
        /// Table name.
        table: String,
    },
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateKey { table, index } => {
                write!(f, "duplicate key in {table} index ({index})")
            }
            Self::WriteConflict { table } => write!(f, "write conflict in {table}"),
            Self::SchemaChanged { table } => write!(f, "schema of {table} changed"),
        }
    }
}

/// Errors that can occur in Suneido core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] suneido_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A block, node or record failed structural validation.
    #[error("corruption at address {address}: {message}")]
    Corrupted {
        /// Storage address of the bad data.
        address: u64,
        /// Description of the corruption.
        message: String,
    },

    /// Transaction conflict detected at commit.
    #[error("transaction conflict: {kind}")]
    Conflict {
        /// What collided.
        kind: ConflictKind,
    },

    /// A table, column, index, view or record does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing item.
        what: String,
    },

    /// Database is already open or locked.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// Invalid database format or version.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// An internal invariant was violated.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the violated invariant.
        message: String,
    },

    /// A previous append failed; the database refuses further commits.
    #[error("database is poisoned by an earlier write failure")]
    Poisoned,

    /// The database was opened read-only.
    #[error("database is read-only")]
    ReadOnly,

    /// Database is closed.
    #[error("database is closed")]
    DatabaseClosed,
}

impl CoreError {
    /// Creates a corruption error.
    pub fn corrupted(address: u64, message: impl Into<String>) -> Self {
        Self::Corrupted {
            address,
            message: message.into(),
        }
    }

    /// Creates a duplicate key conflict.
    pub fn duplicate_key(table: impl Into<String>, index: impl Into<String>) -> Self {
        Self::Conflict {
            kind: ConflictKind::DuplicateKey {
                table: table.into(),
                index: index.into(),
            },
        }
    }

    /// Creates a write conflict.
    pub fn write_conflict(table: impl Into<String>) -> Self {
        Self::Conflict {
            kind: ConflictKind::WriteConflict {
                table: table.into(),
            },
        }
    }

    /// Creates a schema changed conflict.
    pub fn schema_changed(table: impl Into<String>) -> Self {
        Self::Conflict {
            kind: ConflictKind::SchemaChanged {
                table: table.into(),
            },
        }
    }

    /// Creates a not found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the conflict kind if this is a commit conflict.
    #[must_use]
    pub fn conflict_kind(&self) -> Option<&ConflictKind> {
        match self {
            Self::Conflict { kind } => Some(kind),
            _ => None,
        }
    }

    /// Returns true for errors raised while appending to storage.
    #[must_use]
    pub(crate) fn is_io(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io(_))
    }
}
