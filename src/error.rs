//! Error types for the storage engine.
//!
//! One flat error type covers everything from a corrupt WAL header to a
//! poisoned transaction. Low-level I/O and format-corruption variants are
//! fatal to the owning database instance; everything else is returned to
//! the caller as an ordinary `Result`.

use std::fmt;
use std::io;
use std::sync::Arc;

/// Unified error type for storage engine operations.
#[derive(Debug, Clone)]
pub enum DbError {
    CacheFull,
    FileExists(String),
    FileNotExists(String),
    FileCannotRW(String),
    BadLogFile(String),
    BadXidFile(String),
    MemTooSmall,
    DataTooLarge,
    DatabaseBusy(String),
    NullEntry,
    NoTransaction,
    NestedTransaction,
    SwitchDatabaseInTxn,
    NoDatabaseSelected,
    DatabaseExists(String),
    DatabaseNotFound(String),
    DatabaseInUse(String),
    InvalidCommand(String),
    InvalidField(String),
    InvalidValues(String),
    InvalidLogOp,
    FieldNotFound(String),
    FieldNotIndexed(String),
    TableNotFound(String),
    DuplicatedTable(String),
    DuplicatedEntry,
    PrimaryKeyMissing,
    PrimaryKeyNotUpdatable,
    MultipleVisibleVersions,
    ConcurrentUpdate,
    Deadlock,
    LockWaitTimeout,
    TransactionTerminated,
    RecordTooLarge,
    Io(Arc<io::Error>),
    Json(String),
    Syntax(String),
    Internal(String),
}

impl DbError {
    /// True when this kind renders the owning database instance unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DbError::FileCannotRW(_)
                | DbError::BadLogFile(_)
                | DbError::BadXidFile(_)
                | DbError::Io(_)
        )
    }

    /// True for the MVCC kinds that poison the owning transaction.
    pub fn poisons_transaction(&self) -> bool {
        matches!(
            self,
            DbError::ConcurrentUpdate | DbError::Deadlock | DbError::LockWaitTimeout
        )
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::CacheFull => write!(f, "page cache is full"),
            DbError::FileExists(p) => write!(f, "file already exists: {}", p),
            DbError::FileNotExists(p) => write!(f, "file does not exist: {}", p),
            DbError::FileCannotRW(p) => write!(f, "cannot read/write file: {}", p),
            DbError::BadLogFile(m) => write!(f, "bad log file: {}", m),
            DbError::BadXidFile(m) => write!(f, "bad xid file: {}", m),
            DbError::MemTooSmall => write!(f, "memory too small"),
            DbError::DataTooLarge => write!(f, "data item too large for a page"),
            DbError::DatabaseBusy(n) => write!(f, "database busy: {}", n),
            DbError::NullEntry => write!(f, "entry not found"),
            DbError::NoTransaction => write!(f, "no such transaction"),
            DbError::NestedTransaction => write!(f, "nested transaction not allowed"),
            DbError::SwitchDatabaseInTxn => write!(f, "cannot switch database inside a transaction"),
            DbError::NoDatabaseSelected => write!(f, "no database selected"),
            DbError::DatabaseExists(n) => write!(f, "database already exists: {}", n),
            DbError::DatabaseNotFound(n) => write!(f, "database not found: {}", n),
            DbError::DatabaseInUse(n) => write!(f, "database in use: {}", n),
            DbError::InvalidCommand(m) => write!(f, "invalid command: {}", m),
            DbError::InvalidField(m) => write!(f, "invalid field: {}", m),
            DbError::InvalidValues(m) => write!(f, "invalid values: {}", m),
            DbError::InvalidLogOp => write!(f, "invalid log record operation"),
            DbError::FieldNotFound(n) => write!(f, "field not found: {}", n),
            DbError::FieldNotIndexed(n) => write!(f, "field not indexed: {}", n),
            DbError::TableNotFound(n) => write!(f, "table not found: {}", n),
            DbError::DuplicatedTable(n) => write!(f, "table already exists: {}", n),
            DbError::DuplicatedEntry => write!(f, "duplicate entry for unique field"),
            DbError::PrimaryKeyMissing => write!(f, "primary key value missing"),
            DbError::PrimaryKeyNotUpdatable => write!(f, "primary key column is not updatable"),
            DbError::MultipleVisibleVersions => write!(f, "multiple visible versions of one row"),
            DbError::ConcurrentUpdate => write!(f, "concurrent update conflict"),
            DbError::Deadlock => write!(f, "deadlock detected"),
            DbError::LockWaitTimeout => write!(f, "lock wait timeout exceeded"),
            DbError::TransactionTerminated => write!(f, "transaction already terminated"),
            DbError::RecordTooLarge => write!(f, "log record too large for the ring buffer"),
            DbError::Io(e) => write!(f, "{}", e),
            DbError::Json(m) => write!(f, "{}", m),
            DbError::Syntax(m) => write!(f, "{}", m),
            DbError::Internal(m) => write!(f, "internal error: {}", m),
        }
    }
}

impl std::error::Error for DbError {}

impl From<io::Error> for DbError {
    fn from(e: io::Error) -> Self {
        DbError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Json(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
