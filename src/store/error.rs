//! Error types for the document store layer.

/// Why a store could not be opened.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpenFailure {
    /// The store name is empty or not a single path component.
    #[error("invalid store name")]
    InvalidName,
    /// Version 0 is reserved for "does not exist yet".
    #[error("version must be at least 1")]
    InvalidVersion,
    /// The caller asked for an older version than the one on disk.
    #[error("requested version {requested} is lower than stored version {existing}")]
    VersionTooLow { requested: u32, existing: u32 },
    /// Other live handles did not close in time for an upgrade or delete.
    #[error("upgrade to version {requested} blocked by {open_handles} open handle(s)")]
    Blocked { requested: u32, open_handles: usize },
    /// The platform refused access to the backing file.
    #[error("storage access denied: {0}")]
    Access(String),
}

/// Errors raised by the store, its transactions and cursors.
///
/// `Clone` because a transaction's failure cause is delivered both to the
/// request that triggered it and to every waiter on the completion signal.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store could not be opened.
    #[error("cannot open store `{name}`: {reason}")]
    Open { name: String, reason: OpenFailure },

    /// A migration step failed; the upgrade was rolled back.
    #[error("migration {from}->{to} of store `{name}` failed: {reason}")]
    Migration {
        name: String,
        from: u32,
        to: u32,
        reason: String,
    },

    /// A mutation was attempted on a read-only transaction.
    #[error("`{operation}` requires a read-write transaction")]
    TransactionMode { operation: &'static str },

    /// The transaction has already committed or aborted.
    #[error("transaction is no longer active")]
    TransactionClosed,

    /// The transaction did not settle within its timeout and was aborted.
    #[error("transaction timed out after {timeout_ms}ms")]
    TransactionTimeout { timeout_ms: u64 },

    /// The transaction was aborted by its owner.
    #[error("transaction was aborted")]
    Aborted,

    /// The database handle was closed.
    #[error("database connection is closed")]
    ConnectionClosed,

    /// The object store does not exist or is outside the transaction scope.
    #[error("unknown object store `{0}`")]
    UnknownStore(String),

    /// The index does not exist on the object store.
    #[error("unknown index `{index}` on object store `{store}`")]
    UnknownIndex { store: String, index: String },

    /// A key or uniqueness constraint was violated.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// A key, key range or record could not be used as given.
    #[error("data error: {0}")]
    Data(String),

    /// The SQLite backend reported an error.
    #[error("storage error: {0}")]
    Storage(String),

    /// The transaction worker thread went away.
    #[error("transaction worker error: {0}")]
    Worker(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Data(e.to_string())
    }
}

impl StoreError {
    /// Returns `true` for errors that close the transaction they occur in.
    ///
    /// Validation errors raised before a request reaches the store leave the
    /// transaction usable.
    pub(crate) fn aborts_transaction(&self) -> bool {
        matches!(
            self,
            StoreError::Constraint(_) | StoreError::Data(_) | StoreError::Storage(_)
        )
    }
}

/// Convenience result type for the store layer.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
