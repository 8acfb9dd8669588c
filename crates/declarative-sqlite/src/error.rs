//! Crate-wide error taxonomy.
//!
//! Kinds mirror the failure categories a caller needs to branch on (not raw
//! SQLite error strings). LWW rejection is intentionally absent here: a
//! stale write is a silent drop, not an error (see `write.rs`).

/// Reasons a create (`insert`) can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateErrorKind {
    ConstraintViolation,
    InvalidData,
    AccessDenied,
    Unknown,
}

/// Reasons a read (`query`/`get`) can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadErrorKind {
    NotFound,
    InvalidData,
    AccessDenied,
}

/// Reasons an update can fail. Concurrency conflicts from LWW are not
/// errors; this kind is reserved for update APIs that require a precondition
/// (e.g. optimistic `save()` on a row that no longer exists).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateErrorKind {
    NotFound,
    ConstraintViolation,
    InvalidData,
    ConcurrencyConflict,
}

/// Reasons a delete can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteErrorKind {
    ConstraintViolation,
    NotFound,
}

/// Hard vs. soft sync failures (spec.md §4.9 / §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    /// The callback reported the batch as permanently rejected.
    Hard,
    /// The callback raised an exception; the batch should be retried.
    Soft,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("create failed on `{table}`{}: {kind:?}", column.as_deref().map(|c| format!(" column `{c}`")).unwrap_or_default())]
    Create {
        table: String,
        column: Option<String>,
        kind: CreateErrorKind,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("read failed on `{table}`: {kind:?}")]
    Read {
        table: String,
        kind: ReadErrorKind,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("update failed on `{table}`{}: {kind:?}", column.as_deref().map(|c| format!(" column `{c}`")).unwrap_or_default())]
    Update {
        table: String,
        column: Option<String>,
        kind: UpdateErrorKind,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("delete failed on `{table}`: {kind:?}")]
    Delete {
        table: String,
        kind: DeleteErrorKind,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("migration transaction failed: {0}")]
    Transaction(Box<Error>),

    #[error("schema cannot be reconciled without losing data: {message}")]
    Schema { message: String },

    #[error("sync failed ({kind:?}): {message}")]
    Sync { message: String, kind: SyncErrorKind },

    /// Modifying a read-only record, or a non-LWW column on a remote-origin
    /// row. Carries the row's origin so callers can explain the failure.
    #[error("permission denied on `{table}`: {message}")]
    PermissionDenied { table: String, message: String },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error("invalid HLC string: {0}")]
    HlcParse(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(table: impl Into<String>) -> Self {
        Error::Read {
            table: table.into(),
            kind: ReadErrorKind::NotFound,
            source: None,
        }
    }

    pub fn permission_denied(table: impl Into<String>, message: impl Into<String>) -> Self {
        Error::PermissionDenied {
            table: table.into(),
            message: message.into(),
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Error::Schema {
            message: message.into(),
        }
    }
}
