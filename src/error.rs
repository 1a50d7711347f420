//! Error types for the strata engine.
//!
//! Provides structured error handling with:
//! - A machine-readable error taxonomy (`ErrorKind`, kebab-case strings)
//! - Transient-fault classification for the retry policy
//! - Operation / entity / key context on every failure path

use thiserror::Error;

/// Result type alias for strata operations.
pub type Result<T> = std::result::Result<T, Error>;

// ── Error Kind ────────────────────────────────────────────────

/// Machine-readable error kinds.
///
/// Each kind maps to a kebab-case string. Callers match on the kind to
/// decide recovery; only `transient-backend` is retryable by the engine
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Read/update/delete targeted a missing key.
    EntityNotFound,
    /// Create conflicted with an active row.
    EntityAlreadyExists,
    /// Update targeted a soft-deleted latest version.
    EntityDeleted,
    /// Version mismatch on update, or list-mapping inconsistency.
    ConcurrencyConflict,
    /// Foreign-key, unique, or check constraint failed.
    ConstraintViolation,
    /// `create_list` on an existing list key.
    ListAlreadyExists,
    /// The expression translator met an unmapped node or property.
    UnsupportedExpression,
    /// Import schema-version mismatch.
    SchemaIncompatible,
    /// BUSY, LOCKED, I/O blips — absorbed by the retry wrapper.
    TransientBackend,
    /// A cancellation signal was observed.
    Canceled,
    /// Zero rows affected where one was expected.
    WriteFailed,
    /// Corruption or non-retryable backend failure.
    FatalBackend,
    /// Descriptor construction failed validation.
    InvalidDescriptor,
    /// A scope was opened inside an existing scope.
    NestedTransaction,
    /// Configuration load or validation failure.
    Config,
    /// Serialization failure (NDJSON, config documents).
    Serialization,
}

impl ErrorKind {
    /// Kebab-case kind string for logs and machine consumers.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EntityNotFound => "entity-not-found",
            Self::EntityAlreadyExists => "entity-already-exists",
            Self::EntityDeleted => "entity-deleted",
            Self::ConcurrencyConflict => "concurrency-conflict",
            Self::ConstraintViolation => "constraint-violation",
            Self::ListAlreadyExists => "list-already-exists",
            Self::UnsupportedExpression => "unsupported-expression",
            Self::SchemaIncompatible => "schema-incompatible",
            Self::TransientBackend => "transient-backend",
            Self::Canceled => "canceled",
            Self::WriteFailed => "write-failed",
            Self::FatalBackend => "fatal-backend",
            Self::InvalidDescriptor => "invalid-descriptor",
            Self::NestedTransaction => "nested-transaction",
            Self::Config => "config",
            Self::Serialization => "serialization",
        }
    }

    /// Whether the retry wrapper may absorb this kind.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientBackend)
    }
}

// ── Error Enum ────────────────────────────────────────────────

/// Errors surfaced by strata operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{entity} not found: {key}")]
    NotFound { entity: String, key: String },

    #[error("{entity} already exists: {key}")]
    AlreadyExists { entity: String, key: String },

    #[error("{entity} is deleted: {key}")]
    Deleted { entity: String, key: String },

    #[error("version conflict on {entity} {key}: expected {expected}, found {actual}")]
    VersionConflict {
        entity: String,
        key: String,
        expected: i64,
        actual: i64,
    },

    /// Aggregate failure for batch operations: names every offending entity.
    #[error("batch {operation} failed for {entity}: {}", keys.join(", "))]
    BatchConflict {
        entity: String,
        operation: &'static str,
        keys: Vec<String>,
    },

    #[error("constraint violation: {message}")]
    Constraint { message: String },

    #[error("list already exists: {list_key}")]
    ListAlreadyExists { list_key: String },

    #[error("list mapping for {list_key} is ahead of storage on {entry_key}")]
    ListMappingConflict { list_key: String, entry_key: String },

    #[error("unsupported expression: {detail}")]
    UnsupportedExpression { detail: String },

    #[error("incompatible schema version: package is v{package_version}, engine is v{target}")]
    SchemaIncompatible { package_version: i64, target: i64 },

    #[error("invalid version chain for {entity} {key}: {message}")]
    VersionChain {
        entity: String,
        key: String,
        message: String,
    },

    #[error("checksum mismatch for {file}")]
    ChecksumMismatch { file: String },

    #[error("operation canceled")]
    Canceled,

    #[error("{operation} exceeded the command deadline")]
    Timeout { operation: String },

    #[error("{operation} on {entity} affected no rows")]
    WriteFailed {
        entity: String,
        operation: &'static str,
    },

    #[error("nested transaction scopes are not supported")]
    NestedTransaction,

    #[error("invalid descriptor for {entity}: {message}")]
    InvalidDescriptor { entity: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Map this error to its taxonomy kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::EntityNotFound,
            Self::AlreadyExists { .. } => ErrorKind::EntityAlreadyExists,
            Self::Deleted { .. } => ErrorKind::EntityDeleted,
            Self::VersionConflict { .. }
            | Self::BatchConflict { .. }
            | Self::ListMappingConflict { .. }
            | Self::VersionChain { .. } => ErrorKind::ConcurrencyConflict,
            Self::Constraint { .. } => ErrorKind::ConstraintViolation,
            Self::ListAlreadyExists { .. } => ErrorKind::ListAlreadyExists,
            Self::UnsupportedExpression { .. } => ErrorKind::UnsupportedExpression,
            Self::SchemaIncompatible { .. } => ErrorKind::SchemaIncompatible,
            // A bad checksum is data corruption, not a version mismatch.
            Self::ChecksumMismatch { .. } => ErrorKind::FatalBackend,
            Self::Canceled => ErrorKind::Canceled,
            Self::Timeout { .. } => ErrorKind::TransientBackend,
            Self::WriteFailed { .. } => ErrorKind::WriteFailed,
            Self::NestedTransaction => ErrorKind::NestedTransaction,
            Self::InvalidDescriptor { .. } => ErrorKind::InvalidDescriptor,
            Self::Config(_) => ErrorKind::Config,
            Self::Json(_) => ErrorKind::Serialization,
            Self::Io(_) => ErrorKind::TransientBackend,
            Self::Database(e) => classify_sqlite(e),
        }
    }

    /// Whether the retry wrapper may absorb this error.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

// ── Transient classification ──────────────────────────────────

/// SQLite primary result codes judged likely to succeed on retry.
const TRANSIENT_SQLITE_CODES: [i32; 4] = [
    5,  // SQLITE_BUSY
    6,  // SQLITE_LOCKED
    10, // SQLITE_IOERR
    14, // SQLITE_CANTOPEN
];

/// Case-insensitive message fragments that mark a transient backend fault.
const TRANSIENT_MESSAGE_FRAGMENTS: [&str; 6] = [
    "database is locked",
    "database table is locked",
    "unable to open database",
    "disk i/o error",
    "connection was closed",
    "connection was lost",
];

/// Classify a rusqlite error into the taxonomy.
///
/// Constraint failures get their own kind; BUSY/LOCKED/IOERR/CANTOPEN and
/// the known lock/IO message fragments are transient; everything else is
/// fatal (the connection may be unusable).
fn classify_sqlite(err: &rusqlite::Error) -> ErrorKind {
    if let rusqlite::Error::SqliteFailure(ffi_err, message) = err {
        if ffi_err.code == rusqlite::ErrorCode::ConstraintViolation {
            return ErrorKind::ConstraintViolation;
        }
        let primary = ffi_err.extended_code & 0xff;
        if TRANSIENT_SQLITE_CODES.contains(&primary) {
            return ErrorKind::TransientBackend;
        }
        if let Some(msg) = message {
            if message_is_transient(msg) {
                return ErrorKind::TransientBackend;
            }
        }
        return ErrorKind::FatalBackend;
    }
    if message_is_transient(&err.to_string()) {
        return ErrorKind::TransientBackend;
    }
    ErrorKind::FatalBackend
}

/// Check an error message against the transient fragment list.
fn message_is_transient(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MESSAGE_FRAGMENTS
        .iter()
        .any(|fragment| lower.contains(fragment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_kebab_case() {
        assert_eq!(ErrorKind::EntityNotFound.as_str(), "entity-not-found");
        assert_eq!(
            ErrorKind::ConcurrencyConflict.as_str(),
            "concurrency-conflict"
        );
        assert_eq!(ErrorKind::TransientBackend.as_str(), "transient-backend");
    }

    #[test]
    fn busy_is_transient() {
        let err = Error::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::DatabaseBusy,
                extended_code: 5,
            },
            Some("database is locked".to_string()),
        ));
        assert_eq!(err.kind(), ErrorKind::TransientBackend);
        assert!(err.is_transient());
    }

    #[test]
    fn constraint_is_not_transient() {
        let err = Error::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::ConstraintViolation,
                extended_code: 19,
            },
            Some("UNIQUE constraint failed: users.Email".to_string()),
        ));
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
        assert!(!err.is_transient());
    }

    #[test]
    fn locked_message_heuristic() {
        assert!(message_is_transient("Database Table Is Locked"));
        assert!(message_is_transient("disk I/O error occurred"));
        assert!(!message_is_transient("syntax error near SELECT"));
    }

    #[test]
    fn conflict_carries_context() {
        let err = Error::VersionConflict {
            entity: "Order".to_string(),
            key: "ord-1".to_string(),
            expected: 5,
            actual: 6,
        };
        assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);
        assert!(err.to_string().contains("ord-1"));
        assert!(err.to_string().contains("expected 5"));
    }
}
