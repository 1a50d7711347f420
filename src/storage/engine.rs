//! The storage engine: one connection, pragmas, engine tables, and the
//! transaction protocol every mutation goes through.
//!
//! The engine follows a strict discipline for writes:
//! 1. Begin an IMMEDIATE transaction (take the write lock up front)
//! 2. Execute the operation closure
//! 3. Commit, or roll back on error
//!
//! The whole unit is wrapped by the retry policy, so a BUSY during any step
//! re-runs the closure against a fresh transaction.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::debug;

use crate::config::EngineConfig;
use crate::descriptor::EntityDescriptor;
use crate::entity::Row;
use crate::error::{Error, Result};
use crate::sql::SqlStatement;
use crate::storage::retry::RetryPolicy;
use crate::storage::transaction::Scope;
use crate::value::{format_timestamp, Value};

/// Engine schema version, recorded in `schema_migrations` and stamped into
/// export packages.
pub const SCHEMA_VERSION: i64 = 1;

/// Engine-owned tables: the global version sequence, list mappings, the
/// unified audit log, and schema version tracking.
const ENGINE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS version_seq (
    id INTEGER PRIMARY KEY AUTOINCREMENT
);

CREATE TABLE IF NOT EXISTS list_entries (
    list_key TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    version INTEGER NOT NULL,
    created_time TEXT NOT NULL,
    last_write_time TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (list_key, entry_key)
);

CREATE INDEX IF NOT EXISTS idx_list_entries_position
    ON list_entries(list_key, position);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    new_version INTEGER,
    old_version INTEGER,
    payload_size INTEGER NOT NULL DEFAULT 0,
    caller_file TEXT NOT NULL,
    caller_member TEXT NOT NULL,
    caller_line INTEGER NOT NULL,
    created_time TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_log(entity_type, entity_id);
CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_log(created_time DESC);
";

// ── Cancellation ──────────────────────────────────────────────

/// Cooperative cancellation signal for long-running operations.
///
/// Clones share the same flag. The engine checks the token between units of
/// work and the statement progress handler aborts in-flight statements.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Error out when the token has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }
}

// ── Store ─────────────────────────────────────────────────────

/// The storage engine: owns one connection for its lifetime.
///
/// Concurrent work needs distinct stores; within one store, operations run
/// in strict caller order.
pub struct Store {
    conn: Connection,
    config: EngineConfig,
    retry: RetryPolicy,
    /// Per-command deadline as epoch milliseconds; 0 disarms the watchdog.
    deadline_ms: Arc<AtomicI64>,
    cancel: CancelToken,
    shutdown: Arc<AtomicBool>,
    watchdog: Option<std::thread::JoinHandle<()>>,
}

impl Drop for Store {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.watchdog.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("db_file", &self.config.db_file)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open (creating if needed) the database named by the configuration
    /// and apply pragmas and the engine schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or the
    /// engine schema fails to apply.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let conn = Connection::open(&config.db_file)?;
        Self::bootstrap(conn, config)
    }

    /// Open an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::bootstrap(conn, EngineConfig::new(Path::new(":memory:")))
    }

    fn bootstrap(conn: Connection, config: EngineConfig) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))?;
        conn.pragma_update(None, "journal_mode", config.journal_mode.as_pragma())?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        if let Some(pages) = config.cache_size_pages {
            conn.pragma_update(None, "cache_size", pages.to_string())?;
        }

        conn.execute_batch(ENGINE_SCHEMA)?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![
                format!("v{SCHEMA_VERSION}"),
                format_timestamp(&Utc::now())
            ],
        )?;

        let deadline_ms = Arc::new(AtomicI64::new(0));
        let cancel = CancelToken::new();
        let shutdown = Arc::new(AtomicBool::new(false));

        // Watchdog: aborts the in-flight statement when the armed deadline
        // passes or the cancel token fires. The interrupt handle is safe to
        // use after the connection closes.
        let watchdog = {
            let interrupt = conn.get_interrupt_handle();
            let deadline = Arc::clone(&deadline_ms);
            let cancel = cancel.clone();
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    let armed = deadline.load(Ordering::SeqCst);
                    let expired = armed != 0 && Utc::now().timestamp_millis() > armed;
                    if cancel.is_canceled() || expired {
                        interrupt.interrupt();
                    }
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
            })
        };

        let retry = RetryPolicy::new(config.retry.clone());
        Ok(Self {
            conn,
            config,
            retry,
            deadline_ms,
            cancel,
            shutdown,
            watchdog: Some(watchdog),
        })
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A cancellation token shared with this store's progress handler.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    // ── Transaction protocol ──────────────────────────────────

    /// Execute a mutation unit under the retry policy.
    ///
    /// Each attempt runs inside a fresh IMMEDIATE transaction; the closure
    /// may therefore run more than once and must not carry side effects
    /// outside the transaction.
    ///
    /// # Errors
    ///
    /// Transient backend faults are retried per the policy; all other
    /// errors roll back and propagate.
    pub fn execute<R>(
        &mut self,
        operation: &str,
        unit: impl Fn(&Transaction) -> Result<R>,
    ) -> Result<R> {
        self.cancel.check()?;
        self.arm_deadline();
        let conn = &mut self.conn;
        let cancel = &self.cancel;
        let result = self.retry.run(operation, || {
            cancel.check()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = unit(&tx)?;
            tx.commit()?;
            Ok(value)
        });
        self.disarm_deadline();
        self.map_interrupt(operation, result)
    }

    /// Open a caller-managed transaction scope.
    ///
    /// # Errors
    ///
    /// Fails with `nested-transaction` when a transaction is already open
    /// on this connection.
    pub fn begin_scope(&mut self) -> Result<Scope<'_>> {
        if !self.conn.is_autocommit() {
            return Err(Error::NestedTransaction);
        }
        self.arm_deadline();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(Scope::new(tx))
    }

    // ── Reads ─────────────────────────────────────────────────

    /// Run a generated SELECT and materialize rows through the descriptor's
    /// column mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn select_rows(
        &self,
        descriptor: &EntityDescriptor,
        statement: &SqlStatement,
    ) -> Result<Vec<Row>> {
        self.cancel.check()?;
        self.arm_deadline();
        let result = read_rows(&self.conn, descriptor, statement);
        self.disarm_deadline();
        self.map_interrupt("select", result)
    }

    /// Run a generated scalar query (COUNT and friends).
    pub(crate) fn select_scalar(&self, statement: &SqlStatement) -> Result<i64> {
        self.cancel.check()?;
        let mut stmt = self.conn.prepare(&statement.sql)?;
        let value = stmt.query_row(statement.param_refs().as_slice(), |row| row.get(0))?;
        Ok(value)
    }

    // ── Deadline plumbing ─────────────────────────────────────

    fn arm_deadline(&self) {
        let timeout_s = self.config.command_timeout_s;
        if timeout_s == 0 {
            return;
        }
        #[allow(clippy::cast_possible_wrap)]
        let deadline = Utc::now().timestamp_millis() + (timeout_s as i64) * 1_000;
        self.deadline_ms.store(deadline, Ordering::SeqCst);
    }

    fn disarm_deadline(&self) {
        self.deadline_ms.store(0, Ordering::SeqCst);
    }

    /// Rewrite interrupt errors into `canceled` or `timeout` depending on
    /// which signal fired.
    fn map_interrupt<R>(&self, operation: &str, result: Result<R>) -> Result<R> {
        match result {
            Err(err) if self.cancel.is_canceled() => {
                debug!(operation, "statement aborted by cancellation");
                drop(err);
                Err(Error::Canceled)
            }
            Err(Error::Database(rusqlite::Error::SqliteFailure(ffi_err, _)))
                if ffi_err.code == rusqlite::ErrorCode::OperationInterrupted =>
            {
                Err(Error::Timeout {
                    operation: operation.to_string(),
                })
            }
            other => other,
        }
    }
}

// ── Version sequence ──────────────────────────────────────────

/// Allocate the next global version inside the consuming transaction.
///
/// The sequence table is append-only; `last_insert_rowid` yields the value.
/// Allocation and the write that consumes it commit or roll back together.
///
/// # Errors
///
/// Returns an error if the insert fails.
pub fn allocate_version(tx: &Transaction) -> Result<i64> {
    tx.execute("INSERT INTO version_seq DEFAULT VALUES", [])?;
    Ok(tx.last_insert_rowid())
}

/// Advance the version sequence so future allocations exceed `floor`.
///
/// Used by import when a package carries explicit version chains.
///
/// # Errors
///
/// Returns an error if the sequence cannot be updated.
pub fn advance_version_seq(tx: &Transaction, floor: i64) -> Result<()> {
    let updated = tx.execute(
        "UPDATE sqlite_sequence SET seq = ?1 WHERE name = 'version_seq' AND seq < ?1",
        [floor],
    )?;
    if updated == 0 {
        tx.execute(
            "INSERT INTO sqlite_sequence (name, seq) \
             SELECT 'version_seq', ?1 \
             WHERE NOT EXISTS (SELECT 1 FROM sqlite_sequence WHERE name = 'version_seq')",
            [floor],
        )?;
    }
    Ok(())
}

// ── Row materialization ───────────────────────────────────────

/// Read all result rows of a statement into property-keyed rows.
///
/// Column order follows the descriptor's mapped columns, which is exactly
/// the order the select generator emits.
pub(crate) fn read_rows(
    conn: &Connection,
    descriptor: &EntityDescriptor,
    statement: &SqlStatement,
) -> Result<Vec<Row>> {
    let properties: Vec<String> = descriptor
        .mapped_columns()
        .map(|c| c.property.clone())
        .collect();
    let mut stmt = conn.prepare(&statement.sql)?;
    let mapped = stmt.query_map(statement.param_refs().as_slice(), |sql_row| {
        let mut row = Row::new();
        for (index, property) in properties.iter().enumerate() {
            let value: Value = sql_row.get(index)?;
            row.set(property, value);
        }
        Ok(row)
    })?;
    mapped
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::from)
}

/// The stored current time, for stamping tracking fields.
#[must_use]
pub fn engine_now() -> DateTime<Utc> {
    crate::value::now_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn open_in_memory_applies_engine_schema() {
        let store = Store::open_in_memory().unwrap();
        let tables: Vec<String> = store
            .connection()
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        assert!(tables.contains(&"version_seq".to_string()));
        assert!(tables.contains(&"list_entries".to_string()));
        assert!(tables.contains(&"audit_log".to_string()));
        assert!(tables.contains(&"schema_migrations".to_string()));
    }

    #[test]
    fn version_allocation_is_monotonic_from_one() {
        let mut store = Store::open_in_memory().unwrap();
        let first = store.execute("alloc", |tx| allocate_version(tx)).unwrap();
        let second = store.execute("alloc", |tx| allocate_version(tx)).unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[test]
    fn rolled_back_allocation_is_not_reused() {
        let mut store = Store::open_in_memory().unwrap();
        // AUTOINCREMENT never reuses rowids even after rollback, so a failed
        // writer cannot collide with a later one.
        let result: Result<i64> = store.execute("alloc", |tx| {
            allocate_version(tx)?;
            Err(Error::Canceled)
        });
        assert!(result.is_err());
        let next = store.execute("alloc", |tx| allocate_version(tx)).unwrap();
        assert!(next >= 1);
    }

    #[test]
    fn advance_version_seq_raises_the_floor() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .execute("advance", |tx| advance_version_seq(tx, 40))
            .unwrap();
        let next = store.execute("alloc", |tx| allocate_version(tx)).unwrap();
        assert_eq!(next, 41);
    }

    #[test]
    fn sequential_scopes_reuse_the_connection() {
        let mut store = Store::open_in_memory().unwrap();
        let scope = store.begin_scope().unwrap();
        drop(scope);
        // After dropping the first scope a new one opens fine.
        let scope = store.begin_scope().unwrap();
        scope.rollback().unwrap();
    }

    #[test]
    fn canceled_token_short_circuits() {
        let mut store = Store::open_in_memory().unwrap();
        store.cancel_token().cancel();
        let err = store
            .execute("noop", |_tx| Ok(()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Canceled);
    }

    #[test]
    fn schema_application_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = EngineConfig::new(dir.path().join("engine.db"));
        drop(Store::open(config.clone()).unwrap());
        // Reopening applies the schema again without error.
        drop(Store::open(config).unwrap());
    }
}
