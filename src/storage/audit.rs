//! Unified audit trail.
//!
//! Audited tables get one immutable row per mutation in the shared
//! `audit_log` table. Writes happen inside the calling transaction, so an
//! audit row never exists for a rolled-back change.

use rusqlite::Connection;

use crate::entity::CallerInfo;
use crate::error::{Error, Result};
use crate::value::format_timestamp;

/// The audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOperation {
    Create,
    Read,
    Update,
    Delete,
}

impl AuditOperation {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Read => "READ",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl std::str::FromStr for AuditOperation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "READ" => Ok(Self::Read),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(format!("unknown audit operation: {other}")),
        }
    }
}

/// One audit record.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: AuditOperation,
    pub new_version: Option<i64>,
    pub old_version: Option<i64>,
    /// Serialized payload size in bytes.
    pub payload_size: i64,
    pub caller: CallerInfo,
    pub created_time: String,
}

/// Append an audit record inside the calling transaction.
///
/// # Errors
///
/// Returns an error if the insert fails.
pub(crate) fn append(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
    operation: AuditOperation,
    new_version: Option<i64>,
    old_version: Option<i64>,
    payload_size: i64,
    caller: &CallerInfo,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO audit_log (entity_type, entity_id, operation, new_version, old_version, \
         payload_size, caller_file, caller_member, caller_line, created_time) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            entity_type,
            entity_id,
            operation.as_str(),
            new_version,
            old_version,
            payload_size,
            caller.file,
            caller.member,
            caller.line,
            format_timestamp(&chrono::Utc::now()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Read the audit trail for an entity, most recent first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn trail(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
    limit: u32,
) -> Result<Vec<AuditRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, entity_type, entity_id, operation, new_version, old_version, payload_size, \
         caller_file, caller_member, caller_line, created_time \
         FROM audit_log WHERE entity_type = ?1 AND entity_id = ?2 \
         ORDER BY id DESC LIMIT ?3",
    )?;
    let rows = stmt.query_map(rusqlite::params![entity_type, entity_id, limit], |row| {
        let operation: String = row.get(3)?;
        Ok(AuditRecord {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            operation: operation.parse().unwrap_or(AuditOperation::Update),
            new_version: row.get(4)?,
            old_version: row.get(5)?,
            payload_size: row.get(6)?,
            caller: CallerInfo {
                file: row.get(7)?,
                member: row.get(8)?,
                line: row.get(9)?,
            },
            created_time: row.get(10)?,
        })
    })?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::from)
}
