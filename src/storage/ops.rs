//! The versioned CRUD state machine.
//!
//! Every operation picks its path from `(soft_delete, expiry)`:
//!
//! - hard-delete tables are mutated in place and guarded by a `Version`
//!   concurrency stamp;
//! - soft-delete tables are append-only: updates and deletes insert a new
//!   row at the next global version, leaving prior rows immutable.
//!
//! Write functions take the open transaction; reads work on any connection
//! (a [`rusqlite::Transaction`] derefs to one).

use rusqlite::{Connection, Transaction};
use tracing::warn;

use crate::descriptor::{track, EntityDescriptor, TrackingRole};
use crate::entity::{CallerInfo, Row};
use crate::error::{Error, Result};
use crate::sql::dml::{self, SelectOptions};
use crate::sql::{quote_ident, SqlStatement};
use crate::storage::audit::{self, AuditOperation};
use crate::storage::engine::{allocate_version, engine_now, read_rows};

// ── Reads ─────────────────────────────────────────────────────

/// The latest stored row for a key, regardless of tombstones or expiry.
///
/// This is the state-machine input for create/update/delete decisions.
pub(crate) fn read_latest_any(
    conn: &Connection,
    descriptor: &EntityDescriptor,
    key: &crate::value::Value,
) -> Result<Option<Row>> {
    let mut options = SelectOptions::by_key(descriptor, key);
    options.include_all_versions = true;
    options.include_deleted = true;
    options.include_expired = true;
    options.order_by = Some(version_desc(descriptor));
    options.limit = Some(1);
    let statement = dml::select(descriptor, &options, engine_now());
    Ok(read_rows(conn, descriptor, &statement)?.into_iter().next())
}

/// The caller-visible row for a key: latest version, not deleted, not
/// expired. `None` when nothing qualifies.
pub(crate) fn get_visible(
    conn: &Connection,
    descriptor: &EntityDescriptor,
    key: &crate::value::Value,
) -> Result<Option<Row>> {
    let mut options = SelectOptions::by_key(descriptor, key);
    options.include_all_versions = true;
    options.include_deleted = true;
    options.include_expired = false;
    options.order_by = Some(version_desc(descriptor));
    options.limit = Some(1);
    let statement = dml::select(descriptor, &options, engine_now());
    let row = read_rows(conn, descriptor, &statement)?.into_iter().next();
    Ok(row.filter(|r| !r.is_deleted()))
}

// ── Create ────────────────────────────────────────────────────

/// Insert a new entity row.
///
/// A live row under the same key fails with `entity-already-exists`; a
/// missing or tombstoned key (re)creates the entity at a fresh version with
/// `CreatedTime = now`.
///
/// `forced_version` carries the shared batch version used by list creation
/// in soft-delete mode; `None` allocates normally.
pub(crate) fn create_row(
    tx: &Transaction,
    descriptor: &EntityDescriptor,
    mut row: Row,
    caller: &CallerInfo,
    forced_version: Option<i64>,
) -> Result<Row> {
    let key = key_of(descriptor, &row)?;
    let now = engine_now();
    let latest = read_latest_any(tx, descriptor, &key)?;

    if descriptor.soft_delete() {
        if latest.as_ref().is_some_and(|l| !l.is_deleted()) {
            return Err(already_exists(descriptor, &row));
        }
        let version = match forced_version {
            Some(v) => v,
            None => allocate_version(tx)?,
        };
        row.set_version(version);
        row.set(track::IS_DELETED, false);
    } else {
        if latest.is_some() {
            return Err(already_exists(descriptor, &row));
        }
        row.set_version(forced_version.unwrap_or(1));
    }

    row.set(track::CREATED_TIME, now);
    row.set(track::LAST_WRITE_TIME, now);
    stamp_expiry_defaults(descriptor, &mut row, now);

    let statement = dml::insert(descriptor, &row);
    if execute(tx, &statement)? != 1 {
        return Err(write_failed(descriptor, "create"));
    }
    record_audit(
        tx,
        descriptor,
        &row,
        AuditOperation::Create,
        row.version(),
        None,
        caller,
    )?;
    Ok(row)
}

// ── Update ────────────────────────────────────────────────────

/// Rewrite (hard mode) or append (soft mode) an entity at the expected
/// version.
pub(crate) fn update_row(
    tx: &Transaction,
    descriptor: &EntityDescriptor,
    mut row: Row,
    caller: &CallerInfo,
    expected: i64,
) -> Result<Row> {
    let key = key_of(descriptor, &row)?;
    let now = engine_now();
    let latest = read_latest_any(tx, descriptor, &key)?
        .ok_or_else(|| not_found(descriptor, &row))?;

    if descriptor.soft_delete() && latest.is_deleted() {
        return Err(Error::Deleted {
            entity: descriptor.entity().to_string(),
            key: row.key_string(descriptor),
        });
    }

    let actual = latest.version().unwrap_or(0);
    if actual != expected {
        return Err(Error::VersionConflict {
            entity: descriptor.entity().to_string(),
            key: row.key_string(descriptor),
            expected,
            actual,
        });
    }

    row.set(track::LAST_WRITE_TIME, now);
    // Tracking fields the caller did not touch carry forward.
    if let Some(created) = latest.created_time() {
        row.set(track::CREATED_TIME, created);
    }
    if descriptor.expiry_enabled() && row.absolute_expiration().is_none() {
        if let Some(expiration) = latest.absolute_expiration() {
            row.set(track::ABSOLUTE_EXPIRATION, expiration);
        }
    }
    if descriptor.archive() && row.get(track::IS_ARCHIVED).is_none() {
        row.set(track::IS_ARCHIVED, latest.is_archived());
    }

    let new_version = if descriptor.soft_delete() {
        let next = allocate_version(tx)?;
        row.set_version(next);
        row.set(track::IS_DELETED, false);
        let statement = dml::insert(descriptor, &row);
        if execute(tx, &statement)? != 1 {
            return Err(write_failed(descriptor, "update"));
        }
        next
    } else {
        let statement = dml::update(descriptor, &row, expected);
        if execute(tx, &statement)? == 0 {
            return Err(write_failed(descriptor, "update"));
        }
        row.set_version(expected + 1);
        expected + 1
    };

    record_audit(
        tx,
        descriptor,
        &row,
        AuditOperation::Update,
        Some(new_version),
        Some(expected),
        caller,
    )?;
    Ok(row)
}

// ── Delete ────────────────────────────────────────────────────

/// Remove (hard mode) or tombstone (soft mode) an entity.
///
/// Deleting a missing key is success without effect (`false`); deleting an
/// already-deleted soft entity is success without a new row (`true`).
pub(crate) fn delete_row(
    tx: &Transaction,
    descriptor: &EntityDescriptor,
    key: &crate::value::Value,
    caller: &CallerInfo,
) -> Result<bool> {
    let now = engine_now();
    let latest = read_latest_any(tx, descriptor, key)?;

    let Some(latest) = latest else {
        warn!(
            entity = descriptor.entity(),
            "delete targeted a missing key"
        );
        return Ok(false);
    };

    if descriptor.soft_delete() {
        if latest.is_deleted() {
            return Ok(true);
        }
        let next = allocate_version(tx)?;
        let old_version = latest.version();
        let mut tombstone = latest;
        tombstone.set_version(next);
        tombstone.set(track::IS_DELETED, true);
        tombstone.set(track::LAST_WRITE_TIME, now);
        let statement = dml::insert(descriptor, &tombstone);
        if execute(tx, &statement)? != 1 {
            return Err(write_failed(descriptor, "delete"));
        }
        record_audit(
            tx,
            descriptor,
            &tombstone,
            AuditOperation::Delete,
            Some(next),
            old_version,
            caller,
        )?;
    } else {
        let statement = dml::delete_by_key(descriptor, key);
        if execute(tx, &statement)? == 0 {
            return Ok(false);
        }
        record_audit(
            tx,
            descriptor,
            &latest,
            AuditOperation::Delete,
            None,
            latest.version(),
            caller,
        )?;
    }
    Ok(true)
}

// ── Shared helpers ────────────────────────────────────────────

pub(crate) fn execute(conn: &Connection, statement: &SqlStatement) -> Result<usize> {
    conn.execute(&statement.sql, statement.param_refs().as_slice())
        .map_err(Error::from)
}

/// Default expiry and archive stamps for a fresh row.
fn stamp_expiry_defaults(
    descriptor: &EntityDescriptor,
    row: &mut Row,
    now: chrono::DateTime<chrono::Utc>,
) {
    if let Some(span) = descriptor.expiry_span() {
        if row.absolute_expiration().is_none() {
            row.set(track::ABSOLUTE_EXPIRATION, now + span);
        }
    }
    if descriptor.archive() && row.get(track::IS_ARCHIVED).is_none() {
        row.set(track::IS_ARCHIVED, false);
    }
}

fn version_desc(descriptor: &EntityDescriptor) -> String {
    let column = descriptor
        .tracking_column(TrackingRole::Version)
        .map_or(track::VERSION, |c| c.column.as_str());
    format!("t.{} DESC", quote_ident(column))
}

fn key_of(descriptor: &EntityDescriptor, row: &Row) -> Result<crate::value::Value> {
    row.get(descriptor.key_property())
        .filter(|v| !v.is_null())
        .cloned()
        .ok_or_else(|| Error::InvalidDescriptor {
            entity: descriptor.entity().to_string(),
            message: format!("row is missing key property {}", descriptor.key_property()),
        })
}

fn already_exists(descriptor: &EntityDescriptor, row: &Row) -> Error {
    Error::AlreadyExists {
        entity: descriptor.entity().to_string(),
        key: row.key_string(descriptor),
    }
}

fn not_found(descriptor: &EntityDescriptor, row: &Row) -> Error {
    Error::NotFound {
        entity: descriptor.entity().to_string(),
        key: row.key_string(descriptor),
    }
}

fn write_failed(descriptor: &EntityDescriptor, operation: &'static str) -> Error {
    Error::WriteFailed {
        entity: descriptor.entity().to_string(),
        operation,
    }
}

#[allow(clippy::cast_possible_wrap)]
fn payload_size(row: &Row) -> i64 {
    serde_json::to_string(row).map_or(0, |s| s.len() as i64)
}

fn record_audit(
    tx: &Transaction,
    descriptor: &EntityDescriptor,
    row: &Row,
    operation: AuditOperation,
    new_version: Option<i64>,
    old_version: Option<i64>,
    caller: &CallerInfo,
) -> Result<()> {
    if !descriptor.audit_trail() {
        return Ok(());
    }
    audit::append(
        tx,
        descriptor.entity(),
        &row.key_string(descriptor),
        operation,
        new_version,
        old_version,
        payload_size(row),
        caller,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DescriptorBuilder, PropertyKind};
    use crate::error::ErrorKind;
    use crate::sql::ddl;
    use crate::storage::engine::Store;
    use crate::value::Value;
    use std::sync::LazyLock;

    static SOFT: LazyLock<EntityDescriptor> = LazyLock::new(|| {
        DescriptorBuilder::new("Note")
            .table("Notes")
            .key("Id", PropertyKind::Str)
            .column("Body", PropertyKind::Str)
            .soft_delete(true)
            .audit_trail(true)
            .build()
            .unwrap()
    });

    static HARD: LazyLock<EntityDescriptor> = LazyLock::new(|| {
        DescriptorBuilder::new("Tag")
            .table("Tags")
            .key("Id", PropertyKind::Str)
            .column("Label", PropertyKind::Str)
            .build()
            .unwrap()
    });

    fn store_with(descriptor: &EntityDescriptor) -> Store {
        let mut store = Store::open_in_memory().unwrap();
        let table = ddl::create_table(descriptor, true);
        store
            .execute("initialize", |tx| {
                tx.execute(&table, [])?;
                Ok(())
            })
            .unwrap();
        store
    }

    fn caller() -> CallerInfo {
        CallerInfo::new("ops.rs", "test", 1)
    }

    #[test]
    fn soft_create_allocates_global_version() {
        let mut store = store_with(&SOFT);
        let created = store
            .execute("create", |tx| {
                create_row(
                    tx,
                    &SOFT,
                    Row::new().with("Id", "n1").with("Body", "hello"),
                    &caller(),
                    None,
                )
            })
            .unwrap();
        assert_eq!(created.version(), Some(1));
        assert!(!created.is_deleted());
        assert!(created.created_time().is_some());
    }

    #[test]
    fn create_conflicts_with_live_row() {
        let mut store = store_with(&SOFT);
        store
            .execute("create", |tx| {
                create_row(
                    tx,
                    &SOFT,
                    Row::new().with("Id", "n1").with("Body", "a"),
                    &caller(),
                    None,
                )
            })
            .unwrap();
        let err = store
            .execute("create", |tx| {
                create_row(
                    tx,
                    &SOFT,
                    Row::new().with("Id", "n1").with("Body", "b"),
                    &caller(),
                    None,
                )
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EntityAlreadyExists);
    }

    #[test]
    fn soft_update_appends_and_preserves_created_time() {
        let mut store = store_with(&SOFT);
        let created = store
            .execute("create", |tx| {
                create_row(
                    tx,
                    &SOFT,
                    Row::new().with("Id", "n1").with("Body", "a"),
                    &caller(),
                    None,
                )
            })
            .unwrap();
        let updated = store
            .execute("update", |tx| {
                update_row(
                    tx,
                    &SOFT,
                    Row::new().with("Id", "n1").with("Body", "b"),
                    &caller(),
                    1,
                )
            })
            .unwrap();
        assert_eq!(updated.version(), Some(2));
        assert_eq!(updated.created_time(), created.created_time());

        // Both versions remain stored.
        let rows: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM Notes WHERE Id = 'n1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(rows, 2);
    }

    #[test]
    fn stale_update_is_a_version_conflict() {
        let mut store = store_with(&SOFT);
        store
            .execute("create", |tx| {
                create_row(
                    tx,
                    &SOFT,
                    Row::new().with("Id", "n1").with("Body", "a"),
                    &caller(),
                    None,
                )
            })
            .unwrap();
        store
            .execute("update", |tx| {
                update_row(
                    tx,
                    &SOFT,
                    Row::new().with("Id", "n1").with("Body", "b"),
                    &caller(),
                    1,
                )
            })
            .unwrap();
        let err = store
            .execute("update", |tx| {
                update_row(
                    tx,
                    &SOFT,
                    Row::new().with("Id", "n1").with("Body", "c"),
                    &caller(),
                    1,
                )
            })
            .unwrap_err();
        assert!(matches!(
            err,
            Error::VersionConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
    }

    #[test]
    fn soft_delete_appends_tombstone_and_hides_row() {
        let mut store = store_with(&SOFT);
        store
            .execute("create", |tx| {
                create_row(
                    tx,
                    &SOFT,
                    Row::new().with("Id", "n1").with("Body", "a"),
                    &caller(),
                    None,
                )
            })
            .unwrap();
        let deleted = store
            .execute("delete", |tx| {
                delete_row(tx, &SOFT, &Value::from("n1"), &caller())
            })
            .unwrap();
        assert!(deleted);

        let visible = get_visible(store.connection(), &SOFT, &Value::from("n1")).unwrap();
        assert!(visible.is_none());
        let latest = read_latest_any(store.connection(), &SOFT, &Value::from("n1"))
            .unwrap()
            .unwrap();
        assert!(latest.is_deleted());
        assert_eq!(latest.version(), Some(2));
    }

    #[test]
    fn delete_is_idempotent() {
        let mut store = store_with(&SOFT);
        store
            .execute("create", |tx| {
                create_row(
                    tx,
                    &SOFT,
                    Row::new().with("Id", "n1").with("Body", "a"),
                    &caller(),
                    None,
                )
            })
            .unwrap();
        for _ in 0..2 {
            let ok = store
                .execute("delete", |tx| {
                    delete_row(tx, &SOFT, &Value::from("n1"), &caller())
                })
                .unwrap();
            assert!(ok);
        }
        // Exactly one tombstone row.
        let rows: i64 = store
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM Notes WHERE Id = 'n1' AND IsDeleted = 1",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn deleted_key_can_be_recreated() {
        let mut store = store_with(&SOFT);
        for body in ["a", "b"] {
            if body == "b" {
                store
                    .execute("delete", |tx| {
                        delete_row(tx, &SOFT, &Value::from("n1"), &caller())
                    })
                    .unwrap();
            }
            let created = store
                .execute("create", |tx| {
                    create_row(
                        tx,
                        &SOFT,
                        Row::new().with("Id", "n1").with("Body", body),
                        &caller(),
                        None,
                    )
                })
                .unwrap();
            assert!(!created.is_deleted());
        }
    }

    #[test]
    fn hard_update_rewrites_in_place() {
        let mut store = store_with(&HARD);
        store
            .execute("create", |tx| {
                create_row(
                    tx,
                    &HARD,
                    Row::new().with("Id", "t1").with("Label", "old"),
                    &caller(),
                    None,
                )
            })
            .unwrap();
        let updated = store
            .execute("update", |tx| {
                update_row(
                    tx,
                    &HARD,
                    Row::new().with("Id", "t1").with("Label", "new"),
                    &caller(),
                    1,
                )
            })
            .unwrap();
        assert_eq!(updated.version(), Some(2));

        let rows: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM Tags", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
        let label: String = store
            .connection()
            .query_row("SELECT Label FROM Tags WHERE Id = 't1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(label, "new");
    }

    #[test]
    fn hard_delete_removes_the_row() {
        let mut store = store_with(&HARD);
        store
            .execute("create", |tx| {
                create_row(
                    tx,
                    &HARD,
                    Row::new().with("Id", "t1").with("Label", "x"),
                    &caller(),
                    None,
                )
            })
            .unwrap();
        let first = store
            .execute("delete", |tx| {
                delete_row(tx, &HARD, &Value::from("t1"), &caller())
            })
            .unwrap();
        let second = store
            .execute("delete", |tx| {
                delete_row(tx, &HARD, &Value::from("t1"), &caller())
            })
            .unwrap();
        assert!(first);
        assert!(!second);
    }

    #[test]
    fn update_of_deleted_soft_entity_fails() {
        let mut store = store_with(&SOFT);
        store
            .execute("create", |tx| {
                create_row(
                    tx,
                    &SOFT,
                    Row::new().with("Id", "n1").with("Body", "a"),
                    &caller(),
                    None,
                )
            })
            .unwrap();
        store
            .execute("delete", |tx| {
                delete_row(tx, &SOFT, &Value::from("n1"), &caller())
            })
            .unwrap();
        let err = store
            .execute("update", |tx| {
                update_row(
                    tx,
                    &SOFT,
                    Row::new().with("Id", "n1").with("Body", "b"),
                    &caller(),
                    2,
                )
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EntityDeleted);
    }

    #[test]
    fn expiry_defaults_and_hides_expired_rows() {
        let expiring = DescriptorBuilder::new("Ticket")
            .table("Tickets")
            .key("Id", PropertyKind::Str)
            .expiry_span(chrono::TimeDelta::try_hours(1).unwrap())
            .build()
            .unwrap();
        let mut store = store_with(&expiring);

        // Unset expiration defaults to CreatedTime + span.
        let created = store
            .execute("create", |tx| {
                create_row(tx, &expiring, Row::new().with("Id", "t1"), &caller(), None)
            })
            .unwrap();
        let expiration = created.absolute_expiration().unwrap();
        let expected = created.created_time().unwrap() + chrono::TimeDelta::try_hours(1).unwrap();
        assert_eq!(expiration, expected);
        assert!(get_visible(store.connection(), &expiring, &Value::from("t1"))
            .unwrap()
            .is_some());

        // A past expiration hides the row from reads but not from the
        // latest-row scan the state machine uses.
        let past = engine_now() - chrono::TimeDelta::try_minutes(5).unwrap();
        store
            .execute("create", |tx| {
                create_row(
                    tx,
                    &expiring,
                    Row::new()
                        .with("Id", "t2")
                        .with(track::ABSOLUTE_EXPIRATION, past),
                    &caller(),
                    None,
                )
            })
            .unwrap();
        assert!(get_visible(store.connection(), &expiring, &Value::from("t2"))
            .unwrap()
            .is_none());
        assert!(read_latest_any(store.connection(), &expiring, &Value::from("t2"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn audited_ops_leave_a_trail() {
        let mut store = store_with(&SOFT);
        store
            .execute("create", |tx| {
                create_row(
                    tx,
                    &SOFT,
                    Row::new().with("Id", "n1").with("Body", "a"),
                    &caller(),
                    None,
                )
            })
            .unwrap();
        store
            .execute("delete", |tx| {
                delete_row(tx, &SOFT, &Value::from("n1"), &caller())
            })
            .unwrap();
        let trail = audit::trail(store.connection(), "Note", "n1", 10).unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].operation, AuditOperation::Delete);
        assert_eq!(trail[1].operation, AuditOperation::Create);
    }
}
