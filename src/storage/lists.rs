//! List-to-entity mappings.
//!
//! A list is a value-level view: `list_entries` rows associate a list key
//! with member entities and the member versions the list was assembled
//! from. Lists never own entities; deleting a list leaves every member
//! retrievable by its key.

use std::collections::BTreeMap;

use rusqlite::Transaction;

use crate::descriptor::EntityDescriptor;
use crate::entity::{CallerInfo, Row};
use crate::error::{Error, Result};
use crate::storage::engine::{allocate_version, engine_now};
use crate::storage::ops;
use crate::value::{format_timestamp, Value};

/// One stored mapping row.
#[derive(Debug, Clone)]
struct ListEntry {
    entry_key: String,
    version: i64,
    created_time: String,
}

/// Create a list and its member entities.
///
/// In soft-delete mode all members share one allocated batch version; in
/// hard-delete mode each member follows the normal per-row path.
///
/// # Errors
///
/// Fails with `list-already-exists` when the key is taken, and with the
/// per-entity create errors otherwise (rolling back the whole list).
pub(crate) fn create_list(
    tx: &Transaction,
    descriptor: &EntityDescriptor,
    list_key: &str,
    rows: Vec<Row>,
    caller: &CallerInfo,
) -> Result<Vec<Row>> {
    ensure_list_sync(descriptor)?;
    if !load_entries(tx, list_key)?.is_empty() {
        return Err(Error::ListAlreadyExists {
            list_key: list_key.to_string(),
        });
    }

    let now = format_timestamp(&engine_now());
    let shared_version = if descriptor.soft_delete() {
        Some(allocate_version(tx)?)
    } else {
        None
    };

    let mut created = Vec::with_capacity(rows.len());
    for (position, row) in rows.into_iter().enumerate() {
        let stored = ops::create_row(tx, descriptor, row, caller, shared_version)?;
        insert_entry(
            tx,
            list_key,
            &stored.key_string(descriptor),
            stored.version().unwrap_or(0),
            &now,
            &now,
            position,
        )?;
        created.push(stored);
    }
    Ok(created)
}

/// Assemble a list in mapping order.
///
/// Mapping versions reconcile against storage: a newer entity advances the
/// mapping, an older one is a concurrency conflict, and a missing or
/// deleted member fails the read.
pub(crate) fn get_list(
    tx: &Transaction,
    descriptor: &EntityDescriptor,
    list_key: &str,
) -> Result<Vec<Row>> {
    ensure_list_sync(descriptor)?;
    let entries = load_entries(tx, list_key)?;
    let now = format_timestamp(&engine_now());

    let mut members = Vec::with_capacity(entries.len());
    for entry in entries {
        let row = ops::get_visible(tx, descriptor, &Value::Text(entry.entry_key.clone()))?
            .ok_or_else(|| Error::NotFound {
                entity: descriptor.entity().to_string(),
                key: entry.entry_key.clone(),
            })?;
        let entity_version = row.version().unwrap_or(0);
        if entity_version > entry.version {
            tx.execute(
                "UPDATE list_entries SET version = ?1, last_write_time = ?2 \
                 WHERE list_key = ?3 AND entry_key = ?4",
                rusqlite::params![entity_version, now, list_key, entry.entry_key],
            )?;
        } else if entity_version < entry.version {
            return Err(Error::ListMappingConflict {
                list_key: list_key.to_string(),
                entry_key: entry.entry_key,
            });
        }
        members.push(row);
    }
    Ok(members)
}

/// Replace a list's membership as a unit.
///
/// Dropped members lose their mapping only; kept members are deep-compared
/// against storage (tracking fields excluded) and rewritten only when they
/// differ; new members are created. The mapping table is rewritten to the
/// new membership and versions.
pub(crate) fn update_list(
    tx: &Transaction,
    descriptor: &EntityDescriptor,
    list_key: &str,
    rows: Vec<Row>,
    caller: &CallerInfo,
) -> Result<Vec<Row>> {
    ensure_list_sync(descriptor)?;
    let existing: BTreeMap<String, ListEntry> = load_entries(tx, list_key)?
        .into_iter()
        .map(|e| (e.entry_key.clone(), e))
        .collect();

    let now = format_timestamp(&engine_now());
    let mut result = Vec::with_capacity(rows.len());

    for row in rows {
        let entry_key = row.key_string(descriptor);
        let stored = if existing.contains_key(&entry_key) {
            let current =
                ops::read_latest_any(tx, descriptor, &Value::Text(entry_key.clone()))?;
            match current {
                Some(current) if !current.is_deleted() => {
                    if payload_equal(descriptor, &row, &current) {
                        current
                    } else {
                        // The list replaces as a unit: the current stored
                        // version is the expected token, not a caller echo.
                        let expected = current.version().unwrap_or(0);
                        ops::update_row(tx, descriptor, row, caller, expected)?
                    }
                }
                _ => ops::create_row(tx, descriptor, row, caller, None)?,
            }
        } else {
            ops::create_row(tx, descriptor, row, caller, None)?
        };
        result.push(stored);
    }

    // Rewrite the mapping to exactly the new membership.
    tx.execute(
        "DELETE FROM list_entries WHERE list_key = ?1",
        [list_key],
    )?;
    for (position, stored) in result.iter().enumerate() {
        let entry_key = stored.key_string(descriptor);
        let created_time = existing
            .get(&entry_key)
            .map_or_else(|| now.clone(), |e| e.created_time.clone());
        insert_entry(
            tx,
            list_key,
            &entry_key,
            stored.version().unwrap_or(0),
            &created_time,
            &now,
            position,
        )?;
    }
    Ok(result)
}

/// Remove a list's mappings. Entities are untouched.
///
/// Returns the number of removed mappings.
pub(crate) fn delete_list(tx: &Transaction, list_key: &str) -> Result<usize> {
    let removed = tx.execute(
        "DELETE FROM list_entries WHERE list_key = ?1",
        [list_key],
    )?;
    Ok(removed)
}

// ── Helpers ───────────────────────────────────────────────────

fn ensure_list_sync(descriptor: &EntityDescriptor) -> Result<()> {
    if descriptor.sync_with_list() {
        Ok(())
    } else {
        Err(Error::InvalidDescriptor {
            entity: descriptor.entity().to_string(),
            message: "entity does not declare sync_with_list".to_string(),
        })
    }
}

fn load_entries(tx: &Transaction, list_key: &str) -> Result<Vec<ListEntry>> {
    let mut stmt = tx.prepare(
        "SELECT entry_key, version, created_time FROM list_entries \
         WHERE list_key = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map([list_key], |row| {
        Ok(ListEntry {
            entry_key: row.get(0)?,
            version: row.get(1)?,
            created_time: row.get(2)?,
        })
    })?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::from)
}

#[allow(clippy::cast_possible_wrap)]
fn insert_entry(
    tx: &Transaction,
    list_key: &str,
    entry_key: &str,
    version: i64,
    created_time: &str,
    last_write_time: &str,
    position: usize,
) -> Result<()> {
    tx.execute(
        "INSERT INTO list_entries \
         (list_key, entry_key, version, created_time, last_write_time, position) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            list_key,
            entry_key,
            version,
            created_time,
            last_write_time,
            position as i64
        ],
    )?;
    Ok(())
}

/// Compare two rows over the mapped payload columns, treating a missing
/// property as NULL and skipping engine-managed tracking fields.
fn payload_equal(descriptor: &EntityDescriptor, a: &Row, b: &Row) -> bool {
    descriptor
        .mapped_columns()
        .filter(|c| c.tracking.is_none())
        .all(|column| {
            let left = a.get(&column.property).cloned().unwrap_or(Value::Null);
            let right = b.get(&column.property).cloned().unwrap_or(Value::Null);
            left == right
        })
}
