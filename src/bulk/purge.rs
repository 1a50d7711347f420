//! Retention purges.
//!
//! Purge is the only operation that physically removes soft-delete rows.
//! Every strategy resolves to one or more condition sets over the entity
//! table; preview mode reports counts and sample keys without touching
//! anything, and a real purge deletes inside one transaction, including the
//! list mappings of entities it fully removes.

use tracing::{debug, info};

use crate::bulk::export;
use crate::bulk::types::{ExportOptions, PurgeOptions, PurgeStrategy, PurgeSummary};
use crate::descriptor::{EntityDescriptor, TrackingRole};
use crate::error::{Error, Result};
use crate::query::{translate_predicate, SqliteDialect};
use crate::sql::{quote_ident, quote_table, SqlStatement};
use crate::storage::engine::{engine_now, Store};
use crate::value::{format_timestamp, Value};

/// Maximum keys echoed back in a summary.
const SAMPLE_LIMIT: usize = 5;

/// One deletable row set.
struct CandidateSet {
    conditions: Vec<String>,
    params: Vec<(String, Value)>,
}

/// Run (or preview) a purge.
///
/// # Errors
///
/// Fails when the strategy does not fit the descriptor (`Expired` without
/// expiry, `SoftRetention` without soft delete), when the backup export
/// fails, or when any statement fails — rolling back all removals.
pub fn run(
    store: &mut Store,
    descriptor: &EntityDescriptor,
    options: &PurgeOptions,
) -> Result<PurgeSummary> {
    if let Some(backup_dir) = &options.backup_dir {
        if !options.preview {
            // Backup failure aborts the purge before any removal.
            export::run(store, descriptor, backup_dir, &ExportOptions::default(), None)?;
        }
    }

    let sets = candidate_sets(descriptor, options)?;
    let table = quote_table(descriptor);
    let key_column = quote_ident(descriptor.key_column());

    // Candidate sets can overlap (a dead chain's old rows also satisfy the
    // stale-version conditions), so the preview count runs over a UNION of
    // the sets — the same distinct row set a real purge removes.
    let union_sql = sets
        .iter()
        .map(|set| {
            format!(
                "SELECT t.rowid FROM {table} AS t WHERE {}",
                set.conditions.join(" AND ")
            )
        })
        .collect::<Vec<_>>()
        .join(" UNION ");
    let mut count_stmt = SqlStatement::new(format!("SELECT COUNT(*) FROM ({union_sql})"));
    count_stmt.params = merged_params(&sets);
    #[allow(clippy::cast_sign_loss)]
    let matched = store.select_scalar(&count_stmt)?.max(0) as usize;

    let mut keys: Vec<String> = Vec::new();
    for set in &sets {
        let mut keys_stmt = SqlStatement::new(format!(
            "SELECT DISTINCT t.{key_column} FROM {table} AS t WHERE {}",
            set.conditions.join(" AND ")
        ));
        keys_stmt.params.clone_from(&set.params);
        keys.extend(select_keys(store, &keys_stmt)?);
    }
    keys.sort();
    keys.dedup();
    let samples: Vec<String> = keys.iter().take(SAMPLE_LIMIT).cloned().collect();

    if options.preview {
        debug!(
            entity = descriptor.entity(),
            matched, "purge preview, no changes made"
        );
        return Ok(PurgeSummary {
            matched_rows: matched,
            removed_rows: 0,
            removed_mappings: 0,
            preview: true,
            samples,
        });
    }

    let sync_with_list = descriptor.sync_with_list();
    let entity = descriptor.entity().to_string();
    let (removed, mappings) = store.execute("purge", |tx| {
        let mut removed = 0usize;
        for set in &sets {
            let where_clause = set.conditions.join(" AND ");
            let mut delete_stmt = SqlStatement::new(format!(
                "DELETE FROM {table} WHERE rowid IN \
                 (SELECT t.rowid FROM {table} AS t WHERE {where_clause})"
            ));
            delete_stmt.params.clone_from(&set.params);
            removed += crate::storage::ops::execute(tx, &delete_stmt)?;
        }

        // Entities with no surviving rows lose their list mappings too.
        let mut mappings = 0usize;
        if sync_with_list {
            let remaining_sql =
                format!("SELECT COUNT(*) FROM {table} WHERE {key_column} = ?1");
            for key in &keys {
                let remaining: i64 =
                    tx.query_row(&remaining_sql, [key.as_str()], |row| row.get(0))?;
                if remaining == 0 {
                    mappings += tx.execute(
                        "DELETE FROM list_entries WHERE entry_key = ?1",
                        [key.as_str()],
                    )?;
                }
            }
        }
        Ok((removed, mappings))
    })?;

    info!(
        entity,
        removed_rows = removed,
        removed_mappings = mappings,
        "purge complete"
    );
    Ok(PurgeSummary {
        matched_rows: matched,
        removed_rows: removed,
        removed_mappings: mappings,
        preview: false,
        samples,
    })
}

/// Build the strategy's condition sets, AND-ing in the caller filter.
fn candidate_sets(
    descriptor: &EntityDescriptor,
    options: &PurgeOptions,
) -> Result<Vec<CandidateSet>> {
    let now = engine_now();
    let table = quote_table(descriptor);
    let key = quote_ident(descriptor.key_column());
    let version = tracking(descriptor, TrackingRole::Version)?;

    let mut sets = match &options.strategy {
        PurgeStrategy::Expired => {
            if !descriptor.expiry_enabled() {
                return Err(Error::InvalidDescriptor {
                    entity: descriptor.entity().to_string(),
                    message: "expired purge requires an expiry span".to_string(),
                });
            }
            let expiration = tracking(descriptor, TrackingRole::AbsoluteExpiration)?;
            let mut conditions = vec![
                format!("t.{expiration} IS NOT NULL"),
                format!("t.{expiration} < @Now"),
            ];
            if descriptor.archive() {
                let archived = tracking(descriptor, TrackingRole::IsArchived)?;
                conditions.push(format!("t.{archived} = 0"));
            }
            vec![CandidateSet {
                conditions,
                params: vec![("@Now".to_string(), Value::Text(format_timestamp(&now)))],
            }]
        }
        PurgeStrategy::SoftRetention { window } => {
            if !descriptor.soft_delete() {
                return Err(Error::InvalidDescriptor {
                    entity: descriptor.entity().to_string(),
                    message: "soft retention purge requires soft delete".to_string(),
                });
            }
            let tombstone = tracking(descriptor, TrackingRole::IsDeleted)?;
            let written = tracking(descriptor, TrackingRole::LastWriteTime)?;
            let cutoff = (
                "@Cutoff".to_string(),
                Value::Text(format_timestamp(&(now - *window))),
            );
            // Whole chains whose latest version is an old tombstone.
            let dead_chains = CandidateSet {
                conditions: vec![format!(
                    "t.{key} IN (SELECT t1.{key} FROM {table} AS t1 \
                     WHERE t1.{tombstone} = 1 AND t1.{written} < @Cutoff \
                     AND t1.{version} = (SELECT MAX(t2.{version}) FROM {table} AS t2 \
                     WHERE t2.{key} = t1.{key}))"
                )],
                params: vec![cutoff.clone()],
            };
            // Stale non-latest versions of still-active entities.
            let stale_versions = CandidateSet {
                conditions: vec![
                    format!("t.{written} < @Cutoff"),
                    format!(
                        "t.{version} < (SELECT MAX(t2.{version}) FROM {table} AS t2 \
                         WHERE t2.{key} = t.{key})"
                    ),
                ],
                params: vec![cutoff],
            };
            vec![dead_chains, stale_versions]
        }
        PurgeStrategy::HardRetention { window } => {
            let written = tracking(descriptor, TrackingRole::LastWriteTime)?;
            vec![CandidateSet {
                conditions: vec![format!("t.{written} < @Cutoff")],
                params: vec![(
                    "@Cutoff".to_string(),
                    Value::Text(format_timestamp(&(now - *window))),
                )],
            }]
        }
    };

    if let Some(filter) = &options.filter {
        let fragment = translate_predicate(descriptor, filter, &SqliteDialect)?;
        for set in &mut sets {
            set.conditions.push(format!("({})", fragment.sql));
            set.params.extend(fragment.params.iter().cloned());
        }
    }
    Ok(sets)
}

fn tracking(descriptor: &EntityDescriptor, role: TrackingRole) -> Result<String> {
    descriptor
        .tracking_column(role)
        .map(|c| quote_ident(&c.column))
        .ok_or_else(|| Error::InvalidDescriptor {
            entity: descriptor.entity().to_string(),
            message: format!("missing tracking column for {role:?}"),
        })
}

/// Combine the sets' parameters for the UNION statement. A name shared
/// across sets always carries the same value (`@Now`/`@Cutoff` and filter
/// parameters are computed once per run), so the first occurrence wins.
fn merged_params(sets: &[CandidateSet]) -> Vec<(String, Value)> {
    let mut params: Vec<(String, Value)> = Vec::new();
    for set in sets {
        for (name, value) in &set.params {
            if !params.iter().any(|(existing, _)| existing == name) {
                params.push((name.clone(), value.clone()));
            }
        }
    }
    params
}

fn select_keys(store: &Store, statement: &SqlStatement) -> Result<Vec<String>> {
    let mut stmt = store.connection().prepare(&statement.sql)?;
    let rows = stmt.query_map(statement.param_refs().as_slice(), |row| {
        let value: Value = row.get(0)?;
        Ok(match value {
            Value::Text(s) => s,
            Value::Integer(i) => i.to_string(),
            other => format!("{other:?}"),
        })
    })?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{track, DescriptorBuilder, PropertyKind};
    use crate::entity::{CallerInfo, Row};
    use crate::error::ErrorKind;
    use crate::sql::ddl;
    use crate::storage::{lists, ops};
    use chrono::TimeDelta;
    use std::sync::LazyLock;

    static TOKEN: LazyLock<EntityDescriptor> = LazyLock::new(|| {
        DescriptorBuilder::new("Token")
            .table("Tokens")
            .key("Id", PropertyKind::Str)
            .column("Label", PropertyKind::Str)
            .soft_delete(true)
            .sync_with_list(true)
            .expiry_span(TimeDelta::try_hours(1).unwrap())
            .build()
            .unwrap()
    });

    fn store_with_table() -> Store {
        let mut store = Store::open_in_memory().unwrap();
        let table = ddl::create_table(&TOKEN, true);
        store
            .execute("initialize", |tx| {
                tx.execute(&table, [])?;
                Ok(())
            })
            .unwrap();
        store
    }

    fn caller() -> CallerInfo {
        CallerInfo::new("purge.rs", "test", 1)
    }

    fn create(store: &mut Store, id: &str, expiration: Option<chrono::DateTime<chrono::Utc>>) {
        store
            .execute("create", |tx| {
                let mut row = Row::new().with("Id", id).with("Label", "x");
                if let Some(exp) = expiration {
                    row.set(track::ABSOLUTE_EXPIRATION, exp);
                }
                ops::create_row(tx, &TOKEN, row, &caller(), None)
            })
            .unwrap();
    }

    #[test]
    fn expired_preview_counts_without_removing() {
        let mut store = store_with_table();
        let past = engine_now() - TimeDelta::try_hours(2).unwrap();
        create(&mut store, "old", Some(past));
        create(&mut store, "fresh", None);

        let mut options = PurgeOptions::new(PurgeStrategy::Expired);
        options.preview = true;
        let summary = run(&mut store, &TOKEN, &options).unwrap();
        assert_eq!(summary.matched_rows, 1);
        assert_eq!(summary.removed_rows, 0);
        assert_eq!(summary.samples, vec!["old".to_string()]);

        let remaining: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM Tokens", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 2);
    }

    #[test]
    fn expired_purge_removes_rows_and_mappings() {
        let mut store = store_with_table();
        let past = engine_now() - TimeDelta::try_hours(2).unwrap();
        store
            .execute("create_list", |tx| {
                lists::create_list(
                    tx,
                    &TOKEN,
                    "L",
                    vec![Row::new()
                        .with("Id", "old")
                        .with("Label", "x")
                        .with(track::ABSOLUTE_EXPIRATION, past)],
                    &caller(),
                )
            })
            .unwrap();
        create(&mut store, "fresh", None);

        let summary = run(
            &mut store,
            &TOKEN,
            &PurgeOptions::new(PurgeStrategy::Expired),
        )
        .unwrap();
        assert_eq!(summary.removed_rows, 1);
        assert_eq!(summary.removed_mappings, 1);

        let remaining: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM Tokens WHERE Id = 'old'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn expired_purge_requires_expiry() {
        let plain = DescriptorBuilder::new("Plain")
            .key("Id", PropertyKind::Str)
            .build()
            .unwrap();
        let mut store = store_with_table();
        let err = run(
            &mut store,
            &plain,
            &PurgeOptions::new(PurgeStrategy::Expired),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDescriptor);
    }

    #[test]
    fn archived_rows_survive_expired_purge() {
        let archived_desc = DescriptorBuilder::new("Memo")
            .table("Memos")
            .key("Id", PropertyKind::Str)
            .expiry_span(TimeDelta::try_hours(1).unwrap())
            .archive(true)
            .build()
            .unwrap();
        let mut store = Store::open_in_memory().unwrap();
        let table = ddl::create_table(&archived_desc, true);
        store
            .execute("initialize", |tx| {
                tx.execute(&table, [])?;
                Ok(())
            })
            .unwrap();

        let past = engine_now() - TimeDelta::try_hours(2).unwrap();
        store
            .execute("create", |tx| {
                ops::create_row(
                    tx,
                    &archived_desc,
                    Row::new()
                        .with("Id", "kept")
                        .with(track::ABSOLUTE_EXPIRATION, past)
                        .with(track::IS_ARCHIVED, true),
                    &caller(),
                    None,
                )
            })
            .unwrap();

        let summary = run(
            &mut store,
            &archived_desc,
            &PurgeOptions::new(PurgeStrategy::Expired),
        )
        .unwrap();
        assert_eq!(summary.removed_rows, 0);
    }

    #[test]
    fn soft_retention_drops_dead_chains_and_stale_versions() {
        let mut store = store_with_table();
        create(&mut store, "live", None);
        create(&mut store, "dead", None);
        store
            .execute("mutate", |tx| {
                ops::update_row(
                    tx,
                    &TOKEN,
                    Row::new().with("Id", "live").with("Label", "new"),
                    &caller(),
                    1,
                )?;
                ops::delete_row(tx, &TOKEN, &Value::from("dead"), &caller())
            })
            .unwrap();

        // A zero-width window makes everything older than the cutoff; the
        // sleep keeps the cutoff strictly after the writes at millisecond
        // resolution.
        std::thread::sleep(std::time::Duration::from_millis(5));

        // The dead chain's old row also satisfies the stale-version
        // conditions; the preview must still count each row once.
        let mut preview_options = PurgeOptions::new(PurgeStrategy::SoftRetention {
            window: TimeDelta::zero(),
        });
        preview_options.preview = true;
        let preview = run(&mut store, &TOKEN, &preview_options).unwrap();
        assert_eq!(preview.matched_rows, 3);
        assert_eq!(preview.removed_rows, 0);

        let summary = run(
            &mut store,
            &TOKEN,
            &PurgeOptions::new(PurgeStrategy::SoftRetention {
                window: TimeDelta::zero(),
            }),
        )
        .unwrap();

        // Dead chain: both rows of "dead". Stale version: v1 of "live".
        assert_eq!(summary.removed_rows, 3);
        assert_eq!(summary.matched_rows, summary.removed_rows);
        let live_latest: i64 = store
            .connection()
            .query_row(
                "SELECT MAX(Version) FROM Tokens WHERE Id = 'live'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(live_latest > 1);
        let dead_rows: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM Tokens WHERE Id = 'dead'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(dead_rows, 0);
    }

    #[test]
    fn backup_first_writes_a_package() {
        let mut store = store_with_table();
        let past = engine_now() - TimeDelta::try_hours(2).unwrap();
        create(&mut store, "old", Some(past));

        let backup = tempfile::TempDir::new().unwrap();
        let mut options = PurgeOptions::new(PurgeStrategy::Expired);
        options.backup_dir = Some(backup.path().to_path_buf());
        let summary = run(&mut store, &TOKEN, &options).unwrap();
        assert_eq!(summary.removed_rows, 1);
        assert!(backup.path().join("manifest.json").exists());
        assert!(backup.path().join("data-0000.ndjson").exists());
    }
}
