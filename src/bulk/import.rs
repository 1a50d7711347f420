//! Package import.
//!
//! The schema-version gate and checksum verification run before any row is
//! touched; all row work then happens inside one transaction, so a failed
//! import leaves the database exactly as it was. Soft-delete packages carry
//! explicit version chains, which are validated and inserted verbatim; the
//! global version sequence is advanced past the highest imported version so
//! later writes cannot collide.

use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::Transaction;
use tracing::{debug, warn};

use crate::bulk::file;
use crate::bulk::types::{
    BulkProgress, ConflictResolution, ImportOptions, ImportStrategy, ImportSummary, Manifest,
    PackageMetadata, Progress,
};
use crate::descriptor::EntityDescriptor;
use crate::entity::{CallerInfo, Row};
use crate::error::{Error, Result};
use crate::sql::{dml, quote_table};
use crate::storage::engine::{advance_version_seq, Store, SCHEMA_VERSION};
use crate::storage::ops;
use crate::value::Value;

/// Import a package directory.
///
/// # Errors
///
/// Fails with `schema-incompatible` on a version or flag mismatch, with a
/// checksum mismatch on corrupted data files, and with
/// `concurrency-conflict` on an invalid version chain — all before any row
/// is written.
pub fn run(
    store: &mut Store,
    descriptor: &EntityDescriptor,
    source: &Path,
    options: &ImportOptions,
    mut progress: Option<Progress<'_>>,
) -> Result<ImportSummary> {
    let manifest: Manifest = file::read_json(&source.join("manifest.json"))?;
    let metadata: PackageMetadata = file::read_json(&source.join("metadata.json"))?;

    if metadata.schema_version != SCHEMA_VERSION {
        return Err(Error::SchemaIncompatible {
            package_version: metadata.schema_version,
            target: SCHEMA_VERSION,
        });
    }
    if metadata.entity_type != descriptor.entity()
        || metadata.soft_delete_enabled != descriptor.soft_delete()
    {
        return Err(Error::Config(format!(
            "package for {} (soft_delete={}) does not match descriptor {} (soft_delete={})",
            metadata.entity_type,
            metadata.soft_delete_enabled,
            descriptor.entity(),
            descriptor.soft_delete()
        )));
    }

    if options.verify_checksums {
        for entry in &manifest.files {
            file::verify_checksum(&source.join(&entry.name), &entry.checksum)?;
        }
    }

    let mut rows = Vec::new();
    for entry in &manifest.files {
        rows.extend(file::read_rows(&source.join(&entry.name))?);
    }
    debug!(
        entity = descriptor.entity(),
        rows = rows.len(),
        strategy = ?options.strategy,
        "importing package"
    );

    // Group rows into per-key chains, preserving file order within a key.
    let mut chains: BTreeMap<String, Vec<Row>> = BTreeMap::new();
    for row in rows {
        let key = row.key_string(descriptor);
        if key.is_empty() {
            return Err(Error::VersionChain {
                entity: descriptor.entity().to_string(),
                key: String::new(),
                message: "imported row is missing its key".to_string(),
            });
        }
        chains.entry(key).or_default().push(row);
    }

    let mut max_version = 0i64;
    for (key, chain) in &chains {
        validate_chain(descriptor, key, chain)?;
        for row in chain {
            max_version = max_version.max(row.version().unwrap_or(0));
        }
    }

    let caller = CallerInfo::current("bulk_import");
    let cancel = store.cancel_token();
    let total = chains.len();
    let mut summary = ImportSummary::default();

    let scope = store.begin_scope()?;
    {
        let tx = scope.tx();
        if options.strategy == ImportStrategy::Replace {
            tx.execute(&format!("DELETE FROM {}", quote_table(descriptor)), [])?;
        }

        for (processed, (key, chain)) in chains.into_iter().enumerate() {
            cancel.check()?;
            let exists = options.strategy != ImportStrategy::Replace
                && ops::read_latest_any(tx, descriptor, &Value::Text(key.clone()))?.is_some();

            if exists {
                match options.strategy {
                    // Replace cleared the table; exists is always false.
                    ImportStrategy::Replace => {}
                    ImportStrategy::Merge => summary.skipped += 1,
                    ImportStrategy::Upsert => {
                        summary.conflicts += 1;
                        resolve_conflict(
                            tx,
                            descriptor,
                            &key,
                            &chain,
                            options.conflict,
                            &caller,
                            &mut summary,
                        )?;
                    }
                }
            } else {
                insert_chain(tx, descriptor, &chain)?;
                summary.created += 1;
            }

            if let Some(callback) = progress.as_deref_mut() {
                callback(BulkProgress {
                    processed: processed + 1,
                    total: Some(total),
                });
            }
        }

        if descriptor.soft_delete() && max_version > 0 {
            advance_version_seq(tx, max_version)?;
        }
    }
    scope.commit()?;
    Ok(summary)
}

/// Validate one key's chain: versions strictly increasing, timestamps
/// coherent per row.
fn validate_chain(descriptor: &EntityDescriptor, key: &str, chain: &[Row]) -> Result<()> {
    if !descriptor.soft_delete() && chain.len() > 1 {
        return Err(chain_error(descriptor, key, "multiple rows for a hard-delete key"));
    }
    let mut previous: Option<i64> = None;
    for row in chain {
        let Some(version) = row.version() else {
            return Err(chain_error(descriptor, key, "row is missing a Version"));
        };
        if previous.is_some_and(|p| version <= p) {
            return Err(chain_error(
                descriptor,
                key,
                "versions are not strictly increasing",
            ));
        }
        previous = Some(version);
        if let (Some(created), Some(written)) = (row.created_time(), row.last_write_time()) {
            if written < created {
                return Err(chain_error(
                    descriptor,
                    key,
                    "LastWriteTime precedes CreatedTime",
                ));
            }
        }
    }
    Ok(())
}

fn chain_error(descriptor: &EntityDescriptor, key: &str, message: &str) -> Error {
    Error::VersionChain {
        entity: descriptor.entity().to_string(),
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// Insert a validated chain verbatim, tracking fields included.
fn insert_chain(tx: &Transaction, descriptor: &EntityDescriptor, chain: &[Row]) -> Result<()> {
    if chain.is_empty() {
        return Ok(());
    }
    let statement = dml::batch_insert(descriptor, chain);
    if ops::execute(tx, &statement)? != chain.len() {
        return Err(Error::WriteFailed {
            entity: descriptor.entity().to_string(),
            operation: "import",
        });
    }
    Ok(())
}

fn resolve_conflict(
    tx: &Transaction,
    descriptor: &EntityDescriptor,
    key: &str,
    chain: &[Row],
    resolution: ConflictResolution,
    caller: &CallerInfo,
    summary: &mut ImportSummary,
) -> Result<()> {
    match resolution {
        ConflictResolution::UseSource => {
            delete_key_rows(tx, descriptor, key)?;
            insert_chain(tx, descriptor, chain)?;
            summary.updated += 1;
        }
        ConflictResolution::UseTarget => {
            summary.skipped += 1;
        }
        ConflictResolution::MergeFields => {
            merge_fields(tx, descriptor, key, chain, caller)?;
            summary.updated += 1;
        }
        ConflictResolution::ManualLog => {
            warn!(
                entity = descriptor.entity(),
                key, "import conflict left for manual resolution"
            );
            summary.logged += 1;
            summary.skipped += 1;
        }
    }
    Ok(())
}

/// Remove every stored version of a key.
fn delete_key_rows(tx: &Transaction, descriptor: &EntityDescriptor, key: &str) -> Result<()> {
    let table = quote_table(descriptor);
    let column = crate::sql::quote_ident(descriptor.key_column());
    tx.execute(
        &format!("DELETE FROM {table} WHERE {column} = ?1"),
        [key],
    )?;
    Ok(())
}

/// Overlay the package's latest payload fields onto the stored latest row
/// and write the result as a normal update.
fn merge_fields(
    tx: &Transaction,
    descriptor: &EntityDescriptor,
    key: &str,
    chain: &[Row],
    caller: &CallerInfo,
) -> Result<()> {
    let Some(source) = chain.last() else {
        return Ok(());
    };
    let target = ops::read_latest_any(tx, descriptor, &Value::Text(key.to_string()))?
        .ok_or_else(|| Error::NotFound {
            entity: descriptor.entity().to_string(),
            key: key.to_string(),
        })?;

    let mut merged = target.clone();
    for column in descriptor.mapped_columns().filter(|c| c.tracking.is_none()) {
        if let Some(value) = source.get(&column.property) {
            if !value.is_null() {
                merged.set(&column.property, value.clone());
            }
        }
    }
    let expected = target.version().unwrap_or(0);
    ops::update_row(tx, descriptor, merged, caller, expected)?;
    Ok(())
}
