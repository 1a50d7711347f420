//! Package export.
//!
//! Rows stream out in `(key, Version)` ascending order, so a soft-delete
//! package carries each key's full version chain sorted with no
//! interleaving. Data files are batched by the configured size, optionally
//! gzipped, and checksummed into the manifest.

use std::fs;
use std::path::Path;

use chrono::Utc;
use tracing::debug;

use crate::bulk::file;
use crate::bulk::types::{
    BulkProgress, ExportMode, ExportOptions, ExportSummary, Manifest, ManifestFile,
    PackageMetadata, Progress,
};
use crate::descriptor::{track, EntityDescriptor, TrackingRole};
use crate::entity::Row;
use crate::error::Result;
use crate::query::{col, translate_predicate, SqliteDialect};
use crate::sql::dml::{self, SelectOptions};
use crate::sql::quote_ident;
use crate::storage::engine::{engine_now, Store, SCHEMA_VERSION};
use crate::value::format_timestamp;

/// Export a package directory for one entity type.
///
/// # Errors
///
/// Returns an error when translation, the select, or any file write fails.
pub fn run(
    store: &Store,
    descriptor: &EntityDescriptor,
    dest: &Path,
    options: &ExportOptions,
    mut progress: Option<Progress<'_>>,
) -> Result<ExportSummary> {
    fs::create_dir_all(dest)?;
    let cancel = store.cancel_token();

    let rows = select_rows(store, descriptor, options)?;
    let total = rows.len();
    debug!(
        entity = descriptor.entity(),
        rows = total,
        mode = options.mode.label(),
        "exporting package"
    );

    let all_versions = descriptor.soft_delete() && !options.latest_only;
    let mut files = Vec::new();
    let batch_size = options.batch_size.max(1);

    for (index, batch) in rows.chunks(batch_size).enumerate() {
        cancel.check()?;
        let extension = if options.compress {
            "ndjson.gz"
        } else {
            "ndjson"
        };
        let name = format!("data-{index:04}.{extension}");
        let (checksum, _) = file::write_rows(&dest.join(&name), batch, options.compress)?;
        files.push(ManifestFile {
            name,
            checksum,
            row_count: batch.len(),
            compressed: options.compress,
        });
        if let Some(callback) = progress.as_deref_mut() {
            callback(BulkProgress {
                processed: (index * batch_size + batch.len()).min(total),
                total: Some(total),
            });
        }
    }

    let metadata = PackageMetadata {
        entity_type: descriptor.entity().to_string(),
        soft_delete_enabled: descriptor.soft_delete(),
        expiry_enabled: descriptor.expiry_enabled(),
        audit_enabled: descriptor.audit_trail(),
        schema_version: SCHEMA_VERSION,
    };
    file::write_json(&dest.join("metadata.json"), &metadata)?;

    let manifest = Manifest {
        files,
        schema_version: SCHEMA_VERSION,
        exported_at: format_timestamp(&Utc::now()),
        mode: options.mode.label().to_string(),
        all_versions,
    };
    file::write_json(&dest.join("manifest.json"), &manifest)?;

    Ok(ExportSummary {
        rows: total,
        files: manifest.files.len(),
        mode: options.mode.label().to_string(),
    })
}

/// Select the export row set in chain order.
fn select_rows(
    store: &Store,
    descriptor: &EntityDescriptor,
    options: &ExportOptions,
) -> Result<Vec<Row>> {
    let mode_predicate = match &options.mode {
        ExportMode::Full => None,
        ExportMode::Incremental { since } => Some(col(track::LAST_WRITE_TIME).gt(*since)),
        ExportMode::Archive { cutoff } => Some(col(track::LAST_WRITE_TIME).lt(*cutoff)),
    };
    let predicate = match (mode_predicate, options.filter.clone()) {
        (Some(mode), Some(filter)) => Some(mode.and(filter)),
        (Some(mode), None) => Some(mode),
        (None, filter) => filter,
    };
    let where_clause = predicate
        .as_ref()
        .map(|p| translate_predicate(descriptor, p, &SqliteDialect))
        .transpose()?;

    let include_chain = descriptor.soft_delete() && !options.latest_only;
    let select_options = SelectOptions {
        include_all_versions: include_chain,
        include_deleted: include_chain,
        include_expired: true,
        where_clause,
        order_by: Some(chain_order(descriptor)),
        limit: None,
        offset: None,
    };
    let statement = dml::select(descriptor, &select_options, engine_now());
    store.select_rows(descriptor, &statement)
}

/// `(key, Version)` ascending: the package chain invariant.
fn chain_order(descriptor: &EntityDescriptor) -> String {
    let key = quote_ident(descriptor.key_column());
    let version = descriptor
        .tracking_column(TrackingRole::Version)
        .map_or(track::VERSION, |c| c.column.as_str());
    format!("t.{key}, t.{}", quote_ident(version))
}
