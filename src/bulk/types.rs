//! Bulk operation options, package documents, and summaries.

use std::path::PathBuf;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::query::Predicate;

/// Progress report passed to bulk callbacks.
#[derive(Debug, Clone, Copy)]
pub struct BulkProgress {
    pub processed: usize,
    pub total: Option<usize>,
}

/// Bulk progress callback.
pub type Progress<'a> = &'a mut dyn FnMut(BulkProgress);

// ── Export ────────────────────────────────────────────────────

/// What an export covers.
#[derive(Debug, Clone)]
pub enum ExportMode {
    /// Everything matching the filter.
    Full,
    /// Entities written after the last export watermark.
    Incremental { since: DateTime<Utc> },
    /// Entities not written since the retention cutoff.
    Archive { cutoff: DateTime<Utc> },
}

impl ExportMode {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental { .. } => "incremental",
            Self::Archive { .. } => "archive",
        }
    }
}

/// Export options.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub mode: ExportMode,
    /// Additional row filter, AND-ed with the mode's own constraint.
    pub filter: Option<Predicate>,
    /// Rows per data file.
    pub batch_size: usize,
    /// Gzip data files.
    pub compress: bool,
    /// Restrict a soft-delete export to the latest live versions instead of
    /// the full chain.
    pub latest_only: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            mode: ExportMode::Full,
            filter: None,
            batch_size: 1_000,
            compress: false,
            latest_only: false,
        }
    }
}

/// One data file entry in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    /// Hex SHA-256 of the file bytes as written.
    pub checksum: String,
    pub row_count: usize,
    pub compressed: bool,
}

/// The package manifest (`manifest.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub files: Vec<ManifestFile>,
    pub schema_version: i64,
    pub exported_at: String,
    pub mode: String,
    /// Whether the package carries full version chains.
    pub all_versions: bool,
}

/// The package metadata document (`metadata.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub entity_type: String,
    pub soft_delete_enabled: bool,
    pub expiry_enabled: bool,
    pub audit_enabled: bool,
    pub schema_version: i64,
}

/// Result of an export.
#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub rows: usize,
    pub files: usize,
    pub mode: String,
}

// ── Import ────────────────────────────────────────────────────

/// How an import treats existing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStrategy {
    /// Clear in-scope data, then insert the package.
    Replace,
    /// Preserve existing entities, insert only missing ones.
    Merge,
    /// Insert missing entities, reconcile present ones per the conflict
    /// resolution.
    Upsert,
}

/// Per-row reconciliation when Upsert meets an existing entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictResolution {
    /// The package wins: replace the stored entity.
    #[default]
    UseSource,
    /// Local storage wins: skip the package row.
    UseTarget,
    /// Field-level merge: package fields overlay the stored latest row.
    MergeFields,
    /// Log the conflict and skip.
    ManualLog,
}

/// Import options.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub strategy: ImportStrategy,
    pub conflict: ConflictResolution,
    /// Verify manifest checksums before touching any rows.
    pub verify_checksums: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            strategy: ImportStrategy::Merge,
            conflict: ConflictResolution::default(),
            verify_checksums: true,
        }
    }
}

/// Result of an import.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportSummary {
    /// Entities newly inserted.
    pub created: usize,
    /// Entities reconciled in favor of the package.
    pub updated: usize,
    /// Entities left untouched.
    pub skipped: usize,
    /// Conflicts encountered.
    pub conflicts: usize,
    /// Conflicts routed to the manual log.
    pub logged: usize,
}

// ── Purge ─────────────────────────────────────────────────────

/// What a purge removes.
#[derive(Debug, Clone)]
pub enum PurgeStrategy {
    /// Rows past their `AbsoluteExpiration`, unless archived. Requires
    /// expiry on the descriptor.
    Expired,
    /// Soft-delete retention: drop whole chains whose latest version is a
    /// tombstone older than the window, and stale non-latest versions.
    SoftRetention { window: TimeDelta },
    /// Direct delete of rows not written within the window.
    HardRetention { window: TimeDelta },
}

/// Purge options.
#[derive(Debug, Clone)]
pub struct PurgeOptions {
    pub strategy: PurgeStrategy,
    /// Additional entity filter.
    pub filter: Option<Predicate>,
    /// Count and sample only; change nothing.
    pub preview: bool,
    /// Export a backup package here first; purge aborts if it fails.
    pub backup_dir: Option<PathBuf>,
}

impl PurgeOptions {
    #[must_use]
    pub fn new(strategy: PurgeStrategy) -> Self {
        Self {
            strategy,
            filter: None,
            preview: false,
            backup_dir: None,
        }
    }
}

/// Result of a purge (or a preview).
#[derive(Debug, Clone, Default, Serialize)]
pub struct PurgeSummary {
    /// Rows matched by the strategy.
    pub matched_rows: usize,
    /// Rows actually removed (zero in preview).
    pub removed_rows: usize,
    /// List mappings removed alongside.
    pub removed_mappings: usize,
    pub preview: bool,
    /// Up to five affected keys.
    pub samples: Vec<String>,
}
