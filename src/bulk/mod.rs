//! Bulk import, export, and purge.
//!
//! Export writes a self-describing package directory: `manifest.json`
//! (per-file checksums), `metadata.json` (entity identity and flags), and
//! batched `data-NNNN.ndjson[.gz]` files. Import consumes the same layout
//! under Replace/Merge/Upsert strategies; purge shares the versioning rules
//! and cleans list mappings for rows it removes.

pub mod export;
pub mod file;
pub mod import;
pub mod purge;
pub mod types;

pub use types::{
    BulkProgress, ConflictResolution, ExportMode, ExportOptions, ExportSummary, ImportOptions,
    ImportStrategy, ImportSummary, Manifest, ManifestFile, PackageMetadata, Progress,
    PurgeOptions, PurgeStrategy, PurgeSummary,
};
